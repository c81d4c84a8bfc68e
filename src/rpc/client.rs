//! RPC client.

use std::time::Duration;

use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{decode_body, Result, RpcError, CONTENT_TYPE_JSON};
use crate::transport::{
    BrokerConnection, Channel, ChannelOf, MessageProperties, QueueKind, Transport,
};

/// Client behaviour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RpcClientConfig {
    /// Give up waiting for a reply after this long. `None` waits forever.
    pub reply_timeout: Option<Duration>,
}

/// Sends requests and waits for the matching reply.
///
/// Every call opens its own channel and exclusive reply queue, so
/// concurrent calls never see each other's replies.
pub struct RpcClient<T: Transport> {
    connection: BrokerConnection<T>,
    config: RpcClientConfig,
}

impl<T: Transport> Clone for RpcClient<T> {
    fn clone(&self) -> Self {
        Self {
            connection: self.connection.clone(),
            config: self.config,
        }
    }
}

impl<T: Transport> RpcClient<T> {
    pub fn new(connection: BrokerConnection<T>, config: RpcClientConfig) -> Self {
        Self { connection, config }
    }

    pub fn config(&self) -> &RpcClientConfig {
        &self.config
    }

    /// Send `request` to the `destination` queue and decode the reply.
    ///
    /// Waits for a broker connection first. Setup failures and, when a
    /// reply timeout is configured, a missing reply fail the call.
    #[tracing::instrument(name = "rpc.send", skip_all, fields(destination = %destination))]
    pub async fn send<Req, Resp>(&self, destination: &str, request: &Req) -> Result<Resp>
    where
        Req: Serialize + ?Sized + Sync,
        Resp: DeserializeOwned,
    {
        let body = serde_json::to_vec(request)?;
        let channel = self.connection.create_channel().await?;

        let outcome = match self.config.reply_timeout {
            Some(limit) => tokio::time::timeout(limit, round_trip::<T>(&channel, destination, body))
                .await
                .unwrap_or(Err(RpcError::Timeout(limit))),
            None => round_trip::<T>(&channel, destination, body).await,
        };

        if let Err(e) = channel.close().await {
            debug!(error = %e, "Failed to close reply channel");
        }

        let reply = outcome?;
        Ok(serde_json::from_value(decode_body(&reply)?)?)
    }
}

async fn round_trip<T: Transport>(
    channel: &ChannelOf<T>,
    destination: &str,
    body: Vec<u8>,
) -> Result<Vec<u8>> {
    let reply_queue = channel.declare_queue("", QueueKind::Exclusive).await?;
    let mut replies = channel.consume(&reply_queue).await?;

    let correlation_id = Uuid::new_v4().to_string();
    channel
        .publish(
            destination,
            MessageProperties {
                correlation_id: Some(correlation_id.clone()),
                reply_to: Some(reply_queue.clone()),
                content_type: Some(CONTENT_TYPE_JSON.to_string()),
            },
            body,
        )
        .await?;
    debug!(correlation_id = %correlation_id, reply_to = %reply_queue, "Request sent");

    while let Some(delivery) = replies.next().await {
        let delivery = delivery?;
        if delivery.properties.correlation_id.as_deref() == Some(correlation_id.as_str()) {
            channel.ack(delivery.tag).await?;
            return Ok(delivery.body);
        }
        warn!(
            expected = %correlation_id,
            received = ?delivery.properties.correlation_id,
            "Ignoring reply with foreign correlation id"
        );
    }

    Err(RpcError::ReplyStreamClosed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{BrokerEndpoint, ConnectionSettings, MemoryBroker};
    use serde_json::{json, Value};

    async fn client(broker: &MemoryBroker, config: RpcClientConfig) -> RpcClient<MemoryBroker> {
        let connection = BrokerConnection::new(
            broker.clone(),
            BrokerEndpoint::new("memory", 5672, "guest", "guest"),
            ConnectionSettings::default(),
        )
        .unwrap();
        connection.connect().await;
        RpcClient::new(connection, config)
    }

    /// Answer the next request on `queue` with `reply`, optionally preceded
    /// by a stray message carrying a foreign correlation id.
    async fn answer_once(broker: &MemoryBroker, queue: &str, reply: Vec<u8>, stray: bool) {
        let link = broker
            .open(&BrokerEndpoint::new("memory", 5672, "guest", "guest"))
            .await
            .unwrap();
        let channel = crate::transport::Link::create_channel(&link).await.unwrap();
        channel.declare_queue(queue, QueueKind::Durable).await.unwrap();
        let mut requests = channel.consume(queue).await.unwrap();

        tokio::spawn(async move {
            let _link = link;
            let request = requests.next().await.unwrap().unwrap();
            channel.ack(request.tag).await.unwrap();
            let reply_to = request.properties.reply_to.clone().unwrap();
            if stray {
                channel
                    .publish(
                        &reply_to,
                        MessageProperties {
                            correlation_id: Some("someone-else".to_string()),
                            ..Default::default()
                        },
                        b"\"wrong\"".to_vec(),
                    )
                    .await
                    .unwrap();
            }
            channel
                .publish(
                    &reply_to,
                    MessageProperties {
                        correlation_id: request.properties.correlation_id.clone(),
                        ..Default::default()
                    },
                    reply,
                )
                .await
                .unwrap();
        });
    }

    #[tokio::test]
    async fn test_send_returns_matching_reply() {
        let broker = MemoryBroker::new();
        answer_once(&broker, "svc.op", br#"{"ok":true}"#.to_vec(), true).await;
        let client = client(&broker, RpcClientConfig::default()).await;

        let reply: Value = client.send("svc.op", &json!({"id": "1"})).await.unwrap();
        assert_eq!(reply, json!({"ok": true}));
    }

    #[tokio::test]
    async fn test_empty_reply_decodes_as_empty_string() {
        let broker = MemoryBroker::new();
        answer_once(&broker, "svc.op", Vec::new(), false).await;
        let client = client(&broker, RpcClientConfig::default()).await;

        let reply: String = client.send("svc.op", &json!(null)).await.unwrap();
        assert_eq!(reply, "");
    }

    #[tokio::test]
    async fn test_timeout_fails_call_and_cleans_up() {
        let broker = MemoryBroker::new();
        let client = client(
            &broker,
            RpcClientConfig {
                reply_timeout: Some(Duration::from_millis(30)),
            },
        )
        .await;

        let result: Result<Value> = client.send("nobody.home", &json!({})).await;
        assert!(matches!(result, Err(RpcError::Timeout(_))));
        assert_eq!(broker.unacked_count(), 0);
    }

    #[tokio::test]
    async fn test_without_timeout_waits() {
        let broker = MemoryBroker::new();
        let client = client(&broker, RpcClientConfig::default()).await;

        let request = json!({});
        let call = client.send::<_, Value>("nobody.home", &request);
        assert!(tokio::time::timeout(Duration::from_millis(50), call)
            .await
            .is_err());
    }
}
