//! RPC server dispatch.
//!
//! Each registered operation consumes its own durable queue with prefetch 1.
//! A request is acknowledged on arrival, before its handler runs, so a
//! request is never redelivered regardless of outcome. Exactly one reply is
//! published per request.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use backon::BackoffBuilder;
use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, error, info, warn, Instrument};

use super::{decode_body, Result, RpcError, RpcHandler, ServiceResponse, CONTENT_TYPE_JSON};
use crate::transport::{
    BrokerConnection, Channel, ChannelOf, Delivery, DeliveryStream, MessageProperties, QueueKind,
    Transport,
};
use crate::utils::retry::resubscribe_backoff;
use crate::utils::{Shutdown, TaskHandle};

/// One in-flight request per operation channel.
const PREFETCH: u16 = 1;

/// Registration table plus the connection to serve it on.
pub struct RpcServer<T: Transport> {
    connection: BrokerConnection<T>,
    service: String,
    operations: BTreeMap<String, Arc<dyn RpcHandler>>,
}

impl<T: Transport> RpcServer<T> {
    pub fn new(connection: BrokerConnection<T>, service: impl Into<String>) -> Result<Self> {
        let service = service.into();
        if service.is_empty() {
            return Err(RpcError::Registration(
                "service name must not be empty".to_string(),
            ));
        }
        Ok(Self {
            connection,
            service,
            operations: BTreeMap::new(),
        })
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Bind `handler` to `operation`.
    pub fn register(
        &mut self,
        operation: impl Into<String>,
        handler: Arc<dyn RpcHandler>,
    ) -> Result<&mut Self> {
        let operation = operation.into();
        if operation.is_empty() {
            return Err(RpcError::Registration(
                "operation name must not be empty".to_string(),
            ));
        }
        if self.operations.contains_key(&operation) {
            return Err(RpcError::Registration(format!(
                "operation '{}' already registered on '{}'",
                operation, self.service
            )));
        }
        self.operations.insert(operation, handler);
        Ok(self)
    }

    /// Registered operation names, sorted.
    pub fn operations(&self) -> impl Iterator<Item = &str> {
        self.operations.keys().map(String::as_str)
    }

    /// Queue serving `operation`.
    pub fn queue_name(&self, operation: &str) -> String {
        format!("{}.{}", self.service, operation)
    }

    /// Subscribe every operation, then spawn one dispatch task per queue.
    ///
    /// Fails without leaving consumers behind if any subscription fails.
    pub async fn start(self) -> Result<RpcServerHandle> {
        if self.operations.is_empty() {
            return Err(RpcError::Registration(format!(
                "no operations registered on '{}'",
                self.service
            )));
        }

        let mut subscriptions = Vec::with_capacity(self.operations.len());
        for (operation, handler) in &self.operations {
            let queue = self.queue_name(operation);
            match subscribe(&self.connection, &queue).await {
                Ok((channel, stream)) => {
                    subscriptions.push((queue, Arc::clone(handler), channel, stream))
                }
                Err(e) => {
                    for (queue, _, channel, _) in subscriptions {
                        if let Err(close_err) = channel.close().await {
                            debug!(queue = %queue, error = %close_err, "Failed to close operation channel");
                        }
                    }
                    return Err(e);
                }
            }
        }

        let mut tasks = Vec::with_capacity(subscriptions.len());
        let mut queues = Vec::with_capacity(subscriptions.len());
        for (queue, handler, channel, stream) in subscriptions {
            let connection = self.connection.clone();
            let span = tracing::info_span!("rpc.serve", queue = %queue);
            queues.push(queue.clone());
            tasks.push(TaskHandle::spawn(move |shutdown| {
                serve(connection, queue, handler, channel, stream, shutdown).instrument(span)
            }));
        }

        info!(service = %self.service, operations = ?queues, "RPC server started");
        Ok(RpcServerHandle { tasks, queues })
    }
}

/// Running dispatch tasks of a started server.
#[must_use = "dropping the handle stops the server"]
pub struct RpcServerHandle {
    tasks: Vec<TaskHandle>,
    queues: Vec<String>,
}

impl RpcServerHandle {
    /// Queues being served.
    pub fn queues(&self) -> &[String] {
        &self.queues
    }

    pub fn is_running(&self) -> bool {
        self.tasks.iter().any(|task| !task.is_finished())
    }

    /// Stop every dispatch task and wait for them to exit.
    pub async fn stop(self) {
        futures::future::join_all(self.tasks.into_iter().map(TaskHandle::shutdown)).await;
        debug!(queues = ?self.queues, "RPC server stopped");
    }
}

async fn subscribe<T: Transport>(
    connection: &BrokerConnection<T>,
    queue: &str,
) -> Result<(ChannelOf<T>, DeliveryStream)> {
    let channel = connection.create_channel().await?;
    channel.declare_queue(queue, QueueKind::Durable).await?;
    channel.set_prefetch(PREFETCH).await?;
    let stream = channel.consume(queue).await?;
    debug!(queue = %queue, "Subscribed");
    Ok((channel, stream))
}

/// Re-establish a consumer after its stream ended. `None` if stopped first.
async fn resubscribe<T: Transport>(
    connection: &BrokerConnection<T>,
    queue: &str,
    shutdown: &mut Shutdown,
) -> Option<(ChannelOf<T>, DeliveryStream)> {
    let backoff = resubscribe_backoff().build();

    for (attempt, delay) in std::iter::once(Duration::ZERO).chain(backoff).enumerate() {
        if attempt > 0 && !shutdown.sleep(delay).await {
            return None;
        }

        let subscribed = tokio::select! {
            subscribed = subscribe(connection, queue) => subscribed,
            _ = shutdown.requested() => return None,
        };
        match subscribed {
            Ok(subscription) => {
                info!(queue = %queue, attempt = attempt + 1, "Resubscribed");
                return Some(subscription);
            }
            Err(e) => {
                warn!(queue = %queue, attempt = attempt + 1, error = %e, "Resubscribe failed, retrying...");
            }
        }
    }
    None
}

async fn serve<T: Transport>(
    connection: BrokerConnection<T>,
    queue: String,
    handler: Arc<dyn RpcHandler>,
    mut channel: ChannelOf<T>,
    mut stream: DeliveryStream,
    mut shutdown: Shutdown,
) {
    loop {
        let next = tokio::select! {
            next = stream.next() => next,
            _ = shutdown.requested() => break,
        };

        match next {
            Some(Ok(delivery)) => handle_delivery(&channel, handler.as_ref(), delivery).await,
            Some(Err(e)) => error!(error = %e, "Delivery error"),
            None => {
                warn!("Consumer stream ended, resubscribing");
                if let Err(e) = channel.close().await {
                    debug!(error = %e, "Failed to close stale operation channel");
                }
                match resubscribe(&connection, &queue, &mut shutdown).await {
                    Some((fresh_channel, fresh_stream)) => {
                        channel = fresh_channel;
                        stream = fresh_stream;
                    }
                    None => return,
                }
            }
        }
    }

    if let Err(e) = channel.close().await {
        debug!(error = %e, "Failed to close operation channel");
    }
}

async fn handle_delivery<C: Channel>(channel: &C, handler: &dyn RpcHandler, delivery: Delivery) {
    if let Err(e) = channel.ack(delivery.tag).await {
        error!(error = %e, "Failed to ack request");
    }

    let reply = match decode_body(&delivery.body) {
        Ok(request) => match handler.call(request).await {
            Ok(Value::Null) => Value::Object(Default::default()),
            Ok(value) => value,
            Err(e) => {
                error!(
                    correlation_id = ?delivery.properties.correlation_id,
                    error = %e,
                    "Handler failed"
                );
                ServiceResponse::error().into_value()
            }
        },
        Err(e) => {
            warn!(
                correlation_id = ?delivery.properties.correlation_id,
                error = %e,
                "Request body is not JSON"
            );
            ServiceResponse::error().into_value()
        }
    };

    let Some(reply_to) = delivery.properties.reply_to.as_deref() else {
        warn!(
            correlation_id = ?delivery.properties.correlation_id,
            "Request has no reply_to, dropping reply"
        );
        return;
    };

    let body = match serde_json::to_vec(&reply) {
        Ok(body) => body,
        Err(e) => {
            error!(error = %e, "Failed to encode reply");
            return;
        }
    };

    let properties = MessageProperties {
        correlation_id: delivery.properties.correlation_id.clone(),
        reply_to: None,
        content_type: Some(CONTENT_TYPE_JSON.to_string()),
    };
    if let Err(e) = channel.publish(reply_to, properties, body).await {
        error!(reply_to = %reply_to, error = %e, "Failed to publish reply");
    }
}
