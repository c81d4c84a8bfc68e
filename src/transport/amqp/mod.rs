//! AMQP (RabbitMQ) transport.
//!
//! Thin mapping of the broker traits onto `lapin`. Publishes go through the
//! default exchange with the queue name as routing key.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Connection, ConnectionProperties,
};
use tracing::{debug, error};

use super::{
    BrokerEndpoint, BrokerError, Channel, Delivery, DeliveryStream, Link, MessageProperties,
    QueueKind, Result, Transport,
};

/// Opens `lapin` connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct AmqpTransport;

#[async_trait]
impl Transport for AmqpTransport {
    type Link = AmqpLink;

    async fn open(&self, endpoint: &BrokerEndpoint) -> Result<AmqpLink> {
        let connection = Connection::connect(&endpoint.uri(), ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        Ok(AmqpLink(connection))
    }
}

/// One AMQP connection.
pub struct AmqpLink(Connection);

#[async_trait]
impl Link for AmqpLink {
    type Channel = AmqpChannel;

    fn is_connected(&self) -> bool {
        self.0.status().connected()
    }

    async fn create_channel(&self) -> Result<AmqpChannel> {
        let channel = self
            .0
            .create_channel()
            .await
            .map_err(|e| BrokerError::Channel(format!("Failed to create channel: {}", e)))?;
        Ok(AmqpChannel(channel))
    }

    async fn close(&self) {
        if let Err(e) = self.0.close(200, "OK").await {
            debug!(error = %e, "Error closing AMQP connection");
        }
    }
}

/// One AMQP channel.
pub struct AmqpChannel(lapin::Channel);

fn properties_from(properties: &BasicProperties) -> MessageProperties {
    MessageProperties {
        correlation_id: properties
            .correlation_id()
            .as_ref()
            .map(|s| s.as_str().to_string()),
        reply_to: properties.reply_to().as_ref().map(|s| s.as_str().to_string()),
        content_type: properties
            .content_type()
            .as_ref()
            .map(|s| s.as_str().to_string()),
    }
}

fn properties_into(properties: MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default();
    if let Some(correlation_id) = properties.correlation_id {
        basic = basic.with_correlation_id(correlation_id.into());
    }
    if let Some(reply_to) = properties.reply_to {
        basic = basic.with_reply_to(reply_to.into());
    }
    if let Some(content_type) = properties.content_type {
        basic = basic.with_content_type(content_type.into());
    }
    basic
}

#[async_trait]
impl Channel for AmqpChannel {
    async fn declare_queue(&self, name: &str, kind: QueueKind) -> Result<String> {
        let options = match kind {
            QueueKind::Durable => QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            QueueKind::Exclusive => QueueDeclareOptions {
                exclusive: true,
                auto_delete: true,
                ..Default::default()
            },
        };

        let queue = self
            .0
            .queue_declare(name, options, FieldTable::default())
            .await
            .map_err(|e| BrokerError::Declare(format!("Failed to declare queue: {}", e)))?;
        Ok(queue.name().as_str().to_string())
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.0
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::Channel(format!("Failed to set prefetch: {}", e)))
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream> {
        let consumer = self
            .0
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Consume(format!("Failed to start consumer: {}", e)))?;

        Ok(consumer
            .map(|delivery| match delivery {
                Ok(delivery) => Ok(Delivery {
                    tag: delivery.delivery_tag,
                    properties: properties_from(&delivery.properties),
                    body: delivery.data,
                }),
                Err(e) => {
                    error!(error = %e, "AMQP consumer error");
                    Err(BrokerError::Consume(e.to_string()))
                }
            })
            .boxed())
    }

    async fn publish(
        &self,
        queue: &str,
        properties: MessageProperties,
        body: Vec<u8>,
    ) -> Result<()> {
        let confirm = self
            .0
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &body,
                properties_into(properties),
            )
            .await
            .map_err(|e| BrokerError::Publish(format!("Failed to publish: {}", e)))?;

        confirm
            .await
            .map_err(|e| BrokerError::Publish(format!("Publish confirmation failed: {}", e)))?;
        Ok(())
    }

    async fn ack(&self, tag: u64) -> Result<()> {
        self.0
            .basic_ack(tag, BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }

    async fn close(&self) -> Result<()> {
        self.0
            .close(200, "OK")
            .await
            .map_err(|e| BrokerError::Channel(format!("Failed to close channel: {}", e)))
    }
}
