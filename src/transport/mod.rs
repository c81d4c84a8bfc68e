//! Message broker access.
//!
//! This module contains:
//! - `Transport` / `Link` / `Channel` traits: the broker primitives RPC needs
//! - `BrokerConnection`: one long-lived link with a liveness watchdog
//! - Implementations: AMQP (feature `amqp`), in-memory

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::config::ConfigError;

pub mod connection;
pub mod memory;
#[cfg(feature = "amqp")]
pub mod amqp;

#[cfg(feature = "amqp")]
pub use amqp::AmqpTransport;
pub use connection::{BrokerConnection, ConnectionSettings};
pub use memory::MemoryBroker;

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors that can occur talking to the broker.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Queue declaration failed: {0}")]
    Declare(String),

    #[error("Consume failed: {0}")]
    Consume(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Acknowledgement failed: {0}")]
    Ack(String),

    #[error("Not connected to broker")]
    NotConnected,
}

/// Where and as whom to connect.
#[derive(Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
}

impl BrokerEndpoint {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
            password: password.into(),
            vhost: "/".to_string(),
        }
    }

    /// Every connection parameter is required.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::Missing("broker host"));
        }
        if self.port == 0 {
            return Err(ConfigError::Missing("broker port"));
        }
        if self.user.is_empty() {
            return Err(ConfigError::Missing("broker user"));
        }
        if self.password.is_empty() {
            return Err(ConfigError::Missing("broker password"));
        }
        if self.vhost.is_empty() {
            return Err(ConfigError::Missing("broker vhost"));
        }
        Ok(())
    }

    /// AMQP URI for this endpoint.
    pub fn uri(&self) -> String {
        let vhost = if self.vhost == "/" {
            "%2f".to_string()
        } else {
            self.vhost.trim_start_matches('/').to_string()
        };
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, vhost
        )
    }
}

impl fmt::Debug for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerEndpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("vhost", &self.vhost)
            .finish()
    }
}

/// Queue lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// Survives broker restarts; shared by competing consumers.
    Durable,
    /// Server-named, private to the declaring channel, deleted with it.
    Exclusive,
}

/// Message metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub content_type: Option<String>,
}

/// A message delivered to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Channel-scoped tag used to acknowledge this delivery.
    pub tag: u64,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

/// Deliveries for one consumer. Ends when the channel or link closes.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Opens links to a broker.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Link: Link;

    async fn open(&self, endpoint: &BrokerEndpoint) -> Result<Self::Link>;
}

/// One broker connection.
#[async_trait]
pub trait Link: Send + Sync + 'static {
    type Channel: Channel;

    /// Whether the underlying transport is still usable.
    fn is_connected(&self) -> bool;

    async fn create_channel(&self) -> Result<Self::Channel>;

    async fn close(&self);
}

/// A logical channel multiplexed over a link.
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    /// Declare a queue and return its name. An exclusive queue declared
    /// with an empty name gets a server-generated one.
    async fn declare_queue(&self, name: &str, kind: QueueKind) -> Result<String>;

    /// Limit unacknowledged deliveries on this channel.
    async fn set_prefetch(&self, count: u16) -> Result<()>;

    async fn consume(&self, queue: &str) -> Result<DeliveryStream>;

    /// Publish to `queue` through the default exchange.
    async fn publish(&self, queue: &str, properties: MessageProperties, body: Vec<u8>)
        -> Result<()>;

    async fn ack(&self, tag: u64) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Channel type produced by a transport.
pub type ChannelOf<T> = <<T as Transport>::Link as Link>::Channel;
