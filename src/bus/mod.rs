//! Durable job bus over a stream store.
//!
//! This module contains:
//! - `EventBus`: publishes events to a stream and runs a competing-consumers
//!   loop against a consumer group
//! - `JobStatusStore`: per-job lifecycle status kept next to the stream
//! - `BusEventHandler` trait: for processing events
//! - Bus configuration types

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::storage::StoreError;

pub mod dispatch;
pub mod status;
pub mod stream;

pub use dispatch::{handler_fn, DispatchResult};
pub use status::{JobStatus, JobStatusStore};
pub use stream::{EventBus, DEFAULT_POLL_INTERVAL};

#[cfg(feature = "redis")]
/// Event bus backed by Redis streams.
pub type RedisEventBus = EventBus<crate::storage::RedisManager>;

/// Event bus backed by the in-memory store.
pub type MemoryEventBus = EventBus<crate::storage::MemoryManager>;

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Handler failed: {0}")]
    Handler(String),

    #[error("Job {0} failed")]
    JobFailed(String),
}

// ============================================================================
// Events and handlers
// ============================================================================

/// An event as published by producers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusEvent {
    /// Event type. Handlers filter on this themselves.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Arbitrary JSON payload.
    pub payload: serde_json::Value,
}

impl BusEvent {
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
        }
    }
}

/// An event as delivered to handlers.
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    /// Store-assigned stream entry id.
    pub id: String,
    /// Job tracked for this event.
    pub job_id: String,
    /// The published event.
    pub event: BusEvent,
}

/// Handler for processing events from the bus.
///
/// Every registered handler sees every event.
pub trait BusEventHandler: Send + Sync {
    /// Process one event.
    fn handle(&self, message: Arc<BusMessage>) -> BoxFuture<'static, Result<()>>;
}

// ============================================================================
// Configuration
// ============================================================================

/// Default number of entries claimed per read.
pub const DEFAULT_CONSUME_COUNT: usize = 10;

/// Default time a read blocks waiting for new entries.
pub const DEFAULT_BLOCK_TIMEOUT_MS: u64 = 5000;

/// Event bus options.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BusOptions {
    /// Stream events are appended to.
    pub stream_key: String,
    /// Consumer group sharing the stream cursor.
    pub group: String,
    /// Hash holding per-job status.
    pub status_key: String,
    /// Entries claimed per read (default 10).
    #[serde(default)]
    pub consume_count: Option<usize>,
    /// Milliseconds a read blocks waiting for entries (default 5000).
    #[serde(default)]
    pub block_timeout_ms: Option<u64>,
}

impl BusOptions {
    pub fn new(
        stream_key: impl Into<String>,
        group: impl Into<String>,
        status_key: impl Into<String>,
    ) -> Self {
        Self {
            stream_key: stream_key.into(),
            group: group.into(),
            status_key: status_key.into(),
            consume_count: None,
            block_timeout_ms: None,
        }
    }

    pub fn with_consume_count(mut self, count: usize) -> Self {
        self.consume_count = Some(count);
        self
    }

    /// Block timeout for group reads, rounded up to whole milliseconds.
    pub fn with_block_timeout(mut self, timeout: Duration) -> Self {
        self.block_timeout_ms = Some(ceil_millis(timeout));
        self
    }

    pub fn consume_count(&self) -> usize {
        self.consume_count.unwrap_or(DEFAULT_CONSUME_COUNT)
    }

    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout_ms.unwrap_or(DEFAULT_BLOCK_TIMEOUT_MS))
    }

    /// Reject missing keys and explicit zero limits.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.stream_key.is_empty() {
            return Err(ConfigError::Missing("bus stream_key"));
        }
        if self.group.is_empty() {
            return Err(ConfigError::Missing("bus group"));
        }
        if self.status_key.is_empty() {
            return Err(ConfigError::Missing("bus status_key"));
        }
        if self.consume_count == Some(0) {
            return Err(ConfigError::Invalid(
                "bus consume_count must be a positive number".to_string(),
            ));
        }
        if self.block_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "bus block_timeout_ms must be a positive number".to_string(),
            ));
        }
        Ok(())
    }
}

fn ceil_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros().div_ceil(1000)).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sub_millisecond_block_timeout_rounds_up() {
        let options = BusOptions::new("jobs", "workers", "jobs:status")
            .with_block_timeout(Duration::from_micros(300));
        assert!(options.validate().is_ok());
        assert_eq!(options.block_timeout(), Duration::from_millis(1));

        let options = BusOptions::new("jobs", "workers", "jobs:status")
            .with_block_timeout(Duration::from_micros(2001));
        assert_eq!(options.block_timeout(), Duration::from_millis(3));
    }

    #[test]
    fn test_bus_options_defaults() {
        let options = BusOptions::new("jobs", "workers", "jobs:status");
        assert!(options.validate().is_ok());
        assert_eq!(options.consume_count(), 10);
        assert_eq!(options.block_timeout(), Duration::from_millis(5000));
    }

    #[test]
    fn test_bus_options_reject_zero_limits() {
        let zero_count = BusOptions::new("jobs", "workers", "jobs:status").with_consume_count(0);
        assert!(matches!(
            zero_count.validate(),
            Err(ConfigError::Invalid(_))
        ));

        let zero_block =
            BusOptions::new("jobs", "workers", "jobs:status").with_block_timeout(Duration::ZERO);
        assert!(matches!(
            zero_block.validate(),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_bus_options_require_keys() {
        for options in [
            BusOptions::new("", "workers", "jobs:status"),
            BusOptions::new("jobs", "", "jobs:status"),
            BusOptions::new("jobs", "workers", ""),
        ] {
            assert!(matches!(options.validate(), Err(ConfigError::Missing(_))));
        }
    }

    #[test]
    fn test_bus_event_wire_shape() {
        let event = BusEvent::new("user.created", serde_json::json!({"a": 1}));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json, serde_json::json!({"type": "user.created", "payload": {"a": 1}}));
    }
}
