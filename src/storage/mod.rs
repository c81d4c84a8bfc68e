//! Stream store access.
//!
//! This module contains:
//! - `StreamConnection` trait: the stream, consumer-group and hash commands
//!   the event bus needs from one store session
//! - `ConnectionPool`: bounded pool of store sessions
//! - Implementations: Redis (feature `redis`), in-memory

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use deadpool::managed::Manager;

use crate::config::ConfigError;

pub mod memory;
pub mod pool;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::{MemoryConnection, MemoryManager, MemoryStore};
pub use pool::{ConnectionPool, PoolConfig, PoolStatus, Pooled};
#[cfg(feature = "redis")]
pub use self::redis::RedisManager;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur talking to the stream store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Pool error: {0}")]
    Pool(String),

    #[error("Command failed: {0}")]
    Command(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

/// One entry read from a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    /// Store-assigned, monotonically increasing entry id.
    pub id: String,
    /// Entry fields.
    pub fields: HashMap<String, String>,
}

impl StreamEntry {
    /// Look up a field value.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Where a consumer-group read starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadCursor {
    /// Entries never delivered to any consumer of the group (`>`).
    New,
    /// Entries already delivered to this consumer but not acknowledged (`0`).
    Pending,
}

impl ReadCursor {
    /// Wire form of the cursor.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadCursor::New => ">",
            ReadCursor::Pending => "0",
        }
    }
}

/// Outcome of creating a consumer group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupInit {
    /// The group was created at the stream tail.
    Created,
    /// The group already existed; its cursor was left untouched.
    Existing,
}

/// Commands the event bus issues against one store session.
#[async_trait]
pub trait StreamConnection: Send {
    /// Create `group` on `stream` at the stream tail, creating the stream if
    /// needed. An existing group is left as is.
    async fn create_group(&mut self, stream: &str, group: &str) -> Result<GroupInit>;

    /// Append an entry, returning its store-assigned id.
    async fn append(&mut self, stream: &str, fields: &[(&str, &str)]) -> Result<String>;

    /// Read up to `count` entries for `consumer` under `group`.
    ///
    /// With `ReadCursor::New` this blocks up to `block` when nothing is
    /// available and returns an empty batch on timeout.
    async fn read_group(
        &mut self,
        stream: &str,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>>;

    /// Acknowledge an entry, removing it from the group's pending list.
    async fn ack(&mut self, stream: &str, group: &str, id: &str) -> Result<()>;

    /// Set one field of a hash.
    async fn hash_set(&mut self, key: &str, field: &str, value: &str) -> Result<()>;

    /// Read one field of a hash.
    async fn hash_get(&mut self, key: &str, field: &str) -> Result<Option<String>>;
}

/// Pool manager whose sessions speak `StreamConnection`.
pub trait StoreManager:
    Manager<Type: StreamConnection, Error = StoreError> + 'static
{
}

impl<T> StoreManager for T
where
    T: Manager<Error = StoreError> + 'static,
    T::Type: StreamConnection,
{
}
