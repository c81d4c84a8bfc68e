//! Redis stream store.
//!
//! Sessions are multiplexed async connections handed out by the pool.
//! Streams map to XADD/XREADGROUP/XACK, job status to a single hash.

use std::time::Duration;

use async_trait::async_trait;
use deadpool::managed::{Manager, Metrics, RecycleError, RecycleResult};
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client};
use tracing::{debug, info};

use crate::storage::{GroupInit, ReadCursor, Result, StoreError, StreamConnection, StreamEntry};

/// Pool manager opening Redis sessions.
pub struct RedisManager {
    client: Client,
    url: String,
}

impl RedisManager {
    /// Create a manager for `url` (e.g., redis://localhost:6379).
    ///
    /// Only parses the URL; no connection is made until the pool asks.
    pub fn new(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Manager for RedisManager {
    type Type = MultiplexedConnection;
    type Error = StoreError;

    async fn create(&self) -> std::result::Result<MultiplexedConnection, StoreError> {
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::Connect(format!("{}: {}", self.url, e)))?;
        info!(url = %self.url, "Connected to Redis");
        Ok(conn)
    }

    async fn recycle(
        &self,
        conn: &mut MultiplexedConnection,
        _metrics: &Metrics,
    ) -> RecycleResult<StoreError> {
        let pong: String = redis::cmd("PING")
            .query_async(conn)
            .await
            .map_err(|e| RecycleError::Backend(StoreError::Redis(e)))?;
        if pong != "PONG" {
            return Err(RecycleError::Backend(StoreError::Command(format!(
                "Unexpected PING reply: {}",
                pong
            ))));
        }
        Ok(())
    }
}

#[async_trait]
impl StreamConnection for MultiplexedConnection {
    async fn create_group(&mut self, stream: &str, group: &str) -> Result<GroupInit> {
        let created: redis::RedisResult<()> = self.xgroup_create_mkstream(stream, group, "$").await;
        match created {
            Ok(()) => Ok(GroupInit::Created),
            Err(e) if e.code() == Some("BUSYGROUP") => {
                debug!(stream = %stream, group = %group, "Consumer group already exists");
                Ok(GroupInit::Existing)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn append(&mut self, stream: &str, fields: &[(&str, &str)]) -> Result<String> {
        let id: String = self.xadd(stream, "*", fields).await?;
        Ok(id)
    }

    async fn read_group(
        &mut self,
        stream: &str,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>> {
        let mut options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count);
        if cursor == ReadCursor::New {
            let millis = block.as_micros().div_ceil(1000);
            options = options.block(usize::try_from(millis).unwrap_or(usize::MAX));
        }

        let reply: Option<StreamReadReply> = self
            .xread_options(&[stream], &[cursor.as_str()], &options)
            .await?;

        let mut entries = Vec::new();
        for key in reply.map(|r| r.keys).unwrap_or_default() {
            for id in key.ids {
                let mut fields = std::collections::HashMap::with_capacity(id.map.len());
                for (name, value) in id.map {
                    fields.insert(name, redis::from_redis_value::<String>(&value)?);
                }
                entries.push(StreamEntry { id: id.id, fields });
            }
        }
        Ok(entries)
    }

    async fn ack(&mut self, stream: &str, group: &str, id: &str) -> Result<()> {
        let _: i64 = self.xack(stream, group, &[id]).await?;
        Ok(())
    }

    async fn hash_set(&mut self, key: &str, field: &str, value: &str) -> Result<()> {
        let _: () = self.hset(key, field, value).await?;
        Ok(())
    }

    async fn hash_get(&mut self, key: &str, field: &str) -> Result<Option<String>> {
        let value: Option<String> = self.hget(key, field).await?;
        Ok(value)
    }
}
