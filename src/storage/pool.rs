//! Bounded pool of stream store sessions.
//!
//! Every bus operation acquires its own session per round trip and returns
//! it when the pooled object drops; callers never hold one across unrelated
//! work.

use std::cell::Cell;
use std::time::Duration;

use deadpool::managed::{Object, Pool, PoolError};
use serde::Deserialize;
use tracing::{debug, error, info};

use super::{Result, StoreError, StoreManager};
use crate::config::ConfigError;
use crate::utils::TaskHandle;

/// A session checked out of the pool. Returned on drop.
pub type Pooled<M> = Object<M>;

/// Pool limits.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of live sessions.
    pub max: usize,
    /// Sessions opened eagerly by `warm` and kept by the idle reaper.
    pub min: usize,
    /// Idle time after which surplus sessions are closed.
    pub idle_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max: 10,
            min: 2,
            idle_timeout_ms: 30_000,
        }
    }
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.max == 0 {
            return Err(ConfigError::Invalid(
                "pool max must be a positive number".to_string(),
            ));
        }
        if self.min > self.max {
            return Err(ConfigError::Invalid(format!(
                "pool min ({}) exceeds max ({})",
                self.min, self.max
            )));
        }
        if self.idle_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "pool idle timeout must be a positive number".to_string(),
            ));
        }
        Ok(())
    }
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Sessions currently open (idle + checked out).
    pub size: usize,
    /// Idle sessions ready to hand out.
    pub available: usize,
    /// Configured maximum.
    pub max: usize,
}

/// Bounded pool of store sessions.
///
/// `acquire` hands out an idle session, opens a new one while below `max`,
/// and otherwise waits until one is returned. Connect failures surface to
/// the caller; the pool never retries on its own.
pub struct ConnectionPool<M: StoreManager> {
    inner: Pool<M>,
    config: PoolConfig,
}

impl<M: StoreManager> Clone for ConnectionPool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            config: self.config.clone(),
        }
    }
}

impl<M: StoreManager> ConnectionPool<M> {
    /// Create a pool. No session is opened until first use or `warm`.
    pub fn new(manager: M, config: PoolConfig) -> Result<Self> {
        config.validate()?;

        let inner = Pool::builder(manager)
            .max_size(config.max)
            .build()
            .map_err(|e| StoreError::Pool(format!("Failed to create pool: {}", e)))?;

        debug!(
            max = config.max,
            min = config.min,
            idle_timeout_ms = config.idle_timeout_ms,
            "Store connection pool created"
        );

        Ok(Self { inner, config })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Check out a ready session.
    pub async fn acquire(&self) -> Result<Pooled<M>> {
        self.inner.get().await.map_err(|e| match e {
            PoolError::Backend(e) => {
                error!(error = %e, "Error creating store client");
                e
            }
            other => StoreError::Pool(other.to_string()),
        })
    }

    /// Evict a broken session so it is never handed out again.
    pub fn destroy(&self, conn: Pooled<M>) {
        drop(Object::take(conn));
        debug!("Destroyed store client");
    }

    /// Open sessions until `min` are idle. Failures are logged, not fatal.
    pub async fn warm(&self) {
        let mut held = Vec::with_capacity(self.config.min);
        while held.len() < self.config.min {
            match self.inner.get().await {
                Ok(conn) => held.push(conn),
                Err(e) => {
                    error!(error = %e, opened = held.len(), "Failed to warm store pool");
                    break;
                }
            }
        }
        info!(size = self.inner.status().size, "Store pool warmed");
    }

    pub fn status(&self) -> PoolStatus {
        let status = self.inner.status();
        PoolStatus {
            size: status.size,
            available: status.available,
            max: status.max_size,
        }
    }

    /// Spawn the idle reaper.
    ///
    /// Every `idle_timeout` it closes idle sessions unused for longer than
    /// `idle_timeout`, keeping at least `min` open.
    pub fn spawn_reaper(&self) -> TaskHandle {
        let pool = self.inner.clone();
        let min = self.config.min;
        let idle_timeout = self.config.idle_timeout();

        TaskHandle::spawn(move |mut shutdown| async move {
            while shutdown.sleep(idle_timeout).await {
                let surplus = Cell::new(pool.status().size.saturating_sub(min));
                let evicted = Cell::new(0usize);

                let _ = pool.retain(|_, metrics| {
                    if surplus.get() > 0 && metrics.last_used() > idle_timeout {
                        surplus.set(surplus.get() - 1);
                        evicted.set(evicted.get() + 1);
                        false
                    } else {
                        true
                    }
                });

                if evicted.get() > 0 {
                    debug!(evicted = evicted.get(), "Evicted idle store clients");
                }
            }
            debug!("Store pool reaper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryManager, MemoryStore, StreamConnection};

    fn pool_with(store: &MemoryStore, config: PoolConfig) -> ConnectionPool<MemoryManager> {
        ConnectionPool::new(MemoryManager::new(store.clone()), config).unwrap()
    }

    #[test]
    fn test_pool_config_validation() {
        assert!(PoolConfig::default().validate().is_ok());

        let zero_max = PoolConfig {
            max: 0,
            min: 0,
            ..Default::default()
        };
        assert!(zero_max.validate().is_err());

        let min_above_max = PoolConfig {
            max: 2,
            min: 3,
            ..Default::default()
        };
        assert!(min_above_max.validate().is_err());
    }

    #[test]
    fn test_invalid_config_rejected_at_construction() {
        let store = MemoryStore::new();
        let result = ConnectionPool::new(
            MemoryManager::new(store.clone()),
            PoolConfig {
                max: 0,
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(StoreError::Config(_))));
        assert_eq!(store.connections_opened(), 0);
    }

    #[tokio::test]
    async fn test_acquire_reuses_returned_session() {
        let store = MemoryStore::new();
        let pool = pool_with(&store, PoolConfig::default());

        {
            let mut conn = pool.acquire().await.unwrap();
            conn.hash_set("k", "f", "v").await.unwrap();
        }
        {
            let mut conn = pool.acquire().await.unwrap();
            assert_eq!(conn.hash_get("k", "f").await.unwrap().as_deref(), Some("v"));
        }

        assert_eq!(store.connections_opened(), 1);
        assert_eq!(pool.status().size, 1);
    }

    #[tokio::test]
    async fn test_connect_failure_surfaces_to_caller() {
        let store = MemoryStore::new();
        store.set_offline(true);
        let pool = pool_with(&store, PoolConfig::default());

        let result = pool.acquire().await;
        assert!(matches!(result, Err(StoreError::Connect(_))));
    }

    #[tokio::test]
    async fn test_acquire_waits_when_exhausted() {
        let store = MemoryStore::new();
        let pool = pool_with(
            &store,
            PoolConfig {
                max: 1,
                min: 0,
                ..Default::default()
            },
        );

        let held = pool.acquire().await.unwrap();
        let waiting = tokio::time::timeout(Duration::from_millis(50), pool.acquire()).await;
        assert!(waiting.is_err(), "acquire should block while pool is exhausted");

        let pool2 = pool.clone();
        let waiter = tokio::spawn(async move { pool2.acquire().await.map(|_| ()) });
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(held);

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should be served once a session frees")
            .unwrap()
            .unwrap();
        assert_eq!(store.connections_opened(), 1);
    }

    #[tokio::test]
    async fn test_destroy_evicts_session() {
        let store = MemoryStore::new();
        let pool = pool_with(&store, PoolConfig::default());

        let conn = pool.acquire().await.unwrap();
        pool.destroy(conn);
        assert_eq!(pool.status().size, 0);

        let _conn = pool.acquire().await.unwrap();
        assert_eq!(store.connections_opened(), 2);
    }

    #[tokio::test]
    async fn test_warm_opens_min_sessions() {
        let store = MemoryStore::new();
        let pool = pool_with(
            &store,
            PoolConfig {
                max: 5,
                min: 3,
                ..Default::default()
            },
        );

        pool.warm().await;

        let status = pool.status();
        assert_eq!(status.size, 3);
        assert_eq!(status.available, 3);
        assert_eq!(status.max, 5);
    }

    #[tokio::test]
    async fn test_warm_tolerates_offline_store() {
        let store = MemoryStore::new();
        store.set_offline(true);
        let pool = pool_with(&store, PoolConfig::default());

        pool.warm().await;
        assert_eq!(pool.status().size, 0);
    }

    #[tokio::test]
    async fn test_reaper_trims_idle_sessions_down_to_min() {
        let store = MemoryStore::new();
        let pool = pool_with(
            &store,
            PoolConfig {
                max: 5,
                min: 1,
                idle_timeout_ms: 20,
            },
        );

        {
            let _a = pool.acquire().await.unwrap();
            let _b = pool.acquire().await.unwrap();
            let _c = pool.acquire().await.unwrap();
        }
        assert_eq!(pool.status().size, 3);

        let reaper = pool.spawn_reaper();
        tokio::time::sleep(Duration::from_millis(120)).await;
        reaper.shutdown().await;

        assert_eq!(pool.status().size, 1);
    }
}
