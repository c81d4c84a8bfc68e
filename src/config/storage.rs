//! Stream store configuration types.

use serde::Deserialize;

use crate::storage::PoolConfig;

/// Stream store configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Redis connection URL.
    pub url: String,
    /// Connection pool limits.
    pub pool: PoolConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            pool: PoolConfig::default(),
        }
    }
}
