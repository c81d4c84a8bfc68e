//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables.

mod messaging;
mod storage;

pub use messaging::{BrokerConfig, RpcConfig};
pub use storage::StoreConfig;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "relaybus.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "RELAYBUS_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "RELAYBUS";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "RELAYBUS_LOG";

use serde::Deserialize;

use crate::bus::BusOptions;

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing configuration: {0}")]
    Missing(&'static str),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),
}

/// Identity of the running service.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Service name. RPC queues are named `{name}.{operation}`.
    pub name: String,
    /// Consumer name within the bus group. Defaults to `{name}-{pid}`.
    pub consumer: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "relaybus".to_string(),
            consumer: None,
        }
    }
}

impl ServiceConfig {
    /// Consumer name to register under the bus group.
    pub fn consumer_name(&self) -> String {
        self.consumer
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.name, std::process::id()))
    }
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Service identity.
    pub service: ServiceConfig,
    /// Message broker connection.
    pub broker: BrokerConfig,
    /// Stream store connection and pool.
    pub store: StoreConfig,
    /// Event bus options (optional; no bus consumer without it).
    pub bus: Option<BusOptions>,
    /// RPC client behaviour.
    pub rpc: RpcConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `relaybus.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    /// 5. Legacy variables (`SERVICE_NAME`, `RABBITMQ_*`, `REDIS_*`)
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(CONFIG_ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        for (key, value) in legacy_env_overrides() {
            builder = builder.set_override_option(key, value)?;
        }

        let config: Config = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self::default()
    }
}

/// Map the environment variables of earlier deployments onto config keys.
fn legacy_env_overrides() -> Vec<(&'static str, Option<String>)> {
    let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());

    vec![
        ("service.name", var("SERVICE_NAME")),
        ("broker.host", var("RABBITMQ_HOST")),
        ("broker.port", var("RABBITMQ_PORT")),
        ("broker.user", var("RABBITMQ_USER")),
        ("broker.password", var("RABBITMQ_PASSWORD")),
        (
            "store.url",
            var("REDIS_HOST").map(|host| format!("redis://{}", host)),
        ),
        ("store.pool.max", var("REDIS_POOL_MAX")),
        ("store.pool.min", var("REDIS_POOL_MIN")),
        ("store.pool.idle_timeout_ms", var("REDIS_POOL_IDLE_TIMEOUT")),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const LEGACY_VARS: &[&str] = &[
        "SERVICE_NAME",
        "RABBITMQ_HOST",
        "RABBITMQ_PORT",
        "RABBITMQ_USER",
        "RABBITMQ_PASSWORD",
        "REDIS_HOST",
        "REDIS_POOL_MAX",
        "REDIS_POOL_MIN",
        "REDIS_POOL_IDLE_TIMEOUT",
    ];

    fn clear_legacy_vars() {
        for name in LEGACY_VARS {
            std::env::remove_var(name);
        }
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.service.name, "relaybus");
        assert_eq!(config.broker.port, 5672);
        assert!(config.broker.host.is_empty());
        assert_eq!(config.store.url, "redis://localhost:6379");
        assert_eq!(config.store.pool.max, 10);
        assert_eq!(config.store.pool.min, 2);
        assert!(config.bus.is_none());
        assert!(config.rpc.reply_timeout_ms.is_none());
    }

    #[test]
    fn test_consumer_name_defaults_to_service_and_pid() {
        let service = ServiceConfig::default();
        assert_eq!(
            service.consumer_name(),
            format!("relaybus-{}", std::process::id())
        );

        let named = ServiceConfig {
            consumer: Some("worker-a".to_string()),
            ..Default::default()
        };
        assert_eq!(named.consumer_name(), "worker-a");
    }

    #[test]
    #[serial]
    fn test_legacy_env_vars_override_defaults() {
        clear_legacy_vars();
        std::env::set_var("SERVICE_NAME", "users");
        std::env::set_var("RABBITMQ_HOST", "rabbit.internal");
        std::env::set_var("RABBITMQ_PORT", "5673");
        std::env::set_var("RABBITMQ_USER", "svc");
        std::env::set_var("RABBITMQ_PASSWORD", "secret");
        std::env::set_var("REDIS_HOST", "cache.internal:6380");
        std::env::set_var("REDIS_POOL_MAX", "4");

        let config = Config::load(None);
        clear_legacy_vars();
        let config = config.unwrap();

        assert_eq!(config.service.name, "users");
        assert_eq!(config.broker.host, "rabbit.internal");
        assert_eq!(config.broker.port, 5673);
        assert_eq!(config.broker.user, "svc");
        assert_eq!(config.broker.password, "secret");
        assert_eq!(config.store.url, "redis://cache.internal:6380");
        assert_eq!(config.store.pool.max, 4);
        assert_eq!(config.store.pool.min, 2);
    }

    #[test]
    #[serial]
    fn test_load_bus_section_from_file() {
        clear_legacy_vars();
        let dir = std::env::temp_dir().join(format!("relaybus-config-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("worker.yaml");
        std::fs::write(
            &path,
            "bus:\n  stream_key: jobs\n  group: workers\n  status_key: jobs:status\n  consume_count: 5\nrpc:\n  reply_timeout_ms: 2500\n",
        )
        .unwrap();

        let config = Config::load(Some(path.to_str().unwrap())).unwrap();
        let _ = std::fs::remove_dir_all(&dir);

        let bus = config.bus.expect("bus section should load");
        assert_eq!(bus.stream_key, "jobs");
        assert_eq!(bus.group, "workers");
        assert_eq!(bus.status_key, "jobs:status");
        assert_eq!(bus.consume_count, Some(5));
        assert_eq!(bus.block_timeout_ms, None);
        assert_eq!(
            config.rpc.client_config().reply_timeout,
            Some(std::time::Duration::from_millis(2500))
        );
    }

    #[test]
    #[serial]
    fn test_missing_explicit_file_is_an_error() {
        clear_legacy_vars();
        let result = Config::load(Some("/nonexistent/relaybus-missing.yaml"));
        assert!(matches!(result, Err(ConfigError::Load(_))));
    }
}
