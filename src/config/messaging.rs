//! Broker and RPC configuration types.

use std::fmt;
use std::time::Duration;

use serde::Deserialize;

use crate::rpc::RpcClientConfig;
use crate::transport::{BrokerEndpoint, ConnectionSettings};

/// Message broker configuration.
///
/// Connection parameters default to empty; `BrokerConnection::new` rejects
/// them until they are supplied.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker host name.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Login user.
    pub user: String,
    /// Login password.
    pub password: String,
    /// Virtual host.
    pub vhost: String,
    /// Liveness check period for the broker watchdog.
    pub reconnect_interval_ms: u64,
    /// Poll period while waiting for a connection before opening a channel.
    pub channel_wait_interval_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        let settings = ConnectionSettings::default();
        Self {
            host: String::new(),
            port: 5672,
            user: String::new(),
            password: String::new(),
            vhost: "/".to_string(),
            reconnect_interval_ms: settings.reconnect_interval.as_millis() as u64,
            channel_wait_interval_ms: settings.channel_wait_interval.as_millis() as u64,
        }
    }
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("vhost", &self.vhost)
            .field("reconnect_interval_ms", &self.reconnect_interval_ms)
            .field("channel_wait_interval_ms", &self.channel_wait_interval_ms)
            .finish()
    }
}

impl BrokerConfig {
    /// Connection target described by this config.
    pub fn endpoint(&self) -> BrokerEndpoint {
        BrokerEndpoint {
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
            password: self.password.clone(),
            vhost: self.vhost.clone(),
        }
    }

    /// Watchdog and channel-wait timing.
    pub fn settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            reconnect_interval: Duration::from_millis(self.reconnect_interval_ms),
            channel_wait_interval: Duration::from_millis(self.channel_wait_interval_ms),
        }
    }
}

/// RPC client configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Reply deadline; unset waits indefinitely.
    pub reply_timeout_ms: Option<u64>,
}

impl RpcConfig {
    /// Client settings derived from this config.
    pub fn client_config(&self) -> RpcClientConfig {
        RpcClientConfig {
            reply_timeout: self.reply_timeout_ms.map(Duration::from_millis),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_config_debug_redacts_password() {
        let config = BrokerConfig {
            password: "hunter2".to_string(),
            ..Default::default()
        };
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_broker_settings_match_defaults() {
        let settings = BrokerConfig::default().settings();
        assert_eq!(settings.reconnect_interval, Duration::from_secs(5));
        assert_eq!(settings.channel_wait_interval, Duration::from_secs(1));
    }
}
