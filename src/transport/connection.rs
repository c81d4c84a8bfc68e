//! Long-lived broker connection with a liveness watchdog.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::{BrokerEndpoint, ChannelOf, Link, Result, Transport};
use crate::config::ConfigError;
use crate::utils::TaskHandle;

/// Watchdog and channel-wait timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// How often the watchdog checks the link.
    pub reconnect_interval: Duration,
    /// How often `create_channel` re-checks while disconnected.
    pub channel_wait_interval: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_secs(5),
            channel_wait_interval: Duration::from_secs(1),
        }
    }
}

struct Shared<T: Transport> {
    transport: T,
    endpoint: BrokerEndpoint,
    settings: ConnectionSettings,
    link: RwLock<Option<Arc<T::Link>>>,
    connecting: tokio::sync::Mutex<()>,
}

impl<T: Transport> Shared<T> {
    fn live_link(&self) -> Option<Arc<T::Link>> {
        self.link
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .filter(|link| link.is_connected())
            .cloned()
    }

    fn replace_link(&self, link: Option<Arc<T::Link>>) -> Option<Arc<T::Link>> {
        let mut slot = self
            .link
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::replace(&mut *slot, link)
    }

    /// Open a link unless a live one exists. Failures are logged only.
    async fn ensure_connected(&self) {
        let _guard = self.connecting.lock().await;
        if self.live_link().is_some() {
            return;
        }

        match self.transport.open(&self.endpoint).await {
            Ok(link) => {
                if let Some(stale) = self.replace_link(Some(Arc::new(link))) {
                    stale.close().await;
                }
                info!(
                    host = %self.endpoint.host,
                    port = self.endpoint.port,
                    "Connected to broker"
                );
            }
            Err(e) => {
                error!(
                    host = %self.endpoint.host,
                    port = self.endpoint.port,
                    error = %e,
                    "Failed to connect to broker"
                );
            }
        }
    }
}

/// Single shared broker connection.
///
/// `connect` never fails: errors are logged and the watchdog keeps trying
/// every `reconnect_interval` at a fixed pace. Clones share the link.
pub struct BrokerConnection<T: Transport> {
    shared: Arc<Shared<T>>,
    watchdog: Arc<Mutex<Option<TaskHandle>>>,
}

impl<T: Transport> Clone for BrokerConnection<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            watchdog: Arc::clone(&self.watchdog),
        }
    }
}

impl<T: Transport> BrokerConnection<T> {
    /// Create a connection. Validates the endpoint; does not connect.
    pub fn new(
        transport: T,
        endpoint: BrokerEndpoint,
        settings: ConnectionSettings,
    ) -> std::result::Result<Self, ConfigError> {
        endpoint.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                transport,
                endpoint,
                settings,
                link: RwLock::new(None),
                connecting: tokio::sync::Mutex::new(()),
            }),
            watchdog: Arc::new(Mutex::new(None)),
        })
    }

    pub fn endpoint(&self) -> &BrokerEndpoint {
        &self.shared.endpoint
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.shared.settings
    }

    /// Connect and start the watchdog. A no-op while connected.
    pub async fn connect(&self) {
        self.shared.ensure_connected().await;
        self.start_watchdog();
    }

    fn start_watchdog(&self) {
        let mut watchdog = self
            .watchdog
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if watchdog.is_some() {
            return;
        }

        let shared = Arc::clone(&self.shared);
        *watchdog = Some(TaskHandle::spawn(move |mut shutdown| async move {
            while shutdown.sleep(shared.settings.reconnect_interval).await {
                if shared.live_link().is_none() {
                    warn!(host = %shared.endpoint.host, "Broker connection lost, reconnecting");
                    shared.ensure_connected().await;
                }
            }
            debug!("Broker watchdog stopped");
        }));
    }

    pub fn is_connected(&self) -> bool {
        self.shared.live_link().is_some()
    }

    /// Open a channel, waiting for a live connection first.
    pub async fn create_channel(&self) -> Result<ChannelOf<T>> {
        loop {
            if let Some(link) = self.shared.live_link() {
                return link.create_channel().await;
            }
            debug!("Waiting for broker connection");
            tokio::time::sleep(self.shared.settings.channel_wait_interval).await;
        }
    }

    /// Stop the watchdog and close the link.
    pub async fn shutdown(&self) {
        let watchdog = self
            .watchdog
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(watchdog) = watchdog {
            watchdog.shutdown().await;
        }

        if let Some(link) = self.shared.replace_link(None) {
            link.close().await;
        }
        info!(host = %self.shared.endpoint.host, "Broker connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Channel, MemoryBroker, QueueKind};

    fn fast() -> ConnectionSettings {
        ConnectionSettings {
            reconnect_interval: Duration::from_millis(20),
            channel_wait_interval: Duration::from_millis(5),
        }
    }

    fn endpoint() -> BrokerEndpoint {
        BrokerEndpoint::new("memory", 5672, "guest", "guest")
    }

    #[test]
    fn test_settings_defaults() {
        let settings = ConnectionSettings::default();
        assert_eq!(settings.reconnect_interval, Duration::from_secs(5));
        assert_eq!(settings.channel_wait_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_new_rejects_missing_parameters() {
        let result = BrokerConnection::new(
            MemoryBroker::new(),
            BrokerEndpoint::new("", 5672, "guest", "guest"),
            fast(),
        );
        assert!(matches!(result, Err(ConfigError::Missing(_))));
    }

    #[tokio::test]
    async fn test_repeated_connect_is_noop() {
        let broker = MemoryBroker::new();
        let conn = BrokerConnection::new(broker.clone(), endpoint(), fast()).unwrap();

        conn.connect().await;
        conn.connect().await;

        assert!(conn.is_connected());
        assert_eq!(broker.connections_opened(), 1);
        conn.shutdown().await;
    }

    #[tokio::test]
    async fn test_connect_failure_is_not_raised() {
        let broker = MemoryBroker::new();
        broker.set_refuse_connections(true);
        let conn = BrokerConnection::new(broker.clone(), endpoint(), fast()).unwrap();

        conn.connect().await;
        assert!(!conn.is_connected());

        broker.set_refuse_connections(false);
        tokio::time::timeout(Duration::from_secs(1), async {
            while !conn.is_connected() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("watchdog should connect once the broker accepts");
        conn.shutdown().await;
    }

    #[tokio::test]
    async fn test_watchdog_reconnects_dead_link() {
        let broker = MemoryBroker::new();
        let conn = BrokerConnection::new(broker.clone(), endpoint(), fast()).unwrap();
        conn.connect().await;

        broker.sever_connections();
        assert!(!conn.is_connected());

        tokio::time::timeout(Duration::from_secs(1), async {
            while !conn.is_connected() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("watchdog should reconnect");
        assert_eq!(broker.connections_opened(), 2);
        conn.shutdown().await;
    }

    #[tokio::test]
    async fn test_create_channel_waits_for_connection() {
        let broker = MemoryBroker::new();
        broker.set_refuse_connections(true);
        let conn = BrokerConnection::new(broker.clone(), endpoint(), fast()).unwrap();
        conn.connect().await;

        let waiting = conn.clone();
        let channel = tokio::spawn(async move { waiting.create_channel().await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!channel.is_finished());

        broker.set_refuse_connections(false);
        let channel = tokio::time::timeout(Duration::from_secs(1), channel)
            .await
            .expect("channel should open after reconnect")
            .unwrap()
            .unwrap();
        assert!(channel.declare_queue("svc.op", QueueKind::Durable).await.is_ok());
        conn.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_link() {
        let broker = MemoryBroker::new();
        let conn = BrokerConnection::new(broker.clone(), endpoint(), fast()).unwrap();
        conn.connect().await;

        conn.shutdown().await;
        assert!(!conn.is_connected());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(broker.connections_opened(), 1);
    }
}
