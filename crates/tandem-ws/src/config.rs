//! Broker and client configuration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tandem_core::{CloseReason, Endpoint};

/// Configuration for a [`crate::Broker`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Heartbeat sweep interval in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Outbound frame queue capacity per connection.
    pub outbound_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_connections: 1024,
            heartbeat_interval_ms: 30_000,
            max_message_size: 16 * 1024 * 1024, // 16 MB
            outbound_capacity: 1024,
        }
    }
}

impl BrokerConfig {
    /// `host:port` string used for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Heartbeat interval, never shorter than 1 ms.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }
}

/// Configuration for a [`crate::Client`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Outbound frame queue capacity.
    pub outbound_capacity: usize,
    /// Default wait between reconnect attempts, in milliseconds.
    pub reconnect_backoff_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 1024,
            reconnect_backoff_ms: 1000,
        }
    }
}

impl ClientConfig {
    /// Reconnect backoff as a [`Duration`].
    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }
}

type OpenHook = Arc<dyn Fn(&Endpoint) + Send + Sync>;
type CloseHook = Arc<dyn Fn(&Endpoint, CloseReason) + Send + Sync>;
type ErrorHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Optional observers for connection lifecycle events.
#[derive(Clone, Default)]
pub struct LifecycleHooks {
    on_open: Option<OpenHook>,
    on_close: Option<CloseHook>,
    on_error: Option<ErrorHook>,
}

impl LifecycleHooks {
    /// No hooks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Called once a connection is open and its endpoint is usable.
    #[must_use]
    pub fn on_open(mut self, hook: impl Fn(&Endpoint) + Send + Sync + 'static) -> Self {
        self.on_open = Some(Arc::new(hook));
        self
    }

    /// Called after a connection's endpoint has been marked closed.
    #[must_use]
    pub fn on_close(
        mut self,
        hook: impl Fn(&Endpoint, CloseReason) + Send + Sync + 'static,
    ) -> Self {
        self.on_close = Some(Arc::new(hook));
        self
    }

    /// Called with a description of any transport or handshake error.
    #[must_use]
    pub fn on_error(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(hook));
        self
    }

    pub(crate) fn fire_open(&self, endpoint: &Endpoint) {
        if let Some(hook) = &self.on_open {
            hook(endpoint);
        }
    }

    pub(crate) fn fire_close(&self, endpoint: &Endpoint, reason: CloseReason) {
        if let Some(hook) = &self.on_close {
            hook(endpoint, reason);
        }
    }

    pub(crate) fn fire_error(&self, message: &str) {
        if let Some(hook) = &self.on_error {
            hook(message);
        }
    }
}

impl fmt::Debug for LifecycleHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleHooks")
            .field("on_open", &self.on_open.is_some())
            .field("on_close", &self.on_close.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}
