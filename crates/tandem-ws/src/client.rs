//! `Client`: dial a broker and manage one connection's lifecycle.

use std::future::Future;
use std::time::Duration;

use tandem_core::{Endpoint, Link};
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ClientConfig, LifecycleHooks};
use crate::errors::ClientError;
use crate::socket::drive_socket;

/// Connection factory. Holds configuration only; each call dials anew.
#[derive(Clone, Debug, Default)]
pub struct Client {
    config: ClientConfig,
    hooks: LifecycleHooks,
}

impl Client {
    /// Create a client with the given configuration.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            hooks: LifecycleHooks::default(),
        }
    }

    /// Install lifecycle hooks.
    #[must_use]
    pub fn with_hooks(mut self, hooks: LifecycleHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Open a connection and return its endpoint once the handshake is done.
    pub async fn create(&self, url: &str) -> Result<Endpoint, ClientError> {
        let (socket, _response) = connect_async(url).await.map_err(|err| {
            let message = err.to_string();
            debug!(url, error = %message, "connect failed");
            self.hooks.fire_error(&message);
            ClientError::Connect {
                url: url.to_owned(),
                source: Box::new(err),
            }
        })?;

        let (link, outbound) = Link::channel(self.config.outbound_capacity);
        let endpoint = Endpoint::new(Uuid::now_v7().to_string(), link);
        info!(url, conn_id = %endpoint.id(), "connected");

        let driver_endpoint = endpoint.clone();
        let hooks = self.hooks.clone();
        drop(tokio::spawn(async move {
            let reason =
                drive_socket(socket, driver_endpoint.clone(), outbound, &hooks, || {}).await;
            info!(conn_id = %driver_endpoint.id(), ?reason, "disconnected");
            hooks.fire_close(&driver_endpoint, reason);
        }));

        self.hooks.fire_open(&endpoint);
        Ok(endpoint)
    }

    /// Connect and run `continuation` with the endpoint.
    ///
    /// If the connection drops first the result is [`ClientError::Closed`];
    /// a continuation error caused by that drop is reported the same way.
    /// Otherwise the continuation's own result is returned. The endpoint is
    /// closed when the continuation fails and left open when it succeeds.
    pub async fn connect<F, Fut, T>(&self, url: &str, continuation: F) -> Result<T, ClientError>
    where
        F: FnOnce(Endpoint) -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let endpoint = self.create(url).await?;

        let result = tokio::select! {
            biased;
            () = endpoint.closed() => Err(ClientError::Closed),
            result = continuation(endpoint.clone()) => result,
        };

        match result {
            Ok(value) => Ok(value),
            Err(err) => {
                let err = if err.is_connection_loss() && !endpoint.is_open() {
                    ClientError::Closed
                } else {
                    err
                };
                endpoint.close();
                Err(err)
            }
        }
    }

    /// [`Client::connect`] in a loop, waiting `backoff` between attempts.
    ///
    /// Retries when the connection drops ([`ClientError::Closed`]) and when
    /// the dial itself fails, so a broker that comes up later is picked up.
    /// Errors raised by the continuation and unusable URLs are returned at
    /// once. There is no retry limit.
    pub async fn auto_reconnect<F, Fut, T>(
        &self,
        url: &str,
        mut continuation: F,
        backoff: Duration,
    ) -> Result<T, ClientError>
    where
        F: FnMut(Endpoint) -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            match self.connect(url, &mut continuation).await {
                Err(err) if err.is_retryable() => {
                    warn!(
                        url,
                        attempt,
                        error = %err,
                        backoff_ms = backoff.as_millis(),
                        "connection unavailable, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                other => return other,
            }
        }
    }
}
