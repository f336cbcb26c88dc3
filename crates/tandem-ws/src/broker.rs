//! `Broker`: many-connection acceptor over axum.
//!
//! The broker keeps a canonical [`HandlerRegistry`]. Every accepted socket
//! gets its own [`Endpoint`] seeded from it, and later registrations and
//! removals are pushed to every live endpoint. Seeding and fan-out both run
//! under the canonical lock, so a peer accepted concurrently with a
//! registration still ends up with it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use futures::future::{join_all, try_join_all};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde_json::Value;
use tandem_core::{
    CallHandler, Endpoint, HandlerEntry, HandlerError, HandlerId, HandlerRegistry, Link, RpcError,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{BrokerConfig, LifecycleHooks};
use crate::connection::PeerConnection;
use crate::errors::BrokerError;
use crate::health::{self, HealthResponse};
use crate::heartbeat;
use crate::peers::PeerTable;
use crate::shutdown::BrokerTasks;
use crate::socket::drive_socket;

/// Bound on how long `close()` waits for peers and background tasks.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Options for [`Broker::create`].
#[derive(Debug, Default)]
pub struct BrokerOptions {
    /// Bind address, limits and heartbeat interval.
    pub config: BrokerConfig,
    /// Pre-bound listener. When set, `config.host` and `config.port` are ignored.
    pub listener: Option<TcpListener>,
    /// Connection lifecycle observers.
    pub hooks: LifecycleHooks,
}

impl BrokerOptions {
    /// Options with the given config and no pre-bound listener.
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Adopt an already bound listener.
    #[must_use]
    pub fn with_listener(mut self, listener: TcpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Install lifecycle hooks.
    #[must_use]
    pub fn with_hooks(mut self, hooks: LifecycleHooks) -> Self {
        self.hooks = hooks;
        self
    }
}

struct BrokerShared {
    config: BrokerConfig,
    canonical: Mutex<HandlerRegistry>,
    peers: Arc<PeerTable>,
    hooks: LifecycleHooks,
    tasks: BrokerTasks,
    start_time: Instant,
    local_addr: SocketAddr,
}

/// Server-role aggregator. Cheap to clone.
#[derive(Clone)]
pub struct Broker {
    shared: Arc<BrokerShared>,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("local_addr", &self.shared.local_addr)
            .field("connections", &self.shared.peers.connection_count())
            .finish_non_exhaustive()
    }
}

impl Broker {
    /// Start accepting connections.
    ///
    /// Resolves once the listener is bound; fails with [`BrokerError::Bind`]
    /// when the address cannot be used.
    pub async fn create(options: BrokerOptions) -> Result<Self, BrokerError> {
        let BrokerOptions {
            config,
            listener,
            hooks,
        } = options;

        let listener = match listener {
            Some(listener) => listener,
            None => {
                let addr = config.bind_addr();
                TcpListener::bind(&addr)
                    .await
                    .map_err(|source| BrokerError::Bind { addr, source })?
            }
        };
        let local_addr = listener.local_addr().map_err(|source| BrokerError::Bind {
            addr: config.bind_addr(),
            source,
        })?;

        let interval = config.heartbeat_interval();
        let shared = Arc::new(BrokerShared {
            config,
            canonical: Mutex::new(HandlerRegistry::new()),
            peers: Arc::new(PeerTable::new()),
            hooks,
            tasks: BrokerTasks::new(),
            start_time: Instant::now(),
            local_addr,
        });

        let router = router(shared.clone());
        let serve_token = shared.tasks.token();
        shared.tasks.spawn("acceptor", async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move { serve_token.cancelled().await })
                .await;
            if let Err(err) = result {
                warn!(error = %err, "acceptor stopped with error");
            }
        });
        shared.tasks.spawn(
            "heartbeat",
            heartbeat::run_supervisor(shared.peers.clone(), interval, shared.tasks.token()),
        );

        info!(addr = %local_addr, heartbeat_ms = interval.as_millis(), "broker listening");
        Ok(Self { shared })
    }

    /// Address the acceptor is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// `ws://` URL clients can dial.
    pub fn url(&self) -> String {
        format!("ws://{}", self.shared.local_addr)
    }

    /// Number of tracked connections.
    pub fn connection_count(&self) -> usize {
        self.shared.peers.connection_count()
    }

    /// Tracked connection IDs.
    pub fn connection_ids(&self) -> Vec<String> {
        self.shared.peers.ids()
    }

    /// Whether `close()` has been called.
    pub fn is_closed(&self) -> bool {
        self.shared.tasks.is_shutting_down()
    }

    // ── Handlers ────────────────────────────────────────────────────

    /// Register a handler on the canonical registry and every live peer.
    pub fn on_call(&self, name: &str, handler: impl CallHandler + 'static) -> HandlerId {
        self.install(name, HandlerEntry::new(handler))
    }

    /// Like [`Broker::on_call`], routing handler failures to `on_error`.
    pub fn on_call_with_error(
        &self,
        name: &str,
        handler: impl CallHandler + 'static,
        on_error: impl Fn(HandlerError) + Send + Sync + 'static,
    ) -> HandlerId {
        self.install(name, HandlerEntry::new(handler).with_error_handler(on_error))
    }

    fn install(&self, name: &str, entry: HandlerEntry) -> HandlerId {
        let mut canonical = self.shared.canonical.lock();
        let id = canonical.insert(name, entry.clone());
        let peers = self.shared.peers.snapshot();
        for peer in &peers {
            let _ = peer.endpoint().install_handler(name, entry.clone());
        }
        debug!(name, handler = %id, peers = peers.len(), "handler registered");
        id
    }

    /// Remove a handler everywhere. Unknown ids are ignored.
    pub fn remove_handler(&self, name: &str, id: HandlerId) -> bool {
        let mut canonical = self.shared.canonical.lock();
        let removed = canonical.remove(name, id);
        for peer in self.shared.peers.snapshot() {
            let _ = peer.endpoint().remove_handler(name, id);
        }
        removed
    }

    /// Handlers registered for `name` on the canonical registry.
    pub fn handler_count(&self, name: &str) -> usize {
        self.shared.canonical.lock().count(name)
    }

    /// Wait for the first call to `name` from any peer and return its
    /// arguments. The call is answered with `null`.
    pub async fn wait_for(&self, name: &str) -> Result<Vec<Value>, BrokerError> {
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(Mutex::new(Some(tx)));
        let id = self.on_call(name, move |args: Vec<Value>| {
            let slot = slot.clone();
            async move {
                if let Some(tx) = slot.lock().take() {
                    let _ = tx.send(args);
                }
                Ok::<_, HandlerError>(Value::Null)
            }
        });

        let token = self.shared.tasks.token();
        let result = tokio::select! {
            args = rx => args.map_err(|_| BrokerError::Closed),
            () = token.cancelled() => Err(BrokerError::Closed),
        };
        let _ = self.remove_handler(name, id);
        result
    }

    // ── Aggregate calls ─────────────────────────────────────────────

    /// Call `name` on every open peer concurrently.
    ///
    /// Fails as soon as any single call fails; results of calls that had
    /// already succeeded are discarded. See [`Broker::call_settled`].
    pub async fn call(&self, name: &str, args: Vec<Value>) -> Result<Vec<Option<Value>>, RpcError> {
        let endpoints = self.shared.peers.open_endpoints();
        debug!(name, peers = endpoints.len(), "broadcast call");
        let args = &args;
        try_join_all(endpoints.iter().map(|ep| ep.call(name, args.clone()))).await
    }

    /// Call `name` on every open peer and wait for every outcome.
    ///
    /// Results are paired with the connection id they came from.
    pub async fn call_settled(
        &self,
        name: &str,
        args: Vec<Value>,
    ) -> Vec<(String, Result<Option<Value>, RpcError>)> {
        let endpoints = self.shared.peers.open_endpoints();
        let args = &args;
        join_all(endpoints.iter().map(|ep| async move {
            (ep.id().to_owned(), ep.call(name, args.clone()).await)
        }))
        .await
    }

    // ── Shutdown ────────────────────────────────────────────────────

    /// Stop the heartbeat supervisor, terminate every peer and stop
    /// accepting. Safe to call more than once.
    pub async fn close(&self) {
        if !self.shared.tasks.begin() {
            return;
        }

        let peers = self.shared.peers.snapshot();
        let terminated = self.shared.peers.terminate_all();
        info!(peers = terminated, "broker closing");

        let closed = join_all(peers.iter().map(|peer| peer.endpoint().closed()));
        if tokio::time::timeout(CLOSE_TIMEOUT, closed).await.is_err() {
            warn!("peers did not close within {CLOSE_TIMEOUT:?}");
        }
        let report = self.shared.tasks.drain(CLOSE_TIMEOUT).await;
        info!(clean = report.is_clean(), "broker closed");
    }
}

fn router(shared: Arc<BrokerShared>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .fallback(ws_handler)
        .with_state(shared)
}

/// GET /health
async fn health_handler(State(shared): State<Arc<BrokerShared>>) -> Json<HealthResponse> {
    let canonical = shared.canonical.lock();
    Json(health::health_check(
        shared.start_time,
        shared.tasks.is_shutting_down(),
        &shared.peers,
        &canonical,
        shared.config.max_connections,
    ))
}

/// WebSocket upgrade on any other path.
async fn ws_handler(State(shared): State<Arc<BrokerShared>>, ws: WebSocketUpgrade) -> Response {
    if shared.tasks.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "broker is shutting down").into_response();
    }
    let count = shared.peers.connection_count();
    if count >= shared.config.max_connections {
        warn!(count, max = shared.config.max_connections, "refusing connection");
        return (StatusCode::SERVICE_UNAVAILABLE, "too many connections").into_response();
    }
    ws.max_message_size(shared.config.max_message_size)
        .on_upgrade(move |socket| accept(shared, socket))
}

async fn accept(shared: Arc<BrokerShared>, socket: WebSocket) {
    let conn_id = Uuid::now_v7().to_string();
    let (link, outbound) = Link::channel(shared.config.outbound_capacity);
    let endpoint = Endpoint::new(conn_id.clone(), link);
    let peer = Arc::new(PeerConnection::new(endpoint.clone()));

    {
        let canonical = shared.canonical.lock();
        for (name, entry) in canonical.entries() {
            let _ = endpoint.install_handler(name, entry.clone());
        }
        shared.peers.add(peer.clone());
    }
    if shared.tasks.is_shutting_down() {
        endpoint.close();
    }

    info!(conn_id, "peer connected");
    counter!("ws_connections_total").increment(1);
    gauge!("ws_connections_active").increment(1.0);
    shared.hooks.fire_open(&endpoint);

    let pong_peer = peer.clone();
    let reason = drive_socket(socket, endpoint.clone(), outbound, &shared.hooks, move || {
        pong_peer.mark_alive();
    })
    .await;

    let _ = shared.peers.remove(&conn_id);
    gauge!("ws_connections_active").decrement(1.0);
    info!(conn_id, ?reason, age_ms = peer.age().as_millis(), "peer disconnected");
    shared.hooks.fire_close(&endpoint, reason);
}
