//! Endpoint: per-connection request/reply correlation engine.
//!
//! An endpoint owns one [`Link`], a table of outbound calls awaiting their
//! response (keyed by correlation id), a table of inbound calls awaiting a
//! handler result, and a [`HandlerRegistry`]. The same type serves both ends
//! of a connection.
//!
//! Inbound frames are fed in by the socket owner through
//! [`Endpoint::dispatch_frame`]. Dispatch never blocks: handlers run in their
//! own tasks, so a slow handler does not hold up later frames and responses
//! may complete out of order. Matching is strictly by id.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::envelope::Envelope;
use crate::errors::{HandlerError, RpcError};
use crate::link::{Link, ReadyState};
use crate::registry::{CallHandler, HandlerEntry, HandlerId, HandlerRegistry};

type CallResolver = oneshot::Sender<Result<Option<Value>, RpcError>>;

/// Why an endpoint stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// Terminated from this side (`close()`, heartbeat, broker shutdown).
    Local,
    /// The peer sent a close frame or the stream ended.
    Peer,
    /// The transport failed with an I/O or protocol error.
    Transport,
}

/// Inbound call whose reply has not been sent yet.
struct PendingReply {
    /// Handler invocations that have not settled.
    outstanding: usize,
}

struct EndpointInner {
    id: String,
    link: Link,
    next_id: AtomicU64,
    pending_calls: Mutex<HashMap<u64, CallResolver>>,
    pending_replies: Mutex<HashMap<u64, PendingReply>>,
    handlers: RwLock<HandlerRegistry>,
    closed: CancellationToken,
    close_reason: Mutex<Option<CloseReason>>,
}

/// Removes an outbound call's resolver when its `call` future goes away.
struct PendingCallGuard<'a> {
    calls: &'a Mutex<HashMap<u64, CallResolver>>,
    id: u64,
}

impl Drop for PendingCallGuard<'_> {
    fn drop(&mut self) {
        let _ = self.calls.lock().remove(&self.id);
    }
}

/// Cheaply cloneable handle to one connection's correlation state.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<EndpointInner>,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.inner.id)
            .field("state", &self.inner.link.state())
            .finish_non_exhaustive()
    }
}

impl Endpoint {
    /// Create an endpoint writing through `link`.
    pub fn new(id: impl Into<String>, link: Link) -> Self {
        Self {
            inner: Arc::new(EndpointInner {
                id: id.into(),
                link,
                next_id: AtomicU64::new(0),
                pending_calls: Mutex::new(HashMap::new()),
                pending_replies: Mutex::new(HashMap::new()),
                handlers: RwLock::new(HandlerRegistry::new()),
                closed: CancellationToken::new(),
                close_reason: Mutex::new(None),
            }),
        }
    }

    /// Connection id.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Ready state of the underlying link.
    pub fn state(&self) -> ReadyState {
        self.inner.link.state()
    }

    /// Whether calls can be sent.
    pub fn is_open(&self) -> bool {
        self.inner.link.is_open()
    }

    /// Whether the transport has shut down.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Why the endpoint closed, once it has.
    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.inner.close_reason.lock()
    }

    /// Resolves once the transport has shut down.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await;
    }

    /// Ping the peer through the link. Returns `false` if it could not be queued.
    pub fn ping(&self) -> bool {
        self.inner.link.ping()
    }

    /// Force-terminate the transport. The endpoint cannot be reused.
    pub fn close(&self) {
        debug!(conn_id = %self.inner.id, "terminating transport");
        self.inner.link.terminate();
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    // ── Outbound ────────────────────────────────────────────────────

    /// Invoke `name` on the peer and wait for its response.
    ///
    /// Resolves `None` when the peer acknowledged without a handler (or its
    /// handler returned `null`).
    pub async fn call(&self, name: &str, args: Vec<Value>) -> Result<Option<Value>, RpcError> {
        if !self.is_open() {
            return Err(RpcError::NotOpen);
        }
        let id = self.next_id();
        let frame = Envelope::call(id, name, args).encode()?;

        let (tx, rx) = oneshot::channel();
        let _ = self.inner.pending_calls.lock().insert(id, tx);
        // Clears the entry if this future is dropped before it settles.
        let _pending = PendingCallGuard {
            calls: &self.inner.pending_calls,
            id,
        };
        counter!("rpc_calls_total").increment(1);
        debug!(conn_id = %self.inner.id, id, name, "sending call");

        if let Err(err) = self.inner.link.send_frame(frame).await {
            warn!(conn_id = %self.inner.id, id, name, error = %err, "call not delivered");
            return Err(err.into());
        }

        rx.await.unwrap_or(Err(RpcError::ConnectionClosed))
    }

    /// Outbound calls still waiting for a response.
    pub fn pending_call_count(&self) -> usize {
        self.inner.pending_calls.lock().len()
    }

    /// Invoke `name` on the peer without waiting for a response.
    pub async fn notify(&self, name: &str, args: Vec<Value>) -> Result<(), RpcError> {
        if !self.is_open() {
            return Err(RpcError::NotOpen);
        }
        let id = self.next_id();
        let frame = Envelope::call(id, name, args).encode()?;
        debug!(conn_id = %self.inner.id, id, name, "sending notification");
        self.inner.link.send_frame(frame).await?;
        Ok(())
    }

    // ── Handler registration ────────────────────────────────────────

    /// Register a handler for `name`. Several handlers may share a name.
    pub fn on_call(&self, name: &str, handler: impl CallHandler + 'static) -> HandlerId {
        self.install_handler(name, HandlerEntry::new(handler))
    }

    /// Register a handler whose failures go to `on_error` (no response is sent).
    pub fn on_call_with_error(
        &self,
        name: &str,
        handler: impl CallHandler + 'static,
        on_error: impl Fn(HandlerError) + Send + Sync + 'static,
    ) -> HandlerId {
        self.install_handler(name, HandlerEntry::new(handler).with_error_handler(on_error))
    }

    /// Register a handler that is removed after its first invocation.
    pub fn once_call(&self, name: &str, handler: impl CallHandler + 'static) -> HandlerId {
        self.install_handler(name, HandlerEntry::new(handler).once())
    }

    /// Install a prepared entry, keeping its id.
    pub fn install_handler(&self, name: &str, entry: HandlerEntry) -> HandlerId {
        self.inner.handlers.write().insert(name, entry)
    }

    /// Remove a handler. Unknown ids are ignored.
    pub fn remove_handler(&self, name: &str, id: HandlerId) -> bool {
        self.inner.handlers.write().remove(name, id)
    }

    /// Number of handlers registered for `name`.
    pub fn handler_count(&self, name: &str) -> usize {
        self.inner.handlers.read().count(name)
    }

    /// Wait for the next inbound call to `name` and return its arguments.
    ///
    /// The call is answered with `null`.
    pub async fn wait_for(&self, name: &str) -> Result<Vec<Value>, RpcError> {
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(Mutex::new(Some(tx)));
        let id = self.once_call(name, move |args: Vec<Value>| {
            let slot = slot.clone();
            async move {
                if let Some(tx) = slot.lock().take() {
                    let _ = tx.send(args);
                }
                Ok::<_, HandlerError>(Value::Null)
            }
        });

        tokio::select! {
            args = rx => args.map_err(|_| RpcError::ConnectionClosed),
            () = self.inner.closed.cancelled() => {
                let _ = self.remove_handler(name, id);
                Err(RpcError::ConnectionClosed)
            }
        }
    }

    // ── Inbound ─────────────────────────────────────────────────────

    /// Handle one inbound text frame.
    ///
    /// Malformed frames are logged and dropped. Must be called from within a
    /// tokio runtime; handlers and replies are spawned.
    pub fn dispatch_frame(&self, text: &str) {
        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                counter!("rpc_frames_dropped_total").increment(1);
                warn!(conn_id = %self.inner.id, error = %err, "dropping malformed frame");
                return;
            }
        };
        match envelope {
            Envelope::Call { id, name, args } => self.accept_call(id, name, args),
            Envelope::Response { id, data } => self.settle_call(id, data),
        }
    }

    fn accept_call(&self, id: u64, name: String, args: Vec<Value>) {
        let entries = self.inner.handlers.write().take_for_dispatch(&name);
        if entries.is_empty() {
            debug!(conn_id = %self.inner.id, id, name, "no handler, acknowledging");
            self.spawn_send(Envelope::ack(id));
            return;
        }

        debug!(conn_id = %self.inner.id, id, name, handlers = entries.len(), "dispatching call");
        let _ = self.inner.pending_replies.lock().insert(
            id,
            PendingReply {
                outstanding: entries.len(),
            },
        );

        for entry in entries {
            let endpoint = self.clone();
            let args = args.clone();
            let name = name.clone();
            drop(tokio::spawn(async move {
                let outcome = AssertUnwindSafe(entry.invoke(args)).catch_unwind().await;
                let result = outcome.unwrap_or_else(|payload| {
                    Err(HandlerError::Panicked(panic_message(payload.as_ref())))
                });
                endpoint.finish_reply(id, &name, &entry, result).await;
            }));
        }
    }

    async fn finish_reply(
        &self,
        id: u64,
        name: &str,
        entry: &HandlerEntry,
        result: Result<Value, HandlerError>,
    ) {
        match result {
            Ok(data) => {
                let claimed = self.inner.pending_replies.lock().remove(&id).is_some();
                if !claimed {
                    trace!(conn_id = %self.inner.id, id, name, "reply already sent");
                    return;
                }
                self.send_envelope(Envelope::response(id, data)).await;
            }
            Err(err) => {
                {
                    let mut replies = self.inner.pending_replies.lock();
                    if let Some(reply) = replies.get_mut(&id) {
                        reply.outstanding = reply.outstanding.saturating_sub(1);
                        if reply.outstanding == 0 {
                            let _ = replies.remove(&id);
                        }
                    }
                }
                counter!("rpc_handler_failures_total").increment(1);
                if !entry.report_error(err.clone()) {
                    warn!(
                        conn_id = %self.inner.id,
                        id,
                        name,
                        handler = %entry.id(),
                        error = %err,
                        "call handler failed, no response sent"
                    );
                }
            }
        }
    }

    fn settle_call(&self, id: u64, data: Option<Value>) {
        let resolver = self.inner.pending_calls.lock().remove(&id);
        match resolver {
            Some(tx) => {
                debug!(conn_id = %self.inner.id, id, "call settled");
                let _ = tx.send(Ok(data));
            }
            None => trace!(conn_id = %self.inner.id, id, "response for unknown id"),
        }
    }

    fn spawn_send(&self, envelope: Envelope) {
        let endpoint = self.clone();
        drop(tokio::spawn(async move {
            endpoint.send_envelope(envelope).await;
        }));
    }

    async fn send_envelope(&self, envelope: Envelope) {
        let id = envelope.id();
        let frame = match envelope.encode() {
            Ok(frame) => frame,
            Err(err) => {
                warn!(conn_id = %self.inner.id, id, error = %err, "failed to encode reply");
                return;
            }
        };
        if let Err(err) = self.inner.link.send_frame(frame).await {
            debug!(conn_id = %self.inner.id, id, error = %err, "reply not delivered");
        }
    }

    // ── Teardown ────────────────────────────────────────────────────

    /// Record that the transport has shut down.
    ///
    /// Called by the socket owner once. Wakes `closed()` waiters first, then
    /// fails every pending call with [`RpcError::ConnectionClosed`] and drops
    /// pending replies.
    pub fn mark_closed(&self, reason: CloseReason) {
        {
            let mut slot = self.inner.close_reason.lock();
            if slot.is_some() {
                return;
            }
            *slot = Some(reason);
        }
        self.inner.link.terminate();
        self.inner.closed.cancel();

        let pending: Vec<CallResolver> = self
            .inner
            .pending_calls
            .lock()
            .drain()
            .map(|(_, tx)| tx)
            .collect();
        let replies = {
            let mut replies = self.inner.pending_replies.lock();
            let n = replies.len();
            replies.clear();
            n
        };
        debug!(
            conn_id = %self.inner.id,
            ?reason,
            rejected_calls = pending.len(),
            dropped_replies = replies,
            "endpoint closed"
        );
        for tx in pending {
            let _ = tx.send(Err(RpcError::ConnectionClosed));
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}
