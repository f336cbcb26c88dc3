//! Handler registry: operation name -> ordered set of handler entries.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::HandlerError;

/// Trait implemented by every inbound call handler.
///
/// Closures of the form
/// `Fn(Vec<Value>) -> impl Future<Output = Result<Value, HandlerError>>`
/// implement it automatically.
#[async_trait]
pub trait CallHandler: Send + Sync {
    /// Execute the handler with the call's positional arguments.
    async fn handle(&self, args: Vec<Value>) -> Result<Value, HandlerError>;
}

#[async_trait]
impl<F, Fut> CallHandler for F
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    async fn handle(&self, args: Vec<Value>) -> Result<Value, HandlerError> {
        (self)(args).await
    }
}

/// Receives handler failures in place of a response.
pub type ErrorCallback = Arc<dyn Fn(HandlerError) + Send + Sync>;

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique handle returned at registration and used for removal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

impl HandlerId {
    /// Allocate a fresh id.
    pub fn next() -> Self {
        Self(NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}", self.0)
    }
}

/// A registered handler plus its registration options.
///
/// Cloning shares the handler; the same entry (same id) can be installed on
/// many registries, which is how the broker fans registrations out.
#[derive(Clone)]
pub struct HandlerEntry {
    id: HandlerId,
    handler: Arc<dyn CallHandler>,
    on_error: Option<ErrorCallback>,
    once: bool,
}

impl HandlerEntry {
    /// Wrap a handler under a fresh id.
    pub fn new(handler: impl CallHandler + 'static) -> Self {
        Self {
            id: HandlerId::next(),
            handler: Arc::new(handler),
            on_error: None,
            once: false,
        }
    }

    /// Route handler failures to `on_error`.
    #[must_use]
    pub fn with_error_handler(
        mut self,
        on_error: impl Fn(HandlerError) + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Some(Arc::new(on_error));
        self
    }

    /// Remove the entry before its first dispatch.
    #[must_use]
    pub fn once(mut self) -> Self {
        self.once = true;
        self
    }

    /// Registration handle.
    pub fn id(&self) -> HandlerId {
        self.id
    }

    /// Run the handler.
    pub async fn invoke(&self, args: Vec<Value>) -> Result<Value, HandlerError> {
        self.handler.handle(args).await
    }

    /// Hand a failure to the error callback.
    ///
    /// Returns `false` when no callback was registered.
    pub fn report_error(&self, err: HandlerError) -> bool {
        match &self.on_error {
            Some(on_error) => {
                on_error(err);
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for HandlerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("id", &self.id)
            .field("once", &self.once)
            .field("has_error_handler", &self.on_error.is_some())
            .finish_non_exhaustive()
    }
}

/// Registry mapping operation names to handlers, in insertion order.
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Vec<HandlerEntry>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install an entry under `name`. An id already present is not added twice.
    pub fn insert(&mut self, name: &str, entry: HandlerEntry) -> HandlerId {
        let id = entry.id;
        let entries = self.handlers.entry(name.to_owned()).or_default();
        if !entries.iter().any(|e| e.id == id) {
            entries.push(entry);
        }
        id
    }

    /// Remove the entry with `id` from `name`. Absent ids are a no-op.
    pub fn remove(&mut self, name: &str, id: HandlerId) -> bool {
        let Some(entries) = self.handlers.get_mut(name) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|e| e.id != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            let _ = self.handlers.remove(name);
        }
        removed
    }

    /// Number of handlers registered under `name`.
    pub fn count(&self, name: &str) -> usize {
        self.handlers.get(name).map_or(0, Vec::len)
    }

    /// Registered operation names (sorted).
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Every `(name, entry)` pair, per-name insertion order preserved.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &HandlerEntry)> {
        self.handlers
            .iter()
            .flat_map(|(name, entries)| {
                entries.iter().map(move |e| (name.as_str(), e))
            })
    }

    /// Snapshot the handlers for one inbound call, dropping `once` entries
    /// from the registry in the same step.
    pub fn take_for_dispatch(&mut self, name: &str) -> Vec<HandlerEntry> {
        let Some(entries) = self.handlers.get_mut(name) else {
            return Vec::new();
        };
        let snapshot = entries.clone();
        entries.retain(|e| !e.once);
        if entries.is_empty() {
            let _ = self.handlers.remove(name);
        }
        snapshot
    }
}
