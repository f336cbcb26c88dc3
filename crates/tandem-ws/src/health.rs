//! `GET /health` on the broker listener.
//!
//! Reports load (connections against the limit, calls the broker is still
//! waiting on) and which operations peers can currently invoke.

use std::time::Instant;

use serde::Serialize;
use tandem_core::HandlerRegistry;

use crate::peers::PeerTable;

/// Health check response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    /// `"ok"` while accepting, `"closing"` once shutdown has begun.
    pub status: &'static str,
    /// Seconds since the broker started.
    pub uptime_secs: u64,
    /// Tracked peer connections.
    pub connections: usize,
    /// Connection limit; upgrades beyond it get 503.
    pub max_connections: usize,
    /// Broker-initiated calls awaiting a peer's response.
    pub pending_calls: usize,
    /// Handler entries in the canonical registry.
    pub handlers: usize,
    /// Operation names with at least one handler, sorted.
    pub operations: Vec<String>,
}

/// Build a health response from the broker's live state.
pub fn health_check(
    start_time: Instant,
    shutting_down: bool,
    peers: &PeerTable,
    registry: &HandlerRegistry,
    max_connections: usize,
) -> HealthResponse {
    HealthResponse {
        status: if shutting_down { "closing" } else { "ok" },
        uptime_secs: start_time.elapsed().as_secs(),
        connections: peers.connection_count(),
        max_connections,
        pending_calls: peers.pending_calls(),
        handlers: registry.entries().count(),
        operations: registry.names(),
    }
}
