//! Table of live broker connections.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tandem_core::Endpoint;
use tracing::debug;

use crate::connection::PeerConnection;

/// Connected peers indexed by connection ID.
#[derive(Debug, Default)]
pub struct PeerTable {
    connections: RwLock<HashMap<String, Arc<PeerConnection>>>,
}

impl PeerTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection.
    pub fn add(&self, peer: Arc<PeerConnection>) {
        let mut conns = self.connections.write();
        let _ = conns.insert(peer.id.clone(), peer);
    }

    /// Remove a connection by ID.
    pub fn remove(&self, connection_id: &str) -> Option<Arc<PeerConnection>> {
        let removed = self.connections.write().remove(connection_id);
        if removed.is_some() {
            debug!(conn_id = connection_id, "peer removed");
        }
        removed
    }

    /// Number of tracked connections.
    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Tracked connection IDs, sorted (uuid v7 ids sort by acceptance time).
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.connections.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Every tracked connection.
    pub fn snapshot(&self) -> Vec<Arc<PeerConnection>> {
        self.connections.read().values().cloned().collect()
    }

    /// Endpoints of the connections that are currently open.
    pub fn open_endpoints(&self) -> Vec<Endpoint> {
        self.connections
            .read()
            .values()
            .filter(|peer| peer.is_open())
            .map(|peer| peer.endpoint().clone())
            .collect()
    }

    /// Calls awaiting a response, summed over every tracked connection.
    pub fn pending_calls(&self) -> usize {
        self.connections
            .read()
            .values()
            .map(|peer| peer.endpoint().pending_call_count())
            .sum()
    }

    /// Terminate every tracked connection. Returns how many were terminated.
    pub fn terminate_all(&self) -> usize {
        let peers = self.snapshot();
        for peer in &peers {
            peer.terminate();
        }
        peers.len()
    }
}
