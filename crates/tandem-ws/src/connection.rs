//! Broker-side state for one accepted peer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tandem_core::Endpoint;

/// A connected peer tracked by the broker.
pub struct PeerConnection {
    /// Unique connection ID (same as the endpoint id).
    pub id: String,
    endpoint: Endpoint,
    /// When this connection was accepted.
    pub connected_at: Instant,
    /// Whether a pong has arrived since the last heartbeat sweep.
    is_alive: AtomicBool,
    /// When the last pong was received.
    last_pong: Mutex<Instant>,
}

impl PeerConnection {
    /// Track `endpoint`. New peers start out alive.
    pub fn new(endpoint: Endpoint) -> Self {
        let now = Instant::now();
        Self {
            id: endpoint.id().to_owned(),
            endpoint,
            connected_at: now,
            is_alive: AtomicBool::new(true),
            last_pong: Mutex::new(now),
        }
    }

    /// The peer's correlation endpoint.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Whether the peer accepts calls.
    pub fn is_open(&self) -> bool {
        self.endpoint.is_open()
    }

    /// Mark the connection as alive (pong received).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_pong.lock() = Instant::now();
    }

    /// Duration since the last pong (or acceptance).
    pub fn last_pong_elapsed(&self) -> Duration {
        self.last_pong.lock().elapsed()
    }

    /// Check and reset the alive flag for heartbeat.
    ///
    /// Returns `true` if the connection was alive since the last check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Queue a ping. Returns `false` if it could not be queued.
    pub fn ping(&self) -> bool {
        self.endpoint.ping()
    }

    /// Force-terminate the transport.
    pub fn terminate(&self) {
        self.endpoint.close();
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("id", &self.id)
            .field("is_alive", &self.is_alive.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::{Link, LinkReceiver, Outbound};

    fn make_peer(id: &str) -> (PeerConnection, LinkReceiver) {
        let (link, rx) = Link::channel(4);
        (PeerConnection::new(Endpoint::new(id, link)), rx)
    }

    #[test]
    fn id_comes_from_endpoint() {
        let (peer, _rx) = make_peer("conn_1");
        assert_eq!(peer.id, "conn_1");
        assert_eq!(peer.endpoint().id(), "conn_1");
        assert!(peer.is_open());
    }

    #[test]
    fn mark_alive_and_check() {
        let (peer, _rx) = make_peer("c");
        // Initially alive
        assert!(peer.check_alive());
        assert!(!peer.check_alive());
        peer.mark_alive();
        assert!(peer.check_alive());
    }

    #[tokio::test]
    async fn ping_is_queued_on_the_link() {
        let (peer, mut rx) = make_peer("c");
        assert!(peer.ping());
        assert!(matches!(rx.recv().await, Some(Outbound::Ping)));
    }

    #[test]
    fn terminate_closes_endpoint_for_calls() {
        let (peer, rx) = make_peer("c");
        let token = rx.terminate_token();
        peer.terminate();
        assert!(token.is_cancelled());
        assert!(!peer.is_open());
        assert!(!peer.ping());
    }

    #[test]
    fn age_and_pong_elapsed_increase() {
        let (peer, _rx) = make_peer("c");
        let age1 = peer.age();
        std::thread::sleep(Duration::from_millis(10));
        assert!(peer.age() > age1);
        assert!(peer.last_pong_elapsed() >= Duration::from_millis(10));
        peer.mark_alive();
        assert!(peer.last_pong_elapsed() < Duration::from_millis(10));
    }
}
