//! Heartbeat ping/pong liveness supervision.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::peers::PeerTable;

/// Result of one sweep over the peer table.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Peers that answered since the previous sweep and were pinged again.
    pub pinged: usize,
    /// Peers that stayed silent and were terminated.
    pub terminated: usize,
}

/// Probe every tracked peer once.
///
/// A peer not flagged alive since the previous sweep is terminated; every
/// other peer has its flag cleared and is sent a ping. A pong re-flags it.
pub fn sweep(peers: &PeerTable) -> SweepReport {
    let mut report = SweepReport::default();
    for peer in peers.snapshot() {
        if peer.check_alive() {
            if !peer.ping() {
                debug!(conn_id = %peer.id, "ping not queued");
            }
            report.pinged += 1;
        } else {
            warn!(
                conn_id = %peer.id,
                silent_for = ?peer.last_pong_elapsed(),
                "peer unresponsive, terminating"
            );
            counter!("heartbeat_terminations_total").increment(1);
            peer.terminate();
            report.terminated += 1;
        }
    }
    report
}

/// Run sweeps every `interval` until `cancel` fires.
///
/// The first sweep happens one full interval after start, so an unresponsive
/// peer is terminated within two intervals of its last pong.
pub async fn run_supervisor(peers: Arc<PeerTable>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Skip the immediate first tick
    let _ = ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = sweep(&peers);
                if report.pinged + report.terminated > 0 {
                    debug!(
                        pinged = report.pinged,
                        terminated = report.terminated,
                        "heartbeat sweep"
                    );
                }
            }
            () = cancel.cancelled() => {
                debug!("heartbeat supervisor stopped");
                return;
            }
        }
    }
}
