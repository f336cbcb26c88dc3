//! In-process transport: two endpoints wired back to back.
//!
//! Each side's link is drained by a pump task that hands frames straight to
//! the other side's `dispatch_frame`. Closing either endpoint closes both;
//! the closing side records [`CloseReason::Local`], the other
//! [`CloseReason::Peer`].

use tracing::debug;

use crate::endpoint::{CloseReason, Endpoint};
use crate::link::{Link, LinkReceiver, Outbound};

/// Create a connected endpoint pair. Must be called within a tokio runtime.
pub fn memory_pair(capacity: usize) -> (Endpoint, Endpoint) {
    let (link_a, rx_a) = Link::channel(capacity);
    let (link_b, rx_b) = Link::channel(capacity);
    let a = Endpoint::new("mem-a", link_a);
    let b = Endpoint::new("mem-b", link_b);

    drop(tokio::spawn(pump(rx_a, a.clone(), b.clone())));
    drop(tokio::spawn(pump(rx_b, b.clone(), a.clone())));
    (a, b)
}

async fn pump(mut rx: LinkReceiver, local: Endpoint, remote: Endpoint) {
    let terminate = rx.terminate_token();
    let reason = loop {
        tokio::select! {
            biased;
            () = terminate.cancelled() => break CloseReason::Local,
            () = remote.closed() => break CloseReason::Peer,
            item = rx.recv() => match item {
                Some(Outbound::Frame { text, ack }) => {
                    remote.dispatch_frame(&text);
                    if let Some(ack) = ack {
                        let _ = ack.send(Ok(()));
                    }
                }
                Some(Outbound::Ping) => {}
                None => break CloseReason::Local,
            },
        }
    };
    debug!(conn_id = %local.id(), ?reason, "memory pump stopped");
    rx.close();
    local.mark_closed(reason);
}
