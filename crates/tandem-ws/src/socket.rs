//! Socket driver shared by the broker (axum) and the client (tungstenite).
//!
//! One task owns the socket. It writes whatever the endpoint's link queues,
//! acknowledging each frame after the write, and feeds inbound text frames
//! to [`Endpoint::dispatch_frame`]. When the loop ends the endpoint is marked
//! closed with the reason the loop observed.

use std::fmt::Display;
use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use tandem_core::{CloseReason, Endpoint, LinkReceiver, Outbound, SendError};
use tracing::{debug, info, instrument, warn};

use crate::config::LifecycleHooks;

/// How long a local close waits for the close frame to be written.
const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// Classified inbound WebSocket message.
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound {
    /// Text, or binary that is valid UTF-8.
    Text(String),
    /// Reply to one of our pings.
    Pong,
    /// The peer started the closing handshake.
    Close,
    /// Anything else (pings, non-UTF-8 binary, raw frames).
    Skip,
}

/// The handful of operations the driver needs from a WebSocket message type.
pub trait WireMessage: Sized + Send {
    /// Text frame.
    fn text(text: String) -> Self;
    /// Empty ping frame.
    fn ping() -> Self;
    /// Close frame without a payload.
    fn close() -> Self;
    /// Sort an inbound message.
    fn classify(self) -> Inbound;
}

fn utf8_or_skip(data: &[u8]) -> Inbound {
    match std::str::from_utf8(data) {
        Ok(text) => Inbound::Text(text.to_owned()),
        Err(_) => {
            debug!(len = data.len(), "skipping non-UTF-8 binary frame");
            Inbound::Skip
        }
    }
}

impl WireMessage for axum::extract::ws::Message {
    fn text(text: String) -> Self {
        Self::Text(text.into())
    }

    fn ping() -> Self {
        Self::Ping(Vec::new().into())
    }

    fn close() -> Self {
        Self::Close(None)
    }

    fn classify(self) -> Inbound {
        match self {
            Self::Text(text) => Inbound::Text(text.as_str().to_owned()),
            Self::Binary(data) => utf8_or_skip(&data),
            Self::Pong(_) => Inbound::Pong,
            Self::Close(_) => Inbound::Close,
            Self::Ping(_) => Inbound::Skip,
        }
    }
}

impl WireMessage for tokio_tungstenite::tungstenite::Message {
    fn text(text: String) -> Self {
        Self::Text(text.into())
    }

    fn ping() -> Self {
        Self::Ping(Vec::new().into())
    }

    fn close() -> Self {
        Self::Close(None)
    }

    fn classify(self) -> Inbound {
        match self {
            Self::Text(text) => Inbound::Text(text.as_str().to_owned()),
            Self::Binary(data) => utf8_or_skip(&data),
            Self::Pong(_) => Inbound::Pong,
            Self::Close(_) => Inbound::Close,
            Self::Ping(_) | Self::Frame(_) => Inbound::Skip,
        }
    }
}

/// Pump `socket` until either side closes it.
///
/// `on_pong` runs for every pong received. Returns the reason the loop
/// stopped; by then the endpoint has been marked closed and every frame
/// still queued has been rejected.
#[instrument(skip_all, fields(conn_id = %endpoint.id()))]
pub async fn drive_socket<S, M, E>(
    socket: S,
    endpoint: Endpoint,
    mut outbound: LinkReceiver,
    hooks: &LifecycleHooks,
    on_pong: impl Fn(),
) -> CloseReason
where
    S: Stream<Item = Result<M, E>> + Sink<M, Error = E>,
    M: WireMessage + Unpin,
    E: Display,
{
    let (mut sink, mut stream) = socket.split();
    let terminate = outbound.terminate_token();

    let reason = loop {
        tokio::select! {
            biased;
            () = terminate.cancelled() => {
                if tokio::time::timeout(CLOSE_GRACE, sink.send(M::close())).await.is_err() {
                    debug!("close frame not written in time");
                }
                break CloseReason::Local;
            }
            item = outbound.recv() => match item {
                Some(Outbound::Frame { text, ack }) => {
                    let result = sink
                        .send(M::text(text))
                        .await
                        .map_err(|err| SendError::Write(err.to_string()));
                    let failure = result.as_ref().err().map(ToString::to_string);
                    if let Some(ack) = ack {
                        let _ = ack.send(result);
                    }
                    if let Some(message) = failure {
                        warn!(error = %message, "socket write failed");
                        hooks.fire_error(&message);
                        break CloseReason::Transport;
                    }
                }
                Some(Outbound::Ping) => {
                    if let Err(err) = sink.send(M::ping()).await {
                        let message = err.to_string();
                        warn!(error = %message, "ping write failed");
                        hooks.fire_error(&message);
                        break CloseReason::Transport;
                    }
                }
                None => break CloseReason::Local,
            },
            msg = stream.next() => match msg {
                Some(Ok(msg)) => match msg.classify() {
                    Inbound::Text(text) => endpoint.dispatch_frame(&text),
                    Inbound::Pong => on_pong(),
                    Inbound::Close => {
                        info!("peer sent close frame");
                        break CloseReason::Peer;
                    }
                    Inbound::Skip => {}
                },
                Some(Err(err)) => {
                    let message = err.to_string();
                    warn!(error = %message, "socket read failed");
                    hooks.fire_error(&message);
                    break CloseReason::Transport;
                }
                None => break CloseReason::Peer,
            },
        }
    };

    outbound.close();
    endpoint.mark_closed(reason);
    debug!(?reason, "socket driver stopped");
    reason
}
