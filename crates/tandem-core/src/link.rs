//! Outbound side of a transport connection.
//!
//! A [`Link`] is the only way an [`crate::Endpoint`] writes to its transport.
//! Frames travel over a bounded channel to whichever task owns the socket
//! (the [`LinkReceiver`] side); that task acknowledges each frame once the
//! write has completed, so `send_frame` reports real delivery failures.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::errors::SendError;

/// Lifecycle of the underlying transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadyState {
    /// Frames can be written.
    Open,
    /// Teardown has been requested but the socket task has not exited yet.
    Closing,
    /// The socket task has exited.
    Closed,
}

/// Item queued for the socket writer.
#[derive(Debug)]
pub enum Outbound {
    /// A text frame, optionally acknowledged after the write.
    Frame {
        /// Encoded envelope.
        text: String,
        /// Receives the write outcome.
        ack: Option<oneshot::Sender<Result<(), SendError>>>,
    },
    /// A liveness ping.
    Ping,
}

impl Outbound {
    /// Fail the frame's acknowledgement, if it has one.
    pub fn reject(self, err: SendError) {
        if let Self::Frame { ack: Some(ack), .. } = self {
            let _ = ack.send(Err(err));
        }
    }
}

/// Writer handle shared by an endpoint and its owners.
#[derive(Clone, Debug)]
pub struct Link {
    tx: mpsc::Sender<Outbound>,
    state: Arc<Mutex<ReadyState>>,
    terminate: CancellationToken,
}

/// Socket-side counterpart of a [`Link`].
#[derive(Debug)]
pub struct LinkReceiver {
    rx: mpsc::Receiver<Outbound>,
    state: Arc<Mutex<ReadyState>>,
    terminate: CancellationToken,
}

impl Link {
    /// Create a link and its receiver with the given queue capacity.
    pub fn channel(capacity: usize) -> (Self, LinkReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let state = Arc::new(Mutex::new(ReadyState::Open));
        let terminate = CancellationToken::new();
        let link = Self {
            tx,
            state: state.clone(),
            terminate: terminate.clone(),
        };
        let receiver = LinkReceiver {
            rx,
            state,
            terminate,
        };
        (link, receiver)
    }

    /// Current ready state.
    pub fn state(&self) -> ReadyState {
        *self.state.lock()
    }

    /// Whether frames can currently be written.
    pub fn is_open(&self) -> bool {
        self.state() == ReadyState::Open
    }

    /// Queue a frame and wait for the writer to report the outcome.
    pub async fn send_frame(&self, text: String) -> Result<(), SendError> {
        if !self.is_open() {
            return Err(SendError::NotOpen);
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(Outbound::Frame {
                text,
                ack: Some(ack_tx),
            })
            .await
            .map_err(|_| SendError::NotOpen)?;
        ack_rx.await.unwrap_or(Err(SendError::NotOpen))
    }

    /// Queue a ping without waiting.
    ///
    /// Returns `false` if the queue is full or the link is not open.
    pub fn ping(&self) -> bool {
        self.is_open() && self.tx.try_send(Outbound::Ping).is_ok()
    }

    /// Force-terminate the transport. Idempotent.
    pub fn terminate(&self) {
        {
            let mut state = self.state.lock();
            if *state == ReadyState::Open {
                *state = ReadyState::Closing;
            }
        }
        self.terminate.cancel();
    }
}

impl LinkReceiver {
    /// Next queued item, or `None` once every [`Link`] clone is gone.
    pub async fn recv(&mut self) -> Option<Outbound> {
        self.rx.recv().await
    }

    /// Token cancelled when the link is terminated.
    pub fn terminate_token(&self) -> CancellationToken {
        self.terminate.clone()
    }

    /// Mark the transport closed and fail every frame still queued.
    pub fn close(&mut self) {
        *self.state.lock() = ReadyState::Closed;
        self.rx.close();
        while let Ok(item) = self.rx.try_recv() {
            item.reject(SendError::NotOpen);
        }
    }
}
