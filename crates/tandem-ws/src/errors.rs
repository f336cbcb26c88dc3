//! Transport-level errors for the client and broker.

use tandem_core::RpcError;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Errors returned by [`crate::Client`].
#[derive(Debug, Error)]
pub enum ClientError {
    /// The connection could not be established.
    #[error("failed to connect to {url}: {source}")]
    Connect {
        /// Address that was dialed.
        url: String,
        /// Handshake or socket error.
        #[source]
        source: Box<tungstenite::Error>,
    },
    /// The connection dropped before the continuation finished.
    #[error("connection closed")]
    Closed,
    /// A call made by the continuation failed.
    #[error(transparent)]
    Rpc(#[from] RpcError),
    /// Any other continuation failure.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ClientError {
    /// Whether this is the distinguished connection-loss error.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Whether the error stems from the transport going away under a call.
    pub(crate) fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            Self::Closed
                | Self::Rpc(RpcError::NotOpen | RpcError::ConnectionClosed | RpcError::Send(_))
        )
    }

    /// Whether `auto_reconnect` should dial again after this error.
    ///
    /// A dropped connection and a failed dial are retried. A malformed URL
    /// can never succeed and continuation errors belong to the caller.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Closed => true,
            Self::Connect { source, .. } => !matches!(**source, tungstenite::Error::Url(_)),
            Self::Rpc(_) | Self::Other(_) => false,
        }
    }

    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "CONNECT_FAILED",
            Self::Closed => "CLOSED",
            Self::Rpc(err) => err.code(),
            Self::Other(_) => "CONTINUATION_FAILED",
        }
    }
}

/// Errors returned by [`crate::Broker`].
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The acceptor could not be started.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that was requested.
        addr: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The broker was closed while waiting.
    #[error("broker is closed")]
    Closed,
}
