//! Error types for the correlation engine.
//!
//! Each layer gets its own enum: the wire codec ([`EnvelopeError`]), the
//! frame writer ([`SendError`]), outbound calls ([`RpcError`]) and inbound
//! handler execution ([`HandlerError`]).

use thiserror::Error;

/// A frame that could not be turned into an [`crate::Envelope`].
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// The frame is not a JSON object of the expected shape.
    #[error("invalid envelope JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// `_id` is absent or zero.
    #[error("envelope has no correlation id")]
    MissingId,
}

/// Failure reported by the transport writer for a single frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// The link is closing or closed.
    #[error("transport is not open")]
    NotOpen,
    /// The socket write itself failed.
    #[error("transport write failed: {0}")]
    Write(String),
}

/// Errors surfaced to a caller of [`crate::Endpoint::call`].
#[derive(Debug, Error)]
pub enum RpcError {
    /// The endpoint's transport is not open.
    #[error("endpoint is not open")]
    NotOpen,
    /// The frame carrying the call could not be delivered.
    #[error("failed to send call: {0}")]
    Send(#[from] SendError),
    /// The transport closed before the response arrived.
    #[error("connection closed before a response arrived")]
    ConnectionClosed,
    /// The envelope could not be encoded.
    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
}

impl RpcError {
    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotOpen => "NOT_OPEN",
            Self::Send(_) => "SEND_FAILED",
            Self::ConnectionClosed => "CONNECTION_CLOSED",
            Self::Encode(_) => "ENCODE_ERROR",
        }
    }
}

/// Failure of a call handler. No response is sent for a failed handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// The handler reported a failure.
    #[error("{0}")]
    Failed(String),
    /// The call's arguments were not what the handler expected.
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),
    /// The handler panicked; the payload message is preserved.
    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    /// Shorthand for [`HandlerError::Failed`].
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Shorthand for [`HandlerError::InvalidArgs`].
    pub fn invalid_args(message: impl Into<String>) -> Self {
        Self::InvalidArgs(message.into())
    }
}
