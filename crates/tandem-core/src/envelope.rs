//! Wire envelope: one JSON object per frame.
//!
//! ```text
//! Call:      { "_id": 7, "name": "say", "args": ["hello"] }
//! Response:  { "_id": 7, "responseData": "HELLO" }
//! Bare ack:  { "_id": 7 }
//! ```
//!
//! A frame is a call when it carries a non-empty `name`; anything else with a
//! valid `_id` is a response. A `null` `responseData` decodes the same as an
//! absent one.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::EnvelopeError;

/// Serde mirror of the wire object.
#[derive(Debug, Default, Serialize, Deserialize)]
struct WireEnvelope {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    args: Option<Vec<Value>>,
    #[serde(
        rename = "responseData",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    response_data: Option<Value>,
}

/// A decoded frame.
#[derive(Clone, Debug, PartialEq)]
pub enum Envelope {
    /// Invocation of a named remote operation.
    Call {
        /// Correlation id allocated by the caller.
        id: u64,
        /// Operation name.
        name: String,
        /// Positional arguments.
        args: Vec<Value>,
    },
    /// Reply to a call. `data` is `None` for a bare acknowledgement.
    Response {
        /// Correlation id of the call being answered.
        id: u64,
        /// Handler result, if any.
        data: Option<Value>,
    },
}

impl Envelope {
    /// Build a call envelope.
    pub fn call(id: u64, name: impl Into<String>, args: Vec<Value>) -> Self {
        Self::Call {
            id,
            name: name.into(),
            args,
        }
    }

    /// Build a response envelope carrying handler output.
    pub fn response(id: u64, data: Value) -> Self {
        Self::Response {
            id,
            data: Some(data),
        }
    }

    /// Build a bare acknowledgement (no handler was registered).
    pub fn ack(id: u64) -> Self {
        Self::Response { id, data: None }
    }

    /// Correlation id.
    pub fn id(&self) -> u64 {
        match self {
            Self::Call { id, .. } | Self::Response { id, .. } => *id,
        }
    }

    /// Parse a text frame.
    pub fn decode(text: &str) -> Result<Self, EnvelopeError> {
        let wire: WireEnvelope = serde_json::from_str(text)?;
        let id = match wire.id {
            Some(id) if id > 0 => id,
            _ => return Err(EnvelopeError::MissingId),
        };
        match wire.name {
            Some(name) if !name.is_empty() => Ok(Self::Call {
                id,
                name,
                args: wire.args.unwrap_or_default(),
            }),
            _ => Ok(Self::Response {
                id,
                data: wire.response_data,
            }),
        }
    }

    /// Serialize to a text frame.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        let wire = match self {
            Self::Call { id, name, args } => WireEnvelope {
                id: Some(*id),
                name: Some(name.clone()),
                args: Some(args.clone()),
                response_data: None,
            },
            Self::Response { id, data } => WireEnvelope {
                id: Some(*id),
                response_data: data.clone(),
                ..WireEnvelope::default()
            },
        };
        serde_json::to_string(&wire)
    }
}
