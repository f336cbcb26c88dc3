//! # tandem-core
//!
//! Transport-agnostic half of the tandem RPC layer.
//!
//! - **Envelope**: JSON wire record carrying a correlation id plus a call or a response
//! - **Link**: the single `send_frame` primitive, ready state and forced teardown
//! - **Registry**: named handlers with explicit [`HandlerId`] handles
//! - **Endpoint**: per-connection correlation engine (pending calls, pending replies)
//! - **Memory**: in-process endpoint pair for tests and embedding

#![deny(unsafe_code)]

pub mod endpoint;
pub mod envelope;
pub mod errors;
pub mod link;
pub mod logging;
pub mod memory;
pub mod registry;

pub use endpoint::{CloseReason, Endpoint};
pub use envelope::Envelope;
pub use errors::{EnvelopeError, HandlerError, RpcError, SendError};
pub use link::{Link, LinkReceiver, Outbound, ReadyState};
pub use registry::{CallHandler, HandlerEntry, HandlerId, HandlerRegistry};
