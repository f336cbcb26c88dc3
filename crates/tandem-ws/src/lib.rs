//! # tandem-ws
//!
//! WebSocket transport for the tandem RPC layer.
//!
//! - [`Client`]: dial a broker, race a continuation against connection loss,
//!   reconnect after a drop
//! - [`Broker`]: accept many peers, fan handler registrations out to every
//!   live connection, aggregate calls across peers, evict dead peers
//!
//! Both sides speak through a [`tandem_core::Endpoint`] driven by
//! [`socket::drive_socket`].

#![deny(unsafe_code)]

pub mod broker;
pub mod client;
pub mod config;
pub mod connection;
pub mod errors;
pub mod health;
pub mod heartbeat;
pub mod peers;
pub mod shutdown;
pub mod socket;

pub use broker::{Broker, BrokerOptions};
pub use client::Client;
pub use config::{BrokerConfig, ClientConfig, LifecycleHooks};
pub use errors::{BrokerError, ClientError};
