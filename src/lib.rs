//! A sans-IO, reliable, encrypted UDP transport for real-time multiplayer
//! games.
//!
//! This crate owns no socket and runs no event loop: callers push received
//! datagrams in through [`connection::Connection::recv`] /
//! [`endpoint::Endpoint::on_datagram`] and pull outgoing ones out through
//! `flush`, on whatever I/O and scheduling model fits their game loop. See
//! the module docs below for the handshake, wire format, and reliability
//! model.

pub mod bitfield;
pub mod client;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod endpoint;
pub mod error;
pub mod frag;
pub mod handshake;
pub mod header;
pub mod message;
pub mod packet;
pub mod seq;
pub mod stats;

pub use connection::{Connection, ConnectionState, DeliveredMessage};
pub use endpoint::{Endpoint, EndpointEvents};
pub use error::{ConnectError, DisconnectReason};
pub use message::RetryMode;
