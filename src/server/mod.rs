//! Network Service
//!
//! The append/consume RPC surface every node exposes, and the client used
//! both by applications and by peers replicating from each other.
//!
//! ## Protocol
//!
//! Length-prefixed bincode frames over TCP, optionally inside TLS. A
//! connection carries any number of `Produce` / `Consume` calls, or turns
//! into a one-way record stream after `ConsumeStream`.

mod client;
mod drain;
pub mod protocol;
mod service;

pub use client::{ClientError, LogClient, RecordStream, TcpPeerConnector};
pub use drain::DrainController;
pub use service::{LogServer, ServerConfig, ServerError, ANONYMOUS_SUBJECT};
