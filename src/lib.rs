//! logmesh Library
//!
//! A node of a distributed append-only log. Every node accepts writes into
//! its own commit log, discovers peers over gossip and pulls their records
//! into its log, so every node eventually holds every record.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod agent;
pub mod auth;
pub mod commitlog;
pub mod config;
pub mod discovery;
pub mod replicator;
pub mod server;
pub mod tls;

// Re-export commonly used types
pub use agent::{Agent, AgentError};
pub use commitlog::{CommitLog, LogError, Record, SqliteLog, Watermark};
pub use config::{load_config, AgentConfig, ConfigError};
pub use discovery::{Handler, Member, MemberStatus, Membership, MembershipConfig};
pub use replicator::{PeerConnector, Replicator, ReplicatorError};
pub use server::{LogClient, LogServer};
pub use tls::TlsFiles;
