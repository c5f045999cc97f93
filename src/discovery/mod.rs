//! Service Discovery
//!
//! Cluster membership over a SWIM-style gossip protocol, surfaced to the
//! rest of the node as plain join/leave notifications.

pub mod gossip;
mod membership;

pub use gossip::{Member, MemberStatus, Tags};
pub use membership::{Handler, Membership, MembershipConfig, MembershipError, RPC_ADDR_TAG};
