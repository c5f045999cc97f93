//! Membership
//!
//! Runs a gossip participant and turns its member events into calls on a
//! [`Handler`]. Events are handled one at a time, in the order gossip
//! observed them, so calls for the same member never overlap.

use super::gossip::{Gossip, GossipConfig, GossipError, GossipEvent, Member, Tags};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::Instrument;

/// Tag under which a member publishes its RPC address.
pub const RPC_ADDR_TAG: &str = "rpc_addr";

/// Receives cluster changes for every member except the local node.
pub trait Handler: Send + Sync {
    /// `name` joined (or came back) and serves RPC at `addr`.
    fn join(&self, name: &str, addr: &str) -> anyhow::Result<()>;

    /// `name` left the cluster or was detected as failed.
    fn leave(&self, name: &str) -> anyhow::Result<()>;
}

/// Membership settings.
#[derive(Debug, Clone)]
pub struct MembershipConfig {
    pub node_name: String,
    /// Gossip address (port 0 picks a free port)
    pub bind_addr: SocketAddr,
    /// Published to other members, including [`RPC_ADDR_TAG`]
    pub tags: Tags,
    /// Seeds to join through; empty starts a new cluster
    pub start_join_addrs: Vec<String>,
    pub gossip_interval: Duration,
    pub failure_timeout: Duration,
    pub join_timeout: Duration,
}

impl MembershipConfig {
    pub fn new(node_name: impl Into<String>, bind_addr: SocketAddr) -> Self {
        let defaults = GossipConfig::new("", bind_addr);
        Self {
            node_name: node_name.into(),
            bind_addr,
            tags: Tags::new(),
            start_join_addrs: Vec::new(),
            gossip_interval: defaults.gossip_interval,
            failure_timeout: defaults.failure_timeout,
            join_timeout: defaults.join_timeout,
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn start_join_addrs(mut self, addrs: Vec<String>) -> Self {
        self.start_join_addrs = addrs;
        self
    }

    fn gossip_config(&self) -> GossipConfig {
        let mut config = GossipConfig::new(self.node_name.clone(), self.bind_addr).tags(self.tags.clone());
        config.gossip_interval = self.gossip_interval;
        config.failure_timeout = self.failure_timeout;
        config.join_timeout = self.join_timeout;
        config
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MembershipError {
    #[error("failed to start gossip: {0}")]
    Start(#[source] GossipError),
    #[error("failed to join cluster: {0}")]
    Join(#[source] GossipError),
    #[error("failed to leave cluster: {0}")]
    Leave(#[source] GossipError),
}

/// A node's participation in the cluster.
pub struct Membership {
    gossip: Gossip,
}

impl Membership {
    /// Start gossiping, forward events to `handler`, and join the seeds.
    pub async fn new(handler: Arc<dyn Handler>, config: MembershipConfig) -> Result<Self, MembershipError> {
        let (gossip, events) = Gossip::start(config.gossip_config())
            .await
            .map_err(MembershipError::Start)?;

        let local = config.node_name.clone();
        tokio::spawn(handle_events(local, events, handler).in_current_span());

        if !config.start_join_addrs.is_empty() {
            if let Err(e) = gossip.join(&config.start_join_addrs).await {
                gossip.shutdown();
                return Err(MembershipError::Join(e));
            }
        }

        Ok(Self { gossip })
    }

    /// Snapshot of the cluster ordered by node name, including this node.
    pub fn members(&self) -> Vec<Member> {
        self.gossip.members()
    }

    /// Gossip address actually bound.
    pub fn bind_addr(&self) -> SocketAddr {
        self.gossip.local_addr()
    }

    pub fn name(&self) -> &str {
        self.gossip.name()
    }

    /// Leave the cluster gracefully. Idempotent.
    pub async fn leave(&self) -> Result<(), MembershipError> {
        self.gossip.leave().await.map_err(MembershipError::Leave)
    }
}

async fn handle_events(local: String, mut events: mpsc::Receiver<GossipEvent>, handler: Arc<dyn Handler>) {
    while let Some(event) = events.recv().await {
        if event.member().name == local {
            continue;
        }

        match &event {
            GossipEvent::MemberJoined(member) => match member.tags.get(RPC_ADDR_TAG) {
                Some(addr) => {
                    if let Err(e) = handler.join(&member.name, addr) {
                        tracing::error!(member = %member.name, %addr, error = %e, "failed to handle join");
                    }
                }
                None => {
                    tracing::warn!(member = %member.name, "member published no rpc address, ignoring");
                }
            },
            GossipEvent::MemberLeft(member) | GossipEvent::MemberFailed(member) => {
                if let Err(e) = handler.leave(&member.name) {
                    tracing::error!(member = %member.name, error = %e, "failed to handle leave");
                }
            }
            GossipEvent::MemberUpdated(_) => {}
        }
    }
    tracing::debug!("membership event loop ended");
}
