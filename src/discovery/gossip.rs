//! Gossip Protocol (SWIM-like)
//!
//! Cluster membership and failure detection over UDP. Every node keeps a
//! local, eventually consistent view of the cluster and spreads it by
//! pinging and pushing its view to random peers.
//!
//! Uses Sans-IO pattern: message processing is separated from I/O for testability.
//! [`process_message`] and [`ClusterView`] never touch the network; the
//! [`Gossip`] loop executes the [`GossipAction`]s they return.

use parking_lot::RwLock;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};

/// Key/value metadata gossiped with a member.
pub type Tags = BTreeMap<String, String>;

/// Status of a cluster member as seen locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberStatus {
    /// Member is alive and reachable
    Alive,
    /// Member stopped responding
    Failed,
    /// Member announced its departure
    Left,
}

impl MemberStatus {
    /// At equal incarnation a status may only move up this ranking.
    fn rank(self) -> u8 {
        match self {
            MemberStatus::Alive => 0,
            MemberStatus::Failed => 1,
            MemberStatus::Left => 2,
        }
    }
}

impl fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MemberStatus::Alive => "alive",
            MemberStatus::Failed => "failed",
            MemberStatus::Left => "left",
        };
        f.write_str(s)
    }
}

/// Member description as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberState {
    pub name: String,
    pub addr: SocketAddr,
    pub tags: Tags,
    pub status: MemberStatus,
    pub incarnation: u64,
}

/// Information about a cluster member.
#[derive(Debug, Clone)]
pub struct Member {
    /// Node name, unique in the cluster
    pub name: String,
    /// Address for gossip communication
    pub addr: SocketAddr,
    /// Metadata published by the member
    pub tags: Tags,
    /// Current status
    pub status: MemberStatus,
    /// Incarnation number for state reconciliation
    pub incarnation: u64,
    /// When the member was last heard from directly
    pub last_seen: Instant,
    /// When `status` last changed
    pub status_since: Instant,
}

impl PartialEq for Member {
    fn eq(&self, other: &Self) -> bool {
        // Compare all fields except the time-based ones
        self.name == other.name
            && self.addr == other.addr
            && self.tags == other.tags
            && self.status == other.status
            && self.incarnation == other.incarnation
    }
}

impl Member {
    fn from_state(state: MemberState, now: Instant) -> Self {
        Self {
            name: state.name,
            addr: state.addr,
            tags: state.tags,
            status: state.status,
            incarnation: state.incarnation,
            last_seen: now,
            status_since: now,
        }
    }

    pub fn state(&self) -> MemberState {
        MemberState {
            name: self.name.clone(),
            addr: self.addr,
            tags: self.tags.clone(),
            status: self.status,
            incarnation: self.incarnation,
        }
    }
}

/// Message types for gossip protocol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GossipMessage {
    /// Ping - check if node is alive
    Ping { from: MemberState },
    /// Ack - response to ping
    Ack { from: MemberState },
    /// Join - announce joining the cluster through a seed
    Join { node: MemberState },
    /// Seed's answer to a join, carrying its full view
    JoinAck { members: Vec<MemberState> },
    /// Anti-entropy push of (part of) a view
    Sync { members: Vec<MemberState> },
    /// Graceful departure
    Leave { name: String, incarnation: u64 },
}

/// Events emitted by the gossip service, in the order they were observed.
#[derive(Debug, Clone, PartialEq)]
pub enum GossipEvent {
    /// A member joined (or came back)
    MemberJoined(Member),
    /// A member left gracefully
    MemberLeft(Member),
    /// A member stopped responding
    MemberFailed(Member),
    /// A member's address or tags changed
    MemberUpdated(Member),
}

impl GossipEvent {
    pub fn member(&self) -> &Member {
        match self {
            GossipEvent::MemberJoined(m)
            | GossipEvent::MemberLeft(m)
            | GossipEvent::MemberFailed(m)
            | GossipEvent::MemberUpdated(m) => m,
        }
    }
}

/// Output action from message processing (Sans-IO pattern).
/// Instead of doing I/O directly, we return actions to be performed.
#[derive(Debug, Clone, PartialEq)]
pub enum GossipAction {
    /// Send a message to a specific address
    Send { to: SocketAddr, message: GossipMessage },
    /// Emit an event
    Emit(GossipEvent),
    /// A seed answered our join
    JoinAcknowledged,
}

/// Result of processing a gossip message (Sans-IO pattern).
#[derive(Debug, Clone, Default)]
pub struct ProcessResult {
    /// Actions to perform (send messages, emit events)
    pub actions: Vec<GossipAction>,
}

impl ProcessResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn send(to: SocketAddr, message: GossipMessage) -> Self {
        Self {
            actions: vec![GossipAction::Send { to, message }],
        }
    }

    pub fn with_action(mut self, action: GossipAction) -> Self {
        self.actions.push(action);
        self
    }

    fn emit(&mut self, event: Option<GossipEvent>) {
        if let Some(event) = event {
            self.actions.push(GossipAction::Emit(event));
        }
    }

    fn broadcast(&mut self, peers: &[SocketAddr], message: &GossipMessage) {
        for peer in peers {
            self.actions.push(GossipAction::Send {
                to: *peer,
                message: message.clone(),
            });
        }
    }
}

/// Local view of the cluster, including the local node itself.
#[derive(Debug, Clone)]
pub struct ClusterView {
    local: String,
    members: BTreeMap<String, Member>,
    leaving: bool,
}

impl ClusterView {
    pub fn new(local: MemberState, now: Instant) -> Self {
        let name = local.name.clone();
        let mut members = BTreeMap::new();
        members.insert(name.clone(), Member::from_state(local, now));
        Self {
            local: name,
            members,
            leaving: false,
        }
    }

    pub fn local_name(&self) -> &str {
        &self.local
    }

    pub fn local_state(&self) -> MemberState {
        self.members[&self.local].state()
    }

    /// Snapshot ordered by member name.
    pub fn members(&self) -> Vec<Member> {
        self.members.values().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Option<&Member> {
        self.members.get(name)
    }

    pub fn states(&self) -> Vec<MemberState> {
        self.members.values().map(Member::state).collect()
    }

    /// Gossip addresses of alive members other than the local node.
    pub fn alive_peers(&self) -> Vec<SocketAddr> {
        self.members
            .values()
            .filter(|m| m.name != self.local && m.status == MemberStatus::Alive)
            .map(|m| m.addr)
            .collect()
    }

    pub fn is_leaving(&self) -> bool {
        self.leaving
    }

    /// Mark the local node as departing and return its new state.
    pub fn mark_leaving(&mut self, now: Instant) -> MemberState {
        self.leaving = true;
        if let Some(local) = self.members.get_mut(&self.local) {
            local.status = MemberStatus::Left;
            local.incarnation += 1;
            local.status_since = now;
        }
        self.local_state()
    }

    /// Merge a gossiped member state into the view.
    ///
    /// `direct` is true when the state came from the member itself, which
    /// counts as proof of life.
    pub fn merge(&mut self, incoming: MemberState, direct: bool, now: Instant) -> Option<GossipEvent> {
        if incoming.name == self.local {
            self.refute(&incoming);
            return None;
        }

        let Some(existing) = self.members.get_mut(&incoming.name) else {
            let member = Member::from_state(incoming, now);
            let event = (member.status == MemberStatus::Alive)
                .then(|| GossipEvent::MemberJoined(member.clone()));
            self.members.insert(member.name.clone(), member);
            return event;
        };

        if incoming.incarnation < existing.incarnation {
            return None;
        }

        let old_status = existing.status;
        if direct && incoming.status == MemberStatus::Alive && old_status == MemberStatus::Alive {
            existing.last_seen = now;
        }

        let newer = incoming.incarnation > existing.incarnation;
        let escalates = incoming.status.rank() > old_status.rank();
        let revives = direct && old_status == MemberStatus::Failed && incoming.status == MemberStatus::Alive;
        let changed = existing.addr != incoming.addr || existing.tags != incoming.tags;
        if !(newer || escalates || revives) {
            return None;
        }

        existing.addr = incoming.addr;
        existing.tags = incoming.tags;
        existing.incarnation = incoming.incarnation;
        existing.status = incoming.status;
        if incoming.status == MemberStatus::Alive {
            existing.last_seen = now;
        }
        if old_status != incoming.status {
            existing.status_since = now;
        }

        let member = existing.clone();
        match (old_status, member.status) {
            (MemberStatus::Alive, MemberStatus::Left) => Some(GossipEvent::MemberLeft(member)),
            (MemberStatus::Alive, MemberStatus::Failed) => Some(GossipEvent::MemberFailed(member)),
            (MemberStatus::Left | MemberStatus::Failed, MemberStatus::Alive) => {
                Some(GossipEvent::MemberJoined(member))
            }
            (MemberStatus::Alive, MemberStatus::Alive) if changed => {
                Some(GossipEvent::MemberUpdated(member))
            }
            _ => None,
        }
    }

    /// Someone claims the local node is gone: outbid the claim.
    fn refute(&mut self, claim: &MemberState) {
        if self.leaving || claim.status == MemberStatus::Alive {
            return;
        }
        if let Some(local) = self.members.get_mut(&self.local) {
            if claim.incarnation >= local.incarnation {
                local.incarnation = claim.incarnation + 1;
                tracing::debug!(
                    incarnation = local.incarnation,
                    claimed = %claim.status,
                    "refuting claim about local node"
                );
            }
        }
    }

    /// Mark alive members not heard from within `timeout` as failed.
    pub fn check_failures(&mut self, timeout: Duration, now: Instant) -> Vec<GossipEvent> {
        let mut events = Vec::new();
        for member in self.members.values_mut() {
            if member.name != self.local
                && member.status == MemberStatus::Alive
                && now.duration_since(member.last_seen) > timeout
            {
                member.status = MemberStatus::Failed;
                member.status_since = now;
                events.push(GossipEvent::MemberFailed(member.clone()));
            }
        }
        events
    }

    /// Forget members that left or failed more than `tombstone` ago.
    pub fn reap(&mut self, tombstone: Duration, now: Instant) -> Vec<String> {
        let reaped: Vec<String> = self
            .members
            .values()
            .filter(|m| {
                m.name != self.local
                    && m.status != MemberStatus::Alive
                    && now.duration_since(m.status_since) > tombstone
            })
            .map(|m| m.name.clone())
            .collect();
        for name in &reaped {
            self.members.remove(name);
        }
        reaped
    }
}

/// Pure function to process a gossip message (Sans-IO pattern).
/// Returns actions to be performed instead of doing I/O directly.
pub fn process_message(
    msg: &GossipMessage,
    src: SocketAddr,
    view: &RwLock<ClusterView>,
    now: Instant,
) -> ProcessResult {
    let mut view = view.write();

    match msg {
        GossipMessage::Ping { from } => {
            let event = view.merge(from.clone(), true, now);
            let mut result = ProcessResult::send(
                src,
                GossipMessage::Ack {
                    from: view.local_state(),
                },
            );
            result.emit(event);
            result
        }

        GossipMessage::Ack { from } => {
            let mut result = ProcessResult::empty();
            result.emit(view.merge(from.clone(), true, now));
            result
        }

        GossipMessage::Join { node } => {
            let event = view.merge(node.clone(), true, now);
            let mut result = ProcessResult::send(
                src,
                GossipMessage::JoinAck {
                    members: view.states(),
                },
            );

            // Tell everyone else about the newcomer right away
            if matches!(event, Some(GossipEvent::MemberJoined(_))) {
                let others: Vec<SocketAddr> = view
                    .alive_peers()
                    .into_iter()
                    .filter(|addr| *addr != src && *addr != node.addr)
                    .collect();
                result.broadcast(
                    &others,
                    &GossipMessage::Sync {
                        members: vec![node.clone()],
                    },
                );
            }
            result.emit(event);
            result
        }

        GossipMessage::JoinAck { members } => {
            let mut result = ProcessResult::empty().with_action(GossipAction::JoinAcknowledged);
            for state in members {
                let direct = state.addr == src;
                result.emit(view.merge(state.clone(), direct, now));
            }
            result
        }

        GossipMessage::Sync { members } => {
            let mut result = ProcessResult::empty();
            for state in members {
                let direct = state.addr == src;
                result.emit(view.merge(state.clone(), direct, now));
            }
            result
        }

        GossipMessage::Leave { name, incarnation } => {
            let Some(known) = view.get(name) else {
                return ProcessResult::empty();
            };
            let mut departed = known.state();
            departed.status = MemberStatus::Left;
            departed.incarnation = *incarnation;

            let event = view.merge(departed, false, now);
            let mut result = ProcessResult::empty();

            // Forward once, only when it was news to us
            if matches!(event, Some(GossipEvent::MemberLeft(_))) {
                let others: Vec<SocketAddr> = view
                    .alive_peers()
                    .into_iter()
                    .filter(|addr| *addr != src)
                    .collect();
                result.broadcast(&others, msg);
            }
            result.emit(event);
            result
        }
    }
}

/// One gossip round: ping a random peer and push the view to another.
pub fn gossip_round(view: &RwLock<ClusterView>) -> Vec<GossipAction> {
    let view = view.read();
    let peers = view.alive_peers();
    let mut rng = rand::thread_rng();

    let mut actions = Vec::new();
    if let Some(target) = peers.choose(&mut rng) {
        actions.push(GossipAction::Send {
            to: *target,
            message: GossipMessage::Ping {
                from: view.local_state(),
            },
        });
    }
    if let Some(target) = peers.choose(&mut rng) {
        actions.push(GossipAction::Send {
            to: *target,
            message: GossipMessage::Sync {
                members: view.states(),
            },
        });
    }
    actions
}

/// Gossip tuning.
#[derive(Debug, Clone)]
pub struct GossipConfig {
    /// Unique node name
    pub node_name: String,
    /// Address to bind the UDP socket to (port 0 picks a free port)
    pub bind_addr: SocketAddr,
    /// Address announced to peers (default: the bound address)
    pub advertise_addr: Option<SocketAddr>,
    /// Metadata published with this node
    pub tags: Tags,
    /// Interval between gossip rounds (default: 200ms)
    pub gossip_interval: Duration,
    /// Silence after which a member is marked failed (default: 5s)
    pub failure_timeout: Duration,
    /// How often failures are checked for (default: 1s)
    pub failure_check_interval: Duration,
    /// How long left/failed members stay in the view (default: 24h)
    pub tombstone_timeout: Duration,
    /// How long to wait for a seed to answer a join (default: 2s)
    pub join_timeout: Duration,
}

impl GossipConfig {
    pub fn new(node_name: impl Into<String>, bind_addr: SocketAddr) -> Self {
        Self {
            node_name: node_name.into(),
            bind_addr,
            advertise_addr: None,
            tags: Tags::new(),
            gossip_interval: Duration::from_millis(200),
            failure_timeout: Duration::from_secs(5),
            failure_check_interval: Duration::from_secs(1),
            tombstone_timeout: Duration::from_secs(24 * 60 * 60),
            join_timeout: Duration::from_secs(2),
        }
    }

    pub fn tags(mut self, tags: Tags) -> Self {
        self.tags = tags;
        self
    }
}

/// Gossip errors.
#[derive(Debug, thiserror::Error)]
pub enum GossipError {
    #[error("failed to bind gossip socket on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("no seed answered the join request (seeds: {})", seeds.join(", "))]
    JoinFailed { seeds: Vec<String> },
    #[error("codec: {0}")]
    Codec(#[from] bincode::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Gossip participant: owns the UDP socket and the background loop.
pub struct Gossip {
    config: GossipConfig,
    local_addr: SocketAddr,
    socket: Arc<UdpSocket>,
    view: Arc<RwLock<ClusterView>>,
    shutdown_tx: watch::Sender<bool>,
    join_acks: watch::Receiver<u64>,
}

impl Gossip {
    /// Bind the socket and start gossiping.
    ///
    /// Returns the participant and the receiver of its membership events.
    /// The receiver yields `None` once the gossip loop stops.
    pub async fn start(
        config: GossipConfig,
    ) -> Result<(Self, mpsc::Receiver<GossipEvent>), GossipError> {
        let socket = UdpSocket::bind(config.bind_addr)
            .await
            .map_err(|source| GossipError::Bind {
                addr: config.bind_addr,
                source,
            })?;
        let bound = socket.local_addr()?;
        let local_addr = config.advertise_addr.unwrap_or(bound);

        let local = MemberState {
            name: config.node_name.clone(),
            addr: local_addr,
            tags: config.tags.clone(),
            status: MemberStatus::Alive,
            incarnation: initial_incarnation(),
        };
        let view = Arc::new(RwLock::new(ClusterView::new(local, Instant::now())));
        let socket = Arc::new(socket);

        let (event_tx, event_rx) = mpsc::channel(1024);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (join_ack_tx, join_acks) = watch::channel(0u64);

        tracing::info!(node = %config.node_name, addr = %local_addr, "gossip listening");

        tokio::spawn(run_loop(
            socket.clone(),
            view.clone(),
            config.clone(),
            event_tx,
            join_ack_tx,
            shutdown_rx,
        ));

        let gossip = Self {
            config,
            local_addr,
            socket,
            view,
            shutdown_tx,
            join_acks,
        };
        Ok((gossip, event_rx))
    }

    pub fn name(&self) -> &str {
        &self.config.node_name
    }

    /// Address announced to peers.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Snapshot of the local view ordered by name, including this node.
    pub fn members(&self) -> Vec<Member> {
        self.view.read().members()
    }

    pub fn get_member(&self, name: &str) -> Option<Member> {
        self.view.read().get(name).cloned()
    }

    /// Join the cluster through any of `seeds` (`host:port`).
    pub async fn join(&self, seeds: &[String]) -> Result<(), GossipError> {
        let mut targets = Vec::new();
        for seed in seeds {
            match tokio::net::lookup_host(seed.as_str()).await {
                Ok(mut addrs) => match addrs.next() {
                    Some(addr) if addr != self.local_addr => targets.push(addr),
                    Some(_) => {}
                    None => tracing::warn!(%seed, "seed resolved to no address"),
                },
                Err(e) => tracing::warn!(%seed, error = %e, "failed to resolve seed"),
            }
        }

        let failed = || GossipError::JoinFailed {
            seeds: seeds.to_vec(),
        };
        if targets.is_empty() {
            return Err(failed());
        }

        let mut acks = self.join_acks.clone();
        acks.borrow_and_update();
        let join = bincode::serialize(&GossipMessage::Join {
            node: self.view.read().local_state(),
        })?;

        let deadline = tokio::time::sleep(self.config.join_timeout);
        tokio::pin!(deadline);
        let mut retry = tokio::time::interval(self.config.gossip_interval);

        loop {
            tokio::select! {
                _ = &mut deadline => return Err(failed()),
                _ = retry.tick() => {
                    for target in &targets {
                        if let Err(e) = self.socket.send_to(&join, target).await {
                            tracing::debug!(%target, error = %e, "failed to send join");
                        }
                    }
                }
                changed = acks.changed() => {
                    if changed.is_err() {
                        return Err(failed());
                    }
                    tracing::info!(seeds = ?seeds, "joined cluster");
                    return Ok(());
                }
            }
        }
    }

    /// Announce departure, then stop gossiping. Idempotent.
    pub async fn leave(&self) -> Result<(), GossipError> {
        if self.is_shutdown() || self.view.read().is_leaving() {
            return Ok(());
        }

        let (state, peers) = {
            let mut view = self.view.write();
            let state = view.mark_leaving(Instant::now());
            (state, view.alive_peers())
        };
        let leave = bincode::serialize(&GossipMessage::Leave {
            name: state.name,
            incarnation: state.incarnation,
        })?;

        // Sent twice, one round apart, since datagrams may be lost
        for round in 0..2 {
            if round > 0 {
                tokio::time::sleep(self.config.gossip_interval).await;
            }
            for peer in &peers {
                if let Err(e) = self.socket.send_to(&leave, peer).await {
                    tracing::debug!(%peer, error = %e, "failed to send leave");
                }
            }
        }

        tracing::info!(node = %self.config.node_name, "left cluster");
        self.shutdown();
        Ok(())
    }

    /// Stop the background loop without announcing anything.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_tx.borrow()
    }
}

impl Drop for Gossip {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn initial_incarnation() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

#[cfg_attr(coverage_nightly, coverage(off))]
async fn run_loop(
    socket: Arc<UdpSocket>,
    view: Arc<RwLock<ClusterView>>,
    config: GossipConfig,
    event_tx: mpsc::Sender<GossipEvent>,
    join_ack_tx: watch::Sender<u64>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; 65535];
    let mut gossip_timer = tokio::time::interval(config.gossip_interval);
    let mut failure_timer = tokio::time::interval(config.failure_check_interval);

    loop {
        let actions = tokio::select! {
            _ = shutdown_requested(&mut shutdown_rx) => {
                tracing::debug!(node = %config.node_name, "gossip loop stopped");
                break;
            }

            // Handle incoming messages
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, src)) => match bincode::deserialize::<GossipMessage>(&buf[..len]) {
                    Ok(msg) => process_message(&msg, src, &view, Instant::now()).actions,
                    Err(e) => {
                        tracing::debug!(%src, error = %e, "dropping malformed gossip datagram");
                        continue;
                    }
                },
                Err(e) => {
                    tracing::debug!(error = %e, "gossip recv error");
                    continue;
                }
            },

            _ = gossip_timer.tick() => gossip_round(&view),

            // Check for failed and expired members
            _ = failure_timer.tick() => {
                let now = Instant::now();
                let mut guard = view.write();
                let reaped = guard.reap(config.tombstone_timeout, now);
                if !reaped.is_empty() {
                    tracing::debug!(?reaped, "reaped departed members");
                }
                guard
                    .check_failures(config.failure_timeout, now)
                    .into_iter()
                    .map(GossipAction::Emit)
                    .collect()
            }
        };

        execute_actions(actions, &socket, &event_tx, &join_ack_tx).await;
    }
}

/// Execute gossip actions (Sans-IO pattern).
async fn execute_actions(
    actions: Vec<GossipAction>,
    socket: &UdpSocket,
    event_tx: &mpsc::Sender<GossipEvent>,
    join_ack_tx: &watch::Sender<u64>,
) {
    for action in actions {
        match action {
            GossipAction::Send { to, message } => match bincode::serialize(&message) {
                Ok(data) => {
                    if let Err(e) = socket.send_to(&data, to).await {
                        tracing::debug!(%to, error = %e, "gossip send failed");
                    }
                }
                Err(e) => tracing::error!(error = %e, "failed to encode gossip message"),
            },
            GossipAction::Emit(event) => {
                let _ = event_tx.send(event).await;
            }
            GossipAction::JoinAcknowledged => {
                join_ack_tx.send_modify(|acks| *acks += 1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn state(name: &str, port: u16, status: MemberStatus, incarnation: u64) -> MemberState {
        let mut tags = Tags::new();
        tags.insert("rpc_addr".to_string(), format!("127.0.0.1:{}", port + 1));
        MemberState {
            name: name.to_string(),
            addr: addr(port),
            tags,
            status,
            incarnation,
        }
    }

    fn view(name: &str) -> ClusterView {
        ClusterView::new(state(name, 4000, MemberStatus::Alive, 1), Instant::now())
    }

    #[test]
    fn test_member_status_display() {
        assert_eq!(MemberStatus::Alive.to_string(), "alive");
        assert_eq!(MemberStatus::Left.to_string(), "left");
        assert_eq!(MemberStatus::Failed.to_string(), "failed");
    }

    #[test]
    fn test_view_contains_local_node() {
        let view = view("a");
        let members = view.members();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].name, "a");
        assert!(view.alive_peers().is_empty());
    }

    #[test]
    fn test_merge_new_alive_member_emits_join() {
        let mut view = view("a");
        let event = view.merge(state("b", 4010, MemberStatus::Alive, 1), false, Instant::now());

        match event {
            Some(GossipEvent::MemberJoined(m)) => assert_eq!(m.name, "b"),
            other => panic!("expected join, got {:?}", other),
        }
        assert_eq!(view.alive_peers(), vec![addr(4010)]);
    }

    #[test]
    fn test_merge_unknown_departed_member_is_silent() {
        let mut view = view("a");
        let event = view.merge(state("b", 4010, MemberStatus::Left, 3), false, Instant::now());
        assert!(event.is_none());
        assert_eq!(view.get("b").unwrap().status, MemberStatus::Left);
    }

    #[test]
    fn test_merge_same_state_is_idempotent() {
        let mut view = view("a");
        let now = Instant::now();
        view.merge(state("b", 4010, MemberStatus::Alive, 1), false, now);
        assert!(view.merge(state("b", 4010, MemberStatus::Alive, 1), true, now).is_none());
    }

    #[test]
    fn test_merge_leave_at_same_incarnation() {
        let mut view = view("a");
        let now = Instant::now();
        view.merge(state("b", 4010, MemberStatus::Alive, 1), false, now);

        let event = view.merge(state("b", 4010, MemberStatus::Left, 1), false, now);
        assert!(matches!(event, Some(GossipEvent::MemberLeft(_))));

        // A stale alive claim cannot undo the departure
        assert!(view.merge(state("b", 4010, MemberStatus::Alive, 1), true, now).is_none());
        assert_eq!(view.get("b").unwrap().status, MemberStatus::Left);
    }

    #[test]
    fn test_merge_older_incarnation_ignored() {
        let mut view = view("a");
        let now = Instant::now();
        view.merge(state("b", 4010, MemberStatus::Alive, 5), false, now);
        assert!(view.merge(state("b", 4010, MemberStatus::Left, 4), false, now).is_none());
        assert_eq!(view.get("b").unwrap().status, MemberStatus::Alive);
    }

    #[test]
    fn test_merge_higher_incarnation_revives() {
        let mut view = view("a");
        let now = Instant::now();
        view.merge(state("b", 4010, MemberStatus::Alive, 1), false, now);
        view.merge(state("b", 4010, MemberStatus::Left, 1), false, now);

        let event = view.merge(state("b", 4010, MemberStatus::Alive, 2), false, now);
        assert!(matches!(event, Some(GossipEvent::MemberJoined(_))));
    }

    #[test]
    fn test_direct_contact_revives_failed_member() {
        let mut view = view("a");
        let now = Instant::now();
        view.merge(state("b", 4010, MemberStatus::Alive, 1), false, now);
        view.merge(state("b", 4010, MemberStatus::Failed, 1), false, now);

        assert!(view.merge(state("b", 4010, MemberStatus::Alive, 1), false, now).is_none());
        let event = view.merge(state("b", 4010, MemberStatus::Alive, 1), true, now);
        assert!(matches!(event, Some(GossipEvent::MemberJoined(_))));
    }

    #[test]
    fn test_merge_tag_change_emits_update() {
        let mut view = view("a");
        let now = Instant::now();
        view.merge(state("b", 4010, MemberStatus::Alive, 1), false, now);

        let mut updated = state("b", 4010, MemberStatus::Alive, 2);
        updated.tags.insert("rpc_addr".to_string(), "127.0.0.1:9999".to_string());
        let event = view.merge(updated, false, now);
        assert!(matches!(event, Some(GossipEvent::MemberUpdated(_))));
    }

    #[test]
    fn test_local_node_refutes_failure_claim() {
        let mut view = view("a");
        let event = view.merge(state("a", 4000, MemberStatus::Failed, 1), false, Instant::now());
        assert!(event.is_none());
        assert_eq!(view.local_state().incarnation, 2);
        assert_eq!(view.local_state().status, MemberStatus::Alive);
    }

    #[test]
    fn test_mark_leaving_bumps_incarnation() {
        let mut view = view("a");
        let state = view.mark_leaving(Instant::now());
        assert_eq!(state.status, MemberStatus::Left);
        assert_eq!(state.incarnation, 2);
        assert!(view.is_leaving());

        // No refutation once leaving
        view.merge(self::state("a", 4000, MemberStatus::Failed, 5), false, Instant::now());
        assert_eq!(view.local_state().incarnation, 2);
    }

    #[test]
    fn test_check_failures() {
        let mut view = view("a");
        let then = Instant::now();
        view.merge(state("b", 4010, MemberStatus::Alive, 1), false, then);

        let later = then + Duration::from_secs(10);
        let events = view.check_failures(Duration::from_secs(5), later);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], GossipEvent::MemberFailed(m) if m.name == "b"));

        // Already failed members are not reported again
        assert!(view.check_failures(Duration::from_secs(5), later).is_empty());
    }

    #[test]
    fn test_reap_removes_old_tombstones() {
        let mut view = view("a");
        let then = Instant::now();
        view.merge(state("b", 4010, MemberStatus::Alive, 1), false, then);
        view.merge(state("c", 4020, MemberStatus::Alive, 1), false, then);
        view.merge(state("b", 4010, MemberStatus::Left, 1), false, then);

        let reaped = view.reap(Duration::from_secs(60), then + Duration::from_secs(120));
        assert_eq!(reaped, vec!["b".to_string()]);
        assert_eq!(view.members().len(), 2);
    }

    #[test]
    fn test_process_ping_replies_with_ack() {
        let view = RwLock::new(view("a"));
        let ping = GossipMessage::Ping {
            from: state("b", 4010, MemberStatus::Alive, 1),
        };

        let result = process_message(&ping, addr(4010), &view, Instant::now());
        assert_eq!(result.actions.len(), 2);
        assert!(matches!(
            &result.actions[0],
            GossipAction::Send { to, message: GossipMessage::Ack { from } } if *to == addr(4010) && from.name == "a"
        ));
        assert!(matches!(&result.actions[1], GossipAction::Emit(GossipEvent::MemberJoined(_))));
    }

    #[test]
    fn test_process_join_answers_and_forwards() {
        let view = RwLock::new(view("a"));
        let now = Instant::now();
        view.write().merge(state("b", 4010, MemberStatus::Alive, 1), false, now);

        let join = GossipMessage::Join {
            node: state("c", 4020, MemberStatus::Alive, 1),
        };
        let result = process_message(&join, addr(4020), &view, now);

        let ack = result
            .actions
            .iter()
            .find_map(|a| match a {
                GossipAction::Send { to, message: GossipMessage::JoinAck { members } } => Some((*to, members.len())),
                _ => None,
            })
            .unwrap();
        assert_eq!(ack, (addr(4020), 3));

        let forwarded: Vec<_> = result
            .actions
            .iter()
            .filter(|a| matches!(a, GossipAction::Send { message: GossipMessage::Sync { .. }, .. }))
            .collect();
        assert_eq!(forwarded.len(), 1);
        assert!(matches!(forwarded[0], GossipAction::Send { to, .. } if *to == addr(4010)));
    }

    #[test]
    fn test_process_join_ack_signals_join() {
        let view = RwLock::new(view("c"));
        let ack = GossipMessage::JoinAck {
            members: vec![
                state("a", 4000, MemberStatus::Alive, 1),
                state("b", 4010, MemberStatus::Alive, 1),
                state("c", 4020, MemberStatus::Alive, 1),
            ],
        };

        let result = process_message(&ack, addr(4000), &view, Instant::now());
        assert_eq!(result.actions[0], GossipAction::JoinAcknowledged);
        let joins = result
            .actions
            .iter()
            .filter(|a| matches!(a, GossipAction::Emit(GossipEvent::MemberJoined(_))))
            .count();
        assert_eq!(joins, 2);
    }

    #[test]
    fn test_process_leave_forwards_once() {
        let view = RwLock::new(view("a"));
        let now = Instant::now();
        view.write().merge(state("b", 4010, MemberStatus::Alive, 1), false, now);
        view.write().merge(state("c", 4020, MemberStatus::Alive, 1), false, now);

        let leave = GossipMessage::Leave {
            name: "c".to_string(),
            incarnation: 2,
        };
        let first = process_message(&leave, addr(4020), &view, now);
        assert!(first
            .actions
            .iter()
            .any(|a| matches!(a, GossipAction::Emit(GossipEvent::MemberLeft(m)) if m.name == "c")));
        assert!(first
            .actions
            .iter()
            .any(|a| matches!(a, GossipAction::Send { to, .. } if *to == addr(4010))));

        let second = process_message(&leave, addr(4010), &view, now);
        assert!(second.actions.is_empty());
    }

    #[test]
    fn test_process_leave_for_unknown_member() {
        let view = RwLock::new(view("a"));
        let leave = GossipMessage::Leave {
            name: "ghost".to_string(),
            incarnation: 1,
        };
        assert!(process_message(&leave, addr(4999), &view, Instant::now())
            .actions
            .is_empty());
    }

    #[test]
    fn test_gossip_round_without_peers() {
        let view = RwLock::new(view("a"));
        assert!(gossip_round(&view).is_empty());
    }

    #[test]
    fn test_gossip_round_pings_and_syncs() {
        let view = RwLock::new(view("a"));
        view.write().merge(state("b", 4010, MemberStatus::Alive, 1), false, Instant::now());

        let actions = gossip_round(&view);
        assert_eq!(actions.len(), 2);
        assert!(matches!(&actions[0], GossipAction::Send { message: GossipMessage::Ping { .. }, .. }));
        assert!(matches!(&actions[1], GossipAction::Send { message: GossipMessage::Sync { .. }, .. }));
    }

    #[test]
    fn test_gossip_message_bincode_all_variants() {
        let messages = vec![
            GossipMessage::Ping { from: state("a", 4000, MemberStatus::Alive, 1) },
            GossipMessage::Join { node: state("a", 4000, MemberStatus::Alive, 1) },
            GossipMessage::Sync { members: vec![state("b", 4010, MemberStatus::Failed, 3)] },
            GossipMessage::Leave { name: "a".to_string(), incarnation: 9 },
        ];
        for msg in messages {
            let data = bincode::serialize(&msg).unwrap();
            let decoded: GossipMessage = bincode::deserialize(&data).unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[tokio::test]
    async fn test_join_without_reachable_seed_fails() {
        let mut config = GossipConfig::new("lonely", addr(0));
        config.join_timeout = Duration::from_millis(300);
        let (gossip, _events) = Gossip::start(config).await.unwrap();

        // Bound but silent socket stands in for a dead seed
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let seed = silent.local_addr().unwrap().to_string();

        let err = gossip.join(&[seed]).await.unwrap_err();
        assert!(matches!(err, GossipError::JoinFailed { .. }));
    }

    #[tokio::test]
    async fn test_two_nodes_discover_each_other() {
        let (a, mut a_events) = Gossip::start(GossipConfig::new("a", addr(0))).await.unwrap();
        let (b, _b_events) = Gossip::start(GossipConfig::new("b", addr(0))).await.unwrap();

        b.join(&[a.local_addr().to_string()]).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), a_events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, GossipEvent::MemberJoined(m) if m.name == "b"));
        assert_eq!(b.members().len(), 2);

        b.leave().await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(2), a_events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, GossipEvent::MemberLeft(m) if m.name == "b"));
        assert!(b.is_shutdown());

        // Leaving twice is a no-op
        b.leave().await.unwrap();
    }
}
