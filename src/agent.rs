//! Agent
//!
//! Runs one node: the commit log, the log service, cluster membership and
//! the replicator feeding the log from peers. Components are set up in
//! dependency order and torn down in reverse.

use crate::auth::{AuthError, Authorizer};
use crate::commitlog::{CommitLog, LogConfig, LogError, SqliteLog};
use crate::config::{AgentConfig, ConfigError};
use crate::discovery::{Member, Membership, MembershipConfig, MembershipError, RPC_ADDR_TAG};
use crate::replicator::{Replicator, ReplicatorError};
use crate::server::{LogServer, ServerConfig, ServerError, TcpPeerConnector};
use crate::tls::TlsError;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::Instrument;

/// Agent setup and shutdown errors.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("invalid config: {0}")]
    Config(#[from] ConfigError),
    #[error("commit log: {0}")]
    Log(#[from] LogError),
    #[error("acl: {0}")]
    Auth(#[from] AuthError),
    #[error("tls: {0}")]
    Tls(#[from] TlsError),
    #[error("failed to bind rpc listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot resolve gossip address {addr}")]
    Resolve {
        addr: String,
        #[source]
        source: Option<std::io::Error>,
    },
    #[error("membership: {0}")]
    Membership(#[from] MembershipError),
    #[error("replicator: {0}")]
    Replicator(#[from] ReplicatorError),
}

struct Inner {
    config: AgentConfig,
    span: tracing::Span,
    log: Arc<SqliteLog>,
    server: Arc<LogServer>,
    rpc_addr: SocketAddr,
    replicator: Replicator,
    membership: Membership,
    shutdown: Mutex<bool>,
    shutdown_tx: watch::Sender<bool>,
}

/// A running node.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<Inner>,
}

impl Agent {
    /// Set up every component in order, stopping at the first failure.
    pub async fn new(config: AgentConfig) -> Result<Self, AgentError> {
        config.validate()?;
        let span = setup_logger(&config);

        async move {
            let log = setup_log(&config)?;
            let (fatal_tx, fatal_rx) = mpsc::channel(1);
            let (server, rpc_addr) = setup_server(&config, log.clone(), fatal_tx).await?;

            let (replicator, membership) = match setup_membership(&config, log.clone(), rpc_addr).await {
                Ok(parts) => parts,
                Err(e) => {
                    // The serve task owns the listener; release it before bailing out
                    server.graceful_stop().await;
                    return Err(e);
                }
            };

            let (shutdown_tx, _) = watch::channel(false);
            let agent = Self {
                inner: Arc::new(Inner {
                    span: tracing::Span::current(),
                    config,
                    log,
                    server,
                    rpc_addr,
                    replicator,
                    membership,
                    shutdown: Mutex::new(false),
                    shutdown_tx,
                }),
            };

            tokio::spawn(watch_fatal(Arc::downgrade(&agent.inner), fatal_rx).in_current_span());
            tracing::info!(%rpc_addr, gossip = %agent.gossip_addr(), "agent started");
            Ok(agent)
        }
        .instrument(span)
        .await
    }

    pub fn name(&self) -> &str {
        &self.inner.config.node_name
    }

    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    /// Address the log service listens on.
    pub fn rpc_addr(&self) -> SocketAddr {
        self.inner.rpc_addr
    }

    /// Address gossip listens on.
    pub fn gossip_addr(&self) -> SocketAddr {
        self.inner.membership.bind_addr()
    }

    /// Cluster snapshot ordered by node name.
    pub fn members(&self) -> Vec<Member> {
        self.inner.membership.members()
    }

    pub fn log(&self) -> Arc<SqliteLog> {
        self.inner.log.clone()
    }

    pub fn replicator(&self) -> &Replicator {
        &self.inner.replicator
    }

    pub fn is_shutdown(&self) -> bool {
        *self.inner.shutdown_tx.borrow()
    }

    /// Resolve once shutdown has started.
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.inner.shutdown_tx.subscribe();
        let _ = rx.wait_for(|down| *down).await;
    }

    /// Leave the cluster, stop replication, stop serving and close the log.
    ///
    /// Every step runs even if an earlier one fails; the first error is
    /// returned. Calls after the first return `Ok(())`.
    pub async fn shutdown(&self) -> Result<(), AgentError> {
        let mut down = self.inner.shutdown.lock().await;
        if *down {
            return Ok(());
        }
        *down = true;
        self.inner.shutdown_tx.send_replace(true);

        let inner = &self.inner;
        async move {
            tracing::info!("shutting down");
            let mut first_error: Option<AgentError> = None;

            if let Err(e) = inner.membership.leave().await {
                tracing::warn!(error = %e, "failed to leave cluster");
                first_error.get_or_insert(e.into());
            }

            if let Err(e) = inner.replicator.close() {
                tracing::warn!(error = %e, "failed to close replicator");
                first_error.get_or_insert(e.into());
            }

            if !inner.server.graceful_stop().await {
                tracing::warn!(
                    open = inner.server.open_connections(),
                    "log service stopped with connections still open"
                );
            }

            if let Err(e) = inner.log.close() {
                tracing::warn!(error = %e, "failed to close commit log");
                first_error.get_or_insert(e.into());
            }

            tracing::info!("shutdown complete");
            first_error.map_or(Ok(()), Err)
        }
        .instrument(inner.span.clone())
        .await
    }
}

/// Span carrying the node name, entered by every component of the agent.
fn setup_logger(config: &AgentConfig) -> tracing::Span {
    tracing::info_span!("agent", node = %config.node_name)
}

fn setup_log(config: &AgentConfig) -> Result<Arc<SqliteLog>, AgentError> {
    let log = SqliteLog::open(
        &config.data_dir,
        LogConfig {
            origin: config.node_name.clone(),
        },
    )?;
    Ok(Arc::new(log))
}

async fn setup_server(
    config: &AgentConfig,
    log: Arc<SqliteLog>,
    fatal_tx: mpsc::Sender<ServerError>,
) -> Result<(Arc<LogServer>, SocketAddr), AgentError> {
    let authorizer = Authorizer::new(&config.acl_model_file, &config.acl_policy_file)?;
    let tls = config
        .server_tls
        .as_ref()
        .map(|files| files.server_config())
        .transpose()?;

    let addr = config.rpc_addr()?;
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|source| AgentError::Bind {
            addr: addr.clone(),
            source,
        })?;
    let rpc_addr = listener.local_addr().map_err(|source| AgentError::Bind { addr, source })?;

    let commit_log: Arc<dyn CommitLog> = log;
    let server = Arc::new(LogServer::new(ServerConfig::new(commit_log, authorizer).tls(tls)));

    let serving = server.clone();
    tokio::spawn(
        async move {
            if let Err(e) = serving.serve(listener).await {
                tracing::error!(error = %e, "log service failed");
                let _ = fatal_tx.send(e).await;
            }
        }
        .in_current_span(),
    );

    Ok((server, rpc_addr))
}

async fn setup_membership(
    config: &AgentConfig,
    log: Arc<SqliteLog>,
    rpc_addr: SocketAddr,
) -> Result<(Replicator, Membership), AgentError> {
    let peer_tls = config
        .peer_tls
        .as_ref()
        .map(|files| files.peer_config())
        .transpose()?;
    let replicator = Replicator::new(log, Arc::new(TcpPeerConnector::new(peer_tls)));

    let bind_addr = resolve(&config.bind_addr).await?;
    let membership_config = MembershipConfig::new(config.node_name.clone(), bind_addr)
        .tag(RPC_ADDR_TAG, rpc_addr.to_string())
        .start_join_addrs(config.start_join_addrs.clone());

    let membership = Membership::new(Arc::new(replicator.clone()), membership_config).await?;
    Ok((replicator, membership))
}

async fn resolve(addr: &str) -> Result<SocketAddr, AgentError> {
    let mut addrs = tokio::net::lookup_host(addr)
        .await
        .map_err(|source| AgentError::Resolve {
            addr: addr.to_string(),
            source: Some(source),
        })?;
    addrs.next().ok_or_else(|| AgentError::Resolve {
        addr: addr.to_string(),
        source: None,
    })
}

/// Shut the agent down when the log service fails.
async fn watch_fatal(agent: Weak<Inner>, mut fatal_rx: mpsc::Receiver<ServerError>) {
    let Some(error) = fatal_rx.recv().await else {
        return;
    };
    let Some(inner) = agent.upgrade() else {
        return;
    };

    tracing::error!(%error, "shutting down after log service failure");
    if let Err(e) = (Agent { inner }).shutdown().await {
        tracing::error!(error = %e, "shutdown after log service failure failed");
    }
}
