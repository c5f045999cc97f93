//! Agent Configuration
//!
//! Settings for one node, built either in code with the builder methods or
//! from `LOGMESH_*` environment variables with [`load_config`].

use crate::tls::TlsFiles;
use std::path::PathBuf;

/// Configuration for an [`Agent`](crate::Agent).
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Directory holding the commit log (default: ./data)
    pub data_dir: PathBuf,

    /// Gossip address, `host:port` (default: 127.0.0.1:8401)
    pub bind_addr: String,

    /// RPC port, served on the host of `bind_addr` (default: 8400)
    pub rpc_port: u16,

    /// Unique node name
    pub node_name: String,

    /// Gossip addresses of existing members to join through
    pub start_join_addrs: Vec<String>,

    /// ACL model file (empty: permit everything)
    pub acl_model_file: PathBuf,

    /// ACL policy file (empty: permit everything)
    pub acl_policy_file: PathBuf,

    /// TLS material for the RPC listener
    pub server_tls: Option<TlsFiles>,

    /// TLS material for dialing peers
    pub peer_tls: Option<TlsFiles>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            bind_addr: "127.0.0.1:8401".to_string(),
            rpc_port: 8400,
            node_name: String::new(),
            start_join_addrs: Vec::new(),
            acl_model_file: PathBuf::new(),
            acl_policy_file: PathBuf::new(),
            server_tls: None,
            peer_tls: None,
        }
    }
}

impl AgentConfig {
    /// Create a new configuration with node name.
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            ..Default::default()
        }
    }

    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    pub fn bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = addr.into();
        self
    }

    pub fn rpc_port(mut self, port: u16) -> Self {
        self.rpc_port = port;
        self
    }

    pub fn start_join_addrs(mut self, addrs: Vec<String>) -> Self {
        self.start_join_addrs = addrs;
        self
    }

    /// Set the ACL model and policy files.
    pub fn acl(mut self, model_file: impl Into<PathBuf>, policy_file: impl Into<PathBuf>) -> Self {
        self.acl_model_file = model_file.into();
        self.acl_policy_file = policy_file.into();
        self
    }

    pub fn server_tls(mut self, tls: TlsFiles) -> Self {
        self.server_tls = Some(tls);
        self
    }

    pub fn peer_tls(mut self, tls: TlsFiles) -> Self {
        self.peer_tls = Some(tls);
        self
    }

    /// RPC address: the host of `bind_addr` with `rpc_port`.
    pub fn rpc_addr(&self) -> Result<String, ConfigError> {
        let (host, _) = self
            .bind_addr
            .rsplit_once(':')
            .ok_or_else(|| ConfigError::InvalidBindAddr(self.bind_addr.clone()))?;
        Ok(format!("{}:{}", host, self.rpc_port))
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_name.is_empty() {
            return Err(ConfigError::MissingNodeName);
        }
        if self.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::MissingDataDir);
        }
        match self.bind_addr.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {}
            _ => return Err(ConfigError::InvalidBindAddr(self.bind_addr.clone())),
        }
        if self.acl_model_file.as_os_str().is_empty() != self.acl_policy_file.as_os_str().is_empty() {
            return Err(ConfigError::IncompleteAcl);
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("node_name is required")]
    MissingNodeName,
    #[error("data_dir is required")]
    MissingDataDir,
    #[error("bind_addr must be host:port, got {0:?}")]
    InvalidBindAddr(String),
    #[error("acl model and policy files must be given together")]
    IncompleteAcl,
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key).ok().filter(|v| !v.is_empty()).map(PathBuf::from)
}

fn tls_from_env(prefix: &str, server_name: String) -> TlsFiles {
    TlsFiles {
        cert_file: env_path(&format!("{}_CERT", prefix)),
        key_file: env_path(&format!("{}_KEY", prefix)),
        ca_file: env_path(&format!("{}_CA", prefix)),
        server_name,
    }
}

/// Build an [`AgentConfig`] from `LOGMESH_*` environment variables.
pub fn load_config() -> anyhow::Result<AgentConfig> {
    let defaults = AgentConfig::default();

    let data_dir = env_path("LOGMESH_DATA_DIR").unwrap_or(defaults.data_dir);

    let bind_addr = std::env::var("LOGMESH_BIND_ADDR").unwrap_or(defaults.bind_addr);

    let rpc_port = std::env::var("LOGMESH_RPC_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(defaults.rpc_port);

    let node_name = std::env::var("LOGMESH_NODE_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_default();

    let start_join_addrs = std::env::var("LOGMESH_START_JOIN_ADDRS")
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let acl_model_file = env_path("LOGMESH_ACL_MODEL_FILE").unwrap_or_default();
    let acl_policy_file = env_path("LOGMESH_ACL_POLICY_FILE").unwrap_or_default();

    // TLS settings
    let server_tls = tls_from_env("LOGMESH_SERVER_TLS", String::new());
    let server_tls = server_tls.cert_file.is_some().then_some(server_tls);

    let peer_server_name =
        std::env::var("LOGMESH_PEER_TLS_SERVER_NAME").unwrap_or_else(|_| "localhost".to_string());
    let peer_tls = tls_from_env("LOGMESH_PEER_TLS", peer_server_name);
    let peer_tls = peer_tls.ca_file.is_some().then_some(peer_tls);

    let config = AgentConfig {
        data_dir,
        bind_addr,
        rpc_port,
        node_name,
        start_join_addrs,
        acl_model_file,
        acl_policy_file,
        server_tls,
        peer_tls,
    };
    config.validate()?;
    Ok(config)
}
