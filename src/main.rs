//! logmesh - distributed append-only log node
//!
//! Reads its configuration from `LOGMESH_*` environment variables, runs an
//! agent and shuts it down on Ctrl+C / SIGTERM or when it fails.

use logmesh::{load_config, Agent};
use tracing_subscriber::fmt::format::FmtSpan;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Setup logging
    let log_level = if std::env::var("DEBUG").is_ok() {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_span_events(FmtSpan::CLOSE)
        .init();

    // Load configuration from environment
    let cfg = load_config()?;
    tracing::info!(
        "starting logmesh node={} bind={} rpc_port={}",
        cfg.node_name,
        cfg.bind_addr,
        cfg.rpc_port
    );

    let agent = Agent::new(cfg).await?;

    tokio::select! {
        _ = shutdown_signal() => {}
        _ = agent.wait_for_shutdown() => {
            tracing::warn!("agent shut itself down");
        }
    }

    agent.shutdown().await?;
    Ok(())
}

/// Completes when Ctrl+C or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("received SIGTERM, initiating shutdown");
        }
    }
}
