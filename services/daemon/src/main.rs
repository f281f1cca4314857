//! dyncluster daemon
//!
//! Allocates short-lived multi-node database clusters as containers for
//! integration testing, and tears each one down once its timeout passes.
//!
//! ## Architecture
//!
//! - **HTTP API**: Cluster allocation, inspection, refresh and teardown
//! - **Cluster Service**: Ownership checks in front of the registry and engine
//! - **Expiry Reconciler**: Periodic sweep removing expired clusters
//! - **Shutdown Coordinator**: Stops the listener, the reconciler, then the registry

use anyhow::Result;
use dync_daemon::{config::Config, Daemon};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to DYNCLUSTER_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting dyncluster daemon");
    info!(
        listen_addr = %config.listen_addr,
        engine = ?config.engine,
        data_dir = %config.data_dir.display(),
        network = %config.network,
        cleanup_interval_secs = config.cleanup_interval.as_secs(),
        "Configuration loaded"
    );

    let daemon = match Daemon::from_config(config).await {
        Ok(daemon) => daemon,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Failed to start daemon");
            return Err(e);
        }
    };

    daemon.run().await
}
