//! Shutdown coordination.
//!
//! Termination runs in a fixed order:
//! 1. Close the HTTP listener and wait for its accept loop to return
//! 2. Ask the expiry reconciler to stop and wait for its acknowledgement
//! 3. Close the registry
//!
//! Closing the registry any earlier could leave a sweep running against a
//! closed handle.

use std::future::Future;
use std::sync::Arc;

use dync_registry::Registry;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::reconciler::ReconcilerHandle;

/// Drives the ordered shutdown of the daemon's long-lived parts.
pub struct ShutdownCoordinator {
    reconciler: ReconcilerHandle,
    registry: Arc<dyn Registry>,
}

impl ShutdownCoordinator {
    pub fn new(reconciler: ReconcilerHandle, registry: Arc<dyn Registry>) -> Self {
        Self {
            reconciler,
            registry,
        }
    }

    /// Wait for `signal` (or for the server to exit on its own), then shut
    /// everything down in order.
    ///
    /// `stop_listener` tells the server to stop accepting; `server` is the
    /// server's accept loop and resolves once it has returned.
    pub async fn run<S, F, E>(self, signal: S, stop_listener: oneshot::Sender<()>, server: F)
    where
        S: Future<Output = ()>,
        F: Future<Output = Result<(), E>>,
        E: std::fmt::Display,
    {
        tokio::pin!(server);

        let served = tokio::select! {
            _ = signal => {
                info!("Received shutdown signal, shutting down daemon");
                let _ = stop_listener.send(());
                server.await
            }
            result = &mut server => result,
        };

        match served {
            Ok(()) => info!("HTTP listener closed"),
            Err(e) => error!(error = %e, "HTTP listener failed"),
        }

        match self.reconciler.shutdown().await {
            Ok(()) => info!("Expiry reconciler stopped"),
            Err(e) => warn!(error = %e, "Expiry reconciler already stopped"),
        }

        if let Err(e) = self.registry.close() {
            error!(error = %e, "Failed to close registry");
        }

        info!("Graceful shutdown completed");
    }
}

/// Resolves on Ctrl-C, or on SIGTERM on unix.
pub async fn termination_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
