//! Expiry reconciler.
//!
//! Enforces cluster TTLs. Each loop iteration waits for either the sweep
//! timer or a shutdown request, then runs one sweep:
//! - List every cluster under the system context
//! - Pick the clusters whose timeout is strictly before one sampled `now`
//! - Tear each one down in its own task and wait for every task to report
//!
//! Sweeps never overlap. The timer is re-armed only after a sweep has
//! drained all of its results, so a slow sweep delays the next one.
//! A shutdown request is only observed between sweeps and is acknowledged
//! once the loop has exited.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dync_registry::Cluster;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, instrument, warn};

use crate::actor::ActorContext;
use crate::service::{ClusterService, ServiceError};

/// Reconciler configuration.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Time between the end of one sweep and the start of the next.
    pub interval: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5 * 60),
        }
    }
}

/// Errors returned by a sweep.
#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    /// Listing clusters failed; nothing was torn down.
    #[error("failed to list clusters: {0}")]
    List(#[source] ServiceError),

    /// At least one teardown failed. Carries the first failure drained.
    #[error("failed to tear down cluster {cluster_id}: {source}")]
    Teardown {
        cluster_id: String,
        #[source]
        source: ServiceError,
    },

    /// A teardown task ended without reporting a result.
    #[error("{missing} teardown task(s) exited without reporting")]
    Lost { missing: usize },
}

/// Outcome of a successful sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepSummary {
    /// Clusters returned by the listing.
    pub listed: usize,

    /// Expired clusters torn down.
    pub torn_down: usize,
}

/// A request for the reconciler loop to stop.
#[derive(Debug)]
pub struct ShutdownRequest {
    ack: oneshot::Sender<()>,
}

impl ShutdownRequest {
    /// Confirm that the loop has stopped.
    pub fn acknowledge(self) {
        let _ = self.ack.send(());
    }
}

/// The reconciler's end of the control channel.
pub struct ReconcilerControl {
    requests: mpsc::Receiver<ShutdownRequest>,
}

impl ReconcilerControl {
    /// Wait for the next shutdown request. `None` means every handle was dropped.
    pub async fn recv(&mut self) -> Option<ShutdownRequest> {
        self.requests.recv().await
    }
}

/// Error returned when the reconciler did not acknowledge shutdown.
#[derive(Debug, thiserror::Error)]
#[error("reconciler exited without acknowledging shutdown")]
pub struct ReconcilerGone;

/// Handle used to stop the reconciler loop.
pub struct ReconcilerHandle {
    requests: mpsc::Sender<ShutdownRequest>,
}

impl ReconcilerHandle {
    /// Ask the loop to stop and wait for its acknowledgement.
    ///
    /// If a sweep is in progress this waits for it to finish.
    pub async fn shutdown(self) -> Result<(), ReconcilerGone> {
        let (ack, acked) = oneshot::channel();
        self.requests
            .send(ShutdownRequest { ack })
            .await
            .map_err(|_| ReconcilerGone)?;
        acked.await.map_err(|_| ReconcilerGone)
    }
}

/// Create the control channel connecting a [`ReconcilerHandle`] to a loop.
pub fn control_channel() -> (ReconcilerHandle, ReconcilerControl) {
    let (tx, rx) = mpsc::channel(1);
    (
        ReconcilerHandle { requests: tx },
        ReconcilerControl { requests: rx },
    )
}

/// IDs of clusters whose timeout is strictly before `now`, deduplicated,
/// in listing order.
pub fn expired_cluster_ids(clusters: &[Cluster], now: DateTime<Utc>) -> Vec<String> {
    let mut seen = HashSet::new();
    clusters
        .iter()
        .filter(|c| c.is_expired_at(now))
        .filter(|c| seen.insert(c.id.as_str()))
        .map(|c| c.id.clone())
        .collect()
}

/// Periodic sweep that tears down expired clusters.
pub struct ExpiryReconciler {
    service: Arc<ClusterService>,
    ctx: ActorContext,
    config: ReconcilerConfig,
}

impl ExpiryReconciler {
    /// Create a reconciler acting under `ctx`, which should be system-privileged.
    pub fn new(service: Arc<ClusterService>, ctx: ActorContext, config: ReconcilerConfig) -> Self {
        if !ctx.is_system() {
            warn!(identity = %ctx.identity(), "Reconciler running without system privilege");
        }
        Self {
            service,
            ctx,
            config,
        }
    }

    /// Run sweeps until a shutdown request arrives, then acknowledge it.
    #[instrument(skip_all)]
    pub async fn run(self, mut control: ReconcilerControl) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "Starting expiry reconciler"
        );

        loop {
            tokio::select! {
                biased;

                request = control.recv() => {
                    match request {
                        Some(request) => {
                            info!("Expiry reconciler shutting down");
                            request.acknowledge();
                        }
                        None => info!("Reconciler control channel closed, stopping"),
                    }
                    return;
                }
                _ = tokio::time::sleep(self.config.interval) => {}
            }

            match self.sweep().await {
                Ok(summary) => {
                    if summary.torn_down > 0 {
                        info!(
                            listed = summary.listed,
                            torn_down = summary.torn_down,
                            "Expired clusters cleaned up"
                        );
                    }
                }
                Err(e) => error!(error = %e, "Failed to cleanup old clusters"),
            }
        }
    }

    /// Run one sweep against the current wall-clock time.
    pub async fn sweep(&self) -> Result<SweepSummary, SweepError> {
        self.sweep_at(Utc::now()).await
    }

    /// Run one sweep treating `now` as the current time.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepSummary, SweepError> {
        info!("Cleaning up dead clusters");

        let clusters = self
            .service
            .list_all(&self.ctx)
            .await
            .map_err(SweepError::List)?;

        let expired = expired_cluster_ids(&clusters, now);
        debug!(
            listed = clusters.len(),
            expired = expired.len(),
            "Selected expired clusters"
        );

        self.tear_down(&expired).await?;

        Ok(SweepSummary {
            listed: clusters.len(),
            torn_down: expired.len(),
        })
    }

    /// Kill every cluster in `ids` concurrently and return the first failure
    /// in the order results arrive. Always waits for every task.
    async fn tear_down(&self, ids: &[String]) -> Result<(), SweepError> {
        if ids.is_empty() {
            return Ok(());
        }

        let (results_tx, mut results) = mpsc::channel(ids.len());

        for id in ids {
            let service = Arc::clone(&self.service);
            let ctx = self.ctx.clone();
            let results_tx = results_tx.clone();
            let id = id.clone();

            tokio::spawn(async move {
                let outcome = service.kill(&ctx, &id).await;
                // Capacity equals the task count, so this never waits.
                let _ = results_tx.send((id, outcome)).await;
            });
        }
        drop(results_tx);

        let mut first_error = None;
        let mut received = 0;

        while received < ids.len() {
            let Some((cluster_id, outcome)) = results.recv().await else {
                break;
            };
            received += 1;

            if let Err(source) = outcome {
                warn!(cluster_id = %cluster_id, error = %source, "Cluster teardown failed");
                if first_error.is_none() {
                    first_error = Some(SweepError::Teardown { cluster_id, source });
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        if received < ids.len() {
            return Err(SweepError::Lost {
                missing: ids.len() - received,
            });
        }
        Ok(())
    }
}
