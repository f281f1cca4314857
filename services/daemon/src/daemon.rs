//! Daemon bootstrap.
//!
//! [`Daemon`] owns the process's dependency set: the registry, the engine,
//! the cluster service and the expiry reconciler. Every check that can stop
//! startup runs before the HTTP listener is bound.

use std::future::Future;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use dync_registry::{MemoryRegistry, Registry, SqliteRegistry};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::actor::ActorContext;
use crate::api;
use crate::config::{Config, EngineKind};
use crate::engine::{DockerEngine, Engine, MockEngine};
use crate::reconciler::{control_channel, ExpiryReconciler};
use crate::service::ClusterService;
use crate::shutdown::{termination_signal, ShutdownCoordinator};
use crate::state::AppState;

/// A fully initialised daemon, ready to serve.
pub struct Daemon {
    config: Config,
    registry: Arc<dyn Registry>,
    service: Arc<ClusterService>,
    reconciler: ExpiryReconciler,
}

impl Daemon {
    /// Open the registry and engine named by `config` and run the startup checks.
    pub async fn from_config(config: Config) -> Result<Self> {
        let (registry, engine): (Arc<dyn Registry>, Arc<dyn Engine>) = match config.engine {
            EngineKind::Docker => {
                std::fs::create_dir_all(&config.data_dir).with_context(|| {
                    format!("failed to create data dir {}", config.data_dir.display())
                })?;
                let path = config.registry_path();
                let registry = SqliteRegistry::open(&path)
                    .with_context(|| format!("failed to open registry {}", path.display()))?;
                let engine = DockerEngine::connect(&config.docker_host)
                    .context("failed to create engine client")?;
                (Arc::new(registry), Arc::new(engine))
            }
            EngineKind::Mock => {
                warn!("Running with the mock engine; clusters are not persisted");
                let engine = MockEngine::with_networks([config.network.clone()]);
                (Arc::new(MemoryRegistry::new()), Arc::new(engine))
            }
        };

        Self::start(config, registry, engine).await
    }

    /// Build a daemon from an already opened registry and engine.
    ///
    /// Fails if the engine is unreachable or the configured network is missing.
    pub async fn start(
        config: Config,
        registry: Arc<dyn Registry>,
        engine: Arc<dyn Engine>,
    ) -> Result<Self> {
        engine
            .ping()
            .await
            .with_context(|| format!("failed to connect to engine at {}", config.docker_host))?;
        info!(docker_host = %config.docker_host, "Connected to engine");

        let has_network = engine
            .has_network(&config.network)
            .await
            .context("failed to list engine networks")?;
        if !has_network {
            bail!("required network {} does not exist", config.network);
        }

        if let Some(server) = &config.image_registry {
            match engine.registry_login(server).await {
                Ok(()) => info!(server = %server, "Logged in to image registry"),
                Err(e) => warn!(server = %server, error = %e, "Failed to log in to image registry"),
            }
        }

        let service = Arc::new(ClusterService::new(
            Arc::clone(&registry),
            engine,
            config.service_config(),
        ));

        let system = ActorContext::system();
        service.log_clusters(&system).await;

        let reconciler =
            ExpiryReconciler::new(Arc::clone(&service), system, config.reconciler_config());

        Ok(Self {
            config,
            registry,
            service,
            reconciler,
        })
    }

    /// The cluster service backing the API.
    pub fn service(&self) -> &Arc<ClusterService> {
        &self.service
    }

    /// Bind the configured address and serve until SIGINT or SIGTERM.
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .with_context(|| format!("failed to bind {}", self.config.listen_addr))?;
        self.serve(listener, termination_signal()).await
    }

    /// Serve on `listener` until `signal` resolves, then shut down in order.
    pub async fn serve<S>(self, listener: TcpListener, signal: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        let Daemon {
            registry,
            service,
            reconciler,
            ..
        } = self;

        let (handle, control) = control_channel();
        tokio::spawn(reconciler.run(control));

        let router = api::create_router(AppState::new(service));
        let (stop_tx, stop_rx) = oneshot::channel();

        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Daemon is starting");

        ShutdownCoordinator::new(handle, registry)
            .run(signal, stop_tx, api::serve(listener, router, stop_rx))
            .await;

        Ok(())
    }
}
