//! Cluster service.
//!
//! Facade over the registry and the container engine that enforces the
//! ownership rules carried by [`ActorContext`]:
//! - System actors see and act on every cluster
//! - Other actors see and act only on clusters they own
//!
//! Teardown is concurrency-safe across distinct cluster IDs.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dync_registry::{Cluster, Node, Registry, RegistryError};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::actor::{ActorContext, DeadlineExceeded};
use crate::engine::{Engine, EngineError, NodeSpec};

/// Cluster service errors.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The cluster does not exist or is not visible to the caller.
    #[error("cluster not found: {0}")]
    NotFound(String),

    /// The caller may see the cluster but not act on it.
    #[error("{identity} is not permitted to modify cluster {cluster_id}")]
    Forbidden { identity: String, cluster_id: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A cluster with this ID already exists.
    #[error("cluster already exists: {0}")]
    Conflict(String),

    #[error("registry error: {0}")]
    Registry(#[source] RegistryError),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// The actor's deadline passed before the engine answered.
    #[error("operation timed out")]
    DeadlineExceeded(#[from] DeadlineExceeded),
}

impl ServiceError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ServiceError::NotFound(_))
    }
}

impl From<RegistryError> for ServiceError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(id) => ServiceError::NotFound(id),
            RegistryError::Conflict(id) => ServiceError::Conflict(id),
            other => ServiceError::Registry(other),
        }
    }
}

/// Settings the service needs to allocate clusters.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Network node containers are attached to.
    pub network: String,

    /// Optional registry host prefixed to image references.
    pub image_registry: Option<String>,

    /// Image repository; the server version is used as the tag.
    pub image_repository: String,

    /// Lifetime of a cluster when the caller does not ask for one.
    pub default_ttl: Duration,

    /// Longest lifetime a caller may request.
    pub max_ttl: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            network: "macvlan0".to_string(),
            image_registry: None,
            image_repository: "couchbase/server".to_string(),
            default_ttl: Duration::from_secs(60 * 60),
            max_ttl: Duration::from_secs(14 * 24 * 60 * 60),
        }
    }
}

/// Options for allocating a cluster.
#[derive(Debug, Clone, Default)]
pub struct ClusterOptions {
    /// Owner to allocate on behalf of (system actors only).
    pub owner: Option<String>,

    /// Requested lifetime; the configured default applies when absent.
    pub ttl: Option<Duration>,

    pub nodes: Vec<NodeOptions>,
}

/// Options for one node of a new cluster.
#[derive(Debug, Clone)]
pub struct NodeOptions {
    /// Optional name suffix; defaults to the node's position.
    pub name: Option<String>,

    pub server_version: String,
}

/// Ownership-enforcing cluster operations.
pub struct ClusterService {
    registry: Arc<dyn Registry>,
    engine: Arc<dyn Engine>,
    config: ServiceConfig,
}

impl ClusterService {
    pub fn new(registry: Arc<dyn Registry>, engine: Arc<dyn Engine>, config: ServiceConfig) -> Self {
        Self {
            registry,
            engine,
            config,
        }
    }

    /// The registry this service reads and writes.
    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    /// List the clusters visible to `ctx`.
    pub async fn list_all(&self, ctx: &ActorContext) -> Result<Vec<Cluster>, ServiceError> {
        let clusters = self.registry.list_clusters()?;
        if ctx.is_system() {
            return Ok(clusters);
        }
        Ok(clusters.into_iter().filter(|c| ctx.owns(c)).collect())
    }

    /// Fetch one cluster visible to `ctx`.
    pub async fn get(&self, ctx: &ActorContext, id: &str) -> Result<Cluster, ServiceError> {
        match self.registry.get_cluster(id)? {
            Some(cluster) if ctx.owns(&cluster) => Ok(cluster),
            _ => Err(ServiceError::NotFound(id.to_string())),
        }
    }

    /// Tear down a cluster: remove every node container, then the record.
    ///
    /// Containers the engine no longer knows about are skipped, so a
    /// cluster left half-destroyed by an earlier failure can still be
    /// removed. A cluster with no record yields [`ServiceError::NotFound`].
    #[instrument(skip_all, fields(cluster_id = %id, identity = %ctx.identity()))]
    pub async fn kill(&self, ctx: &ActorContext, id: &str) -> Result<(), ServiceError> {
        let cluster = self
            .registry
            .get_cluster(id)?
            .ok_or_else(|| ServiceError::NotFound(id.to_string()))?;
        self.require_owner(ctx, &cluster)?;

        for node in &cluster.nodes {
            match ctx.within(self.engine.remove_container(&node.container_id)).await? {
                Ok(()) => debug!(container_id = %node.container_id, "Removed node container"),
                Err(e) if e.is_not_found() => warn!(
                    container_id = %node.container_id,
                    "Node container already gone"
                ),
                Err(e) => return Err(e.into()),
            }
        }

        self.registry.delete_cluster(id)?;

        info!(owner = %cluster.owner, nodes = cluster.nodes.len(), "Cluster killed");
        Ok(())
    }

    /// Create a cluster and return its ID.
    ///
    /// If any node fails to come up, the containers created so far are
    /// removed before the error is returned.
    #[instrument(skip_all, fields(identity = %ctx.identity()))]
    pub async fn allocate(
        &self,
        ctx: &ActorContext,
        options: ClusterOptions,
    ) -> Result<String, ServiceError> {
        if options.nodes.is_empty() {
            return Err(ServiceError::InvalidRequest(
                "a cluster needs at least one node".to_string(),
            ));
        }
        if options.nodes.iter().any(|n| n.server_version.trim().is_empty()) {
            return Err(ServiceError::InvalidRequest(
                "every node needs a server version".to_string(),
            ));
        }
        if let Some(name) = options
            .nodes
            .iter()
            .filter_map(|n| n.name.as_deref())
            .find(|name| !name.is_empty() && !is_valid_node_name(name))
        {
            return Err(ServiceError::InvalidRequest(format!(
                "invalid node name {name:?}: use letters, digits, '_', '.' or '-', starting with a letter or digit"
            )));
        }
        let ttl = self.bounded_ttl(options.ttl)?;
        let owner = self.resolve_owner(ctx, options.owner)?;

        let id = self.unused_cluster_id()?;
        let mut nodes = Vec::with_capacity(options.nodes.len());

        for (index, node) in options.nodes.iter().enumerate() {
            let suffix = node
                .name
                .as_deref()
                .filter(|n| !n.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| index.to_string());
            let spec = NodeSpec {
                cluster_id: id.clone(),
                name: format!("dync_{id}_{suffix}"),
                server_version: node.server_version.clone(),
                image: self.image_for(&node.server_version),
                network: self.config.network.clone(),
            };

            // Checked between nodes only; a started create always completes.
            if ctx.deadline_passed() {
                warn!(cluster_id = %id, created = nodes.len(), "Deadline passed during allocation");
                self.remove_nodes(&nodes).await;
                return Err(DeadlineExceeded.into());
            }

            match self.engine.create_node(&spec).await {
                Ok(created) => nodes.push(created),
                Err(e) => {
                    warn!(cluster_id = %id, node = %spec.name, error = %e, "Node creation failed");
                    self.remove_nodes(&nodes).await;
                    return Err(e.into());
                }
            }
        }

        let cluster = Cluster {
            id: id.clone(),
            owner,
            creator: ctx.identity().to_string(),
            timeout: Utc::now() + to_chrono(ttl)?,
            nodes,
        };

        if let Err(e) = self.registry.insert_cluster(&cluster) {
            self.remove_nodes(&cluster.nodes).await;
            return Err(e.into());
        }

        info!(
            cluster_id = %id,
            owner = %cluster.owner,
            nodes = cluster.nodes.len(),
            ttl_secs = ttl.as_secs(),
            "Cluster allocated"
        );
        Ok(id)
    }

    /// Extend a cluster's lifetime to `now + ttl`.
    #[instrument(skip_all, fields(cluster_id = %id, identity = %ctx.identity()))]
    pub async fn refresh(
        &self,
        ctx: &ActorContext,
        id: &str,
        ttl: Option<Duration>,
    ) -> Result<Cluster, ServiceError> {
        let mut cluster = self
            .registry
            .get_cluster(id)?
            .ok_or_else(|| ServiceError::NotFound(id.to_string()))?;
        self.require_owner(ctx, &cluster)?;

        let ttl = self.bounded_ttl(ttl)?;
        cluster.timeout = Utc::now() + to_chrono(ttl)?;
        self.registry.update_timeout(id, cluster.timeout)?;

        info!(ttl_secs = ttl.as_secs(), "Cluster timeout refreshed");
        Ok(cluster)
    }

    /// Log a summary of every cluster visible to `ctx`.
    pub async fn log_clusters(&self, ctx: &ActorContext) {
        let clusters = match self.list_all(ctx).await {
            Ok(clusters) => clusters,
            Err(e) => {
                warn!(error = %e, "Failed to fetch all clusters");
                return;
            }
        };

        info!(count = clusters.len(), "Clusters");
        let now = Utc::now();
        for cluster in &clusters {
            info!(
                cluster_id = %cluster.id,
                owner = %cluster.owner,
                creator = %cluster.creator,
                remaining_secs = (cluster.timeout - now).num_seconds(),
                "Cluster"
            );
            for node in &cluster.nodes {
                info!(
                    cluster_id = %cluster.id,
                    container_id = %node.container_id,
                    name = %node.name,
                    server_version = %node.initial_server_version,
                    ipv4_address = %node.ipv4_address,
                    "Node"
                );
            }
        }
    }

    fn require_owner(&self, ctx: &ActorContext, cluster: &Cluster) -> Result<(), ServiceError> {
        if ctx.owns(cluster) {
            return Ok(());
        }
        Err(ServiceError::Forbidden {
            identity: ctx.identity().to_string(),
            cluster_id: cluster.id.clone(),
        })
    }

    fn resolve_owner(&self, ctx: &ActorContext, owner: Option<String>) -> Result<String, ServiceError> {
        match owner.filter(|o| !o.is_empty()) {
            Some(owner) if ctx.is_system() || owner == ctx.identity() => Ok(owner),
            Some(_) => Err(ServiceError::InvalidRequest(
                "only system actors may allocate on behalf of another owner".to_string(),
            )),
            None => Ok(ctx.identity().to_string()),
        }
    }

    /// Pick a fresh ID, retrying a few times if it is already taken.
    fn unused_cluster_id(&self) -> Result<String, ServiceError> {
        let mut id = new_cluster_id();
        for _ in 0..3 {
            if self.registry.get_cluster(&id)?.is_none() {
                break;
            }
            debug!(cluster_id = %id, "Cluster ID already taken, regenerating");
            id = new_cluster_id();
        }
        Ok(id)
    }

    fn bounded_ttl(&self, ttl: Option<Duration>) -> Result<Duration, ServiceError> {
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        if ttl.is_zero() || ttl > self.config.max_ttl {
            return Err(ServiceError::InvalidRequest(format!(
                "timeout must be between 1s and {}s",
                self.config.max_ttl.as_secs()
            )));
        }
        Ok(ttl)
    }

    fn image_for(&self, server_version: &str) -> String {
        match &self.config.image_registry {
            Some(registry) => format!("{registry}/{}:{server_version}", self.config.image_repository),
            None => format!("{}:{server_version}", self.config.image_repository),
        }
    }

    async fn remove_nodes(&self, nodes: &[Node]) {
        for node in nodes {
            if let Err(e) = self.engine.remove_container(&node.container_id).await {
                warn!(container_id = %node.container_id, error = %e, "Failed to roll back node container");
            }
        }
    }
}

fn to_chrono(ttl: Duration) -> Result<chrono::Duration, ServiceError> {
    chrono::Duration::from_std(ttl)
        .map_err(|_| ServiceError::InvalidRequest("timeout out of range".to_string()))
}

/// Docker container name charset: `[a-zA-Z0-9][a-zA-Z0-9_.-]*`.
fn is_valid_node_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() => {
            chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        }
        _ => false,
    }
}

/// Short random cluster ID (8 lowercase hex characters).
fn new_cluster_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use dync_registry::MemoryRegistry;

    use crate::engine::MockEngine;

    fn cluster(id: &str, owner: &str) -> Cluster {
        Cluster {
            id: id.to_string(),
            owner: owner.to_string(),
            creator: owner.to_string(),
            timeout: Utc::now() + ChronoDuration::minutes(10),
            nodes: vec![Node {
                container_id: format!("ctr-{id}"),
                name: format!("{id}_0"),
                initial_server_version: "7.2.0".to_string(),
                ipv4_address: "10.0.0.2".to_string(),
            }],
        }
    }

    fn fixture() -> (ClusterService, Arc<MemoryRegistry>, Arc<MockEngine>) {
        let registry = Arc::new(MemoryRegistry::with_clusters([
            cluster("A", "alice"),
            cluster("B", "bob"),
            cluster("C", "alice"),
        ]));
        let engine = Arc::new(MockEngine::new());
        engine.add_containers(["ctr-A", "ctr-B", "ctr-C"]);
        let service = ClusterService::new(registry.clone(), engine.clone(), ServiceConfig::default());
        (service, registry, engine)
    }

    fn ids(clusters: &[Cluster]) -> Vec<&str> {
        clusters.iter().map(|c| c.id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_list_all_filters_by_owner() {
        let (service, _, _) = fixture();

        let alice = service.list_all(&ActorContext::user("alice")).await.unwrap();
        assert_eq!(ids(&alice), vec!["A", "C"]);

        let system = service.list_all(&ActorContext::system()).await.unwrap();
        assert_eq!(ids(&system), vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn test_get_hides_foreign_clusters() {
        let (service, _, _) = fixture();
        let alice = ActorContext::user("alice");

        assert_eq!(service.get(&alice, "A").await.unwrap().id, "A");
        assert!(service.get(&alice, "B").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_kill_removes_containers_then_record() {
        let (service, registry, engine) = fixture();

        service.kill(&ActorContext::user("alice"), "A").await.unwrap();

        assert_eq!(engine.removed(), vec!["ctr-A"]);
        assert!(registry.get_cluster("A").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_kill_foreign_cluster_is_forbidden() {
        let (service, registry, engine) = fixture();

        let err = service.kill(&ActorContext::user("alice"), "B").await.unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden { .. }));
        assert!(engine.remove_calls().is_empty());
        assert!(registry.get_cluster("B").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_kill_twice_is_not_found() {
        let (service, _, _) = fixture();
        let system = ActorContext::system();

        service.kill(&system, "B").await.unwrap();
        let err = service.kill(&system, "B").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_kill_finishes_half_destroyed_cluster() {
        let (service, registry, engine) = fixture();
        // Container already removed by an earlier, partially failed teardown.
        engine.remove_container("ctr-C").await.unwrap();

        service.kill(&ActorContext::system(), "C").await.unwrap();
        assert!(registry.get_cluster("C").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_kill_keeps_record_when_removal_fails() {
        let (service, registry, engine) = fixture();
        engine.fail_removal("ctr-A");

        let err = service.kill(&ActorContext::system(), "A").await.unwrap_err();
        assert!(matches!(err, ServiceError::Engine(_)));
        assert!(registry.get_cluster("A").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_allocate_records_owner_and_creator() {
        let (service, registry, engine) = fixture();
        let options = ClusterOptions {
            owner: Some("carol".to_string()),
            ttl: Some(Duration::from_secs(600)),
            nodes: vec![
                NodeOptions {
                    name: None,
                    server_version: "7.6.0".to_string(),
                },
                NodeOptions {
                    name: Some("data".to_string()),
                    server_version: "7.6.0".to_string(),
                },
            ],
        };

        let id = service.allocate(&ActorContext::system(), options).await.unwrap();
        assert_eq!(id.len(), 8);

        let cluster = registry.get_cluster(&id).unwrap().unwrap();
        assert_eq!(cluster.owner, "carol");
        assert_eq!(cluster.creator, "system");
        assert_eq!(cluster.nodes.len(), 2);
        assert_eq!(cluster.nodes[1].name, format!("dync_{id}_data"));
        assert!(cluster.timeout > Utc::now());
        assert_eq!(engine.live_count(), 3 + 2);
    }

    #[tokio::test]
    async fn test_allocate_rolls_back_on_node_failure() {
        let (service, registry, engine) = fixture();
        engine.fail_create("_broken");

        let options = ClusterOptions {
            nodes: vec![
                NodeOptions {
                    name: None,
                    server_version: "7.6.0".to_string(),
                },
                NodeOptions {
                    name: Some("broken".to_string()),
                    server_version: "7.6.0".to_string(),
                },
            ],
            ..Default::default()
        };

        let err = service
            .allocate(&ActorContext::user("alice"), options)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Engine(_)));
        assert_eq!(registry.list_clusters().unwrap().len(), 3);
        // The first node was created and then rolled back.
        assert_eq!(engine.removed().len(), 1);
        assert_eq!(engine.live_count(), 3);
    }

    #[tokio::test]
    async fn test_allocate_validates_options() {
        let (service, _, _) = fixture();
        let alice = ActorContext::user("alice");

        let empty = service.allocate(&alice, ClusterOptions::default()).await;
        assert!(matches!(empty, Err(ServiceError::InvalidRequest(_))));

        let too_long = ClusterOptions {
            ttl: Some(Duration::from_secs(365 * 24 * 60 * 60)),
            nodes: vec![NodeOptions {
                name: None,
                server_version: "7.6.0".to_string(),
            }],
            ..Default::default()
        };
        assert!(matches!(
            service.allocate(&alice, too_long).await,
            Err(ServiceError::InvalidRequest(_))
        ));

        let on_behalf = ClusterOptions {
            owner: Some("bob".to_string()),
            nodes: vec![NodeOptions {
                name: None,
                server_version: "7.6.0".to_string(),
            }],
            ..Default::default()
        };
        assert!(matches!(
            service.allocate(&alice, on_behalf).await,
            Err(ServiceError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_refresh_extends_timeout() {
        let (service, registry, _) = fixture();
        let alice = ActorContext::user("alice");
        let before = registry.get_cluster("A").unwrap().unwrap().timeout;

        let refreshed = service
            .refresh(&alice, "A", Some(Duration::from_secs(3600)))
            .await
            .unwrap();
        assert!(refreshed.timeout > before);
        assert_eq!(registry.get_cluster("A").unwrap().unwrap().timeout, refreshed.timeout);

        let err = service.refresh(&alice, "B", None).await.unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_kill_honours_request_deadline() {
        let (service, registry, engine) = fixture();
        engine.set_remove_delay("ctr-A", Duration::from_secs(5));

        let scope = crate::actor::RequestScope::new("req-1")
            .with_deadline(tokio::time::Instant::now() + Duration::from_secs(1));
        let alice = ActorContext::new(Some(scope), "alice", false);

        let err = service.kill(&alice, "A").await.unwrap_err();
        assert!(matches!(err, ServiceError::DeadlineExceeded(_)));
        assert!(registry.get_cluster("A").unwrap().is_some());
    }

    fn named_node(name: &str) -> NodeOptions {
        NodeOptions {
            name: Some(name.to_string()),
            server_version: "7.6.0".to_string(),
        }
    }

    #[tokio::test]
    async fn test_allocate_rejects_bad_node_names() {
        let (service, _, engine) = fixture();
        let alice = ActorContext::user("alice");

        for name in ["x&platform=linux/arm64", "has space", "-leading", "_leading", "slash/y"] {
            let options = ClusterOptions {
                nodes: vec![named_node(name)],
                ..Default::default()
            };
            let err = service.allocate(&alice, options).await.unwrap_err();
            assert!(matches!(err, ServiceError::InvalidRequest(_)), "{name}");
        }

        assert_eq!(engine.live_count(), 3);
        assert!(is_valid_node_name("data-1.b_2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_allocate_deadline_rolls_back_created_nodes() {
        let (service, registry, engine) = fixture();
        engine.set_create_delay(Duration::from_secs(2));

        let scope = crate::actor::RequestScope::new("req-1")
            .with_deadline(tokio::time::Instant::now() + Duration::from_secs(1));
        let alice = ActorContext::new(Some(scope), "alice", false);
        let options = ClusterOptions {
            nodes: vec![named_node("a"), named_node("b")],
            ..Default::default()
        };

        // The first create outlives the deadline but still completes, so
        // its container is known and removed before the error returns.
        let err = service.allocate(&alice, options).await.unwrap_err();
        assert!(matches!(err, ServiceError::DeadlineExceeded(_)));
        assert_eq!(engine.removed().len(), 1);
        assert_eq!(engine.live_count(), 3);
        assert_eq!(registry.list_clusters().unwrap().len(), 3);
    }

    #[test]
    fn test_registry_conflict_maps_to_conflict() {
        let err = ServiceError::from(RegistryError::Conflict("A".to_string()));
        assert!(matches!(err, ServiceError::Conflict(id) if id == "A"));
    }
}
