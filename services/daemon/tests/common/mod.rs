//! Shared fixtures for daemon integration tests.
//!
//! The recording doubles wrap the in-memory registry and mock engine and
//! append to one [`EventLog`], so tests can assert the order in which the
//! reconciler, the shutdown coordinator and the engine touched them.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dync_daemon::engine::{Engine, EngineError, MockEngine, NodeSpec};
use dync_daemon::service::{ClusterService, ServiceConfig};
use dync_registry::{Cluster, MemoryRegistry, Node, Registry, RegistryError};

/// Ordered record of side effects.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<String>>>,
}

impl EventLog {
    pub fn push(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

/// In-memory registry that records `list`, `ping` and `close` calls.
pub struct RecordingRegistry {
    pub inner: MemoryRegistry,
    log: EventLog,
}

impl RecordingRegistry {
    pub fn new(clusters: Vec<Cluster>, log: EventLog) -> Self {
        Self {
            inner: MemoryRegistry::with_clusters(clusters),
            log,
        }
    }

    /// Stored timeout of `id`, read without recording.
    pub fn inner_timeout(&self, id: &str) -> DateTime<Utc> {
        self.inner.get_cluster(id).unwrap().unwrap().timeout
    }
}

impl Registry for RecordingRegistry {
    fn list_clusters(&self) -> Result<Vec<Cluster>, RegistryError> {
        self.log.push("list");
        self.inner.list_clusters()
    }

    fn get_cluster(&self, id: &str) -> Result<Option<Cluster>, RegistryError> {
        self.inner.get_cluster(id)
    }

    fn insert_cluster(&self, cluster: &Cluster) -> Result<(), RegistryError> {
        self.inner.insert_cluster(cluster)
    }

    fn update_timeout(&self, id: &str, timeout: DateTime<Utc>) -> Result<(), RegistryError> {
        self.inner.update_timeout(id, timeout)
    }

    fn delete_cluster(&self, id: &str) -> Result<(), RegistryError> {
        self.inner.delete_cluster(id)
    }

    fn ping(&self) -> Result<(), RegistryError> {
        self.log.push("ping");
        self.inner.ping()
    }

    fn close(&self) -> Result<(), RegistryError> {
        self.log.push("registry-closed");
        self.inner.close()
    }
}

/// Mock engine that records each completed container removal.
pub struct RecordingEngine {
    pub inner: MockEngine,
    log: EventLog,
}

impl RecordingEngine {
    pub fn new(log: EventLog) -> Self {
        Self {
            inner: MockEngine::new(),
            log,
        }
    }
}

#[async_trait]
impl Engine for RecordingEngine {
    async fn ping(&self) -> Result<(), EngineError> {
        self.inner.ping().await
    }

    async fn has_network(&self, name: &str) -> Result<bool, EngineError> {
        self.inner.has_network(name).await
    }

    async fn registry_login(&self, server: &str) -> Result<(), EngineError> {
        self.inner.registry_login(server).await
    }

    async fn create_node(&self, spec: &NodeSpec) -> Result<Node, EngineError> {
        self.inner.create_node(spec).await
    }

    async fn remove_container(&self, container_id: &str) -> Result<(), EngineError> {
        let result = self.inner.remove_container(container_id).await;
        self.log.push(format!("remove:{container_id}"));
        result
    }
}

/// A cluster with one node whose container ID is `ctr-{id}`.
pub fn cluster(id: &str, owner: &str, timeout: DateTime<Utc>) -> Cluster {
    Cluster {
        id: id.to_string(),
        owner: owner.to_string(),
        creator: owner.to_string(),
        timeout,
        nodes: vec![Node {
            container_id: container_of(id),
            name: format!("dync_{id}_0"),
            initial_server_version: "7.2.4".to_string(),
            ipv4_address: "10.99.0.2".to_string(),
        }],
    }
}

pub fn container_of(cluster_id: &str) -> String {
    format!("ctr-{cluster_id}")
}

/// Offset from `now` in seconds.
pub fn at(now: DateTime<Utc>, offset_secs: i64) -> DateTime<Utc> {
    now + chrono::Duration::seconds(offset_secs)
}

/// Wiring shared by most tests.
pub struct Harness {
    pub log: EventLog,
    pub registry: Arc<RecordingRegistry>,
    pub engine: Arc<RecordingEngine>,
    pub service: Arc<ClusterService>,
}

impl Harness {
    /// Seed the registry with `clusters` and the engine with their containers.
    pub fn new(clusters: Vec<Cluster>) -> Self {
        let log = EventLog::default();
        let engine = Arc::new(RecordingEngine::new(log.clone()));
        engine.inner.add_containers(
            clusters
                .iter()
                .flat_map(|c| c.nodes.iter().map(|n| n.container_id.clone())),
        );
        let registry = Arc::new(RecordingRegistry::new(clusters, log.clone()));
        let service = Arc::new(ClusterService::new(
            registry.clone(),
            engine.clone(),
            ServiceConfig::default(),
        ));

        Self {
            log,
            registry,
            engine,
            service,
        }
    }

    pub fn set_remove_delay(&self, cluster_id: &str, delay: Duration) {
        self.engine
            .inner
            .set_remove_delay(container_of(cluster_id), delay);
    }

    pub fn fail_removal(&self, cluster_id: &str) {
        self.engine.inner.fail_removal(container_of(cluster_id));
    }

    /// IDs still present in the registry.
    pub fn remaining(&self) -> Vec<String> {
        self.registry
            .inner
            .list_clusters()
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect()
    }
}
