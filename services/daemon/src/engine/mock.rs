//! In-process engine for testing and development.
//!
//! Containers are tracked in memory. Removal latency and failures can be
//! injected per container so tests can pin the completion order of
//! concurrent teardowns.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use dync_registry::Node;
use tracing::{debug, info};

use super::{Engine, EngineError, NodeSpec};

/// Mock engine for testing and development.
pub struct MockEngine {
    /// Counter for generating container IDs.
    container_counter: AtomicU64,

    /// Networks reported by `has_network`.
    networks: Vec<String>,

    state: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    live: HashSet<String>,
    remove_calls: Vec<String>,
    removed: Vec<String>,
    remove_delays: HashMap<String, Duration>,
    create_delay: Option<Duration>,
    failing_removals: HashSet<String>,
    failing_creates: HashSet<String>,
}

impl MockEngine {
    /// Create a mock engine exposing the `macvlan0` network.
    pub fn new() -> Self {
        Self::with_networks(["macvlan0"])
    }

    /// Create a mock engine exposing the given networks.
    pub fn with_networks<I, S>(networks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            container_counter: AtomicU64::new(0),
            networks: networks.into_iter().map(Into::into).collect(),
            state: Mutex::new(MockState::default()),
        }
    }

    /// Register containers that already exist on the engine.
    pub fn add_containers<I, S>(&self, container_ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lock()
            .live
            .extend(container_ids.into_iter().map(Into::into));
    }

    /// Delay removal of `container_id` by `delay`.
    pub fn set_remove_delay(&self, container_id: impl Into<String>, delay: Duration) {
        self.lock().remove_delays.insert(container_id.into(), delay);
    }

    /// Delay every node creation by `delay`.
    pub fn set_create_delay(&self, delay: Duration) {
        self.lock().create_delay = Some(delay);
    }

    /// Make removal of `container_id` fail (after any configured delay).
    pub fn fail_removal(&self, container_id: impl Into<String>) {
        self.lock().failing_removals.insert(container_id.into());
    }

    /// Make creation of any node whose name ends with `suffix` fail.
    pub fn fail_create(&self, suffix: impl Into<String>) {
        self.lock().failing_creates.insert(suffix.into());
    }

    /// Every container ID passed to `remove_container`, in call order.
    pub fn remove_calls(&self) -> Vec<String> {
        self.lock().remove_calls.clone()
    }

    /// Containers actually removed, in completion order.
    pub fn removed(&self) -> Vec<String> {
        self.lock().removed.clone()
    }

    /// Returns true if the container currently exists.
    pub fn is_live(&self, container_id: &str) -> bool {
        self.lock().live.contains(container_id)
    }

    /// Number of containers currently alive.
    pub fn live_count(&self) -> usize {
        self.lock().live.len()
    }

    fn next_container_id(&self) -> String {
        let counter = self.container_counter.fetch_add(1, Ordering::SeqCst);
        format!("mock_{:012x}", counter)
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Engine for MockEngine {
    async fn ping(&self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn has_network(&self, name: &str) -> Result<bool, EngineError> {
        Ok(self.networks.iter().any(|n| n == name))
    }

    async fn registry_login(&self, server: &str) -> Result<(), EngineError> {
        debug!(server = %server, "[MOCK] Registry login");
        Ok(())
    }

    async fn create_node(&self, spec: &NodeSpec) -> Result<Node, EngineError> {
        let delay = self.lock().create_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let rejected = self
            .lock()
            .failing_creates
            .iter()
            .any(|suffix| spec.name.ends_with(suffix.as_str()));
        if rejected {
            return Err(EngineError::Mock(format!("create of {} failed", spec.name)));
        }

        let container_id = self.next_container_id();
        info!(
            cluster_id = %spec.cluster_id,
            container_id = %container_id,
            image = %spec.image,
            "[MOCK] Creating node container"
        );

        let octet = self.lock().live.len() % 250 + 2;
        self.lock().live.insert(container_id.clone());

        Ok(Node {
            container_id,
            name: spec.name.clone(),
            initial_server_version: spec.server_version.clone(),
            ipv4_address: format!("10.99.0.{octet}"),
        })
    }

    async fn remove_container(&self, container_id: &str) -> Result<(), EngineError> {
        let delay = {
            let mut state = self.lock();
            state.remove_calls.push(container_id.to_string());
            state.remove_delays.get(container_id).copied()
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if state.failing_removals.contains(container_id) {
            return Err(EngineError::Mock(format!("removal of {container_id} failed")));
        }
        if !state.live.remove(container_id) {
            return Err(EngineError::ContainerNotFound(container_id.to_string()));
        }
        state.removed.push(container_id.to_string());

        debug!(container_id = %container_id, "[MOCK] Container removed");
        Ok(())
    }
}
