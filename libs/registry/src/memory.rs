//! In-memory cluster registry.

use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};

use crate::{Cluster, Registry, RegistryError};

/// Registry that keeps records in process memory.
///
/// Used by tests and by the daemon's mock engine mode.
#[derive(Default)]
pub struct MemoryRegistry {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    clusters: Vec<Cluster>,
    closed: bool,
}

impl MemoryRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry pre-populated with clusters.
    pub fn with_clusters(clusters: impl IntoIterator<Item = Cluster>) -> Self {
        let registry = Self::new();
        {
            let mut state = registry.lock();
            state.clusters.extend(clusters);
        }
        registry
    }

    /// Returns true once [`Registry::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open_state(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>, RegistryError> {
        let state = self.lock();
        if state.closed {
            return Err(RegistryError::Closed);
        }
        Ok(state)
    }
}

impl Registry for MemoryRegistry {
    fn ping(&self) -> Result<(), RegistryError> {
        self.open_state().map(|_| ())
    }

    fn list_clusters(&self) -> Result<Vec<Cluster>, RegistryError> {
        Ok(self.open_state()?.clusters.clone())
    }

    fn get_cluster(&self, id: &str) -> Result<Option<Cluster>, RegistryError> {
        let state = self.open_state()?;
        Ok(state.clusters.iter().find(|c| c.id == id).cloned())
    }

    fn insert_cluster(&self, cluster: &Cluster) -> Result<(), RegistryError> {
        let mut state = self.open_state()?;
        if state.clusters.iter().any(|c| c.id == cluster.id) {
            return Err(RegistryError::Conflict(cluster.id.clone()));
        }
        state.clusters.push(cluster.clone());
        Ok(())
    }

    fn update_timeout(&self, id: &str, timeout: DateTime<Utc>) -> Result<(), RegistryError> {
        let mut state = self.open_state()?;
        let cluster = state
            .clusters
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        cluster.timeout = timeout;
        Ok(())
    }

    fn delete_cluster(&self, id: &str) -> Result<(), RegistryError> {
        let mut state = self.open_state()?;
        let index = state
            .clusters
            .iter()
            .position(|c| c.id == id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        state.clusters.remove(index);
        Ok(())
    }

    fn close(&self) -> Result<(), RegistryError> {
        let mut state = self.open_state()?;
        state.closed = true;
        Ok(())
    }
}
