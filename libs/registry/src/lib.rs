//! # dync-registry
//!
//! Durable records of the clusters managed by the dyncluster daemon.
//!
//! ## Design Principles
//!
//! - A cluster record is the only source of truth for ownership and expiry
//! - Cluster IDs are unique across a registry; inserts never overwrite
//! - A record and its nodes are written and removed atomically
//! - Every registry is safe for concurrent use by distinct callers
//!
//! Two implementations ship with the crate:
//! - [`SqliteRegistry`]: on-disk store used by the daemon
//! - [`MemoryRegistry`]: in-process store for tests and dev mode

mod error;
mod memory;
mod model;
mod sqlite;

pub use error::RegistryError;
pub use memory::MemoryRegistry;
pub use model::{Cluster, Node};
pub use sqlite::SqliteRegistry;

use chrono::{DateTime, Utc};

/// Storage contract for cluster records.
///
/// Implementations must tolerate concurrent calls for distinct cluster IDs.
/// After [`Registry::close`] every operation fails with
/// [`RegistryError::Closed`].
pub trait Registry: Send + Sync {
    /// List every cluster, oldest first.
    fn list_clusters(&self) -> Result<Vec<Cluster>, RegistryError>;

    /// Fetch a single cluster.
    fn get_cluster(&self, id: &str) -> Result<Option<Cluster>, RegistryError>;

    /// Insert a new cluster. Fails with [`RegistryError::Conflict`] if the ID exists.
    fn insert_cluster(&self, cluster: &Cluster) -> Result<(), RegistryError>;

    /// Rewrite the expiry of an existing cluster.
    fn update_timeout(&self, id: &str, timeout: DateTime<Utc>) -> Result<(), RegistryError>;

    /// Delete a cluster and its nodes. Fails with [`RegistryError::NotFound`] if absent.
    fn delete_cluster(&self, id: &str) -> Result<(), RegistryError>;

    /// Cheap check that the store is open and answering.
    fn ping(&self) -> Result<(), RegistryError>;

    /// Release the underlying handle.
    fn close(&self) -> Result<(), RegistryError>;
}
