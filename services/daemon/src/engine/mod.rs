//! Container engine interface.
//!
//! The engine abstracts the container operations a cluster needs:
//! - Creating and starting one container per node
//! - Removing containers during teardown
//! - Startup checks (reachability, required network, registry login)
//!
//! [`DockerEngine`] talks to a Docker Engine API; [`MockEngine`] is an
//! in-process double for tests and development.

mod docker;
mod mock;

pub use docker::DockerEngine;
pub use mock::MockEngine;

use async_trait::async_trait;
use dync_registry::Node;
use thiserror::Error;

/// Errors from engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("engine API error {status}: {message}")]
    Api { status: u16, message: String },

    /// The container does not exist (already removed or never created).
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    #[error("invalid engine host: {0}")]
    InvalidHost(String),

    /// Failure injected by [`MockEngine`].
    #[error("mock engine failure: {0}")]
    Mock(String),
}

impl EngineError {
    /// Returns true if the container the call targeted does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::ContainerNotFound(_))
    }
}

/// Everything needed to create one node container.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    /// Cluster the node belongs to (attached as a container label).
    pub cluster_id: String,

    /// Container name; also used as the hostname.
    pub name: String,

    /// Server version the node is created with.
    pub server_version: String,

    /// Fully qualified image reference.
    pub image: String,

    /// Network the container is attached to.
    pub network: String,
}

/// Container engine operations used by the daemon.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Check that the engine is reachable.
    async fn ping(&self) -> Result<(), EngineError>;

    /// Check whether a network with this name exists.
    async fn has_network(&self, name: &str) -> Result<bool, EngineError>;

    /// Authenticate against an image registry.
    async fn registry_login(&self, server: &str) -> Result<(), EngineError>;

    /// Create and start the container for one node.
    async fn create_node(&self, spec: &NodeSpec) -> Result<Node, EngineError>;

    /// Force-remove a container.
    ///
    /// Returns [`EngineError::ContainerNotFound`] if it no longer exists.
    async fn remove_container(&self, container_id: &str) -> Result<(), EngineError>;
}
