//! Application state shared across request handlers.

use std::sync::Arc;

use crate::service::ClusterService;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    service: Arc<ClusterService>,
}

impl AppState {
    /// Create a new application state.
    pub fn new(service: Arc<ClusterService>) -> Self {
        Self {
            inner: Arc::new(AppStateInner { service }),
        }
    }

    /// Get a reference to the cluster service.
    pub fn service(&self) -> &ClusterService {
        &self.inner.service
    }
}
