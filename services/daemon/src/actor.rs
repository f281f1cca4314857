//! Caller identity and privilege threaded through every cluster operation.
//!
//! An [`ActorContext`] is built once per external request, or once for the
//! daemon's own background work, and never changes afterwards. Cloning is
//! cheap, so teardown tasks each hold their own copy.

use std::future::Future;
use std::sync::Arc;

use dync_registry::Cluster;
use tokio::time::Instant;

/// Identity used for the daemon's own background activity.
pub const SYSTEM_IDENTITY: &str = "system";

/// Metadata inherited from the request an actor is acting for.
#[derive(Debug, Clone, Default)]
pub struct RequestScope {
    request_id: Option<String>,
    deadline: Option<Instant>,
}

impl RequestScope {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: Some(request_id.into()),
            deadline: None,
        }
    }

    /// Bound every operation performed for this request by `deadline`.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Returned when an operation outlives its actor's deadline.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("deadline exceeded")]
pub struct DeadlineExceeded;

/// Immutable actor metadata for one operation.
#[derive(Debug, Clone)]
pub struct ActorContext {
    inner: Arc<ActorInner>,
}

#[derive(Debug)]
struct ActorInner {
    identity: String,
    is_system: bool,
    scope: RequestScope,
}

impl ActorContext {
    /// Create a context for `identity`, inheriting `parent`'s request id and
    /// deadline if there is one.
    pub fn new(parent: Option<RequestScope>, identity: impl Into<String>, is_system: bool) -> Self {
        Self {
            inner: Arc::new(ActorInner {
                identity: identity.into(),
                is_system,
                scope: parent.unwrap_or_default(),
            }),
        }
    }

    /// The system-privileged context used by background daemon activity.
    pub fn system() -> Self {
        Self::new(None, SYSTEM_IDENTITY, true)
    }

    /// An unprivileged context acting as `identity`.
    pub fn user(identity: impl Into<String>) -> Self {
        Self::new(None, identity, false)
    }

    pub fn identity(&self) -> &str {
        &self.inner.identity
    }

    pub fn is_system(&self) -> bool {
        self.inner.is_system
    }

    pub fn request_id(&self) -> Option<&str> {
        self.inner.scope.request_id.as_deref()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.scope.deadline
    }

    /// Returns true once the inherited deadline, if any, has passed.
    pub fn deadline_passed(&self) -> bool {
        self.inner
            .scope
            .deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Run `fut`, failing if the inherited deadline passes first.
    pub async fn within<F: Future>(&self, fut: F) -> Result<F::Output, DeadlineExceeded> {
        match self.inner.scope.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, fut)
                .await
                .map_err(|_| DeadlineExceeded),
            None => Ok(fut.await),
        }
    }

    /// Returns true if this actor may see and act on `cluster`.
    ///
    /// System actors bypass ownership; everyone else must own the cluster.
    pub fn owns(&self, cluster: &Cluster) -> bool {
        self.inner.is_system || cluster.owner == self.inner.identity
    }
}
