//! Cluster and node records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A group of containerized database nodes with an owner and an expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    /// Unique cluster ID.
    pub id: String,

    /// Identity the cluster belongs to.
    pub owner: String,

    /// Identity that allocated the cluster.
    pub creator: String,

    /// Absolute instant after which the cluster is eligible for teardown.
    pub timeout: DateTime<Utc>,

    /// Nodes in allocation order.
    pub nodes: Vec<Node>,
}

impl Cluster {
    /// Returns true if the cluster expired strictly before `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.timeout < now
    }
}

/// One container belonging to a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub container_id: String,
    pub name: String,
    pub initial_server_version: String,
    pub ipv4_address: String,
}
