//! Cluster API endpoints.
//!
//! Every handler acts under the caller's [`ActorContext`], so callers only
//! ever see and modify clusters they own.

use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use dync_registry::{Cluster, Node};
use serde::{Deserialize, Serialize};

use crate::actor::ActorContext;
use crate::api::error::ApiError;
use crate::service::{ClusterOptions, NodeOptions};
use crate::state::AppState;

/// Create cluster routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/clusters", get(list_clusters).post(create_cluster))
        .route(
            "/clusters/{cluster_id}",
            get(get_cluster).delete(delete_cluster),
        )
        .route("/clusters/{cluster_id}/refresh", post(refresh_cluster))
}

// =============================================================================
// Request/Response Types
// =============================================================================

/// Request to allocate a cluster.
#[derive(Debug, Deserialize)]
pub struct CreateClusterRequest {
    /// Nodes to create, in order.
    pub nodes: Vec<CreateNodeRequest>,

    /// Requested lifetime in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct CreateNodeRequest {
    #[serde(default)]
    pub name: Option<String>,

    pub server_version: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateClusterResponse {
    pub id: String,
}

/// Request to extend a cluster's lifetime.
#[derive(Debug, Default, Deserialize)]
pub struct RefreshClusterRequest {
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Response for a single cluster.
#[derive(Debug, Serialize, Deserialize)]
pub struct ClusterResponse {
    pub id: String,
    pub owner: String,
    pub creator: String,

    /// When the cluster expires.
    pub timeout: DateTime<Utc>,

    pub nodes: Vec<Node>,
}

impl From<Cluster> for ClusterResponse {
    fn from(cluster: Cluster) -> Self {
        Self {
            id: cluster.id,
            owner: cluster.owner,
            creator: cluster.creator,
            timeout: cluster.timeout,
            nodes: cluster.nodes,
        }
    }
}

/// Response for listing clusters.
#[derive(Debug, Serialize, Deserialize)]
pub struct ListClustersResponse {
    pub items: Vec<ClusterResponse>,
}

// =============================================================================
// Handlers
// =============================================================================

async fn list_clusters(
    State(state): State<AppState>,
    ctx: ActorContext,
) -> Result<impl IntoResponse, ApiError> {
    let clusters = state
        .service()
        .list_all(&ctx)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id()))?;

    Ok(Json(ListClustersResponse {
        items: clusters.into_iter().map(ClusterResponse::from).collect(),
    }))
}

async fn create_cluster(
    State(state): State<AppState>,
    ctx: ActorContext,
    Json(request): Json<CreateClusterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let options = ClusterOptions {
        owner: None,
        ttl: request.timeout_secs.map(Duration::from_secs),
        nodes: request
            .nodes
            .into_iter()
            .map(|n| NodeOptions {
                name: n.name,
                server_version: n.server_version,
            })
            .collect(),
    };

    let id = state
        .service()
        .allocate(&ctx, options)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id()))?;

    Ok((StatusCode::CREATED, Json(CreateClusterResponse { id })))
}

async fn get_cluster(
    State(state): State<AppState>,
    ctx: ActorContext,
    Path(cluster_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let cluster = state
        .service()
        .get(&ctx, &cluster_id)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id()))?;

    Ok(Json(ClusterResponse::from(cluster)))
}

async fn delete_cluster(
    State(state): State<AppState>,
    ctx: ActorContext,
    Path(cluster_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .service()
        .kill(&ctx, &cluster_id)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id()))?;

    Ok(StatusCode::NO_CONTENT)
}

async fn refresh_cluster(
    State(state): State<AppState>,
    ctx: ActorContext,
    Path(cluster_id): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    // The body is optional; an empty one refreshes with the default timeout.
    let request: RefreshClusterRequest = if body.is_empty() {
        RefreshClusterRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| {
            ApiError::bad_request("invalid_body", e.to_string()).with_request_id(ctx.request_id())
        })?
    };

    let cluster = state
        .service()
        .refresh(&ctx, &cluster_id, request.timeout_secs.map(Duration::from_secs))
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id()))?;

    Ok(Json(ClusterResponse::from(cluster)))
}
