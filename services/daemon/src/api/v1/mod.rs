//! API v1 routes.

mod clusters;

use axum::Router;

use crate::state::AppState;

/// Create API v1 routes.
pub fn routes() -> Router<AppState> {
    Router::new().merge(clusters::routes())
}
