//! HTTP API handlers and routing.

pub mod error;
mod health;
mod request_context;
mod v1;

use std::future::IntoFuture;

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::state::AppState;

pub use request_context::{IDENTITY_HEADER, REQUEST_ID_HEADER, REQUEST_TIMEOUT_HEADER};

/// Create the main API router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health endpoints (no auth required)
        .merge(health::routes())
        // API v1 routes
        .nest("/v1", v1::routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve `router` on `listener` until `stop` fires.
///
/// Stopping closes the listener immediately: the accept loop is dropped
/// without waiting for open connections to drain.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    stop: oneshot::Receiver<()>,
) -> std::io::Result<()> {
    tokio::select! {
        result = axum::serve(listener, router).into_future() => result,
        _ = stop => {
            info!("HTTP listener closing");
            Ok(())
        }
    }
}
