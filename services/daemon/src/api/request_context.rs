//! Per-request actor context extracted from HTTP requests.
//!
//! HTTP callers identify themselves with `Authorization: Bearer <identity>`
//! and are never granted system privilege.

use std::time::Duration;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use tokio::time::Instant;

use crate::actor::{ActorContext, RequestScope, SYSTEM_IDENTITY};
use crate::api::error::ApiError;

pub const IDENTITY_HEADER: &str = "Authorization";
pub const REQUEST_ID_HEADER: &str = "x-request-id";
/// Optional per-request time budget in milliseconds.
pub const REQUEST_TIMEOUT_HEADER: &str = "x-request-timeout-ms";

const MAX_IDENTITY_LEN: usize = 320;

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

fn identity_from_headers(headers: &HeaderMap, request_id: &str) -> Result<String, ApiError> {
    let Some(value) = header_string(headers, IDENTITY_HEADER) else {
        return Err(ApiError::unauthorized(
            "missing_identity",
            "Authorization header with a Bearer identity is required",
        )
        .with_request_id(Some(request_id)));
    };

    let Some(identity) = value.trim().strip_prefix("Bearer ") else {
        return Err(ApiError::unauthorized(
            "invalid_authorization",
            "Authorization must be a Bearer identity",
        )
        .with_request_id(Some(request_id)));
    };

    let identity = identity.trim();
    if identity.is_empty() || identity.len() > MAX_IDENTITY_LEN {
        return Err(ApiError::unauthorized(
            "invalid_identity",
            "Bearer identity must be between 1 and 320 characters",
        )
        .with_request_id(Some(request_id)));
    }
    if identity == SYSTEM_IDENTITY {
        return Err(ApiError::forbidden(
            "reserved_identity",
            "The system identity cannot be used over HTTP",
        )
        .with_request_id(Some(request_id)));
    }

    Ok(identity.to_string())
}

fn scope_from_headers(headers: &HeaderMap, request_id: String) -> Result<RequestScope, ApiError> {
    let Some(value) = header_string(headers, REQUEST_TIMEOUT_HEADER) else {
        return Ok(RequestScope::new(request_id));
    };

    match value.trim().parse::<u64>() {
        Ok(ms) if ms > 0 => Ok(RequestScope::new(request_id)
            .with_deadline(Instant::now() + Duration::from_millis(ms))),
        _ => Err(ApiError::bad_request(
            "invalid_request_timeout",
            format!("{REQUEST_TIMEOUT_HEADER} must be a positive number of milliseconds"),
        )
        .with_request_id(Some(&request_id))),
    }
}

impl<S> FromRequestParts<S> for ActorContext
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let request_id = header_string(&parts.headers, REQUEST_ID_HEADER)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let identity = identity_from_headers(&parts.headers, &request_id)?;
        let scope = scope_from_headers(&parts.headers, request_id)?;

        Ok(ActorContext::new(Some(scope), identity, false))
    }
}
