//! Policy administration
//!
//! Bearer-token guarded endpoints for the block and pool sets. Every
//! mutation is persisted by the policy gate before the response is sent.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use crate::AppState;
use crate::error::AppError;
use crate::federation::policy::PolicyScope;

#[derive(Debug, Deserialize)]
pub struct BlockRequest {
    pub scope: String,
    pub target: String,
}

fn parse_scope(scope: &str) -> Result<PolicyScope, AppError> {
    match scope {
        "user" => Ok(PolicyScope::User),
        "instance" => Ok(PolicyScope::Instance),
        other => Err(AppError::InvalidScope(format!(
            "Unknown scope: {}",
            other
        ))),
    }
}

/// POST /api/admin/block
pub async fn block(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<BlockRequest>,
) -> Result<StatusCode, AppError> {
    state.require_admin(&headers)?;
    let scope = parse_scope(&request.scope)?;
    state.policy.block(scope, &request.target).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/admin/unblock
pub async fn unblock(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<BlockRequest>,
) -> Result<StatusCode, AppError> {
    state.require_admin(&headers)?;
    let scope = parse_scope(&request.scope)?;
    state.policy.unblock(scope, &request.target).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct PoolRequest {
    pub target: String,
}

/// POST /api/admin/pool
pub async fn pool(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<PoolRequest>,
) -> Result<StatusCode, AppError> {
    state.require_admin(&headers)?;
    state.policy.pool(&request.target).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/admin/unpool
pub async fn unpool(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<PoolRequest>,
) -> Result<StatusCode, AppError> {
    state.require_admin(&headers)?;
    state.policy.unpool(&request.target).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/admin/policy
pub async fn policy(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    state.require_admin(&headers)?;
    let snapshot = state.policy.snapshot().await;
    Ok(Json(serde_json::json!({
        "blocked": snapshot.blocked,
        "pooled": snapshot.pooled,
    }))
    .into_response())
}

/// POST /api/admin/rotate-key
///
/// Rotates the instance signing key on demand.
pub async fn rotate_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<StatusCode, AppError> {
    state.require_admin(&headers)?;
    state.keys.rotate().await?;
    Ok(StatusCode::NO_CONTENT)
}
