use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use twin_core::{Tree, VmId};
use twin_runner::{ReconcileOutcome, ReconciliationState, TwinContext};
use twin_storage::HistoryEntry;
use twin_virt::SnapshotListing;

pub const SOURCE_HEADER: &str = "x-twin-source";
const DEFAULT_SOURCE: &str = "agent";
const DEFAULT_HISTORY_LIMIT: usize = 10;

#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<TwinContext>,
}

impl AppState {
    pub fn new(ctx: Arc<TwinContext>) -> Self {
        Self { ctx }
    }

    /// Run engine work off the async runtime.
    async fn blocking<T, F>(&self, f: F) -> Result<T, ApiError>
    where
        F: FnOnce(&TwinContext) -> T + Send + 'static,
        T: Send + 'static,
    {
        let ctx = self.ctx.clone();
        tokio::task::spawn_blocking(move || f(&ctx))
            .await
            .map_err(ApiError::internal)
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("{0}")]
    Conflict(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn bad_request<E: std::fmt::Display>(e: E) -> Self {
        Self::BadRequest(e.to_string())
    }
    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusReply {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl StatusReply {
    fn ok() -> Self {
        Self {
            status: "ok".to_string(),
            reason: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let code = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = StatusReply {
            status: "error".to_string(),
            reason: Some(self.to_string()),
        };
        (code, Json(body)).into_response()
    }
}

pub async fn update_state(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Result<(StatusCode, Json<ReconcileOutcome>), ApiError> {
    let source = headers
        .get(SOURCE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(DEFAULT_SOURCE)
        .to_string();
    let payload = Tree::from_json(body);
    let outcome = state
        .blocking(move |ctx| ctx.reconciler.on_observed_state(payload, &source))
        .await?;
    let code = match &outcome {
        ReconcileOutcome::Error { id: None, .. } => StatusCode::BAD_REQUEST,
        ReconcileOutcome::Error { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::OK,
    };
    Ok((code, Json(outcome)))
}

pub async fn list_snapshots(State(state): State<AppState>) -> Result<Json<SnapshotListing>, ApiError> {
    let listing = state
        .blocking(|ctx| ctx.reconciler.list_snapshots())
        .await?
        .map_err(ApiError::internal)?;
    Ok(Json(listing))
}

pub async fn revert_snapshot(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<StatusReply>, ApiError> {
    let target = name.clone();
    if state.blocking(move |ctx| ctx.reconciler.revert(&target)).await? {
        Ok(Json(StatusReply::ok()))
    } else {
        warn!(snapshot = %name, "revert refused");
        Err(ApiError::Conflict(format!("could not revert to snapshot {name}")))
    }
}

pub async fn delete_snapshot(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<StatusReply>, ApiError> {
    let target = name.clone();
    if state.blocking(move |ctx| ctx.reconciler.delete(&target)).await? {
        Ok(Json(StatusReply::ok()))
    } else {
        Err(ApiError::Conflict(format!("could not delete snapshot {name}")))
    }
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

pub async fn history(
    State(state): State<AppState>,
    Query(q): Query<HistoryQuery>,
) -> Result<Json<Vec<HistoryEntry>>, ApiError> {
    let limit = q.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    if limit == 0 {
        return Err(ApiError::bad_request("limit must be positive"));
    }
    let entries = state
        .blocking(move |ctx| ctx.reconciler.history(limit))
        .await?
        .map_err(ApiError::internal)?;
    Ok(Json(entries))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusView {
    pub vm: String,
    pub vm_id: Option<VmId>,
    #[serde(flatten)]
    pub state: ReconciliationState,
}

pub async fn status(State(state): State<AppState>) -> Result<Json<StatusView>, ApiError> {
    let view = state
        .blocking(|ctx| StatusView {
            vm: ctx.config.vm.name.clone(),
            vm_id: ctx.reconciler.snapshots().vm_id(),
            state: ctx.reconciler.status(),
        })
        .await?;
    Ok(Json(view))
}
