pub mod api;

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub use api::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/update_state", post(api::update_state))
        .route("/api/v1/snapshots", get(api::list_snapshots))
        .route("/api/v1/snapshots/{name}", delete(api::delete_snapshot))
        .route("/api/v1/snapshots/{name}/revert", post(api::revert_snapshot))
        .route("/api/v1/history", get(api::history))
        .route("/api/v1/status", get(api::status))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
