//! Health check endpoints.

use axum::Router;
use axum::extract::State;
use axum::routing::get;
use axum::Json;
use serde_json::{Value, json};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/health/ready", get(ready))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Ready means the definition set loaded and validated; the engine itself
/// is in-process, so there is no backend to probe.
async fn ready(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ready",
        "pipelines": state.engine.pipelines().len(),
    }))
}
