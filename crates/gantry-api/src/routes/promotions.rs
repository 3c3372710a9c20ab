//! Pending manual promotion endpoints.

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;

use crate::AppState;
use crate::error::ApiError;
use gantry_core::PromotionId;
use gantry_core::promotion::PendingPromotion;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_promotions))
        .route("/{id}/fire", post(fire_promotion))
}

#[derive(Debug, Serialize)]
struct PendingResponse {
    id: String,
    workflow_id: String,
    source_pipeline: String,
    rule: String,
    target: String,
    branch: String,
    commit: String,
    created_at: String,
}

fn describe(promotion: &PendingPromotion) -> PendingResponse {
    PendingResponse {
        id: promotion.id.to_string(),
        workflow_id: promotion.workflow_id.to_string(),
        source_pipeline: promotion.source_pipeline.clone(),
        rule: promotion.rule.clone(),
        target: promotion.target.clone(),
        branch: promotion.branch.clone(),
        commit: promotion.commit.clone(),
        created_at: promotion.created_at.to_rfc3339(),
    }
}

async fn list_promotions(State(state): State<AppState>) -> Json<Vec<PendingResponse>> {
    Json(
        state
            .engine
            .pending_promotions()
            .await
            .iter()
            .map(describe)
            .collect(),
    )
}

#[derive(Debug, Serialize)]
struct FireResponse {
    run_id: String,
    workflow_id: String,
    pipeline: String,
}

/// Fire a pending promotion. Single shot: a second fire of the same id
/// returns 404 because the entry was consumed.
async fn fire_promotion(
    State(state): State<AppState>,
    Path(id): Path<PromotionId>,
) -> Result<Json<FireResponse>, ApiError> {
    let run_id = state.engine.fire_promotion(id).await?;
    let run = state.engine.run(run_id).await?;
    Ok(Json(FireResponse {
        run_id: run_id.to_string(),
        workflow_id: run.workflow_id.to_string(),
        pipeline: run.pipeline,
    }))
}
