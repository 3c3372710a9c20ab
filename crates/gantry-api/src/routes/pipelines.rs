//! Pipeline definition and trigger endpoints.

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::ApiError;
use gantry_core::WorkflowId;
use gantry_core::pipeline::PipelineDefinition;
use gantry_core::promotion::TriggerMode;
use gantry_core::trigger::TriggerEvent;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_pipelines))
        .route("/{name}", get(get_pipeline))
        .route("/{name}/trigger", post(trigger_pipeline))
}

#[derive(Debug, Serialize)]
struct PipelineResponse {
    name: String,
    blocks: Vec<BlockSummary>,
    promotions: Vec<PromotionSummary>,
}

#[derive(Debug, Serialize)]
struct BlockSummary {
    name: String,
    jobs: Vec<String>,
}

#[derive(Debug, Serialize)]
struct PromotionSummary {
    name: String,
    target: String,
    mode: String,
}

fn describe(definition: &PipelineDefinition) -> PipelineResponse {
    PipelineResponse {
        name: definition.name.clone(),
        blocks: definition
            .blocks
            .iter()
            .map(|b| BlockSummary {
                name: b.name.clone(),
                jobs: b.jobs.iter().map(|j| j.name.clone()).collect(),
            })
            .collect(),
        promotions: definition
            .promotions
            .iter()
            .map(|p| PromotionSummary {
                name: p.name.clone(),
                target: p.target.clone(),
                mode: match p.mode {
                    TriggerMode::Auto => "auto".to_string(),
                    TriggerMode::Manual => "manual".to_string(),
                },
            })
            .collect(),
    }
}

async fn list_pipelines(State(state): State<AppState>) -> Json<Vec<PipelineResponse>> {
    Json(state.engine.pipelines().into_iter().map(describe).collect())
}

async fn get_pipeline(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<PipelineResponse>, ApiError> {
    let definition = state
        .engine
        .definition(&name)
        .ok_or_else(|| ApiError::NotFound(format!("pipeline '{name}'")))?;
    Ok(Json(describe(definition)))
}

#[derive(Debug, Deserialize)]
struct TriggerRequest {
    branch: String,
    commit: String,
    /// Continue an existing workflow instead of minting a new id.
    workflow_id: Option<WorkflowId>,
    actor: Option<String>,
}

#[derive(Debug, Serialize)]
struct TriggerResponse {
    run_id: String,
    workflow_id: String,
}

async fn trigger_pipeline(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<TriggerRequest>,
) -> Result<Json<TriggerResponse>, ApiError> {
    let mut trigger = TriggerEvent::new(req.branch, req.commit);
    if let Some(workflow_id) = req.workflow_id {
        trigger = trigger.with_workflow_id(workflow_id);
    }
    if let Some(actor) = req.actor {
        trigger = trigger.with_actor(actor);
    }
    let workflow_id = trigger.workflow_id;

    let run_id = state.engine.trigger(&name, trigger).await?;

    Ok(Json(TriggerResponse {
        run_id: run_id.to_string(),
        workflow_id: workflow_id.to_string(),
    }))
}
