//! Run status, output, and stop endpoints.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::AppState;
use crate::error::ApiError;
use gantry_core::RunId;
use gantry_core::pipeline::{OutputStream, PipelineRun};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_runs))
        .route("/{id}", get(get_run))
        .route("/{id}/logs", get(get_logs))
        .route("/{id}/stop", post(stop_run))
}

#[derive(Debug, Serialize)]
struct RunSummary {
    id: String,
    workflow_id: String,
    pipeline: String,
    branch: String,
    commit: String,
    status: String,
    created_at: String,
}

fn summarize(run: &PipelineRun) -> RunSummary {
    RunSummary {
        id: run.id.to_string(),
        workflow_id: run.workflow_id.to_string(),
        pipeline: run.pipeline.clone(),
        branch: run.branch.clone(),
        commit: run.short_commit(),
        status: run.status.to_string(),
        created_at: run.created_at.to_rfc3339(),
    }
}

async fn list_runs(State(state): State<AppState>) -> Json<Vec<RunSummary>> {
    Json(state.engine.runs().await.iter().map(summarize).collect())
}

/// Full run detail, every block and job record included. Job output is
/// already redacted by the engine.
async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<RunId>,
) -> Result<Json<PipelineRun>, ApiError> {
    Ok(Json(state.engine.run(id).await?))
}

#[derive(Debug, Deserialize)]
struct GetLogsQuery {
    block: String,
    job: String,
    offset: Option<usize>,
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct LogEntry {
    timestamp: String,
    stream: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct LogsResponse {
    logs: Vec<LogEntry>,
    has_more: bool,
}

async fn get_logs(
    State(state): State<AppState>,
    Path(id): Path<RunId>,
    Query(query): Query<GetLogsQuery>,
) -> Result<Json<LogsResponse>, ApiError> {
    let offset = query.offset.unwrap_or(0);
    let limit = query.limit.unwrap_or(500).min(1000); // Cap at 1000 lines

    let lines = state
        .engine
        .job_output(id, &query.block, &query.job)
        .await?;

    let has_more = lines.len() > offset + limit;
    let logs = lines
        .into_iter()
        .skip(offset)
        .take(limit)
        .map(|line| LogEntry {
            timestamp: line.timestamp.to_rfc3339(),
            stream: match line.stream {
                OutputStream::Stdout => "stdout".to_string(),
                OutputStream::Stderr => "stderr".to_string(),
                OutputStream::System => "system".to_string(),
            },
            content: line.content,
        })
        .collect();

    Ok(Json(LogsResponse { logs, has_more }))
}

/// Request a cooperative stop. Returns as soon as the stop is signalled;
/// poll the run for its terminal status.
async fn stop_run(
    State(state): State<AppState>,
    Path(id): Path<RunId>,
) -> Result<Json<Value>, ApiError> {
    state.engine.stop(id).await?;
    Ok(Json(json!({ "status": "stopping" })))
}
