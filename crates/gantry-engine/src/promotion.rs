//! Promotion worker: consumes run completions and chains pipelines.
//!
//! Promotion is message passing, not a callback from run execution. Every
//! run sends exactly one [`PipelineCompleted`] when it reaches a terminal
//! status; the worker evaluates the source pipeline's rules against it,
//! starts Auto targets, queues Manual ones, and settles the workflow's
//! active-run accounting last so chained runs are counted before the
//! source run is released.

use crate::engine::Engine;
use crate::events::EngineEvent;
use chrono::Utc;
use gantry_core::pipeline::RunCause;
use gantry_core::promotion::{PendingPromotion, PipelineCompleted, TriggerMode};
use gantry_core::PromotionId;
use std::sync::Weak;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Run until every sender is gone. The worker holds only a weak reference
/// to the engine so that dropping the engine shuts the loop down.
pub(crate) async fn worker_loop(
    engine: Weak<Engine>,
    mut completions: mpsc::UnboundedReceiver<PipelineCompleted>,
) {
    while let Some(completed) = completions.recv().await {
        let Some(engine) = engine.upgrade() else {
            break;
        };
        handle_completion(&engine, completed).await;
    }
}

async fn handle_completion(engine: &Engine, completed: PipelineCompleted) {
    info!(
        run_id = %completed.run_id,
        pipeline = %completed.pipeline,
        status = %completed.status,
        "Evaluating promotions"
    );

    let rules = engine
        .definition(&completed.pipeline)
        .map(|d| d.promotions.clone())
        .unwrap_or_default();

    for rule in rules {
        if !rule.when.matches(completed.status, &completed.branch) {
            continue;
        }
        match rule.mode {
            TriggerMode::Auto => {
                let cause = RunCause::AutoPromotion {
                    rule: rule.name.clone(),
                };
                match engine
                    .start_chained(&rule.target, &completed, cause)
                    .await
                {
                    Ok(run_id) => {
                        info!(
                            rule = %rule.name,
                            target = %rule.target,
                            run_id = %run_id,
                            workflow_id = %completed.workflow_id,
                            "Auto promotion started"
                        );
                    }
                    Err(e) => {
                        // Load-time validation makes this unreachable for
                        // well-formed definition sets.
                        warn!(rule = %rule.name, target = %rule.target, error = %e, "Auto promotion failed to start");
                    }
                }
            }
            TriggerMode::Manual => {
                let promotion = PendingPromotion {
                    id: PromotionId::new(),
                    workflow_id: completed.workflow_id,
                    source_run: completed.run_id,
                    source_pipeline: completed.pipeline.clone(),
                    rule: rule.name.clone(),
                    target: rule.target.clone(),
                    branch: completed.branch.clone(),
                    commit: completed.commit.clone(),
                    created_at: Utc::now(),
                };
                info!(
                    rule = %rule.name,
                    target = %rule.target,
                    promotion_id = %promotion.id,
                    "Manual promotion queued"
                );
                engine.queue_promotion(promotion.clone()).await;
                engine.emit(EngineEvent::PromotionQueued { promotion });
            }
        }
    }

    // Settle last: any Auto successor started above has already been
    // counted, so the workflow cannot settle while a chain is mid-hop.
    if engine.release_workflow_run(completed.workflow_id).await {
        info!(workflow_id = %completed.workflow_id, "Workflow settled");
        engine.emit(EngineEvent::WorkflowSettled {
            workflow_id: completed.workflow_id,
        });
    }
}
