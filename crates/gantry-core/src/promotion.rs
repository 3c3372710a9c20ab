//! Promotion rules: conditional chaining of one pipeline's completion to
//! the start of another.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{PromotionId, RunId, WorkflowId};
use crate::pipeline::PipelineStatus;

/// A promotion rule attached to a pipeline definition. Evaluated exactly
/// once per completed run of that pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromotionRule {
    /// Rule name; also the default display name of the promotion.
    pub name: String,
    /// Name of the pipeline definition to start.
    pub target: String,
    /// Auto rules start the target as soon as the predicate matches;
    /// Manual rules surface an eligible promotion and wait for an external
    /// actor to fire it.
    pub mode: TriggerMode,
    /// Predicate over the completed run. A rule without constraints is
    /// eligible on any terminal result and any branch.
    pub when: PromotionPredicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerMode {
    Auto,
    Manual,
}

/// Predicate fields of a promotion rule. Branch matching is exact string
/// membership in an enumerated set; there is no pattern expansion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromotionPredicate {
    /// Required terminal result, when constrained.
    pub result: Option<PipelineStatus>,
    /// Enumerated branches the source run must be on. Empty means any.
    pub branches: Vec<String>,
}

impl PromotionPredicate {
    pub fn matches(&self, status: PipelineStatus, branch: &str) -> bool {
        if let Some(required) = self.result {
            if status != required {
                return false;
            }
        }
        if !self.branches.is_empty() && !self.branches.iter().any(|b| b == branch) {
            return false;
        }
        true
    }
}

/// Tagged completion event consumed by the promotion engine via message
/// passing, keeping promotion logic out of pipeline execution itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineCompleted {
    pub run_id: RunId,
    pub pipeline: String,
    pub workflow_id: WorkflowId,
    pub branch: String,
    pub commit: String,
    pub status: PipelineStatus,
}

/// An eligible Manual promotion awaiting an explicit external trigger.
/// Firing it consumes the entry; it never starts on its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingPromotion {
    pub id: PromotionId,
    pub workflow_id: WorkflowId,
    /// Run whose completion made this promotion eligible.
    pub source_run: RunId,
    pub source_pipeline: String,
    pub rule: String,
    pub target: String,
    pub branch: String,
    pub commit: String,
    pub created_at: DateTime<Utc>,
}
