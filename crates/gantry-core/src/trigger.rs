//! Source trigger events.

use serde::{Deserialize, Serialize};

use crate::id::WorkflowId;

/// What a source trigger delivers to start a pipeline: the branch, the
/// commit, and the workflow identifier correlating the whole promotion
/// chain. The workflow id is minted here and never changes afterward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub workflow_id: WorkflowId,
    pub branch: String,
    pub commit: String,
    /// Who or what asked for the run, when known.
    pub actor: Option<String>,
}

impl TriggerEvent {
    /// A fresh trigger with a newly minted workflow id.
    pub fn new(branch: impl Into<String>, commit: impl Into<String>) -> Self {
        Self {
            workflow_id: WorkflowId::new(),
            branch: branch.into(),
            commit: commit.into(),
            actor: None,
        }
    }

    pub fn with_workflow_id(mut self, workflow_id: WorkflowId) -> Self {
        self.workflow_id = workflow_id;
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Short (7 character) form of the commit hash.
    pub fn short_commit(&self) -> String {
        self.commit.chars().take(7).collect()
    }
}
