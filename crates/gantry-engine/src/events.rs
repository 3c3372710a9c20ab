//! Events emitted during pipeline execution and promotion.

use gantry_core::pipeline::{BlockStatus, JobStatus, OutputLine, PipelineStatus, RunCause};
use gantry_core::promotion::PendingPromotion;
use gantry_core::{RunId, WorkflowId};

/// Event emitted by the engine. Consumers take the single event stream via
/// [`crate::Engine::take_events`]; the engine never blocks on a slow (or
/// absent) consumer.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    RunStarted {
        run_id: RunId,
        workflow_id: WorkflowId,
        pipeline: String,
        cause: RunCause,
    },
    BlockStarted {
        run_id: RunId,
        block: String,
    },
    JobStarted {
        run_id: RunId,
        block: String,
        job: String,
    },
    /// One redacted line of job output.
    JobOutput {
        run_id: RunId,
        block: String,
        job: String,
        line: OutputLine,
    },
    JobFinished {
        run_id: RunId,
        block: String,
        job: String,
        status: JobStatus,
    },
    BlockFinished {
        run_id: RunId,
        block: String,
        status: BlockStatus,
    },
    RunFinished {
        run_id: RunId,
        pipeline: String,
        status: PipelineStatus,
    },
    /// A Manual promotion became eligible and is waiting to be fired.
    PromotionQueued {
        promotion: PendingPromotion,
    },
    /// The last active run of a workflow finished and promotion evaluation
    /// for it is complete. Pending manual promotions may still exist.
    WorkflowSettled {
        workflow_id: WorkflowId,
    },
}
