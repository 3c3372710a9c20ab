//! Pipeline, block, and job definitions plus their run-time records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::id::{RunId, WorkflowId};
use crate::promotion::PromotionRule;

/// A pipeline definition: an ordered sequence of blocks plus the promotion
/// rules evaluated when a run of this pipeline reaches a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    /// Pipeline name (e.g., "build-test"). Unique within a definition set.
    pub name: String,
    /// Blocks, in execution order.
    pub blocks: Vec<BlockDefinition>,
    /// Promotion rules toward successor pipelines.
    pub promotions: Vec<PromotionRule>,
}

impl PipelineDefinition {
    pub fn block(&self, name: &str) -> Option<&BlockDefinition> {
        self.blocks.iter().find(|b| b.name == name)
    }
}

/// A named set of jobs that all must pass for the pipeline to advance.
/// Jobs within a block have no ordering dependency on each other.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockDefinition {
    /// Block name. Unique within its pipeline.
    pub name: String,
    /// Jobs, run concurrently.
    pub jobs: Vec<JobDefinition>,
}

/// An ordered command sequence with a bounded secret scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    /// Job name. Unique within its block.
    pub name: String,
    /// Commands, run strictly in order; the first failure halts the job.
    pub commands: Vec<Command>,
    /// Secret bundle names resolved at job start and injected into the
    /// job's execution environment. Later bundles win on duplicate keys.
    pub secrets: Vec<String>,
    /// Optional hard wall-clock limit for the whole job.
    pub timeout: Option<Duration>,
}

/// A single step of a job.
///
/// Cache steps are explicit decision points against the artifact cache
/// rather than shell-level filesystem probing; a restore reports hit or
/// miss in the job output and exports `GANTRY_CACHE_HIT` to the commands
/// that follow it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    /// Run a shell command; a non-zero exit fails the job.
    Shell(String),
    /// Store the named files under a cache key, overwriting any previous
    /// entry for that key.
    CacheStore { key: String, paths: Vec<String> },
    /// Restore a cache entry into the working directory. A miss is not a
    /// failure.
    CacheRestore { key: String },
    /// Delete a cache entry. Deleting a missing key is a no-op.
    CacheDelete { key: String },
}

/// Terminal and in-flight states of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    /// Created, not yet started.
    Pending,
    /// Currently executing blocks.
    Running,
    /// Every block passed.
    Passed,
    /// A block failed; later blocks never started.
    Failed,
    /// Stopped by an operator before completion.
    Stopped,
}

impl PipelineStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineStatus::Passed | PipelineStatus::Failed | PipelineStatus::Stopped
        )
    }
}

impl std::fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PipelineStatus::Pending => "pending",
            PipelineStatus::Running => "running",
            PipelineStatus::Passed => "passed",
            PipelineStatus::Failed => "failed",
            PipelineStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Status of a block, derived from its jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockStatus {
    Pending,
    Running,
    Passed,
    Failed,
    Stopped,
}

impl BlockStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BlockStatus::Passed | BlockStatus::Failed | BlockStatus::Stopped
        )
    }

    /// Derive a block's terminal status from its jobs' terminal statuses.
    ///
    /// Passed iff every job passed. Any failed or timed-out job makes the
    /// block Failed, even when sibling jobs were stopped mid-flight;
    /// otherwise any stopped job makes the block Stopped.
    pub fn from_jobs<'a>(jobs: impl IntoIterator<Item = &'a JobStatus>) -> BlockStatus {
        let mut all_passed = true;
        let mut any_stopped = false;
        for status in jobs {
            match status {
                JobStatus::Passed => {}
                JobStatus::Failed | JobStatus::TimedOut => return BlockStatus::Failed,
                JobStatus::Stopped => {
                    any_stopped = true;
                    all_passed = false;
                }
                JobStatus::Pending | JobStatus::Running => {
                    all_passed = false;
                }
            }
        }
        if any_stopped {
            BlockStatus::Stopped
        } else if all_passed {
            BlockStatus::Passed
        } else {
            BlockStatus::Running
        }
    }
}

/// Status of a single job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Passed,
    /// A command exited non-zero, could not be launched, or referenced an
    /// unknown secret bundle.
    Failed,
    /// Cancelled by an operator stop; distinct from Failed so triage can
    /// tell "broke" from "aborted".
    Stopped,
    /// The job's wall-clock limit expired. Counts as a failure for block
    /// derivation.
    TimedOut,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Pending | JobStatus::Running)
    }
}

/// What started a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum RunCause {
    /// A source trigger (push or manual API/CLI request).
    Trigger,
    /// An Auto promotion rule on a completed pipeline.
    AutoPromotion { rule: String },
    /// A Manual promotion fired by an external actor.
    ManualPromotion { rule: String },
}

/// A pipeline run: the live (and, once finished, retained) record of one
/// execution, including every job's captured, redacted output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: RunId,
    pub workflow_id: WorkflowId,
    /// Name of the definition this run executes.
    pub pipeline: String,
    /// Branch of the triggering event.
    pub branch: String,
    /// Full commit hash of the triggering event.
    pub commit: String,
    pub cause: RunCause,
    pub status: PipelineStatus,
    pub blocks: Vec<BlockRun>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    /// Build the Pending record for a definition: every block and job is
    /// laid out up front so results stay addressable by position.
    pub fn new(
        definition: &PipelineDefinition,
        workflow_id: WorkflowId,
        branch: impl Into<String>,
        commit: impl Into<String>,
        cause: RunCause,
    ) -> Self {
        let blocks = definition
            .blocks
            .iter()
            .map(|b| BlockRun {
                name: b.name.clone(),
                status: BlockStatus::Pending,
                jobs: b
                    .jobs
                    .iter()
                    .map(|j| JobRun {
                        name: j.name.clone(),
                        status: JobStatus::Pending,
                        output: Vec::new(),
                        started_at: None,
                        finished_at: None,
                    })
                    .collect(),
            })
            .collect();

        Self {
            id: RunId::new(),
            workflow_id,
            pipeline: definition.name.clone(),
            branch: branch.into(),
            commit: commit.into(),
            cause,
            status: PipelineStatus::Pending,
            blocks,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn block(&self, name: &str) -> Option<&BlockRun> {
        self.blocks.iter().find(|b| b.name == name)
    }

    /// Short (7 character) form of the commit hash.
    pub fn short_commit(&self) -> String {
        self.commit.chars().take(7).collect()
    }
}

/// Run-time record of one block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockRun {
    pub name: String,
    pub status: BlockStatus,
    pub jobs: Vec<JobRun>,
}

impl BlockRun {
    pub fn job(&self, name: &str) -> Option<&JobRun> {
        self.jobs.iter().find(|j| j.name == name)
    }
}

/// Run-time record of one job, including its captured output. Secret
/// values are redacted before lines land here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRun {
    pub name: String,
    pub status: JobStatus,
    pub output: Vec<OutputLine>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// A captured line of job output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputLine {
    pub timestamp: DateTime<Utc>,
    pub stream: OutputStream,
    pub content: String,
}

impl OutputLine {
    /// A line produced by the engine itself (cache results, errors) rather
    /// than by a command.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            stream: OutputStream::System,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
    System,
}
