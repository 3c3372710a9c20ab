//! Run execution: sequential blocks, concurrent jobs.

use crate::events::EngineEvent;
use chrono::Utc;
use futures::future::join_all;
use gantry_config::WorkflowContext;
use gantry_core::cache::{Artifact, ArtifactCache, ArtifactSet, Restored};
use gantry_core::command::{CommandInvocation, CommandOutcome, CommandRunner, StopSignal};
use gantry_core::pipeline::{
    BlockStatus, Command, JobDefinition, JobStatus, OutputLine, PipelineDefinition, PipelineRun,
    PipelineStatus,
};
use gantry_core::secret::{Redactor, SecretResolver};
use gantry_core::{RunId, WorkflowId};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc};
use tracing::{info, warn};

pub(crate) type RunRegistry = Arc<RwLock<HashMap<RunId, PipelineRun>>>;

/// Everything a run needs besides its definition: backends, the shared run
/// registry, and the event sink.
#[derive(Clone)]
pub(crate) struct RunDeps {
    pub cache: Arc<dyn ArtifactCache>,
    pub secrets: Arc<dyn SecretResolver>,
    pub runner: Arc<dyn CommandRunner>,
    pub runs: RunRegistry,
    pub events: mpsc::UnboundedSender<EngineEvent>,
    pub base_env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

#[derive(Clone)]
struct RunMeta {
    run_id: RunId,
    workflow_id: WorkflowId,
    pipeline: String,
    branch: String,
    commit: String,
}

/// Execute one run to a terminal status. Blocks run strictly in order; the
/// jobs of a block run concurrently and all reach a terminal status before
/// the block is judged. A failed or stopped block ends the run with later
/// blocks left Pending.
pub(crate) async fn execute_run(
    deps: RunDeps,
    definition: PipelineDefinition,
    run: PipelineRun,
    stop: StopSignal,
) -> PipelineStatus {
    let meta = RunMeta {
        run_id: run.id,
        workflow_id: run.workflow_id,
        pipeline: run.pipeline.clone(),
        branch: run.branch.clone(),
        commit: run.commit.clone(),
    };

    update_run(&deps.runs, meta.run_id, |r| {
        r.status = PipelineStatus::Running;
        r.started_at = Some(Utc::now());
    })
    .await;
    let _ = deps.events.send(EngineEvent::RunStarted {
        run_id: meta.run_id,
        workflow_id: meta.workflow_id,
        pipeline: meta.pipeline.clone(),
        cause: run.cause.clone(),
    });
    info!(run_id = %meta.run_id, pipeline = %meta.pipeline, branch = %meta.branch, "Run started");

    let mut final_status = PipelineStatus::Passed;

    for (block_idx, block) in definition.blocks.iter().enumerate() {
        if stop.is_stopped() {
            final_status = PipelineStatus::Stopped;
            break;
        }

        update_run(&deps.runs, meta.run_id, |r| {
            if let Some(b) = r.blocks.get_mut(block_idx) {
                b.status = BlockStatus::Running;
            }
        })
        .await;
        let _ = deps.events.send(EngineEvent::BlockStarted {
            run_id: meta.run_id,
            block: block.name.clone(),
        });
        info!(run_id = %meta.run_id, block = %block.name, "Block started");

        let jobs = block.jobs.iter().enumerate().map(|(job_idx, job)| {
            execute_job(
                &deps,
                &meta,
                &block.name,
                block_idx,
                job_idx,
                job,
                stop.clone(),
            )
        });
        let statuses = join_all(jobs).await;

        let block_status = BlockStatus::from_jobs(statuses.iter());
        update_run(&deps.runs, meta.run_id, |r| {
            if let Some(b) = r.blocks.get_mut(block_idx) {
                b.status = block_status;
            }
        })
        .await;
        let _ = deps.events.send(EngineEvent::BlockFinished {
            run_id: meta.run_id,
            block: block.name.clone(),
            status: block_status,
        });
        info!(run_id = %meta.run_id, block = %block.name, status = ?block_status, "Block finished");

        match block_status {
            BlockStatus::Passed => {}
            BlockStatus::Stopped => {
                final_status = PipelineStatus::Stopped;
                break;
            }
            _ => {
                final_status = PipelineStatus::Failed;
                break;
            }
        }
    }

    update_run(&deps.runs, meta.run_id, |r| {
        r.status = final_status;
        r.finished_at = Some(Utc::now());
    })
    .await;
    let _ = deps.events.send(EngineEvent::RunFinished {
        run_id: meta.run_id,
        pipeline: meta.pipeline.clone(),
        status: final_status,
    });
    info!(run_id = %meta.run_id, pipeline = %meta.pipeline, status = %final_status, "Run finished");

    final_status
}

/// Execute one job: resolve its secret bundles, then walk its commands in
/// order until one fails, the run is stopped, or the job's wall-clock
/// budget expires. Every captured line is redacted before it is stored or
/// emitted.
async fn execute_job(
    deps: &RunDeps,
    meta: &RunMeta,
    block_name: &str,
    block_idx: usize,
    job_idx: usize,
    job: &JobDefinition,
    stop: StopSignal,
) -> JobStatus {
    update_run(&deps.runs, meta.run_id, |r| {
        if let Some(j) = job_mut(r, block_idx, job_idx) {
            j.status = JobStatus::Running;
            j.started_at = Some(Utc::now());
        }
    })
    .await;
    let _ = deps.events.send(EngineEvent::JobStarted {
        run_id: meta.run_id,
        block: block_name.to_string(),
        job: job.name.clone(),
    });

    let mut sink = OutputSink {
        deps,
        meta,
        block_name,
        block_idx,
        job_idx,
        job_name: &job.name,
        redactor: Redactor::default(),
    };

    // Resolve every bundle before any command runs; an unknown bundle fails
    // the job with zero commands executed.
    let mut bundles = Vec::with_capacity(job.secrets.len());
    let mut status = JobStatus::Passed;
    for name in &job.secrets {
        match deps.secrets.resolve(name).await {
            Ok(bundle) => bundles.push(bundle),
            Err(e) => {
                sink.push(OutputLine::system(format!(
                    "cannot resolve secret bundle '{name}': {e}"
                )))
                .await;
                status = JobStatus::Failed;
                break;
            }
        }
    }
    sink.redactor = Redactor::for_bundles(&bundles);

    if status == JobStatus::Passed {
        status = run_commands(deps, meta, block_name, job, &bundles, &mut sink, stop).await;
    }

    update_run(&deps.runs, meta.run_id, |r| {
        if let Some(j) = job_mut(r, block_idx, job_idx) {
            j.status = status;
            j.finished_at = Some(Utc::now());
        }
    })
    .await;
    let _ = deps.events.send(EngineEvent::JobFinished {
        run_id: meta.run_id,
        block: block_name.to_string(),
        job: job.name.clone(),
        status,
    });
    if status == JobStatus::Passed {
        info!(run_id = %meta.run_id, block = %block_name, job = %job.name, "Job passed");
    } else {
        warn!(run_id = %meta.run_id, block = %block_name, job = %job.name, status = ?status, "Job did not pass");
    }

    status
}

async fn run_commands(
    deps: &RunDeps,
    meta: &RunMeta,
    block_name: &str,
    job: &JobDefinition,
    bundles: &[gantry_core::secret::SecretBundle],
    sink: &mut OutputSink<'_>,
    stop: StopSignal,
) -> JobStatus {
    let mut var_ctx = WorkflowContext::new()
        .with_workflow_id(meta.workflow_id.to_string())
        .with_commit(&meta.commit)
        .with_branch(&meta.branch)
        .with_pipeline(&meta.pipeline)
        .with_position(block_name, &job.name);
    var_ctx.env = deps.base_env.clone();

    // Later bundles win on duplicate keys; the run identifiers win over
    // everything so jobs cannot lose their coordinates.
    let mut env = var_ctx.interpolate_map(&deps.base_env);
    for bundle in bundles {
        env.extend(bundle.vars.clone());
    }
    let short_commit: String = meta.commit.chars().take(7).collect();
    env.insert("GANTRY_WORKFLOW_ID".to_string(), meta.workflow_id.to_string());
    env.insert("GANTRY_BRANCH".to_string(), meta.branch.clone());
    env.insert("GANTRY_COMMIT".to_string(), meta.commit.clone());
    env.insert("GANTRY_COMMIT_SHORT".to_string(), short_commit);
    env.insert("GANTRY_PIPELINE".to_string(), meta.pipeline.clone());
    env.insert("GANTRY_BLOCK".to_string(), block_name.to_string());
    env.insert("GANTRY_JOB".to_string(), job.name.clone());

    let timeout_secs = job.timeout.map(|t| t.as_secs());
    let deadline = job.timeout.map(|t| tokio::time::Instant::now() + t);
    let workdir = deps
        .working_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("."));

    for command in &job.commands {
        if stop.is_stopped() {
            sink.push(OutputLine::system("stop requested; job cancelled"))
                .await;
            return JobStatus::Stopped;
        }

        // Remaining wall-clock budget, checked at every command boundary.
        let budget = match deadline {
            Some(deadline) => {
                let now = tokio::time::Instant::now();
                if now >= deadline {
                    sink.push(OutputLine::system(format!(
                        "job timed out after {}s",
                        timeout_secs.unwrap_or_default()
                    )))
                    .await;
                    return JobStatus::TimedOut;
                }
                Some(deadline - now)
            }
            None => None,
        };

        match command {
            Command::Shell(line) => {
                let line = var_ctx.interpolate(line);
                let invocation = CommandInvocation {
                    line,
                    env: env.clone(),
                    working_dir: deps.working_dir.clone(),
                    budget,
                };
                let outcome = match deps.runner.run(invocation, stop.clone()).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        sink.push(OutputLine::system(format!("command failed to launch: {e}")))
                            .await;
                        return JobStatus::Failed;
                    }
                };
                for captured in outcome.output() {
                    sink.push(captured.clone()).await;
                }
                match outcome {
                    CommandOutcome::Completed { exit_code: 0, .. } => {}
                    CommandOutcome::Completed { exit_code, .. } => {
                        sink.push(OutputLine::system(format!(
                            "command exited with code {exit_code}"
                        )))
                        .await;
                        return JobStatus::Failed;
                    }
                    CommandOutcome::Stopped { .. } => {
                        sink.push(OutputLine::system("stop requested; job cancelled"))
                            .await;
                        return JobStatus::Stopped;
                    }
                    CommandOutcome::TimedOut { .. } => {
                        sink.push(OutputLine::system(format!(
                            "job timed out after {}s",
                            timeout_secs.unwrap_or_default()
                        )))
                        .await;
                        return JobStatus::TimedOut;
                    }
                }
            }
            Command::CacheStore { key, paths } => {
                let key = var_ctx.interpolate(key);
                let mut artifacts = Vec::with_capacity(paths.len());
                let mut unreadable = None;
                for path in paths {
                    let path = var_ctx.interpolate(path);
                    match tokio::fs::read(workdir.join(&path)).await {
                        Ok(data) => artifacts.push(Artifact::new(path, data)),
                        Err(e) => {
                            unreadable = Some((path, e));
                            break;
                        }
                    }
                }
                if let Some((path, e)) = unreadable {
                    sink.push(OutputLine::system(format!(
                        "cache store '{key}': cannot read '{path}': {e}"
                    )))
                    .await;
                    return JobStatus::Failed;
                }
                let count = artifacts.len();
                match deps.cache.store(&key, ArtifactSet::new(artifacts)).await {
                    Ok(()) => {
                        sink.push(OutputLine::system(format!(
                            "cache store '{key}' ({count} files)"
                        )))
                        .await;
                    }
                    Err(e) => {
                        sink.push(OutputLine::system(format!("cache store '{key}': {e}")))
                            .await;
                        return JobStatus::Failed;
                    }
                }
            }
            Command::CacheRestore { key } => {
                let key = var_ctx.interpolate(key);
                match deps.cache.restore(&key).await {
                    Ok(Restored::Hit(set)) => {
                        let count = set.len();
                        if let Err(e) = materialize(&workdir, &set).await {
                            sink.push(OutputLine::system(format!(
                                "cache restore '{key}': {e}"
                            )))
                            .await;
                            return JobStatus::Failed;
                        }
                        env.insert("GANTRY_CACHE_HIT".to_string(), "1".to_string());
                        sink.push(OutputLine::system(format!(
                            "cache hit '{key}' ({count} files)"
                        )))
                        .await;
                    }
                    Ok(Restored::Miss) => {
                        // A miss is an ordinary answer the job can branch on.
                        env.insert("GANTRY_CACHE_HIT".to_string(), "0".to_string());
                        sink.push(OutputLine::system(format!("cache miss '{key}'")))
                            .await;
                    }
                    Err(e) => {
                        sink.push(OutputLine::system(format!("cache restore '{key}': {e}")))
                            .await;
                        return JobStatus::Failed;
                    }
                }
            }
            Command::CacheDelete { key } => {
                let key = var_ctx.interpolate(key);
                match deps.cache.delete(&key).await {
                    Ok(()) => {
                        sink.push(OutputLine::system(format!("cache delete '{key}'")))
                            .await;
                    }
                    Err(e) => {
                        sink.push(OutputLine::system(format!("cache delete '{key}': {e}")))
                            .await;
                        return JobStatus::Failed;
                    }
                }
            }
        }
    }

    JobStatus::Passed
}

/// Write a restored artifact set into the working directory, creating
/// parent directories as needed.
async fn materialize(workdir: &PathBuf, set: &ArtifactSet) -> std::io::Result<()> {
    for artifact in &set.artifacts {
        let target = workdir.join(&artifact.name);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, &artifact.data).await?;
    }
    Ok(())
}

/// Redacts, records, and emits one line of job output.
struct OutputSink<'a> {
    deps: &'a RunDeps,
    meta: &'a RunMeta,
    block_name: &'a str,
    block_idx: usize,
    job_idx: usize,
    job_name: &'a str,
    redactor: Redactor,
}

impl OutputSink<'_> {
    async fn push(&self, mut line: OutputLine) {
        if !self.redactor.is_empty() {
            line.content = self.redactor.redact(&line.content);
        }
        update_run(&self.deps.runs, self.meta.run_id, |r| {
            if let Some(j) = job_mut(r, self.block_idx, self.job_idx) {
                j.output.push(line.clone());
            }
        })
        .await;
        let _ = self.deps.events.send(EngineEvent::JobOutput {
            run_id: self.meta.run_id,
            block: self.block_name.to_string(),
            job: self.job_name.to_string(),
            line,
        });
    }
}

fn job_mut<'a>(
    run: &'a mut PipelineRun,
    block_idx: usize,
    job_idx: usize,
) -> Option<&'a mut gantry_core::pipeline::JobRun> {
    run.blocks.get_mut(block_idx)?.jobs.get_mut(job_idx)
}

async fn update_run<F: FnOnce(&mut PipelineRun)>(runs: &RunRegistry, run_id: RunId, f: F) {
    let mut runs = runs.write().await;
    if let Some(run) = runs.get_mut(&run_id) {
        f(run);
    }
}
