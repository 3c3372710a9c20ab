//! The engine facade: triggers runs, tracks them, stops them, and owns the
//! promotion worker.

use crate::events::EngineEvent;
use crate::promotion;
use crate::runner::{self, RunDeps, RunRegistry};
use gantry_core::cache::ArtifactCache;
use gantry_core::command::{CommandRunner, StopHandle};
use gantry_core::pipeline::{OutputLine, PipelineDefinition, PipelineRun, RunCause};
use gantry_core::promotion::{PendingPromotion, PipelineCompleted};
use gantry_core::secret::SecretResolver;
use gantry_core::trigger::TriggerEvent;
use gantry_core::{Error, PromotionId, Result, RunId, WorkflowId};
use gantry_executor::ProcessRunner;
use gantry_store::{MemoryCache, MemorySecretStore};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::info;

/// Executes pipelines and chains them through promotions.
///
/// One engine holds one validated definition set. Runs execute on the
/// tokio runtime; a background worker consumes run completions and applies
/// promotion rules, so execution and promotion stay decoupled.
pub struct Engine {
    definitions: HashMap<String, PipelineDefinition>,
    cache: Arc<dyn ArtifactCache>,
    secrets: Arc<dyn SecretResolver>,
    runner: Arc<dyn CommandRunner>,
    base_env: HashMap<String, String>,
    working_dir: Option<PathBuf>,
    runs: RunRegistry,
    stoppers: Arc<Mutex<HashMap<RunId, StopHandle>>>,
    /// Active (not yet promotion-settled) run count per workflow.
    active: Mutex<HashMap<WorkflowId, usize>>,
    pending: Mutex<HashMap<PromotionId, PendingPromotion>>,
    completions: mpsc::UnboundedSender<PipelineCompleted>,
    events: mpsc::UnboundedSender<EngineEvent>,
    events_rx: StdMutex<Option<mpsc::UnboundedReceiver<EngineEvent>>>,
}

/// Builder for [`Engine`]. Backends default to in-memory stores and the
/// local process runner.
pub struct EngineBuilder {
    definitions: Vec<PipelineDefinition>,
    cache: Option<Arc<dyn ArtifactCache>>,
    secrets: Option<Arc<dyn SecretResolver>>,
    runner: Option<Arc<dyn CommandRunner>>,
    base_env: HashMap<String, String>,
    working_dir: Option<PathBuf>,
}

impl EngineBuilder {
    pub fn with_cache(mut self, cache: Arc<dyn ArtifactCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_secrets(mut self, secrets: Arc<dyn SecretResolver>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Environment handed to every job, below secret bundles and the run
    /// identifiers in precedence.
    pub fn with_base_env(mut self, env: HashMap<String, String>) -> Self {
        self.base_env = env;
        self
    }

    /// Directory commands run in and cache steps read from and write to.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Build the engine and spawn its promotion worker. Requires a running
    /// tokio runtime.
    pub fn build(self) -> Arc<Engine> {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let engine = Arc::new(Engine {
            definitions: self
                .definitions
                .into_iter()
                .map(|d| (d.name.clone(), d))
                .collect(),
            cache: self.cache.unwrap_or_else(|| Arc::new(MemoryCache::new())),
            secrets: self
                .secrets
                .unwrap_or_else(|| Arc::new(MemorySecretStore::new())),
            runner: self.runner.unwrap_or_else(|| Arc::new(ProcessRunner::new())),
            base_env: self.base_env,
            working_dir: self.working_dir,
            runs: Arc::new(RwLock::new(HashMap::new())),
            stoppers: Arc::new(Mutex::new(HashMap::new())),
            active: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            completions: completions_tx,
            events: events_tx,
            events_rx: StdMutex::new(Some(events_rx)),
        });

        tokio::spawn(promotion::worker_loop(
            Arc::downgrade(&engine),
            completions_rx,
        ));

        engine
    }
}

impl Engine {
    pub fn builder(definitions: Vec<PipelineDefinition>) -> EngineBuilder {
        EngineBuilder {
            definitions,
            cache: None,
            secrets: None,
            runner: None,
            base_env: HashMap::new(),
            working_dir: None,
        }
    }

    /// All loaded definitions, sorted by name.
    pub fn pipelines(&self) -> Vec<&PipelineDefinition> {
        let mut all: Vec<_> = self.definitions.values().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn definition(&self, name: &str) -> Option<&PipelineDefinition> {
        self.definitions.get(name)
    }

    /// Start a run of the named pipeline for a trigger event. The event's
    /// workflow id becomes the run's; promoted successors inherit it.
    pub async fn trigger(&self, pipeline: &str, trigger: TriggerEvent) -> Result<RunId> {
        let definition = self
            .definitions
            .get(pipeline)
            .ok_or_else(|| Error::NotFound(format!("pipeline '{pipeline}'")))?
            .clone();
        let run = PipelineRun::new(
            &definition,
            trigger.workflow_id,
            trigger.branch,
            trigger.commit,
            RunCause::Trigger,
        );
        Ok(self.spawn_run(definition, run).await)
    }

    /// Request a cooperative stop of a run. Stopping a finished run is a
    /// no-op; an unknown run is an error.
    pub async fn stop(&self, run_id: RunId) -> Result<()> {
        if let Some(handle) = self.stoppers.lock().await.get(&run_id) {
            handle.stop();
            info!(run_id = %run_id, "Stop requested");
            return Ok(());
        }
        if self.runs.read().await.contains_key(&run_id) {
            return Ok(());
        }
        Err(Error::NotFound(format!("run '{run_id}'")))
    }

    /// Snapshot of one run.
    pub async fn run(&self, run_id: RunId) -> Result<PipelineRun> {
        self.runs
            .read()
            .await
            .get(&run_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("run '{run_id}'")))
    }

    /// Snapshots of all runs, newest first.
    pub async fn runs(&self) -> Vec<PipelineRun> {
        let mut runs: Vec<_> = self.runs.read().await.values().cloned().collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        runs
    }

    /// Captured (already redacted) output of one job.
    pub async fn job_output(
        &self,
        run_id: RunId,
        block: &str,
        job: &str,
    ) -> Result<Vec<OutputLine>> {
        let runs = self.runs.read().await;
        let run = runs
            .get(&run_id)
            .ok_or_else(|| Error::NotFound(format!("run '{run_id}'")))?;
        let block_run = run
            .block(block)
            .ok_or_else(|| Error::NotFound(format!("block '{block}' in run '{run_id}'")))?;
        let job_run = block_run
            .job(job)
            .ok_or_else(|| Error::NotFound(format!("job '{job}' in block '{block}'")))?;
        Ok(job_run.output.clone())
    }

    /// Manual promotions waiting to be fired, oldest first.
    pub async fn pending_promotions(&self) -> Vec<PendingPromotion> {
        let mut pending: Vec<_> = self.pending.lock().await.values().cloned().collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        pending
    }

    /// Fire a pending manual promotion, starting its target pipeline under
    /// the source's workflow id. Firing consumes the entry; a second fire
    /// of the same id is an error.
    pub async fn fire_promotion(&self, id: PromotionId) -> Result<RunId> {
        let promotion = self
            .pending
            .lock()
            .await
            .remove(&id)
            .ok_or_else(|| Error::NotFound(format!("pending promotion '{id}'")))?;
        let definition = self
            .definitions
            .get(&promotion.target)
            .ok_or_else(|| Error::NotFound(format!("pipeline '{}'", promotion.target)))?
            .clone();
        info!(promotion_id = %id, target = %promotion.target, "Manual promotion fired");
        let run = PipelineRun::new(
            &definition,
            promotion.workflow_id,
            promotion.branch.clone(),
            promotion.commit.clone(),
            RunCause::ManualPromotion {
                rule: promotion.rule.clone(),
            },
        );
        Ok(self.spawn_run(definition, run).await)
    }

    /// Take the engine's event stream. There is exactly one; subsequent
    /// calls return `None`.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<EngineEvent>> {
        self.events_rx.lock().ok().and_then(|mut rx| rx.take())
    }

    /// Start the target of a matched promotion rule under the source run's
    /// workflow id.
    pub(crate) async fn start_chained(
        &self,
        target: &str,
        completed: &PipelineCompleted,
        cause: RunCause,
    ) -> Result<RunId> {
        let definition = self
            .definitions
            .get(target)
            .ok_or_else(|| Error::NotFound(format!("pipeline '{target}'")))?
            .clone();
        let run = PipelineRun::new(
            &definition,
            completed.workflow_id,
            completed.branch.clone(),
            completed.commit.clone(),
            cause,
        );
        Ok(self.spawn_run(definition, run).await)
    }

    pub(crate) async fn queue_promotion(&self, promotion: PendingPromotion) {
        self.pending.lock().await.insert(promotion.id, promotion);
    }

    /// Drop one active run from a workflow's accounting; true when it was
    /// the last one.
    pub(crate) async fn release_workflow_run(&self, workflow_id: WorkflowId) -> bool {
        let mut active = self.active.lock().await;
        match active.get_mut(&workflow_id) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                active.remove(&workflow_id);
                true
            }
            None => false,
        }
    }

    pub(crate) fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    /// Register the run, count it against its workflow, and execute it on
    /// the runtime. The completion message is sent only after the run's
    /// registry record is terminal.
    async fn spawn_run(&self, definition: PipelineDefinition, run: PipelineRun) -> RunId {
        let run_id = run.id;
        let workflow_id = run.workflow_id;

        *self.active.lock().await.entry(workflow_id).or_insert(0) += 1;

        let (handle, signal) = StopHandle::new();
        self.stoppers.lock().await.insert(run_id, handle);
        self.runs.write().await.insert(run_id, run.clone());

        let deps = RunDeps {
            cache: self.cache.clone(),
            secrets: self.secrets.clone(),
            runner: self.runner.clone(),
            runs: self.runs.clone(),
            events: self.events.clone(),
            base_env: self.base_env.clone(),
            working_dir: self.working_dir.clone(),
        };
        let completions = self.completions.clone();
        let stoppers = self.stoppers.clone();
        let pipeline = run.pipeline.clone();
        let branch = run.branch.clone();
        let commit = run.commit.clone();

        tokio::spawn(async move {
            let status = runner::execute_run(deps, definition, run, signal).await;
            stoppers.lock().await.remove(&run_id);
            let _ = completions.send(PipelineCompleted {
                run_id,
                pipeline,
                workflow_id,
                branch,
                commit,
                status,
            });
        });

        run_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::command::{CommandInvocation, CommandOutcome, StopSignal};
    use gantry_core::pipeline::{
        BlockDefinition, BlockStatus, Command, JobDefinition, JobStatus, OutputStream,
        PipelineStatus,
    };
    use gantry_core::promotion::{PromotionPredicate, PromotionRule, TriggerMode};
    use gantry_core::secret::SecretBundle;
    use std::time::Duration;
    use tokio::sync::Barrier;

    /// Interprets a tiny command language so tests control exactly what
    /// every command does:
    /// - `say <text>`: print text to stdout, exit 0
    /// - `fail <code>`: exit with the given code
    /// - `sleep <ms>`: sleep, honouring stop and budget
    /// - `env <KEY>`: print `KEY=<value>` (or `KEY=unset`), exit 0
    /// - `rendezvous`: wait on the shared barrier, exit 0
    struct ScriptedRunner {
        calls: std::sync::Mutex<Vec<String>>,
        barrier: Option<Arc<Barrier>>,
    }

    impl ScriptedRunner {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: std::sync::Mutex::new(Vec::new()),
                barrier: None,
            })
        }

        fn with_barrier(barrier: Arc<Barrier>) -> Arc<Self> {
            Arc::new(Self {
                calls: std::sync::Mutex::new(Vec::new()),
                barrier: Some(barrier),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    fn stdout_line(content: String) -> OutputLine {
        OutputLine {
            timestamp: chrono::Utc::now(),
            stream: OutputStream::Stdout,
            content,
        }
    }

    #[async_trait::async_trait]
    impl CommandRunner for ScriptedRunner {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn run(
            &self,
            invocation: CommandInvocation,
            mut stop: StopSignal,
        ) -> gantry_core::Result<CommandOutcome> {
            self.calls.lock().unwrap().push(invocation.line.clone());
            let line = invocation.line.as_str();

            if let Some(text) = line.strip_prefix("say ") {
                return Ok(CommandOutcome::Completed {
                    exit_code: 0,
                    output: vec![stdout_line(text.to_string())],
                });
            }
            if let Some(code) = line.strip_prefix("fail ") {
                return Ok(CommandOutcome::Completed {
                    exit_code: code.parse().unwrap(),
                    output: vec![],
                });
            }
            if let Some(ms) = line.strip_prefix("sleep ") {
                let wanted = Duration::from_millis(ms.parse().unwrap());
                let capped = invocation.budget.map_or(false, |b| b < wanted);
                let nap = if capped {
                    invocation.budget.unwrap()
                } else {
                    wanted
                };
                tokio::select! {
                    _ = tokio::time::sleep(nap) => {
                        if capped {
                            return Ok(CommandOutcome::TimedOut { output: vec![] });
                        }
                        return Ok(CommandOutcome::Completed { exit_code: 0, output: vec![] });
                    }
                    _ = stop.stopped() => {
                        return Ok(CommandOutcome::Stopped { output: vec![] });
                    }
                }
            }
            if let Some(key) = line.strip_prefix("env ") {
                let value = invocation
                    .env
                    .get(key)
                    .cloned()
                    .unwrap_or_else(|| "unset".to_string());
                return Ok(CommandOutcome::Completed {
                    exit_code: 0,
                    output: vec![stdout_line(format!("{key}={value}"))],
                });
            }
            if line == "rendezvous" {
                if let Some(barrier) = &self.barrier {
                    barrier.wait().await;
                }
                return Ok(CommandOutcome::Completed {
                    exit_code: 0,
                    output: vec![],
                });
            }
            Ok(CommandOutcome::Completed {
                exit_code: 0,
                output: vec![],
            })
        }
    }

    fn job(name: &str, commands: &[&str]) -> JobDefinition {
        JobDefinition {
            name: name.to_string(),
            commands: commands
                .iter()
                .map(|c| Command::Shell(c.to_string()))
                .collect(),
            secrets: vec![],
            timeout: None,
        }
    }

    fn block(name: &str, jobs: Vec<JobDefinition>) -> BlockDefinition {
        BlockDefinition {
            name: name.to_string(),
            jobs,
        }
    }

    fn pipeline(name: &str, blocks: Vec<BlockDefinition>) -> PipelineDefinition {
        PipelineDefinition {
            name: name.to_string(),
            blocks,
            promotions: vec![],
        }
    }

    fn rule(
        target: &str,
        mode: TriggerMode,
        result: Option<PipelineStatus>,
        branches: &[&str],
    ) -> PromotionRule {
        PromotionRule {
            name: target.to_string(),
            target: target.to_string(),
            mode,
            when: PromotionPredicate {
                result,
                branches: branches.iter().map(|b| b.to_string()).collect(),
            },
        }
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<EngineEvent>) -> EngineEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for engine event")
            .expect("event channel closed")
    }

    /// Collect events until the first WorkflowSettled (inclusive).
    async fn drain_until_settled(rx: &mut mpsc::UnboundedReceiver<EngineEvent>) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        loop {
            let event = next_event(rx).await;
            let settled = matches!(event, EngineEvent::WorkflowSettled { .. });
            events.push(event);
            if settled {
                return events;
            }
        }
    }

    #[tokio::test]
    async fn test_single_job_run_passes() {
        let runner = ScriptedRunner::new();
        let engine = Engine::builder(vec![pipeline(
            "build",
            vec![block("compile", vec![job("make", &["say compiling"])])],
        )])
        .with_runner(runner)
        .build();
        let mut events = engine.take_events().unwrap();

        let run_id = engine
            .trigger("build", TriggerEvent::new("master", "a1b2c3d4e5"))
            .await
            .unwrap();
        drain_until_settled(&mut events).await;

        let run = engine.run(run_id).await.unwrap();
        assert_eq!(run.status, PipelineStatus::Passed);
        assert_eq!(run.blocks[0].status, BlockStatus::Passed);
        assert_eq!(run.blocks[0].jobs[0].status, JobStatus::Passed);
        assert!(run.started_at.is_some());
        assert!(run.finished_at.is_some());

        let output = engine.job_output(run_id, "compile", "make").await.unwrap();
        assert_eq!(output[0].content, "compiling");
    }

    #[tokio::test]
    async fn test_failed_job_fails_run_and_skips_later_blocks() {
        let runner = ScriptedRunner::new();
        let engine = Engine::builder(vec![pipeline(
            "build",
            vec![
                block("test", vec![job("unit", &["fail 2"])]),
                block("package", vec![job("tar", &["say packing"])]),
            ],
        )])
        .with_runner(runner.clone())
        .build();
        let mut events = engine.take_events().unwrap();

        let run_id = engine
            .trigger("build", TriggerEvent::new("master", "abc"))
            .await
            .unwrap();
        drain_until_settled(&mut events).await;

        let run = engine.run(run_id).await.unwrap();
        assert_eq!(run.status, PipelineStatus::Failed);
        assert_eq!(run.blocks[0].status, BlockStatus::Failed);
        // The second block never started.
        assert_eq!(run.blocks[1].status, BlockStatus::Pending);
        assert_eq!(run.blocks[1].jobs[0].status, JobStatus::Pending);
        assert!(!runner.calls().contains(&"say packing".to_string()));

        // The failure reason is visible in the job output.
        let output = engine.job_output(run_id, "test", "unit").await.unwrap();
        assert!(output.iter().any(|l| l.content.contains("exited with code 2")));
    }

    #[tokio::test]
    async fn test_sibling_jobs_complete_when_one_fails() {
        let runner = ScriptedRunner::new();
        let engine = Engine::builder(vec![pipeline(
            "build",
            vec![block(
                "checks",
                vec![job("lint", &["fail 1"]), job("slow", &["sleep 80", "say done"])],
            )],
        )])
        .with_runner(runner.clone())
        .build();
        let mut events = engine.take_events().unwrap();

        let run_id = engine
            .trigger("build", TriggerEvent::new("master", "abc"))
            .await
            .unwrap();
        drain_until_settled(&mut events).await;

        let run = engine.run(run_id).await.unwrap();
        assert_eq!(run.status, PipelineStatus::Failed);
        // The sibling was not cancelled by the failure; it ran to the end.
        assert_eq!(run.blocks[0].jobs[1].status, JobStatus::Passed);
        assert!(runner.calls().contains(&"say done".to_string()));
    }

    #[tokio::test]
    async fn test_passing_block_then_mixed_block_fails_pipeline() {
        let runner = ScriptedRunner::new();
        let engine = Engine::builder(vec![pipeline(
            "build-test",
            vec![
                block("build", vec![job("image", &["say built"])]),
                block(
                    "test",
                    vec![job("unit", &["say ok"]), job("integration", &["fail 1"])],
                ),
            ],
        )])
        .with_runner(runner.clone())
        .build();
        let mut events = engine.take_events().unwrap();

        let run_id = engine
            .trigger("build-test", TriggerEvent::new("master", "abc"))
            .await
            .unwrap();
        drain_until_settled(&mut events).await;

        let run = engine.run(run_id).await.unwrap();
        assert_eq!(run.status, PipelineStatus::Failed);
        assert_eq!(run.blocks[0].status, BlockStatus::Passed);
        assert_eq!(run.blocks[1].status, BlockStatus::Failed);
        assert_eq!(run.blocks[1].jobs[0].status, JobStatus::Passed);
        assert_eq!(run.blocks[1].jobs[1].status, JobStatus::Failed);

        // Each command ran exactly once; nothing is retried.
        let mut calls = runner.calls();
        calls.sort();
        assert_eq!(calls, vec!["fail 1", "say built", "say ok"]);
    }

    #[tokio::test]
    async fn test_jobs_within_a_block_run_concurrently() {
        // Both jobs wait on the same barrier; sequential execution would
        // deadlock and trip the event timeout.
        let barrier = Arc::new(Barrier::new(2));
        let runner = ScriptedRunner::with_barrier(barrier);
        let engine = Engine::builder(vec![pipeline(
            "build",
            vec![block(
                "pair",
                vec![job("left", &["rendezvous"]), job("right", &["rendezvous"])],
            )],
        )])
        .with_runner(runner)
        .build();
        let mut events = engine.take_events().unwrap();

        let run_id = engine
            .trigger("build", TriggerEvent::new("master", "abc"))
            .await
            .unwrap();
        drain_until_settled(&mut events).await;

        let run = engine.run(run_id).await.unwrap();
        assert_eq!(run.status, PipelineStatus::Passed);
    }

    #[tokio::test]
    async fn test_blocks_run_strictly_in_order() {
        let runner = ScriptedRunner::new();
        let engine = Engine::builder(vec![pipeline(
            "build",
            vec![
                block("first", vec![job("a", &["sleep 60"])]),
                block("second", vec![job("b", &["say later"])]),
            ],
        )])
        .with_runner(runner)
        .build();
        let mut events = engine.take_events().unwrap();

        engine
            .trigger("build", TriggerEvent::new("master", "abc"))
            .await
            .unwrap();
        let events = drain_until_settled(&mut events).await;

        let first_finished = events
            .iter()
            .position(|e| matches!(e, EngineEvent::BlockFinished { block, .. } if block == "first"))
            .unwrap();
        let second_started = events
            .iter()
            .position(|e| matches!(e, EngineEvent::BlockStarted { block, .. } if block == "second"))
            .unwrap();
        assert!(first_finished < second_started);
    }

    #[tokio::test]
    async fn test_stop_cancels_running_jobs_and_skips_later_blocks() {
        let runner = ScriptedRunner::new();
        let engine = Engine::builder(vec![pipeline(
            "deploy",
            vec![
                block(
                    "rollout",
                    vec![
                        job("one", &["sleep 60000"]),
                        job("two", &["sleep 60000"]),
                        job("three", &["sleep 60000"]),
                    ],
                ),
                block("verify", vec![job("smoke", &["say smoke"])]),
            ],
        )])
        .with_runner(runner)
        .build();
        let mut events = engine.take_events().unwrap();

        let run_id = engine
            .trigger("deploy", TriggerEvent::new("master", "abc"))
            .await
            .unwrap();

        // Wait until all three jobs are running before stopping.
        let mut started = 0;
        while started < 3 {
            if matches!(next_event(&mut events).await, EngineEvent::JobStarted { .. }) {
                started += 1;
            }
        }
        engine.stop(run_id).await.unwrap();
        drain_until_settled(&mut events).await;

        let run = engine.run(run_id).await.unwrap();
        assert_eq!(run.status, PipelineStatus::Stopped);
        assert_eq!(run.blocks[0].status, BlockStatus::Stopped);
        for job_run in &run.blocks[0].jobs {
            assert_eq!(job_run.status, JobStatus::Stopped);
        }
        assert_eq!(run.blocks[1].status, BlockStatus::Pending);
    }

    #[tokio::test]
    async fn test_job_timeout_marks_job_timed_out_and_fails_block() {
        let runner = ScriptedRunner::new();
        let mut slow = job("slow", &["sleep 60000"]);
        slow.timeout = Some(Duration::from_millis(50));
        let engine = Engine::builder(vec![pipeline("build", vec![block("b", vec![slow])])])
            .with_runner(runner)
            .build();
        let mut events = engine.take_events().unwrap();

        let run_id = engine
            .trigger("build", TriggerEvent::new("master", "abc"))
            .await
            .unwrap();
        drain_until_settled(&mut events).await;

        let run = engine.run(run_id).await.unwrap();
        assert_eq!(run.blocks[0].jobs[0].status, JobStatus::TimedOut);
        assert_eq!(run.blocks[0].status, BlockStatus::Failed);
        assert_eq!(run.status, PipelineStatus::Failed);

        let output = engine.job_output(run_id, "b", "slow").await.unwrap();
        assert!(output.iter().any(|l| l.content.contains("timed out")));
    }

    #[tokio::test]
    async fn test_secret_values_injected_and_redacted() {
        let mut vars = HashMap::new();
        vars.insert("API_TOKEN".to_string(), "tok-sekret-99".to_string());
        let secrets = MemorySecretStore::from_bundles([SecretBundle::new("registry", vars)]);

        let runner = ScriptedRunner::new();
        let mut push = job("push", &["env API_TOKEN"]);
        push.secrets = vec!["registry".to_string()];
        let engine = Engine::builder(vec![pipeline("release", vec![block("b", vec![push])])])
            .with_runner(runner)
            .with_secrets(Arc::new(secrets))
            .build();
        let mut events = engine.take_events().unwrap();

        let run_id = engine
            .trigger("release", TriggerEvent::new("master", "abc"))
            .await
            .unwrap();
        let seen = drain_until_settled(&mut events).await;

        let run = engine.run(run_id).await.unwrap();
        assert_eq!(run.status, PipelineStatus::Passed);

        // The secret reached the command's environment, but its value never
        // reaches stored or emitted output.
        let output = engine.job_output(run_id, "b", "push").await.unwrap();
        assert_eq!(output[0].content, "API_TOKEN=***");
        for event in &seen {
            if let EngineEvent::JobOutput { line, .. } = event {
                assert!(!line.content.contains("tok-sekret-99"));
            }
        }
    }

    #[tokio::test]
    async fn test_missing_bundle_fails_job_before_any_command() {
        let runner = ScriptedRunner::new();
        let mut push = job("push", &["say never"]);
        push.secrets = vec!["absent".to_string()];
        let engine = Engine::builder(vec![pipeline("release", vec![block("b", vec![push])])])
            .with_runner(runner.clone())
            .build();
        let mut events = engine.take_events().unwrap();

        let run_id = engine
            .trigger("release", TriggerEvent::new("master", "abc"))
            .await
            .unwrap();
        drain_until_settled(&mut events).await;

        let run = engine.run(run_id).await.unwrap();
        assert_eq!(run.blocks[0].jobs[0].status, JobStatus::Failed);
        assert!(runner.calls().is_empty());

        let output = engine.job_output(run_id, "b", "push").await.unwrap();
        assert!(output[0].content.contains("absent"));
    }

    #[tokio::test]
    async fn test_run_identifiers_exported_to_commands() {
        let runner = ScriptedRunner::new();
        let engine = Engine::builder(vec![pipeline(
            "build",
            vec![block(
                "meta",
                vec![job(
                    "ids",
                    &["env GANTRY_PIPELINE", "env GANTRY_BLOCK", "env GANTRY_JOB", "env GANTRY_BRANCH", "env GANTRY_COMMIT_SHORT"],
                )],
            )],
        )])
        .with_runner(runner)
        .build();
        let mut events = engine.take_events().unwrap();

        let run_id = engine
            .trigger("build", TriggerEvent::new("develop", "0123456789abcdef"))
            .await
            .unwrap();
        drain_until_settled(&mut events).await;

        let output = engine.job_output(run_id, "meta", "ids").await.unwrap();
        let contents: Vec<_> = output.iter().map(|l| l.content.as_str()).collect();
        assert!(contents.contains(&"GANTRY_PIPELINE=build"));
        assert!(contents.contains(&"GANTRY_BLOCK=meta"));
        assert!(contents.contains(&"GANTRY_JOB=ids"));
        assert!(contents.contains(&"GANTRY_BRANCH=develop"));
        assert!(contents.contains(&"GANTRY_COMMIT_SHORT=0123456"));
    }

    #[tokio::test]
    async fn test_command_lines_are_interpolated() {
        let runner = ScriptedRunner::new();
        let engine = Engine::builder(vec![pipeline(
            "build",
            vec![block("b", vec![job("j", &["say deploying ${git.branch}"])])],
        )])
        .with_runner(runner.clone())
        .build();
        let mut events = engine.take_events().unwrap();

        engine
            .trigger("build", TriggerEvent::new("master", "abc"))
            .await
            .unwrap();
        drain_until_settled(&mut events).await;

        assert!(runner.calls().contains(&"say deploying master".to_string()));
    }

    fn cache_job(name: &str, commands: Vec<Command>) -> JobDefinition {
        JobDefinition {
            name: name.to_string(),
            commands,
            secrets: vec![],
            timeout: None,
        }
    }

    async fn scratch_workdir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("gantry-engine-test-{}", uuid_suffix()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        dir
    }

    fn uuid_suffix() -> String {
        // now_v7 keeps parallel tests from colliding on a directory.
        gantry_core::RunId::new().to_string()
    }

    #[tokio::test]
    async fn test_cache_store_restore_and_workflow_scoped_keys() {
        let workdir = scratch_workdir().await;
        tokio::fs::write(workdir.join("seed.txt"), b"cached bytes")
            .await
            .unwrap();

        let definition = pipeline(
            "build",
            vec![block(
                "b",
                vec![cache_job(
                    "j",
                    vec![
                        Command::CacheRestore {
                            key: "deps-${workflow.id}".to_string(),
                        },
                        Command::Shell("env GANTRY_CACHE_HIT".to_string()),
                        Command::CacheStore {
                            key: "deps-${workflow.id}".to_string(),
                            paths: vec!["seed.txt".to_string()],
                        },
                    ],
                )],
            )],
        );

        let runner = ScriptedRunner::new();
        let engine = Engine::builder(vec![definition])
            .with_runner(runner)
            .with_working_dir(&workdir)
            .build();
        let mut events = engine.take_events().unwrap();

        // First run of workflow A: cold cache.
        let wf_a = TriggerEvent::new("master", "abc");
        let workflow_a = wf_a.workflow_id;
        let first = engine.trigger("build", wf_a).await.unwrap();
        drain_until_settled(&mut events).await;
        let output = engine.job_output(first, "b", "j").await.unwrap();
        assert!(output.iter().any(|l| l.content.contains("cache miss")));
        assert!(output.iter().any(|l| l.content == "GANTRY_CACHE_HIT=0"));

        // Second run of the same workflow: warm cache.
        let again = TriggerEvent::new("master", "abc").with_workflow_id(workflow_a);
        let second = engine.trigger("build", again).await.unwrap();
        drain_until_settled(&mut events).await;
        let output = engine.job_output(second, "b", "j").await.unwrap();
        assert!(output.iter().any(|l| l.content.contains("cache hit")));
        assert!(output.iter().any(|l| l.content == "GANTRY_CACHE_HIT=1"));

        // A different workflow interpolates a different key: cold again.
        let wf_b = TriggerEvent::new("master", "abc");
        let third = engine.trigger("build", wf_b).await.unwrap();
        drain_until_settled(&mut events).await;
        let output = engine.job_output(third, "b", "j").await.unwrap();
        assert!(output.iter().any(|l| l.content.contains("cache miss")));

        tokio::fs::remove_dir_all(&workdir).await.ok();
    }

    #[tokio::test]
    async fn test_literal_cache_key_is_shared_across_workflows() {
        // Keys carry no implicit workflow scope: a definition that does not
        // interpolate ${workflow.id} shares its entries with every workflow.
        let workdir = scratch_workdir().await;
        tokio::fs::write(workdir.join("seed.txt"), b"shared bytes")
            .await
            .unwrap();

        let definition = pipeline(
            "build",
            vec![block(
                "b",
                vec![cache_job(
                    "j",
                    vec![
                        Command::CacheRestore {
                            key: "shared-deps".to_string(),
                        },
                        Command::CacheStore {
                            key: "shared-deps".to_string(),
                            paths: vec!["seed.txt".to_string()],
                        },
                    ],
                )],
            )],
        );

        let engine = Engine::builder(vec![definition])
            .with_runner(ScriptedRunner::new())
            .with_working_dir(&workdir)
            .build();
        let mut events = engine.take_events().unwrap();

        let first = engine
            .trigger("build", TriggerEvent::new("master", "abc"))
            .await
            .unwrap();
        drain_until_settled(&mut events).await;
        let output = engine.job_output(first, "b", "j").await.unwrap();
        assert!(output.iter().any(|l| l.content.contains("cache miss")));

        // A different workflow, the same literal key: warm.
        let second = engine
            .trigger("build", TriggerEvent::new("master", "abc"))
            .await
            .unwrap();
        drain_until_settled(&mut events).await;
        let output = engine.job_output(second, "b", "j").await.unwrap();
        assert!(output.iter().any(|l| l.content.contains("cache hit")));

        tokio::fs::remove_dir_all(&workdir).await.ok();
    }

    #[tokio::test]
    async fn test_cache_store_of_missing_file_fails_job() {
        let workdir = scratch_workdir().await;
        let definition = pipeline(
            "build",
            vec![block(
                "b",
                vec![cache_job(
                    "j",
                    vec![Command::CacheStore {
                        key: "k".to_string(),
                        paths: vec!["no-such-file.bin".to_string()],
                    }],
                )],
            )],
        );
        let engine = Engine::builder(vec![definition])
            .with_runner(ScriptedRunner::new())
            .with_working_dir(&workdir)
            .build();
        let mut events = engine.take_events().unwrap();

        let run_id = engine
            .trigger("build", TriggerEvent::new("master", "abc"))
            .await
            .unwrap();
        drain_until_settled(&mut events).await;

        let run = engine.run(run_id).await.unwrap();
        assert_eq!(run.blocks[0].jobs[0].status, JobStatus::Failed);

        tokio::fs::remove_dir_all(&workdir).await.ok();
    }

    #[tokio::test]
    async fn test_auto_promotion_chains_under_one_workflow() {
        let mut build = pipeline(
            "build",
            vec![block("b", vec![job("j", &["say built"])])],
        );
        build.promotions = vec![rule(
            "deploy",
            TriggerMode::Auto,
            Some(PipelineStatus::Passed),
            &["master"],
        )];
        let deploy = pipeline("deploy", vec![block("d", vec![job("j", &["say deployed"])])]);

        let engine = Engine::builder(vec![build, deploy])
            .with_runner(ScriptedRunner::new())
            .build();
        let mut events = engine.take_events().unwrap();

        let trigger = TriggerEvent::new("master", "abc");
        let workflow_id = trigger.workflow_id;
        engine.trigger("build", trigger).await.unwrap();
        let seen = drain_until_settled(&mut events).await;

        let runs = engine.runs().await;
        assert_eq!(runs.len(), 2);
        let deploy_run = runs.iter().find(|r| r.pipeline == "deploy").unwrap();
        assert_eq!(deploy_run.workflow_id, workflow_id);
        assert_eq!(deploy_run.status, PipelineStatus::Passed);
        assert_eq!(
            deploy_run.cause,
            RunCause::AutoPromotion {
                rule: "deploy".to_string()
            }
        );

        // Settlement happened once, after both runs.
        let finished = seen
            .iter()
            .filter(|e| matches!(e, EngineEvent::RunFinished { .. }))
            .count();
        assert_eq!(finished, 2);
    }

    #[tokio::test]
    async fn test_auto_promotion_requires_exact_branch_membership() {
        let mut build = pipeline("build", vec![block("b", vec![job("j", &["say built"])])]);
        build.promotions = vec![rule(
            "deploy",
            TriggerMode::Auto,
            Some(PipelineStatus::Passed),
            &["master"],
        )];
        let deploy = pipeline("deploy", vec![block("d", vec![job("j", &["say deployed"])])]);

        let engine = Engine::builder(vec![build, deploy])
            .with_runner(ScriptedRunner::new())
            .build();
        let mut events = engine.take_events().unwrap();

        engine
            .trigger("build", TriggerEvent::new("master-2", "abc"))
            .await
            .unwrap();
        drain_until_settled(&mut events).await;

        // "master-2" is not "master": no chained run.
        assert_eq!(engine.runs().await.len(), 1);
        assert!(engine.pending_promotions().await.is_empty());
    }

    #[tokio::test]
    async fn test_promotion_rule_can_match_failure() {
        let mut build = pipeline("build", vec![block("b", vec![job("j", &["fail 1"])])]);
        build.promotions = vec![rule(
            "cleanup",
            TriggerMode::Auto,
            Some(PipelineStatus::Failed),
            &[],
        )];
        let cleanup = pipeline("cleanup", vec![block("c", vec![job("j", &["say cleaned"])])]);

        let engine = Engine::builder(vec![build, cleanup])
            .with_runner(ScriptedRunner::new())
            .build();
        let mut events = engine.take_events().unwrap();

        engine
            .trigger("build", TriggerEvent::new("master", "abc"))
            .await
            .unwrap();
        drain_until_settled(&mut events).await;

        let runs = engine.runs().await;
        let cleanup_run = runs.iter().find(|r| r.pipeline == "cleanup").unwrap();
        assert_eq!(cleanup_run.status, PipelineStatus::Passed);
    }

    #[tokio::test]
    async fn test_manual_promotion_is_queued_not_started() {
        let mut build = pipeline("build", vec![block("b", vec![job("j", &["say built"])])]);
        build.promotions = vec![rule(
            "production",
            TriggerMode::Manual,
            Some(PipelineStatus::Passed),
            &[],
        )];
        let production = pipeline(
            "production",
            vec![block("p", vec![job("j", &["say live"])])],
        );

        let engine = Engine::builder(vec![build, production])
            .with_runner(ScriptedRunner::new())
            .build();
        let mut events = engine.take_events().unwrap();

        engine
            .trigger("build", TriggerEvent::new("master", "abc"))
            .await
            .unwrap();
        let seen = drain_until_settled(&mut events).await;

        // Queued, visible, and not started.
        assert_eq!(engine.runs().await.len(), 1);
        let pending = engine.pending_promotions().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].target, "production");
        assert!(
            seen.iter()
                .any(|e| matches!(e, EngineEvent::PromotionQueued { .. }))
        );
    }

    #[tokio::test]
    async fn test_firing_a_manual_promotion_is_single_shot() {
        let mut build = pipeline("build", vec![block("b", vec![job("j", &["say built"])])]);
        build.promotions = vec![rule("production", TriggerMode::Manual, None, &[])];
        let production = pipeline(
            "production",
            vec![block("p", vec![job("j", &["say live"])])],
        );

        let engine = Engine::builder(vec![build, production])
            .with_runner(ScriptedRunner::new())
            .build();
        let mut events = engine.take_events().unwrap();

        let trigger = TriggerEvent::new("master", "abc");
        let workflow_id = trigger.workflow_id;
        engine.trigger("build", trigger).await.unwrap();
        drain_until_settled(&mut events).await;

        let pending = engine.pending_promotions().await;
        let promotion_id = pending[0].id;

        let run_id = engine.fire_promotion(promotion_id).await.unwrap();
        drain_until_settled(&mut events).await;

        let run = engine.run(run_id).await.unwrap();
        assert_eq!(run.pipeline, "production");
        assert_eq!(run.workflow_id, workflow_id);
        assert_eq!(
            run.cause,
            RunCause::ManualPromotion {
                rule: "production".to_string()
            }
        );

        // The entry was consumed by the first fire.
        assert!(engine.pending_promotions().await.is_empty());
        let err = engine.fire_promotion(promotion_id).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_trigger_unknown_pipeline_is_not_found() {
        let engine = Engine::builder(vec![pipeline(
            "build",
            vec![block("b", vec![job("j", &["say hi"])])],
        )])
        .with_runner(ScriptedRunner::new())
        .build();

        let err = engine
            .trigger("nope", TriggerEvent::new("master", "abc"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_stop_unknown_run_is_not_found() {
        let engine = Engine::builder(vec![pipeline(
            "build",
            vec![block("b", vec![job("j", &["say hi"])])],
        )])
        .with_runner(ScriptedRunner::new())
        .build();

        let err = engine.stop(RunId::new()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_stop_finished_run_is_a_noop() {
        let engine = Engine::builder(vec![pipeline(
            "build",
            vec![block("b", vec![job("j", &["say hi"])])],
        )])
        .with_runner(ScriptedRunner::new())
        .build();
        let mut events = engine.take_events().unwrap();

        let run_id = engine
            .trigger("build", TriggerEvent::new("master", "abc"))
            .await
            .unwrap();
        drain_until_settled(&mut events).await;

        engine.stop(run_id).await.unwrap();
        let run = engine.run(run_id).await.unwrap();
        assert_eq!(run.status, PipelineStatus::Passed);
    }

    #[tokio::test]
    async fn test_job_output_unknown_block_is_not_found() {
        let engine = Engine::builder(vec![pipeline(
            "build",
            vec![block("b", vec![job("j", &["say hi"])])],
        )])
        .with_runner(ScriptedRunner::new())
        .build();
        let mut events = engine.take_events().unwrap();

        let run_id = engine
            .trigger("build", TriggerEvent::new("master", "abc"))
            .await
            .unwrap();
        drain_until_settled(&mut events).await;

        let err = engine.job_output(run_id, "nope", "j").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_take_events_is_single_use() {
        let engine = Engine::builder(vec![pipeline(
            "build",
            vec![block("b", vec![job("j", &["say hi"])])],
        )])
        .with_runner(ScriptedRunner::new())
        .build();

        assert!(engine.take_events().is_some());
        assert!(engine.take_events().is_none());
    }
}
