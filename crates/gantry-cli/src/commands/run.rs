//! Local pipeline execution command.

use anyhow::{Context, Result};
use gantry_config::{parse_bundles, parse_definitions};
use gantry_core::pipeline::{BlockStatus, JobStatus, OutputStream, PipelineStatus, RunCause};
use gantry_core::trigger::TriggerEvent;
use gantry_engine::{Engine, EngineEvent};
use gantry_store::{FsCache, MemorySecretStore};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub struct RunArgs {
    pub path: String,
    pub pipeline: Option<String>,
    pub branch: String,
    pub commit: String,
    pub secrets: Option<String>,
    pub cache_dir: Option<String>,
    pub workdir: Option<String>,
    pub env: Vec<String>,
}

/// Run a pipeline locally, printing events as they happen. Auto promotions
/// are followed until the whole workflow settles; manual promotions are
/// listed at the end, left pending.
pub async fn run_local(args: RunArgs) -> Result<()> {
    let content = std::fs::read_to_string(&args.path)
        .with_context(|| format!("Failed to read definition file: {}", args.path))?;
    let definitions = parse_definitions(&content)
        .with_context(|| format!("Failed to parse definitions: {}", args.path))?;

    let target = match &args.pipeline {
        Some(name) => definitions
            .iter()
            .find(|d| &d.name == name)
            .map(|d| d.name.clone())
            .with_context(|| format!("No pipeline named '{}' in {}", name, args.path))?,
        None => definitions
            .first()
            .map(|d| d.name.clone())
            .context("Definition file contains no pipelines")?,
    };

    // Commands run in the directory containing the definition file unless
    // overridden.
    let workdir = match &args.workdir {
        Some(dir) => PathBuf::from(dir),
        None => Path::new(&args.path)
            .parent()
            .map(|p| {
                if p.as_os_str().is_empty() {
                    Path::new(".")
                } else {
                    p
                }
            })
            .unwrap_or(Path::new("."))
            .to_path_buf(),
    };
    let workdir = workdir
        .canonicalize()
        .context("Failed to resolve working directory")?;

    println!("Running pipeline: {}", target);
    println!("Working directory: {}", workdir.display());

    let mut base_env = HashMap::new();
    base_env.insert("CI".to_string(), "true".to_string());
    base_env.insert("GANTRY".to_string(), "true".to_string());
    for entry in &args.env {
        let (key, value) = entry
            .split_once('=')
            .with_context(|| format!("Invalid --env entry '{}', expected KEY=VALUE", entry))?;
        base_env.insert(key.to_string(), value.to_string());
    }

    let mut builder = Engine::builder(definitions)
        .with_base_env(base_env)
        .with_working_dir(workdir);

    if let Some(path) = &args.secrets {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read secrets file: {}", path))?;
        let bundles = parse_bundles(&content)
            .with_context(|| format!("Failed to parse secrets file: {}", path))?;
        println!("Loaded {} secret bundles", bundles.len());
        builder = builder.with_secrets(Arc::new(MemorySecretStore::from_bundles(bundles)));
    }
    if let Some(dir) = &args.cache_dir {
        builder = builder.with_cache(Arc::new(FsCache::new(dir)));
    }

    let engine = builder.build();
    let mut events = engine.take_events().context("Event stream already taken")?;

    let trigger = TriggerEvent::new(&args.branch, &args.commit);
    let workflow_id = trigger.workflow_id;
    println!("Workflow: {}\n", workflow_id);

    engine.trigger(&target, trigger).await?;

    // Print events until every run in the workflow has completed and its
    // promotions have been evaluated.
    while let Some(event) = events.recv().await {
        match event {
            EngineEvent::RunStarted { pipeline, cause, .. } => match cause {
                RunCause::Trigger => println!("▶ Pipeline '{}' started", pipeline),
                RunCause::AutoPromotion { rule } => {
                    println!("▶ Pipeline '{}' started (auto promotion '{}')", pipeline, rule)
                }
                RunCause::ManualPromotion { rule } => {
                    println!("▶ Pipeline '{}' started (manual promotion '{}')", pipeline, rule)
                }
            },
            EngineEvent::BlockStarted { block, .. } => {
                println!("  ▶ Block '{}'", block);
            }
            EngineEvent::JobOutput { job, line, .. } => {
                let stream_marker = match line.stream {
                    OutputStream::Stdout => " ",
                    OutputStream::Stderr => "!",
                    OutputStream::System => "*",
                };
                println!("    [{}]{} {}", job, stream_marker, line.content);
            }
            EngineEvent::JobFinished { job, status, .. } => {
                let (marker, word) = job_status_display(status);
                println!("    {} Job '{}' {}", marker, job, word);
            }
            EngineEvent::BlockFinished { block, status, .. } => match status {
                BlockStatus::Passed => println!("  ✓ Block '{}' passed\n", block),
                BlockStatus::Stopped => println!("  ⊘ Block '{}' stopped\n", block),
                _ => println!("  ✗ Block '{}' failed\n", block),
            },
            EngineEvent::RunFinished {
                pipeline, status, ..
            } => match status {
                PipelineStatus::Passed => println!("✓ Pipeline '{}' passed", pipeline),
                PipelineStatus::Stopped => println!("⊘ Pipeline '{}' stopped", pipeline),
                _ => println!("✗ Pipeline '{}' failed", pipeline),
            },
            EngineEvent::PromotionQueued { promotion } => {
                println!(
                    "◇ Manual promotion '{}' → '{}' queued",
                    promotion.rule, promotion.target
                );
            }
            EngineEvent::WorkflowSettled { .. } => break,
            _ => {}
        }
    }

    // Summary: every run of the workflow with its terminal status.
    let mut runs = engine.runs().await;
    runs.reverse(); // oldest first
    println!("\n--- Run Summary ---");
    let mut failed = false;
    for run in &runs {
        let marker = match run.status {
            PipelineStatus::Passed => "✓",
            PipelineStatus::Stopped => "⊘",
            _ => "✗",
        };
        if run.status != PipelineStatus::Passed {
            failed = true;
        }
        println!("  {} {} - {}", marker, run.pipeline, run.status);
    }

    let pending = engine.pending_promotions().await;
    if !pending.is_empty() {
        println!("\nManual promotions left pending:");
        for promotion in &pending {
            println!(
                "  {} → {} (from {})",
                promotion.rule, promotion.target, promotion.source_pipeline
            );
        }
    }

    if failed {
        anyhow::bail!("Workflow finished with failures");
    }
    println!("\n✓ Workflow {} settled", workflow_id);
    Ok(())
}

fn job_status_display(status: JobStatus) -> (&'static str, &'static str) {
    match status {
        JobStatus::Passed => ("✓", "passed"),
        JobStatus::Failed => ("✗", "failed"),
        JobStatus::Stopped => ("⊘", "stopped"),
        JobStatus::TimedOut => ("✗", "timed out"),
        JobStatus::Pending => ("○", "pending"),
        JobStatus::Running => ("▶", "running"),
    }
}
