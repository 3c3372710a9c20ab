//! The command runner seam and stop signalling.
//!
//! A `CommandRunner` executes exactly one shell command with a fully
//! prepared environment; the job loop in the engine owns ordering, cache
//! steps, and redaction. Implementations live in `gantry-executor`.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;

use crate::Result;
use crate::pipeline::OutputLine;

/// One prepared command invocation. The environment is complete: runners
/// must not add anything from their own process environment beyond what is
/// needed to locate executables (PATH).
#[derive(Debug, Clone)]
pub struct CommandInvocation {
    /// The shell line to run.
    pub line: String,
    /// The full execution environment for the command.
    pub env: HashMap<String, String>,
    /// Working directory; the runner's current directory when absent.
    pub working_dir: Option<PathBuf>,
    /// Remaining wall-clock budget of the enclosing job, if bounded.
    pub budget: Option<Duration>,
}

/// How a single command ended.
#[derive(Debug)]
pub enum CommandOutcome {
    /// The command ran to completion; zero means success.
    Completed {
        exit_code: i32,
        output: Vec<OutputLine>,
    },
    /// Killed because a stop was requested. Partial output is preserved.
    Stopped { output: Vec<OutputLine> },
    /// Killed because the job's wall-clock budget expired. Partial output
    /// is preserved.
    TimedOut { output: Vec<OutputLine> },
}

impl CommandOutcome {
    pub fn output(&self) -> &[OutputLine] {
        match self {
            CommandOutcome::Completed { output, .. }
            | CommandOutcome::Stopped { output }
            | CommandOutcome::TimedOut { output } => output,
        }
    }
}

/// Runs one command at a time on behalf of the engine.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Name of this runner (for logs).
    fn name(&self) -> &'static str;

    /// Run a single command to completion, cancellation, or timeout.
    ///
    /// An `Err` means the command could not be launched at all; the engine
    /// treats that as equivalent to command failure.
    async fn run(&self, invocation: CommandInvocation, stop: StopSignal)
    -> Result<CommandOutcome>;
}

/// Cooperative stop signal handed to every job and command of a run.
///
/// Cheap to clone; observers either poll [`StopSignal::is_stopped`] between
/// steps or await [`StopSignal::stopped`] inside a `select!`.
#[derive(Debug, Clone)]
pub struct StopSignal(Option<watch::Receiver<bool>>);

impl StopSignal {
    /// A signal that never fires, for standalone command execution.
    pub fn none() -> Self {
        Self(None)
    }

    pub fn is_stopped(&self) -> bool {
        self.0.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Resolves once a stop has been requested. Never resolves on a signal
    /// from [`StopSignal::none`].
    pub async fn stopped(&mut self) {
        match self.0.as_mut() {
            Some(rx) => {
                // wait_for returns Err only when the sender is dropped; a
                // dropped handle means no stop can ever arrive.
                if rx.wait_for(|stopped| *stopped).await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
            None => std::future::pending::<()>().await,
        }
    }
}

/// Requests a stop; held by the engine per run.
#[derive(Debug)]
pub struct StopHandle(watch::Sender<bool>);

impl StopHandle {
    pub fn new() -> (Self, StopSignal) {
        let (tx, rx) = watch::channel(false);
        (Self(tx), StopSignal(Some(rx)))
    }

    /// Request a cooperative stop. Idempotent.
    pub fn stop(&self) {
        let _ = self.0.send(true);
    }
}
