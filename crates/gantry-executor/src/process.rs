//! Local process runner.
//!
//! Runs each command as `sh -c <line>` with a scrubbed environment: the
//! child sees exactly the invocation's variables plus PATH, never the
//! engine's own process environment.

use async_trait::async_trait;
use chrono::Utc;
use gantry_core::command::{CommandInvocation, CommandOutcome, CommandRunner, StopSignal};
use gantry_core::pipeline::{OutputLine, OutputStream};
use gantry_core::{Error, Result};
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::debug;

const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Runs commands as local child processes through `sh -c`.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    shell: String,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }

    /// Use a different shell binary, e.g. `bash`.
    pub fn with_shell(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

enum Wait {
    Exited(std::io::Result<ExitStatus>),
    Stopped,
    TimedOut,
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn run(
        &self,
        invocation: CommandInvocation,
        stop: StopSignal,
    ) -> Result<CommandOutcome> {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(&invocation.line)
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // PATH is the one variable the child needs from outside.
        if !invocation.env.contains_key("PATH") {
            let path = std::env::var("PATH").unwrap_or_else(|_| DEFAULT_PATH.to_string());
            cmd.env("PATH", path);
        }
        cmd.envs(&invocation.env);

        if let Some(dir) = &invocation.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::ExecutionFailed(format!("failed to launch command: {e}")))?;

        // Readers detach onto the runtime and finish at pipe EOF, which a
        // kill also produces.
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_task =
            tokio::spawn(async move { read_lines(stdout, OutputStream::Stdout).await });
        let stderr_task =
            tokio::spawn(async move { read_lines(stderr, OutputStream::Stderr).await });

        let mut stop = stop;
        let ended = tokio::select! {
            status = child.wait() => Wait::Exited(status),
            _ = stop.stopped() => Wait::Stopped,
            _ = budget_expired(invocation.budget) => Wait::TimedOut,
        };

        if !matches!(ended, Wait::Exited(_)) {
            // kill() also reaps the child.
            child.kill().await.ok();
        }

        let mut output = stdout_task.await.unwrap_or_default();
        output.extend(stderr_task.await.unwrap_or_default());
        output.sort_by_key(|line| line.timestamp);

        match ended {
            Wait::Exited(status) => {
                let status = status.map_err(Error::Io)?;
                let exit_code = status.code().unwrap_or(-1);
                debug!(exit_code, "command exited");
                Ok(CommandOutcome::Completed { exit_code, output })
            }
            Wait::Stopped => {
                debug!("command killed by stop request");
                Ok(CommandOutcome::Stopped { output })
            }
            Wait::TimedOut => {
                debug!("command killed by job timeout");
                Ok(CommandOutcome::TimedOut { output })
            }
        }
    }
}

async fn budget_expired(budget: Option<std::time::Duration>) {
    match budget {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

async fn read_lines<R>(reader: Option<R>, stream: OutputStream) -> Vec<OutputLine>
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return Vec::new();
    };
    let mut lines = BufReader::new(reader).lines();
    let mut collected = Vec::new();
    while let Ok(Some(content)) = lines.next_line().await {
        collected.push(OutputLine {
            timestamp: Utc::now(),
            stream,
            content,
        });
    }
    collected
}
