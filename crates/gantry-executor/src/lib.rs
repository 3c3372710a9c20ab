//! Command execution backends for Gantry.
//!
//! Provides `CommandRunner` implementations:
//! - Local processes via `sh -c` (the default)

pub mod process;

pub use gantry_core::command::{CommandInvocation, CommandOutcome, CommandRunner, StopSignal};
pub use process::ProcessRunner;
