//! Core domain types and traits for the Gantry promotion engine.
//!
//! This crate contains:
//! - Workflow, run, and promotion identifiers
//! - Pipeline, block, and job definitions and run records
//! - Trigger events
//! - The command runner seam and stop signalling
//! - Storage abstractions (artifact cache, secret bundles)
//! - Promotion rules and the completion event

pub mod cache;
pub mod command;
pub mod error;
pub mod id;
pub mod pipeline;
pub mod promotion;
pub mod secret;
pub mod trigger;

pub use error::{Error, Result};
pub use id::{PromotionId, RunId, WorkflowId};
