//! Pipeline execution engine for Gantry.
//!
//! Runs pipelines block by block, executes the jobs of a block
//! concurrently, and chains pipelines into workflows through promotion
//! rules. Progress is observable through a single event stream.

pub mod engine;
pub mod events;
mod promotion;
mod runner;

pub use engine::{Engine, EngineBuilder};
pub use events::EngineEvent;
