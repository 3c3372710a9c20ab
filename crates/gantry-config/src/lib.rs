//! KDL configuration parsing for Gantry.
//!
//! This crate handles parsing of:
//! - Pipeline definitions (gantry.kdl)
//! - Secret bundle files
//! - Variable interpolation

pub mod error;
pub mod pipeline;
pub mod secrets;
pub mod variables;

pub use error::{ConfigError, ConfigResult};
pub use pipeline::parse_definitions;
pub use secrets::parse_bundles;
pub use variables::WorkflowContext;
