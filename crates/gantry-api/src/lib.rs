//! HTTP API server for Gantry.
//!
//! Exposes pipeline triggering, run status and redacted output, stop, and
//! the manual promotion surface over REST.

pub mod error;
pub mod routes;
pub mod state;

pub use state::AppState;
