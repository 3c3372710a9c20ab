//! Application state.

use gantry_engine::Engine;
use std::sync::Arc;

/// Shared application state: one engine per server process.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

impl AppState {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}
