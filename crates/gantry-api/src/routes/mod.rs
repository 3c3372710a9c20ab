//! API routes.

pub mod health;
pub mod pipelines;
pub mod promotions;
pub mod runs;

use crate::AppState;
use axum::Router;

/// Build the main API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", api_router())
        .merge(health::router())
        .with_state(state)
}

fn api_router() -> Router<AppState> {
    Router::new()
        .nest("/pipelines", pipelines::router())
        .nest("/runs", runs::router())
        .nest("/promotions", promotions::router())
}
