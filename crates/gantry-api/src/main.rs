//! Gantry API Server

use anyhow::Context;
use gantry_api::{AppState, routes};
use gantry_engine::Engine;
use gantry_store::{FsCache, MemorySecretStore};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load and validate the definition set before serving anything.
    let definitions_path =
        std::env::var("GANTRY_PIPELINES").unwrap_or_else(|_| "gantry.kdl".to_string());
    let text = tokio::fs::read_to_string(&definitions_path)
        .await
        .with_context(|| format!("cannot read pipeline definitions at {definitions_path}"))?;
    let definitions = gantry_config::parse_definitions(&text)
        .with_context(|| format!("invalid pipeline definitions in {definitions_path}"))?;
    info!(path = %definitions_path, pipelines = definitions.len(), "Loaded pipeline definitions");

    let mut builder = Engine::builder(definitions);

    if let Ok(secrets_path) = std::env::var("GANTRY_SECRETS") {
        let text = tokio::fs::read_to_string(&secrets_path)
            .await
            .with_context(|| format!("cannot read secret bundles at {secrets_path}"))?;
        let bundles = gantry_config::parse_bundles(&text)
            .with_context(|| format!("invalid secret bundles in {secrets_path}"))?;
        info!(path = %secrets_path, bundles = bundles.len(), "Loaded secret bundles");
        builder = builder.with_secrets(Arc::new(MemorySecretStore::from_bundles(bundles)));
    }

    if let Ok(cache_dir) = std::env::var("GANTRY_CACHE_DIR") {
        info!(dir = %cache_dir, "Using filesystem artifact cache");
        builder = builder.with_cache(Arc::new(FsCache::new(&cache_dir)));
    }

    if let Ok(workdir) = std::env::var("GANTRY_WORKDIR") {
        builder = builder.with_working_dir(workdir);
    }

    // GANTRY_ENV_NAME=value becomes NAME in every job's base environment.
    let base_env: HashMap<String, String> = std::env::vars()
        .filter_map(|(k, v)| k.strip_prefix("GANTRY_ENV_").map(|name| (name.to_string(), v)))
        .collect();
    if !base_env.is_empty() {
        info!(vars = base_env.len(), "Loaded base environment");
        builder = builder.with_base_env(base_env);
    }

    let engine = builder.build();

    // The server reads run state through the registry; drain the event
    // stream so it cannot grow without bound.
    if let Some(mut events) = engine.take_events() {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                debug!(event = ?event, "Engine event");
            }
        });
    }

    // Create app state
    let state = AppState::new(engine);

    // Build router
    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    // Start server
    let port = std::env::var("GANTRY_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(3000);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting server on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
