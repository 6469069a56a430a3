//! microcdn - minified script CDN
//!
//! Accepts script and zip uploads, minifies and brotli compresses them,
//! stores them in Redis, and serves them back through an in-process cache.

use microcdn::compiler::{ClosureCompiler, CompilePipeline};
use microcdn::config::{Config, MB};
use microcdn::error::{MicrocdnError, Result};
use microcdn::fetcher::FetchOrchestrator;
use microcdn::server::{start_server, ServerState, SharedState};
use script_lru_cache::ScriptCache;
use script_storage::{RedisBackend, StorageEngine};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let env_filter = EnvFilter::from_default_env().add_directive("microcdn=info".parse()?);

    // Use JSON format for GCP Cloud Logging when LOG_FORMAT=json
    if std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false)
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    };

    info!("Starting microcdn...");

    let config = Config::from_env();
    info!("Port: {}", config.port);
    info!("Scratch dir: {:?}", config.scratch_root);
    info!("Cache limit: {} MB", config.cache_limit / MB);
    info!(
        upload = config.limits.upload,
        decompressed = config.limits.decompressed,
        minified = config.limits.minified,
        compressed = config.limits.compressed,
        "Size limits"
    );

    tokio::fs::create_dir_all(&config.scratch_root).await?;

    let backend = RedisBackend::connect(&config.redis_url).await?;
    let storage = Arc::new(StorageEngine::new(Arc::new(backend)));

    let cache = Arc::new(ScriptCache::new(config.cache_limit));
    let fetcher = FetchOrchestrator::new(storage.clone(), Some(cache));
    let pipeline = CompilePipeline::new(
        storage.clone(),
        Arc::new(ClosureCompiler::new(config.minifier.clone())),
        config.scratch_root.clone(),
        config.limits,
    );

    let state: SharedState = Arc::new(ServerState::new(storage, fetcher, pipeline));

    // Start HTTP server (blocking)
    start_server(state, config.port)
        .await
        .map_err(|e| MicrocdnError::Config(format!("Server error: {}", e)))?;

    Ok(())
}
