//! Adaptive Throttling Service
//!
//! This is the main entry point for the adaptive throttling service.
//! It wires the store, counter source, engine and scheduler together and
//! starts the web server.

use std::sync::Arc;
use std::time::Duration;

use actix_web::{web, App, HttpServer};
use anyhow::Context;
use dotenv::dotenv;
use log::{info, warn};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use redis::Client;

use adaptive_throttle_service::api::{self, ApiState};
use adaptive_throttle_service::config;
use adaptive_throttle_service::core::{
    AdaptiveEngine, CounterSource, HttpCounterSource, MemoryStore, RedisCounterSource, RedisStore,
    Scheduler, ThrottleStore,
};
use adaptive_throttle_service::models::{Config, CounterSourceKind, StoreBackend};

fn build_store(config: &Config) -> anyhow::Result<Arc<dyn ThrottleStore>> {
    let store: Arc<dyn ThrottleStore> = match config.store.backend {
        StoreBackend::Redis => {
            let client = Client::open(config.redis.url.as_str())
                .context("Failed to create Redis client")?;
            Arc::new(RedisStore::new(
                client,
                &config.redis.key_prefix,
                Duration::from_millis(config.redis.timeout_ms),
                config.store.log_retention,
            ))
        }
        StoreBackend::Memory => {
            warn!("Using in-memory store; thresholds are not shared with the flow controller");
            Arc::new(MemoryStore::new(config.store.log_retention))
        }
    };
    Ok(store)
}

fn build_counter_source(config: &Config) -> anyhow::Result<Arc<dyn CounterSource>> {
    let timeout = Duration::from_millis(config.counters.timeout_ms);
    let source: Arc<dyn CounterSource> = match config.counters.source {
        CounterSourceKind::Redis => {
            let client = Client::open(config.redis.url.as_str())
                .context("Failed to create Redis client")?;
            Arc::new(RedisCounterSource::new(client, &config.counters.key_prefix, timeout))
        }
        CounterSourceKind::Http => Arc::new(
            HttpCounterSource::new(&config.counters.http_url, timeout)
                .context("Failed to create counter HTTP client")?,
        ),
    };
    Ok(source)
}

fn install_metrics(config: &Config) -> anyhow::Result<Option<PrometheusHandle>> {
    if !config.monitoring.metrics_enabled {
        return Ok(None);
    }
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus recorder")?;
    Ok(Some(handle))
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv().ok();

    // Initialize logging
    env_logger::init();

    info!("Starting Adaptive Throttling Service...");

    // Load configuration
    let config = config::load_config().context("Failed to load configuration")?;

    let metrics = install_metrics(&config)?;
    let store = build_store(&config)?;
    let source = build_counter_source(&config)?;

    let engine = Arc::new(AdaptiveEngine::new(store, source, config.engine.clone()));
    engine.bootstrap().await.context("Failed to load persisted state")?;

    let scheduler = Scheduler::start(Arc::clone(&engine));

    // Create API state
    let state = web::Data::new(ApiState { engine, metrics });

    info!("Listening on {}:{}", config.server.host, config.server.port);

    // Start HTTP server
    HttpServer::new(move || App::new().app_data(state.clone()).configure(api::config))
        .bind((config.server.host.as_str(), config.server.port))?
        .run()
        .await?;

    scheduler.shutdown().await;
    info!("Adaptive Throttling Service stopped");
    Ok(())
}
