//! Configuration management for the adaptive throttling service.
//!
//! Service settings are layered: built-in defaults, then an optional
//! config file, then `ATS__`-prefixed environment variables
//! (`ATS__SERVER__PORT=9000` sets `server.port`). The runtime throttling
//! config is not loaded here; it lives in the store.

use std::env;

use config::{Config as ConfigBuilder, ConfigError, Environment, File};

use crate::models::{Config, CounterSourceKind, StoreBackend};

/// Load configuration from `CONFIG_FILE` (if present) and the environment
pub fn load_config() -> Result<Config, ConfigError> {
    let config_file = env::var("CONFIG_FILE").unwrap_or_else(|_| "config/default.toml".to_string());
    load_config_from(&config_file)
}

pub fn load_config_from(config_file: &str) -> Result<Config, ConfigError> {
    let defaults = Config::default();
    let initial = defaults.engine.initial_thresholds.clone();

    let config = ConfigBuilder::builder()
        .set_default("server.host", defaults.server.host)?
        .set_default("server.port", i64::from(defaults.server.port))?
        .set_default("redis.url", defaults.redis.url)?
        .set_default("redis.key_prefix", defaults.redis.key_prefix)?
        .set_default("redis.timeout_ms", defaults.redis.timeout_ms as i64)?
        .set_default("store.backend", backend_name(&defaults.store.backend))?
        .set_default("store.log_retention", defaults.store.log_retention as i64)?
        .set_default("counters.source", source_name(&defaults.counters.source))?
        .set_default("counters.key_prefix", defaults.counters.key_prefix)?
        .set_default("counters.http_url", defaults.counters.http_url)?
        .set_default("counters.timeout_ms", defaults.counters.timeout_ms as i64)?
        .set_default("engine.initial_thresholds.visit", initial.visit as i64)?
        .set_default("engine.initial_thresholds.attack", initial.attack as i64)?
        .set_default("engine.initial_thresholds.error", initial.error as i64)?
        .set_default("engine.config_reload_seconds", defaults.engine.config_reload_seconds as i64)?
        .set_default("engine.relax.enabled", defaults.engine.relax.enabled)?
        .set_default("engine.relax.calm_ratio", defaults.engine.relax.calm_ratio)?
        .set_default("engine.relax.calm_ticks", i64::from(defaults.engine.relax.calm_ticks))?
        .set_default("monitoring.metrics_enabled", defaults.monitoring.metrics_enabled)?
        .add_source(File::with_name(config_file).required(false))
        .add_source(Environment::with_prefix("ATS").separator("__"))
        .build()?;

    config.try_deserialize()
}

fn backend_name(backend: &StoreBackend) -> &'static str {
    match backend {
        StoreBackend::Redis => "redis",
        StoreBackend::Memory => "memory",
    }
}

fn source_name(source: &CounterSourceKind) -> &'static str {
    match source {
        CounterSourceKind::Redis => "redis",
        CounterSourceKind::Http => "http",
    }
}
