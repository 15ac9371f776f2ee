//! Adaptive threshold engine.
//!
//! Owns the runtime configuration, the three dimension pipelines and the
//! store. Everything the scheduler and the API do goes through here.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use log::{error, info, warn};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::core::counters::CounterSource;
use crate::core::pipeline::DimensionPipeline;
use crate::core::sampler::Sampler;
use crate::core::store::{StoreError, ThrottleStore};
use crate::core::threshold_adjuster::AdjustmentError;
use crate::core::throttle_config::{ConfigHandle, ConfigValidationError, ThrottleConfig};
use crate::models::{
    AdaptiveThrottlingStats, Baseline, Dimension, DimensionQuery, DimensionValues, EngineConfig,
    HistoryQuery, Page, ThrottleAdjustmentLog, TrafficSample,
};

/// Errors surfaced by engine operations
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Adaptive throttling is not configured")]
    NotConfigured,
    #[error("Invalid configuration: {0}")]
    Validation(#[from] ConfigValidationError),
    #[error("Invalid query: {0}")]
    InvalidQuery(String),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Adjustment error: {0}")]
    Adjustment(#[from] AdjustmentError),
}

impl EngineError {
    /// Store and publish failures leave state unchanged and can be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Store(_) => true,
            EngineError::Adjustment(e) => e.is_retryable(),
            _ => false,
        }
    }
}

pub struct AdaptiveEngine {
    config: ConfigHandle,
    /// Held across read, merge, persist and swap of every config write
    config_writes: Mutex<()>,
    settings: EngineConfig,
    store: Arc<dyn ThrottleStore>,
    sampler: Sampler,
    pipelines: DimensionValues<DimensionPipeline>,
}

impl AdaptiveEngine {
    pub fn new(
        store: Arc<dyn ThrottleStore>,
        source: Arc<dyn CounterSource>,
        settings: EngineConfig,
    ) -> Self {
        let now = Utc::now();
        let pipelines = DimensionValues::from_fn(|dimension| {
            DimensionPipeline::new(dimension, settings.initial_thresholds.get(dimension), now)
        });
        Self {
            config: ConfigHandle::new(),
            config_writes: Mutex::new(()),
            settings,
            store,
            sampler: Sampler::new(source),
            pipelines,
        }
    }

    /// Load the persisted config and published thresholds.
    ///
    /// A persisted threshold outside the current bounds is pulled back in
    /// and the correction logged.
    pub async fn bootstrap(&self) -> Result<(), EngineError> {
        match self.store.load_config().await? {
            Some(config) => match config.validate() {
                Ok(()) => {
                    info!("Loaded adaptive throttling config (enabled: {})", config.enabled);
                    self.config.replace(config);
                }
                Err(e) => warn!("Ignoring invalid persisted config: {}", e),
            },
            None => info!("No adaptive throttling config persisted yet"),
        }

        let config = self.config.snapshot();
        let now = Utc::now();
        for pipeline in self.pipelines() {
            let dimension = pipeline.dimension();
            let adjuster = pipeline.adjuster();
            match self.store.load_threshold(dimension).await? {
                Some(value) => adjuster.restore(value),
                None => {
                    let initial = self.settings.initial_thresholds.get(dimension);
                    adjuster.restore(config.clamp_threshold(initial));
                }
            }
            if let Err(e) = adjuster.enforce_bounds(&config, self.store.as_ref(), now).await {
                warn!("Could not re-clamp {} threshold at startup: {}", dimension, e);
            }
        }
        Ok(())
    }

    pub fn settings(&self) -> &EngineConfig {
        &self.settings
    }

    pub fn store(&self) -> &dyn ThrottleStore {
        self.store.as_ref()
    }

    /// Effective configuration (the disabled default when unconfigured)
    pub fn snapshot(&self) -> Arc<ThrottleConfig> {
        self.config.snapshot()
    }

    pub fn pipeline(&self, dimension: Dimension) -> &DimensionPipeline {
        self.pipelines.get(dimension)
    }

    fn pipelines(&self) -> impl Iterator<Item = &DimensionPipeline> {
        Dimension::ALL.into_iter().map(move |d| self.pipelines.get(d))
    }

    pub fn current_threshold(&self, dimension: Dimension) -> u64 {
        self.pipeline(dimension).adjuster().current()
    }

    pub fn get_config(&self) -> Result<Arc<ThrottleConfig>, EngineError> {
        self.config.configured().ok_or(EngineError::NotConfigured)
    }

    /// Validate, persist, then swap in a complete configuration
    pub async fn put_config(
        &self,
        config: ThrottleConfig,
        now: DateTime<Utc>,
    ) -> Result<Arc<ThrottleConfig>, EngineError> {
        let _writer = self.config_writes.lock().await;
        self.commit_config(config, now).await
    }

    /// Merge a partial document over the current (or default) config
    pub async fn patch_config(
        &self,
        patch: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<Arc<ThrottleConfig>, EngineError> {
        let _writer = self.config_writes.lock().await;
        let base = self.config.configured().unwrap_or_default();
        let merged = base.merged_with(patch)?;
        self.commit_config(merged, now).await
    }

    /// Caller holds `config_writes`
    async fn commit_config(
        &self,
        config: ThrottleConfig,
        now: DateTime<Utc>,
    ) -> Result<Arc<ThrottleConfig>, EngineError> {
        config.validate()?;
        self.store.save_config(&config).await?;
        self.config.replace(config);
        info!("Adaptive throttling config updated");

        let current = self.config.snapshot();
        self.apply_bounds(&current, now).await;
        Ok(current)
    }

    /// Remove the configuration, reverting to the disabled default
    pub async fn delete_config(&self) -> Result<(), EngineError> {
        let _writer = self.config_writes.lock().await;
        if self.config.configured().is_none() {
            return Err(EngineError::NotConfigured);
        }
        self.store.delete_config().await?;
        self.config.clear();
        info!("Adaptive throttling config removed");
        Ok(())
    }

    /// Pick up a config written by another instance sharing the store
    pub async fn reload_config(&self, now: DateTime<Utc>) -> Result<bool, EngineError> {
        let _writer = self.config_writes.lock().await;
        let persisted = self.store.load_config().await?;
        let current = self.config.configured();
        if persisted.as_ref() == current.as_deref() {
            return Ok(false);
        }

        match persisted {
            Some(config) => {
                config.validate()?;
                self.config.replace(config);
                info!("Reloaded adaptive throttling config from store");
                let current = self.config.snapshot();
                self.apply_bounds(&current, now).await;
            }
            None => {
                self.config.clear();
                info!("Adaptive throttling config removed from store");
            }
        }
        Ok(true)
    }

    async fn apply_bounds(&self, config: &ThrottleConfig, now: DateTime<Utc>) {
        for pipeline in self.pipelines() {
            // a failed re-clamp is retried on the next sampling tick
            let adjuster = pipeline.adjuster();
            if let Err(e) = adjuster.enforce_bounds(config, self.store.as_ref(), now).await {
                error!("Failed to re-clamp {} threshold: {}", pipeline.dimension(), e);
            }
        }
    }

    /// One sampler tick for `dimension`.
    ///
    /// A failed counter read skips the tick. Publish failures surface.
    pub async fn sample_tick(
        &self,
        dimension: Dimension,
        now: DateTime<Utc>,
    ) -> Result<Option<ThrottleAdjustmentLog>, EngineError> {
        let config = self.config.snapshot();
        if !config.enabled || !config.applies_to(dimension) {
            return Ok(None);
        }
        let sample = match self.sampler.sample(dimension, now).await {
            Ok(sample) => sample,
            Err(_) => return Ok(None),
        };
        let entry = self
            .pipeline(dimension)
            .tick(sample, &config, &self.settings.relax, self.store.as_ref())
            .await?;
        Ok(entry)
    }

    /// Recompute baselines out of cycle, then re-evaluate the latest sample.
    ///
    /// Without a dimension every applied dimension is recomputed. History
    /// is left untouched.
    pub async fn recalculate_baselines(
        &self,
        dimension: Option<Dimension>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Baseline>, EngineError> {
        let config = self.config.snapshot();
        let targets: Vec<Dimension> = match dimension {
            Some(d) => vec![d],
            None => Dimension::ALL
                .into_iter()
                .filter(|d| config.applies_to(*d))
                .collect(),
        };

        let mut baselines = Vec::new();
        for dimension in targets {
            let pipeline = self.pipeline(dimension);
            let Some(baseline) = pipeline.recalculate(&config, now).await else {
                continue;
            };
            if config.enabled {
                if let Some(latest) = pipeline.latest_sample().await {
                    let store = self.store.as_ref();
                    pipeline
                        .evaluate(latest.count, &config, &self.settings.relax, store, now)
                        .await?;
                }
            }
            baselines.push(baseline.as_ref().clone());
        }
        Ok(baselines)
    }

    /// Clear every dimension's history and baseline. Safe to repeat.
    pub async fn reset_learning(&self, now: DateTime<Utc>) {
        for pipeline in self.pipelines() {
            pipeline.reset(now).await;
        }
        info!("Learning reset for all dimensions");
    }

    pub async fn stats(&self, now: DateTime<Utc>) -> Result<AdaptiveThrottlingStats, EngineError> {
        let config = self.get_config()?;

        let since = now - Duration::hours(24);
        let recent_adjustments = self
            .store
            .list_logs()
            .await?
            .iter()
            .filter(|entry| entry.triggered_at >= since)
            .count();

        let mut dimensions = Vec::with_capacity(Dimension::ALL.len());
        let mut learning_started_at = None;
        for pipeline in self.pipelines() {
            dimensions.push(pipeline.stats(&config, now).await);
            let started = pipeline.learning_started_at().await;
            learning_started_at =
                Some(learning_started_at.map_or(started, |s: DateTime<Utc>| s.max(started)));
        }

        let learning_progress = match learning_started_at {
            Some(started) if config.learning_mode.learning_duration > 0 => {
                let elapsed = (now - started).num_seconds().max(0) as f64;
                (elapsed / config.learning_mode.learning_duration as f64 * 100.0).min(100.0)
            }
            _ => 0.0,
        };

        Ok(AdaptiveThrottlingStats {
            enabled: config.enabled,
            current_baseline: DimensionValues::from_fn(|d| {
                self.pipeline(d).baseline().map(|b| b.value)
            }),
            current_threshold: DimensionValues::from_fn(|d| self.current_threshold(d)),
            learning_progress,
            recent_adjustments,
            anomaly_detected: dimensions.iter().any(|d| d.anomaly_detected),
            last_update_time: now,
            dimensions,
        })
    }

    /// Traffic pattern history, newest first
    pub async fn patterns(&self, query: &HistoryQuery) -> Result<Page<TrafficSample>, EngineError> {
        let (page, page_size) = query.pagination().map_err(EngineError::InvalidQuery)?;
        let mut samples = Vec::new();
        for pipeline in self.pipelines() {
            if query.dimension.map_or(true, |d| d == pipeline.dimension()) {
                samples.extend(pipeline.samples(query).await);
            }
        }
        samples.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(Page::from_items(samples, page, page_size))
    }

    pub fn baselines(&self, query: &DimensionQuery) -> Vec<Baseline> {
        Dimension::ALL
            .into_iter()
            .filter(|d| query.dimension.map_or(true, |q| q == *d))
            .filter_map(|d| self.pipeline(d).baseline())
            .map(|b| b.as_ref().clone())
            .collect()
    }

    /// Adjustment log, newest first
    pub async fn logs(
        &self,
        query: &HistoryQuery,
    ) -> Result<Page<ThrottleAdjustmentLog>, EngineError> {
        let (page, page_size) = query.pagination().map_err(EngineError::InvalidQuery)?;
        let entries: Vec<ThrottleAdjustmentLog> = self
            .store
            .list_logs()
            .await?
            .into_iter()
            .filter(|entry| query.matches(entry.dimension, entry.triggered_at))
            .collect();
        Ok(Page::from_items(entries, page, page_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::counters::{CounterError, MockCounterSource};
    use crate::core::store::{MemoryStore, MockThrottleStore};
    use crate::core::throttle_config::CalculationMethod;
    use crate::models::{AdjustmentReason, DimensionPhase, TriggeredBy};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio_test::{assert_err, assert_ok};

    fn counter(value: Arc<AtomicU64>) -> Arc<dyn CounterSource> {
        let mut source = MockCounterSource::new();
        source
            .expect_read()
            .returning(move |_| Ok(value.load(Ordering::SeqCst)));
        Arc::new(source)
    }

    fn enabled_config() -> ThrottleConfig {
        let mut config = ThrottleConfig::default();
        config.enabled = true;
        config.learning_mode.min_samples = 10;
        config.baseline.calculation_method = CalculationMethod::Median;
        config.auto_adjustment.gradual_adjustment = false;
        config
    }

    fn engine_with(store: Arc<dyn ThrottleStore>, live: Arc<AtomicU64>) -> AdaptiveEngine {
        AdaptiveEngine::new(store, counter(live), EngineConfig::default())
    }

    async fn sample_n(engine: &AdaptiveEngine, start: DateTime<Utc>, n: i64) -> DateTime<Utc> {
        for i in 0..n {
            let at = start + Duration::seconds(i * 60);
            assert_ok!(engine.sample_tick(Dimension::Visit, at).await);
        }
        start + Duration::seconds(n * 60)
    }

    #[tokio::test]
    async fn test_learn_detect_adjust() {
        let store = Arc::new(MemoryStore::new(100));
        let live = Arc::new(AtomicU64::new(100));
        let engine = engine_with(store.clone(), live.clone());
        let start = Utc::now();
        engine.put_config(enabled_config(), start).await.unwrap();

        let now = sample_n(&engine, start, 20).await;
        let baselines = engine.recalculate_baselines(Some(Dimension::Visit), now).await.unwrap();
        assert_eq!(baselines.len(), 1);
        assert_eq!(baselines[0].value, 100.0);
        assert!(!baselines[0].provisional);

        live.store(250, Ordering::SeqCst);
        let entry = engine.sample_tick(Dimension::Visit, now).await.unwrap().unwrap();
        assert_eq!(entry.old_threshold, 100);
        assert_eq!(entry.new_threshold, 150);
        assert_eq!(entry.reason, AdjustmentReason::AnomalyDetected);
        assert_eq!(engine.current_threshold(Dimension::Visit), 150);
        assert_eq!(store.load_threshold(Dimension::Visit).await.unwrap(), Some(150));

        // still anomalous, but inside the cooldown
        let blocked = engine
            .sample_tick(Dimension::Visit, now + Duration::seconds(60))
            .await
            .unwrap();
        assert!(blocked.is_none());
        assert_eq!(engine.current_threshold(Dimension::Visit), 150);
    }

    #[tokio::test]
    async fn test_insufficient_samples_never_adjust() {
        let store = Arc::new(MemoryStore::new(100));
        let live = Arc::new(AtomicU64::new(10));
        let engine = engine_with(store.clone(), live.clone());
        let start = Utc::now();
        let mut config = enabled_config();
        config.learning_mode.min_samples = 100;
        engine.put_config(config, start).await.unwrap();

        let now = sample_n(&engine, start, 5).await;
        let baselines = engine.recalculate_baselines(None, now).await.unwrap();
        assert!(baselines[0].provisional);

        live.store(1_000_000, Ordering::SeqCst);
        for i in 0..10 {
            let result = engine
                .sample_tick(Dimension::Visit, now + Duration::seconds(i * 600))
                .await
                .unwrap();
            assert!(result.is_none());
        }
        assert_eq!(engine.current_threshold(Dimension::Visit), 100);
        assert!(store.list_logs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_adjustments_respect_cooldown_and_bounds() {
        let store = Arc::new(MemoryStore::new(1_000));
        let live = Arc::new(AtomicU64::new(100));
        let engine = engine_with(store.clone(), live.clone());
        let start = Utc::now();
        let mut config = enabled_config();
        config.auto_adjustment.max_threshold = 400;
        config.auto_adjustment.cooldown_period = 120;
        engine.put_config(config.clone(), start).await.unwrap();

        let now = sample_n(&engine, start, 20).await;
        engine.recalculate_baselines(None, now).await.unwrap();

        live.store(10_000, Ordering::SeqCst);
        for i in 0..30 {
            engine
                .sample_tick(Dimension::Visit, now + Duration::seconds(i * 30))
                .await
                .unwrap();
            let threshold = engine.current_threshold(Dimension::Visit);
            assert!((10..=400).contains(&threshold));
        }

        let mut logs = store.list_logs().await.unwrap();
        logs.reverse();
        assert!(!logs.is_empty());
        for pair in logs.windows(2) {
            assert!(pair[1].triggered_at - pair[0].triggered_at >= Duration::seconds(120));
        }
        assert_eq!(engine.current_threshold(Dimension::Visit), 400);
    }

    #[tokio::test]
    async fn test_reset_is_idempotent() {
        let store = Arc::new(MemoryStore::new(100));
        let engine = engine_with(store, Arc::new(AtomicU64::new(100)));
        let start = Utc::now();
        engine.put_config(enabled_config(), start).await.unwrap();
        let now = sample_n(&engine, start, 20).await;
        engine.recalculate_baselines(None, now).await.unwrap();

        for _ in 0..2 {
            engine.reset_learning(now).await;
            let stats = engine.stats(now).await.unwrap();
            for dimension in &stats.dimensions {
                assert_eq!(dimension.sample_count, 0);
                assert_eq!(dimension.phase, DimensionPhase::Learning);
                assert_eq!(dimension.baseline, None);
            }
            assert_eq!(stats.learning_progress, 0.0);
        }
        // config is untouched
        assert!(engine.get_config().unwrap().enabled);
    }

    #[tokio::test]
    async fn test_counter_failure_skips_tick() {
        let mut source = MockCounterSource::new();
        source
            .expect_read()
            .returning(|_| Err(CounterError::InvalidResponse("garbage".to_string())));
        let store = Arc::new(MemoryStore::new(10));
        let engine = AdaptiveEngine::new(store, Arc::new(source), EngineConfig::default());
        let now = Utc::now();
        engine.put_config(enabled_config(), now).await.unwrap();

        assert!(engine.sample_tick(Dimension::Visit, now).await.unwrap().is_none());
        assert_eq!(engine.pipeline(Dimension::Visit).sample_count(&enabled_config(), now).await, 0);
    }

    #[tokio::test]
    async fn test_disabled_or_unapplied_dimensions_are_not_sampled() {
        let mut source = MockCounterSource::new();
        source.expect_read().never();
        let store = Arc::new(MemoryStore::new(10));
        let engine = AdaptiveEngine::new(store, Arc::new(source), EngineConfig::default());
        let now = Utc::now();

        // unconfigured means disabled
        assert_ok!(engine.sample_tick(Dimension::Visit, now).await);

        engine.put_config(enabled_config(), now).await.unwrap();
        // error traffic is not applied by default
        assert_ok!(engine.sample_tick(Dimension::Error, now).await);
    }

    #[tokio::test]
    async fn test_config_lifecycle() {
        let store = Arc::new(MemoryStore::new(10));
        let engine = engine_with(store.clone(), Arc::new(AtomicU64::new(0)));
        let now = Utc::now();

        assert!(matches!(engine.get_config(), Err(EngineError::NotConfigured)));
        assert!(matches!(engine.stats(now).await, Err(EngineError::NotConfigured)));

        let mut invalid = enabled_config();
        invalid.learning_mode.sample_interval = 5;
        assert!(matches!(
            engine.put_config(invalid, now).await,
            Err(EngineError::Validation(_))
        ));
        assert!(store.load_config().await.unwrap().is_none());

        let patch = serde_json::json!({"enabled": true, "autoAdjustment": {"cooldownPeriod": 600}});
        let patched = engine.patch_config(patch, now).await.unwrap();
        assert!(patched.enabled);
        assert_eq!(patched.auto_adjustment.cooldown_period, 600);
        assert_eq!(patched.auto_adjustment.anomaly_threshold, 2.0);
        assert_eq!(store.load_config().await.unwrap().as_ref(), Some(patched.as_ref()));

        assert_ok!(engine.delete_config().await);
        assert!(!engine.snapshot().enabled);
        assert_err!(engine.delete_config().await);
    }

    /// Memory store whose config writes stall when they carry `slow_cooldown`
    struct StallingStore {
        inner: MemoryStore,
        slow_cooldown: u64,
    }

    #[async_trait]
    impl ThrottleStore for StallingStore {
        async fn load_config(&self) -> Result<Option<ThrottleConfig>, StoreError> {
            self.inner.load_config().await
        }

        async fn save_config(&self, config: &ThrottleConfig) -> Result<(), StoreError> {
            if config.auto_adjustment.cooldown_period == self.slow_cooldown {
                tokio::time::sleep(std::time::Duration::from_millis(150)).await;
            }
            self.inner.save_config(config).await
        }

        async fn delete_config(&self) -> Result<(), StoreError> {
            self.inner.delete_config().await
        }

        async fn load_threshold(&self, dimension: Dimension) -> Result<Option<u64>, StoreError> {
            self.inner.load_threshold(dimension).await
        }

        async fn commit_adjustment(&self, entry: &ThrottleAdjustmentLog) -> Result<(), StoreError> {
            self.inner.commit_adjustment(entry).await
        }

        async fn list_logs(&self) -> Result<Vec<ThrottleAdjustmentLog>, StoreError> {
            self.inner.list_logs().await
        }

        async fn ping(&self) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_concurrent_patches_keep_both_updates() {
        let store = Arc::new(StallingStore {
            inner: MemoryStore::new(10),
            slow_cooldown: 600,
        });
        let engine = Arc::new(engine_with(store.clone(), Arc::new(AtomicU64::new(0))));
        let now = Utc::now();

        let slow = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                let patch = serde_json::json!({"autoAdjustment": {"cooldownPeriod": 600}});
                engine.patch_config(patch, now).await
            })
        };
        // let the first patch reach the stalled save
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        engine
            .patch_config(serde_json::json!({"enabled": true}), now)
            .await
            .unwrap();
        slow.await.unwrap().unwrap();

        let current = engine.get_config().unwrap();
        assert!(current.enabled);
        assert_eq!(current.auto_adjustment.cooldown_period, 600);
        assert_eq!(store.load_config().await.unwrap().as_ref(), Some(current.as_ref()));
    }

    #[tokio::test]
    async fn test_bounds_change_reclamps_thresholds() {
        let store = Arc::new(MemoryStore::new(10));
        let engine = engine_with(store.clone(), Arc::new(AtomicU64::new(0)));
        let now = Utc::now();
        engine.put_config(enabled_config(), now).await.unwrap();
        assert_eq!(engine.current_threshold(Dimension::Error), 30);

        let mut tighter = enabled_config();
        tighter.auto_adjustment.min_threshold = 60;
        engine.put_config(tighter, now).await.unwrap();

        assert_eq!(engine.current_threshold(Dimension::Visit), 100);
        assert_eq!(engine.current_threshold(Dimension::Attack), 60);
        assert_eq!(engine.current_threshold(Dimension::Error), 60);
        let logs = store.list_logs().await.unwrap();
        assert_eq!(logs.len(), 2);
        assert!(logs.iter().all(|l| {
            l.reason == AdjustmentReason::BoundsChanged && l.triggered_by == TriggeredBy::Config
        }));
    }

    #[tokio::test]
    async fn test_bootstrap_restores_published_state() {
        let store = Arc::new(MemoryStore::new(10));
        let first = engine_with(store.clone(), Arc::new(AtomicU64::new(0)));
        let now = Utc::now();
        first.put_config(enabled_config(), now).await.unwrap();
        let mut tighter = enabled_config();
        tighter.auto_adjustment.min_threshold = 60;
        first.put_config(tighter, now).await.unwrap();

        let second = engine_with(store.clone(), Arc::new(AtomicU64::new(0)));
        second.bootstrap().await.unwrap();
        assert_eq!(second.get_config().unwrap().auto_adjustment.min_threshold, 60);
        assert_eq!(second.current_threshold(Dimension::Attack), 60);
        assert_eq!(second.current_threshold(Dimension::Visit), 100);
    }

    #[tokio::test]
    async fn test_reload_picks_up_external_changes() {
        let store = Arc::new(MemoryStore::new(10));
        let engine = engine_with(store.clone(), Arc::new(AtomicU64::new(0)));
        let now = Utc::now();
        assert!(!engine.reload_config(now).await.unwrap());

        store.save_config(&enabled_config()).await.unwrap();
        assert!(engine.reload_config(now).await.unwrap());
        assert!(engine.snapshot().enabled);
        assert!(!engine.reload_config(now).await.unwrap());

        store.delete_config().await.unwrap();
        assert!(engine.reload_config(now).await.unwrap());
        assert!(engine.get_config().is_err());
    }

    #[tokio::test]
    async fn test_recalculate_surfaces_publish_failure() {
        let mut store = MockThrottleStore::new();
        store.expect_save_config().returning(|_| Ok(()));
        store
            .expect_commit_adjustment()
            .returning(|_| Err(StoreError::Unavailable("redis down".to_string())));
        let live = Arc::new(AtomicU64::new(100));
        let engine = engine_with(Arc::new(store), live.clone());
        let start = Utc::now();
        engine.put_config(enabled_config(), start).await.unwrap();

        let now = sample_n(&engine, start, 20).await;
        engine.recalculate_baselines(None, now).await.unwrap();

        // a spike sampled before the next recalculation
        live.store(1_000, Ordering::SeqCst);
        let err = engine.sample_tick(Dimension::Visit, now).await.unwrap_err();
        assert!(err.is_retryable());
        let err = engine.recalculate_baselines(None, now).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(engine.current_threshold(Dimension::Visit), 100);
    }

    #[tokio::test]
    async fn test_history_queries() {
        let store = Arc::new(MemoryStore::new(10));
        let engine = engine_with(store, Arc::new(AtomicU64::new(7)));
        let start = Utc::now();
        engine.put_config(enabled_config(), start).await.unwrap();
        sample_n(&engine, start, 25).await;

        let query = HistoryQuery {
            dimension: Some(Dimension::Visit),
            page: Some(3),
            ..Default::default()
        };
        let page = engine.patterns(&query).await.unwrap();
        assert_eq!(page.total_count, 25);
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.results.len(), 5);
        assert_eq!(page.results[0].timestamp, start + Duration::seconds(4 * 60));

        let attack_only = HistoryQuery {
            dimension: Some(Dimension::Attack),
            ..Default::default()
        };
        assert_eq!(engine.patterns(&attack_only).await.unwrap().total_count, 0);

        let bad = HistoryQuery {
            page_size: Some(500),
            ..Default::default()
        };
        assert!(matches!(engine.patterns(&bad).await, Err(EngineError::InvalidQuery(_))));
        assert!(matches!(engine.logs(&bad).await, Err(EngineError::InvalidQuery(_))));
    }
}
