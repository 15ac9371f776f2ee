//! Per-dimension pipeline.
//!
//! Visit, attack and error traffic each run an isolated instance of
//! [`DimensionPipeline`]: rolling history, current baseline, last detection
//! and the threshold adjuster. Nothing is shared between instances except
//! the config snapshot passed into each call.

use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use log::{debug, info};
use tokio::sync::RwLock;

use crate::core::anomaly_detector::{AnomalyDetector, Detection};
use crate::core::baseline::BaselineCalculator;
use crate::core::monitoring;
use crate::core::sampler::SampleHistory;
use crate::core::store::ThrottleStore;
use crate::core::threshold_adjuster::{AdjustmentError, AdjustmentRequest, ThresholdAdjuster};
use crate::core::throttle_config::ThrottleConfig;
use crate::models::{
    Baseline, Dimension, DimensionPhase, DimensionStats, HistoryQuery, RelaxConfig,
    ThrottleAdjustmentLog, TrafficSample,
};

pub struct DimensionPipeline {
    dimension: Dimension,
    history: RwLock<SampleHistory>,
    baseline: ArcSwapOption<Baseline>,
    detection: ArcSwapOption<Detection>,
    adjuster: ThresholdAdjuster,
}

impl DimensionPipeline {
    pub fn new(dimension: Dimension, initial_threshold: u64, now: DateTime<Utc>) -> Self {
        Self {
            dimension,
            history: RwLock::new(SampleHistory::new(now)),
            baseline: ArcSwapOption::empty(),
            detection: ArcSwapOption::empty(),
            adjuster: ThresholdAdjuster::new(dimension, initial_threshold),
        }
    }

    pub fn dimension(&self) -> Dimension {
        self.dimension
    }

    pub fn adjuster(&self) -> &ThresholdAdjuster {
        &self.adjuster
    }

    pub fn baseline(&self) -> Option<Arc<Baseline>> {
        self.baseline.load_full()
    }

    pub fn detection(&self) -> Option<Arc<Detection>> {
        self.detection.load_full()
    }

    /// Append a sample unless learning is frozen. Returns whether it was kept.
    pub async fn record(&self, sample: TrafficSample, config: &ThrottleConfig) -> bool {
        if !config.learning_mode.enabled {
            debug!("Learning frozen for {}, sample not kept", self.dimension);
            return false;
        }
        self.history.write().await.push(sample, config.history_window());
        true
    }

    /// Record one sample and evaluate it against the baseline
    pub async fn tick(
        &self,
        sample: TrafficSample,
        config: &ThrottleConfig,
        relax: &RelaxConfig,
        store: &dyn ThrottleStore,
    ) -> Result<Option<ThrottleAdjustmentLog>, AdjustmentError> {
        let now = sample.timestamp;
        let live = sample.count;
        self.record(sample, config).await;
        self.evaluate(live, config, relax, store, now).await
    }

    /// Run detection for `live` and, when warranted, one adjustment.
    ///
    /// Cooldown drops are not errors here; only publish failures surface.
    pub async fn evaluate(
        &self,
        live: u64,
        config: &ThrottleConfig,
        relax: &RelaxConfig,
        store: &dyn ThrottleStore,
        now: DateTime<Utc>,
    ) -> Result<Option<ThrottleAdjustmentLog>, AdjustmentError> {
        let baseline = self.baseline.load_full();
        let detection = AnomalyDetector::detect(
            self.dimension,
            live,
            baseline.as_deref(),
            config.auto_adjustment.anomaly_threshold,
            now,
        );
        if let Some(severity) = detection.severity {
            monitoring::record_anomaly(self.dimension, severity);
        }
        let detection = Arc::new(detection);
        self.detection.store(Some(Arc::clone(&detection)));

        if let Some(entry) = self.adjuster.enforce_bounds(config, store, now).await? {
            return Ok(Some(entry));
        }
        if !config.auto_adjustment.enabled {
            return Ok(None);
        }

        let request = if detection.anomaly {
            self.adjuster.observe_calm(false).await;
            AdjustmentRequest::raise(&detection)
        } else if relax.enabled {
            let streak = self
                .adjuster
                .observe_calm(detection.is_calm(relax.calm_ratio))
                .await;
            if streak < relax.calm_ticks {
                return Ok(None);
            }
            AdjustmentRequest::relax(&detection)
        } else {
            return Ok(None);
        };

        match self.adjuster.adjust(request, config, store, now).await {
            Ok(entry) => Ok(entry),
            Err(AdjustmentError::CooldownActive { .. }) | Err(AdjustmentError::Disabled) => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Recompute the baseline from the current history window.
    ///
    /// The history is only held for the copy and the final swap, so
    /// sampling continues while the statistics run. A reset in between
    /// discards the result.
    pub async fn recalculate(
        &self,
        config: &ThrottleConfig,
        now: DateTime<Utc>,
    ) -> Option<Arc<Baseline>> {
        let (counts, epoch) = {
            let history = self.history.read().await;
            (history.counts_within(now, config.history_window()), history.epoch())
        };

        let started = Instant::now();
        let computed =
            BaselineCalculator::calculate(self.dimension, &counts, config, now).map(Arc::new);

        let history = self.history.read().await;
        if history.epoch() != epoch {
            debug!("Discarding {} baseline computed across a reset", self.dimension);
            return None;
        }
        if let Some(baseline) = &computed {
            monitoring::record_baseline(baseline, started.elapsed());
            info!(
                "Recalculated {} baseline: {:.2} from {} samples{}",
                self.dimension,
                baseline.value,
                baseline.sample_size,
                if baseline.provisional { " (provisional)" } else { "" }
            );
        }
        self.baseline.store(computed.clone());
        drop(history);
        computed
    }

    /// Drop all samples and the baseline, restarting learning at `now`
    pub async fn reset(&self, now: DateTime<Utc>) {
        let mut history = self.history.write().await;
        history.clear(now);
        self.baseline.store(None);
        self.detection.store(None);
        drop(history);
        self.adjuster.reset().await;
    }

    pub async fn learning_started_at(&self) -> DateTime<Utc> {
        self.history.read().await.learning_started_at()
    }

    pub async fn latest_sample(&self) -> Option<TrafficSample> {
        self.history.read().await.latest().cloned()
    }

    pub async fn sample_count(&self, config: &ThrottleConfig, now: DateTime<Utc>) -> usize {
        self.history
            .read()
            .await
            .counts_within(now, config.history_window())
            .len()
    }

    /// Samples matching `query`, newest first
    pub async fn samples(&self, query: &HistoryQuery) -> Vec<TrafficSample> {
        self.history
            .read()
            .await
            .newest_first()
            .filter(|s| query.matches(s.dimension, s.timestamp))
            .cloned()
            .collect()
    }

    pub async fn phase(&self, config: &ThrottleConfig, now: DateTime<Utc>) -> DimensionPhase {
        let baseline = match self.baseline.load_full() {
            Some(b) if !b.provisional => b,
            _ => return DimensionPhase::Learning,
        };
        if self.adjuster.last_adjusted_at().await.is_some()
            && self.adjuster.cooldown_remaining(config, now).await > 0
        {
            return DimensionPhase::Adjusting;
        }
        match self.detection.load_full() {
            Some(d) if d.detected_at >= baseline.computed_at => DimensionPhase::Monitoring,
            _ => DimensionPhase::BaselineEstablished,
        }
    }

    pub async fn stats(&self, config: &ThrottleConfig, now: DateTime<Utc>) -> DimensionStats {
        let baseline = self.baseline.load_full();
        let detection = self.detection.load_full();
        DimensionStats {
            dimension: self.dimension,
            applied: config.applies_to(self.dimension),
            phase: self.phase(config, now).await,
            current_threshold: self.adjuster.current(),
            baseline: baseline.as_ref().map(|b| b.value),
            provisional: baseline.as_ref().map_or(false, |b| b.provisional),
            sample_count: self.sample_count(config, now).await,
            anomaly_detected: detection.as_ref().map_or(false, |d| d.anomaly),
            magnitude: detection.as_ref().and_then(|d| d.magnitude),
            severity: detection.as_ref().and_then(|d| d.severity),
            last_adjustment_at: self.adjuster.last_adjusted_at().await,
            cooldown_remaining: self.adjuster.cooldown_remaining(config, now).await,
        }
    }
}
