//! Threshold adjustment.
//!
//! Each dimension owns one [`ThresholdAdjuster`]. It holds the threshold
//! last published to the flow controller and serializes every change to
//! it: cooldown check, target computation, store commit, then the
//! in-memory update. Reads of the published threshold are lock-free.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use log::{debug, error, info};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::core::anomaly_detector::Detection;
use crate::core::monitoring;
use crate::core::store::{StoreError, ThrottleStore};
use crate::core::throttle_config::{AutoAdjustmentConfig, ThrottleConfig};
use crate::models::{AdjustmentReason, Dimension, ThrottleAdjustmentLog, TriggeredBy};
use crate::utils::remaining_seconds;

/// Errors that can occur while adjusting a threshold
#[derive(Error, Debug)]
pub enum AdjustmentError {
    #[error("automatic adjustment is disabled")]
    Disabled,
    #[error("cooldown active, {remaining_secs}s remaining")]
    CooldownActive { remaining_secs: u64 },
    #[error("failed to publish threshold: {0}")]
    Publish(#[from] StoreError),
}

impl AdjustmentError {
    /// Publish failures leave state untouched and may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, AdjustmentError::Publish(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Raise,
    Relax,
}

/// Inputs recorded alongside an adjustment
#[derive(Debug, Clone)]
pub struct AdjustmentRequest {
    pub direction: Direction,
    pub reason: AdjustmentReason,
    pub baseline_value: Option<f64>,
    pub live_value: Option<u64>,
    pub magnitude: Option<f64>,
}

impl AdjustmentRequest {
    pub fn raise(detection: &Detection) -> Self {
        Self {
            direction: Direction::Raise,
            reason: AdjustmentReason::AnomalyDetected,
            baseline_value: detection.baseline_value,
            live_value: Some(detection.live_value),
            magnitude: detection.magnitude,
        }
    }

    pub fn relax(detection: &Detection) -> Self {
        Self {
            direction: Direction::Relax,
            reason: AdjustmentReason::SustainedCalm,
            baseline_value: detection.baseline_value,
            live_value: Some(detection.live_value),
            magnitude: detection.magnitude,
        }
    }
}

const ROUNDING_SLACK: f64 = 1e-9;

/// Next threshold for one adjustment cycle.
///
/// The target is `current * adjustmentFactor` when raising and
/// `current / adjustmentFactor` when relaxing, clamped to the configured
/// bounds. Gradual mode moves only `adjustmentStepRatio` of the way there.
/// Upward moves round up and downward moves round down so every cycle
/// makes progress until the target is reached.
pub fn next_threshold(current: u64, direction: Direction, auto: &AutoAdjustmentConfig) -> u64 {
    let min = auto.min_threshold as f64;
    let max = auto.max_threshold as f64;
    let current_f = current as f64;

    let target = match direction {
        Direction::Raise => current_f * auto.adjustment_factor,
        Direction::Relax => current_f / auto.adjustment_factor,
    }
    .clamp(min, max);

    let next = if auto.gradual_adjustment {
        current_f + (target - current_f) * auto.adjustment_step_ratio
    } else {
        target
    };

    let rounded = if next > current_f {
        (next - ROUNDING_SLACK).ceil()
    } else {
        (next + ROUNDING_SLACK).floor()
    };
    (rounded.max(0.0) as u64).clamp(auto.min_threshold, auto.max_threshold)
}

#[derive(Debug, Default)]
struct AdjusterState {
    last_adjusted_at: Option<DateTime<Utc>>,
    calm_streak: u32,
}

/// Published threshold and cooldown bookkeeping for one dimension
pub struct ThresholdAdjuster {
    dimension: Dimension,
    published: AtomicU64,
    state: Mutex<AdjusterState>,
}

impl ThresholdAdjuster {
    pub fn new(dimension: Dimension, initial: u64) -> Self {
        Self {
            dimension,
            published: AtomicU64::new(initial),
            state: Mutex::new(AdjusterState::default()),
        }
    }

    /// Threshold currently published to the flow controller
    pub fn current(&self) -> u64 {
        self.published.load(Ordering::Acquire)
    }

    /// Adopt a value already present in the store
    pub fn restore(&self, value: u64) {
        self.published.store(value, Ordering::Release);
        monitoring::record_threshold(self.dimension, value);
    }

    pub async fn last_adjusted_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().await.last_adjusted_at
    }

    /// Seconds until the next adjustment is allowed
    pub async fn cooldown_remaining(&self, config: &ThrottleConfig, now: DateTime<Utc>) -> u64 {
        self.state
            .lock()
            .await
            .last_adjusted_at
            .map_or(0, |last| remaining_seconds(last, config.cooldown(), now))
    }

    /// Track consecutive calm ticks, returning the current streak
    pub async fn observe_calm(&self, calm: bool) -> u32 {
        let mut state = self.state.lock().await;
        state.calm_streak = if calm { state.calm_streak.saturating_add(1) } else { 0 };
        state.calm_streak
    }

    /// Forget calm tracking. The published threshold and the cooldown survive.
    pub async fn reset(&self) {
        self.state.lock().await.calm_streak = 0;
    }

    /// Apply one cooldown-gated adjustment.
    ///
    /// Returns `Ok(None)` when the computed threshold equals the current
    /// one. On a publish failure nothing changes in memory.
    pub async fn adjust(
        &self,
        request: AdjustmentRequest,
        config: &ThrottleConfig,
        store: &dyn ThrottleStore,
        now: DateTime<Utc>,
    ) -> Result<Option<ThrottleAdjustmentLog>, AdjustmentError> {
        if !config.auto_adjustment.enabled {
            return Err(AdjustmentError::Disabled);
        }

        let mut state = self.state.lock().await;
        if let Some(last) = state.last_adjusted_at {
            let remaining_secs = remaining_seconds(last, config.cooldown(), now);
            if remaining_secs > 0 {
                debug!(
                    "Dropping {:?} for {}: cooldown active ({}s left)",
                    request.direction, self.dimension, remaining_secs
                );
                return Err(AdjustmentError::CooldownActive { remaining_secs });
            }
        }

        let old = self.current();
        let new = next_threshold(old, request.direction, &config.auto_adjustment);
        if new == old {
            debug!("Threshold for {} already at {}, nothing to adjust", self.dimension, old);
            return Ok(None);
        }

        let entry = ThrottleAdjustmentLog {
            id: Uuid::new_v4().to_string(),
            dimension: self.dimension,
            old_threshold: old,
            new_threshold: new,
            baseline_value: request.baseline_value,
            live_value: request.live_value,
            magnitude: request.magnitude,
            adjustment_ratio: ratio(old, new),
            reason: request.reason,
            triggered_by: TriggeredBy::Auto,
            triggered_at: now,
        };
        self.commit(&mut state, entry, store, now).await.map(Some)
    }

    /// Pull the published threshold back inside `[minThreshold, maxThreshold]`.
    ///
    /// Runs regardless of cooldown, and starts one when it moves the value.
    pub async fn enforce_bounds(
        &self,
        config: &ThrottleConfig,
        store: &dyn ThrottleStore,
        now: DateTime<Utc>,
    ) -> Result<Option<ThrottleAdjustmentLog>, AdjustmentError> {
        let mut state = self.state.lock().await;
        let old = self.current();
        let new = config.clamp_threshold(old);
        if new == old {
            return Ok(None);
        }

        let entry = ThrottleAdjustmentLog {
            id: Uuid::new_v4().to_string(),
            dimension: self.dimension,
            old_threshold: old,
            new_threshold: new,
            baseline_value: None,
            live_value: None,
            magnitude: None,
            adjustment_ratio: ratio(old, new),
            reason: AdjustmentReason::BoundsChanged,
            triggered_by: TriggeredBy::Config,
            triggered_at: now,
        };
        self.commit(&mut state, entry, store, now).await.map(Some)
    }

    async fn commit(
        &self,
        state: &mut AdjusterState,
        entry: ThrottleAdjustmentLog,
        store: &dyn ThrottleStore,
        now: DateTime<Utc>,
    ) -> Result<ThrottleAdjustmentLog, AdjustmentError> {
        if let Err(e) = store.commit_adjustment(&entry).await {
            error!(
                "Failed to publish {} threshold {} -> {}: {}",
                self.dimension, entry.old_threshold, entry.new_threshold, e
            );
            monitoring::record_publish_failure(self.dimension);
            return Err(AdjustmentError::Publish(e));
        }

        self.published.store(entry.new_threshold, Ordering::Release);
        state.last_adjusted_at = Some(now);
        state.calm_streak = 0;

        info!(
            "Adjusted {} threshold {} -> {} ({})",
            self.dimension,
            entry.old_threshold,
            entry.new_threshold,
            entry.reason.as_str()
        );
        monitoring::record_adjustment(&entry);
        Ok(entry)
    }
}

fn ratio(old: u64, new: u64) -> f64 {
    if old == 0 {
        0.0
    } else {
        new as f64 / old as f64
    }
}
