//! Runtime configuration of the adaptive throttling engine.
//!
//! `ThrottleConfig` is the process-wide document administered over the
//! REST API. Readers take an immutable snapshot from [`ConfigHandle`];
//! writers validate a complete new document and swap it in atomically.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

use crate::models::Dimension;

/// A single out-of-range or inconsistent field
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldViolation {
    pub field: String,
    pub message: String,
}

/// Rejected configuration; the active configuration is left unchanged
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigValidationError {
    #[error("invalid configuration: {} field(s) rejected", .0.len())]
    OutOfRange(Vec<FieldViolation>),
    #[error("malformed configuration: {0}")]
    Malformed(String),
}

impl ConfigValidationError {
    pub fn violations(&self) -> Vec<FieldViolation> {
        match self {
            ConfigValidationError::OutOfRange(violations) => violations.clone(),
            ConfigValidationError::Malformed(message) => vec![FieldViolation {
                field: "body".to_string(),
                message: message.clone(),
            }],
        }
    }
}

/// Record metadata a client may echo back from a previous read
const ECHOED_FIELDS: [&str; 3] = ["id", "createdAt", "updatedAt"];

/// Write whole floats as integers (`2` rather than `2.0`), the way
/// browser clients send them.
fn compact_float<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 9_007_199_254_740_992.0 {
        serializer.serialize_i64(*value as i64)
    } else {
        serializer.serialize_f64(*value)
    }
}

/// Baseline calculation method
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CalculationMethod {
    Mean,
    Median,
    Percentile,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LearningModeConfig {
    pub enabled: bool,
    /// Seconds
    pub learning_duration: u64,
    /// Seconds
    pub sample_interval: u64,
    pub min_samples: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BaselineConfig {
    pub calculation_method: CalculationMethod,
    /// 0-100, used by the percentile method
    pub percentile: u64,
    /// Seconds
    pub update_interval: u64,
    /// Seconds
    pub history_window: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AutoAdjustmentConfig {
    pub enabled: bool,
    /// Multiplier over the baseline that counts as anomalous
    #[serde(serialize_with = "compact_float")]
    pub anomaly_threshold: f64,
    pub min_threshold: u64,
    pub max_threshold: u64,
    #[serde(serialize_with = "compact_float")]
    pub adjustment_factor: f64,
    /// Seconds
    pub cooldown_period: u64,
    pub gradual_adjustment: bool,
    #[serde(serialize_with = "compact_float")]
    pub adjustment_step_ratio: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ApplyToConfig {
    pub visit_limit: bool,
    pub attack_limit: bool,
    pub error_limit: bool,
}

/// Adaptive throttling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ThrottleConfig {
    pub enabled: bool,
    pub learning_mode: LearningModeConfig,
    pub baseline: BaselineConfig,
    pub auto_adjustment: AutoAdjustmentConfig,
    pub apply_to: ApplyToConfig,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            learning_mode: LearningModeConfig {
                enabled: true,
                learning_duration: 86_400,
                sample_interval: 60,
                min_samples: 100,
            },
            baseline: BaselineConfig {
                calculation_method: CalculationMethod::Percentile,
                percentile: 95,
                update_interval: 3_600,
                history_window: 604_800,
            },
            auto_adjustment: AutoAdjustmentConfig {
                enabled: true,
                anomaly_threshold: 2.0,
                min_threshold: 10,
                max_threshold: 10_000,
                adjustment_factor: 1.5,
                cooldown_period: 300,
                gradual_adjustment: true,
                adjustment_step_ratio: 0.1,
            },
            apply_to: ApplyToConfig {
                visit_limit: true,
                attack_limit: true,
                error_limit: false,
            },
        }
    }
}

fn check_int(violations: &mut Vec<FieldViolation>, field: &str, value: u64, min: u64, max: u64) {
    if value < min || value > max {
        violations.push(FieldViolation {
            field: field.to_string(),
            message: format!("must be between {} and {}, got {}", min, max, value),
        });
    }
}

fn check_float(violations: &mut Vec<FieldViolation>, field: &str, value: f64, min: f64, max: f64) {
    if !value.is_finite() || value < min || value > max {
        violations.push(FieldViolation {
            field: field.to_string(),
            message: format!("must be between {} and {}, got {}", min, max, value),
        });
    }
}

impl ThrottleConfig {
    /// Check every numeric range accepted at the API boundary
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        let mut v = Vec::new();
        let lm = &self.learning_mode;
        check_int(&mut v, "learningMode.learningDuration", lm.learning_duration, 3_600, 604_800);
        check_int(&mut v, "learningMode.sampleInterval", lm.sample_interval, 10, 3_600);
        check_int(&mut v, "learningMode.minSamples", lm.min_samples, 10, 10_000);

        let b = &self.baseline;
        check_int(&mut v, "baseline.percentile", b.percentile, 0, 100);
        check_int(&mut v, "baseline.updateInterval", b.update_interval, 60, 86_400);
        check_int(&mut v, "baseline.historyWindow", b.history_window, 86_400, 2_592_000);

        let a = &self.auto_adjustment;
        check_float(&mut v, "autoAdjustment.anomalyThreshold", a.anomaly_threshold, 1.0, 10.0);
        check_int(&mut v, "autoAdjustment.minThreshold", a.min_threshold, 1, 1_000);
        check_int(&mut v, "autoAdjustment.maxThreshold", a.max_threshold, 100, 100_000);
        check_float(&mut v, "autoAdjustment.adjustmentFactor", a.adjustment_factor, 1.0, 5.0);
        check_int(&mut v, "autoAdjustment.cooldownPeriod", a.cooldown_period, 60, 3_600);
        let step = a.adjustment_step_ratio;
        check_float(&mut v, "autoAdjustment.adjustmentStepRatio", step, 0.01, 1.0);
        if a.min_threshold > a.max_threshold {
            v.push(FieldViolation {
                field: "autoAdjustment.minThreshold".to_string(),
                message: format!(
                    "must not exceed maxThreshold ({} > {})",
                    a.min_threshold, a.max_threshold
                ),
            });
        }

        if v.is_empty() {
            Ok(())
        } else {
            Err(ConfigValidationError::OutOfRange(v))
        }
    }

    pub fn applies_to(&self, dimension: Dimension) -> bool {
        match dimension {
            Dimension::Visit => self.apply_to.visit_limit,
            Dimension::Attack => self.apply_to.attack_limit,
            Dimension::Error => self.apply_to.error_limit,
        }
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.learning_mode.sample_interval)
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.baseline.update_interval)
    }

    pub fn history_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.baseline.history_window as i64)
    }

    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.auto_adjustment.cooldown_period as i64)
    }

    pub fn clamp_threshold(&self, value: u64) -> u64 {
        value.clamp(
            self.auto_adjustment.min_threshold,
            self.auto_adjustment.max_threshold,
        )
    }

    /// Parse a complete document as submitted by a client.
    ///
    /// Echoed `id`/`createdAt`/`updatedAt` keys are dropped; any other
    /// unknown key is rejected.
    pub fn from_document(
        document: serde_json::Value,
    ) -> Result<ThrottleConfig, ConfigValidationError> {
        let document = strip_echoed_fields(document)?;
        serde_json::from_value(document)
            .map_err(|e| ConfigValidationError::Malformed(e.to_string()))
    }

    /// Merge a partial JSON document over this config and validate the result
    pub fn merged_with(
        &self,
        patch: serde_json::Value,
    ) -> Result<ThrottleConfig, ConfigValidationError> {
        let patch = strip_echoed_fields(patch)?;
        let mut document = serde_json::to_value(self)
            .map_err(|e| ConfigValidationError::Malformed(e.to_string()))?;
        merge_json(&mut document, patch);
        let merged = Self::from_document(document)?;
        merged.validate()?;
        Ok(merged)
    }
}

fn strip_echoed_fields(
    document: serde_json::Value,
) -> Result<serde_json::Value, ConfigValidationError> {
    match document {
        serde_json::Value::Object(mut fields) => {
            for key in ECHOED_FIELDS {
                fields.remove(key);
            }
            Ok(serde_json::Value::Object(fields))
        }
        _ => Err(ConfigValidationError::Malformed(
            "configuration body must be a JSON object".to_string(),
        )),
    }
}

fn merge_json(target: &mut serde_json::Value, patch: serde_json::Value) {
    match (target, patch) {
        (serde_json::Value::Object(target), serde_json::Value::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (target, patch) => *target = patch,
    }
}

/// Read-mostly holder of the active configuration.
///
/// `None` means "not yet configured"; readers then see the disabled default.
pub struct ConfigHandle {
    current: ArcSwapOption<ThrottleConfig>,
    fallback: Arc<ThrottleConfig>,
}

impl ConfigHandle {
    pub fn new() -> Self {
        Self {
            current: ArcSwapOption::empty(),
            fallback: Arc::new(ThrottleConfig::default()),
        }
    }

    /// Effective configuration for the hot path
    pub fn snapshot(&self) -> Arc<ThrottleConfig> {
        self.current
            .load_full()
            .unwrap_or_else(|| Arc::clone(&self.fallback))
    }

    /// Configuration explicitly written by an administrator, if any
    pub fn configured(&self) -> Option<Arc<ThrottleConfig>> {
        self.current.load_full()
    }

    pub fn replace(&self, config: ThrottleConfig) -> Option<Arc<ThrottleConfig>> {
        self.current.swap(Some(Arc::new(config)))
    }

    pub fn clear(&self) -> Option<Arc<ThrottleConfig>> {
        self.current.swap(None)
    }
}

impl Default for ConfigHandle {
    fn default() -> Self {
        Self::new()
    }
}
