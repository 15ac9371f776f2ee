//! Anomaly detection against the learned baseline.
//!
//! A dimension is anomalous when its live counter exceeds
//! `baseline * anomalyThreshold`. Provisional baselines never trigger.

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::models::{Baseline, Dimension};

/// Severity of an anomaly relative to the configured multiplier
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Grade `magnitude / anomaly_threshold`
    pub fn from_ratio(ratio: f64) -> Self {
        if ratio < 1.5 {
            Severity::Low
        } else if ratio < 2.5 {
            Severity::Medium
        } else if ratio < 4.0 {
            Severity::High
        } else {
            Severity::Critical
        }
    }
}

/// Why detection produced no verdict
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Suppression {
    NoBaseline,
    ProvisionalBaseline,
    ZeroBaseline,
}

/// Outcome of comparing one live value to the baseline
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Detection {
    pub dimension: Dimension,
    pub live_value: u64,
    pub baseline_value: Option<f64>,
    /// `live / baseline`, when a usable baseline exists
    pub magnitude: Option<f64>,
    pub anomaly: bool,
    pub severity: Option<Severity>,
    pub suppressed: Option<Suppression>,
    pub detected_at: DateTime<Utc>,
}

impl Detection {
    /// Live traffic stayed below `baseline * calm_ratio`
    pub fn is_calm(&self, calm_ratio: f64) -> bool {
        self.suppressed.is_none() && self.magnitude.map_or(false, |m| m < calm_ratio)
    }
}

pub struct AnomalyDetector;

impl AnomalyDetector {
    pub fn detect(
        dimension: Dimension,
        live_value: u64,
        baseline: Option<&Baseline>,
        anomaly_threshold: f64,
        now: DateTime<Utc>,
    ) -> Detection {
        let mut detection = Detection {
            dimension,
            live_value,
            baseline_value: baseline.map(|b| b.value),
            magnitude: None,
            anomaly: false,
            severity: None,
            suppressed: None,
            detected_at: now,
        };

        let baseline = match baseline {
            None => {
                detection.suppressed = Some(Suppression::NoBaseline);
                return detection;
            }
            Some(b) if b.provisional => {
                detection.suppressed = Some(Suppression::ProvisionalBaseline);
                return detection;
            }
            Some(b) if b.value <= 0.0 => {
                detection.suppressed = Some(Suppression::ZeroBaseline);
                return detection;
            }
            Some(b) => b,
        };

        let live = live_value as f64;
        let magnitude = live / baseline.value;
        detection.magnitude = Some(magnitude);

        if live > baseline.value * anomaly_threshold {
            let severity = Severity::from_ratio(magnitude / anomaly_threshold);
            detection.anomaly = true;
            detection.severity = Some(severity);
            warn!(
                "Anomaly detected on {}: live {} vs baseline {:.2} (x{:.2}, {:?})",
                dimension, live_value, baseline.value, magnitude, severity
            );
        } else {
            debug!(
                "No anomaly on {}: live {} vs baseline {:.2}",
                dimension, live_value, baseline.value
            );
        }

        detection
    }
}
