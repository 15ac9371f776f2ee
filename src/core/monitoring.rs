//! Monitoring for the adaptive throttling service.
//!
//! Metric emission for every pipeline stage plus the health probe used by
//! the API. Metrics go through the `metrics` facade; without an installed
//! recorder they are no-ops.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::anomaly_detector::Severity;
use crate::core::store::ThrottleStore;
use crate::models::{Baseline, Dimension, ThrottleAdjustmentLog};

pub fn record_sample(dimension: Dimension, count: u64) {
    metrics::increment_counter!("adaptive_samples_total", "dimension" => dimension.as_str());
    metrics::gauge!("adaptive_live_count", count as f64, "dimension" => dimension.as_str());
}

pub fn record_sample_failure(dimension: Dimension) {
    metrics::increment_counter!(
        "adaptive_sample_failures_total",
        "dimension" => dimension.as_str()
    );
}

pub fn record_baseline(baseline: &Baseline, elapsed: Duration) {
    let dimension = baseline.dimension.as_str();
    metrics::gauge!("adaptive_baseline", baseline.value, "dimension" => dimension);
    metrics::histogram!(
        "adaptive_baseline_compute_seconds",
        elapsed.as_secs_f64(),
        "dimension" => dimension
    );
}

pub fn record_anomaly(dimension: Dimension, severity: Severity) {
    let severity = match severity {
        Severity::Low => "low",
        Severity::Medium => "medium",
        Severity::High => "high",
        Severity::Critical => "critical",
    };
    metrics::increment_counter!(
        "adaptive_anomalies_total",
        "dimension" => dimension.as_str(),
        "severity" => severity
    );
}

pub fn record_threshold(dimension: Dimension, value: u64) {
    metrics::gauge!("adaptive_threshold", value as f64, "dimension" => dimension.as_str());
}

pub fn record_adjustment(entry: &ThrottleAdjustmentLog) {
    metrics::increment_counter!(
        "adaptive_adjustments_total",
        "dimension" => entry.dimension.as_str(),
        "reason" => entry.reason.as_str()
    );
    record_threshold(entry.dimension, entry.new_threshold);
}

pub fn record_publish_failure(dimension: Dimension) {
    metrics::increment_counter!(
        "adaptive_publish_failures_total",
        "dimension" => dimension.as_str()
    );
}

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    pub version: String,
    pub store: String,
}

/// Probe the store; the service itself is up if this runs at all
pub async fn check_health(store: &dyn ThrottleStore) -> HealthReport {
    let (status, store_state) = match store.ping().await {
        Ok(()) => ("ok", "reachable".to_string()),
        Err(e) => ("degraded", format!("unreachable: {}", e)),
    };
    HealthReport {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        store: store_state,
    }
}
