//! Baseline calculation.
//!
//! Turns the samples inside the history window into a single "normal"
//! value per dimension using the configured method.

use chrono::{DateTime, Utc};
use log::debug;

use crate::core::throttle_config::{CalculationMethod, ThrottleConfig};
use crate::models::{Baseline, Dimension};

/// Arithmetic mean; 0 for an empty slice
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Median of an ascending slice; even lengths average the two middle values
pub fn median(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return 0.0;
    }
    let mid = n / 2;
    if n % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Percentile of an ascending slice, interpolating linearly between
/// the order statistics around rank `p / 100 * (n - 1)`
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return 0.0;
    }
    let rank = (p.clamp(0.0, 100.0) / 100.0) * (n - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        return sorted[lower];
    }
    sorted[lower] + (sorted[upper] - sorted[lower]) * (rank - lower as f64)
}

/// Population standard deviation around `center`
pub fn std_dev(values: &[f64], center: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let variance = values.iter().map(|v| (v - center).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

/// Computes baselines from raw sample counts
pub struct BaselineCalculator;

impl BaselineCalculator {
    /// Build a baseline from the counts of one dimension's history window.
    ///
    /// Idle windows (count 0) carry no rate information and are skipped.
    /// Returns `None` when nothing is left; a result backed by fewer than
    /// `learningMode.minSamples` values is marked provisional.
    pub fn calculate(
        dimension: Dimension,
        counts: &[u64],
        config: &ThrottleConfig,
        now: DateTime<Utc>,
    ) -> Option<Baseline> {
        let mut values: Vec<f64> = counts
            .iter()
            .filter(|&&c| c > 0)
            .map(|&c| c as f64)
            .collect();
        if values.is_empty() {
            debug!("No non-idle samples for {} baseline", dimension);
            return None;
        }
        values.sort_by(|a, b| a.total_cmp(b));

        let method = config.baseline.calculation_method;
        let value = match method {
            CalculationMethod::Mean => mean(&values),
            CalculationMethod::Median => median(&values),
            CalculationMethod::Percentile => percentile(&values, config.baseline.percentile as f64),
        };

        let min_samples = config.learning_mode.min_samples.max(1);
        let sample_size = values.len();
        let confidence_level = (sample_size as f64 / (min_samples * 10) as f64).min(1.0);

        Some(Baseline {
            dimension,
            value,
            method,
            percentile: (method == CalculationMethod::Percentile)
                .then_some(config.baseline.percentile),
            sample_size,
            std_dev: std_dev(&values, value),
            confidence_level,
            provisional: (sample_size as u64) < min_samples,
            computed_at: now,
        })
    }
}
