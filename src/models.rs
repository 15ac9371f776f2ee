use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::anomaly_detector::Severity;
use crate::core::throttle_config::CalculationMethod;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
}

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    pub url: String,
    /// Prefix for every key this service owns
    pub key_prefix: String,
    /// Upper bound for a single Redis round trip (milliseconds)
    pub timeout_ms: u64,
}

/// Where thresholds, logs and the runtime config are persisted
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Redis,
    Memory,
}

/// Store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Storage backend
    pub backend: StoreBackend,
    /// Number of adjustment log entries kept
    pub log_retention: usize,
}

/// Where live counters are read from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CounterSourceKind {
    Redis,
    Http,
}

/// Counter source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterConfig {
    /// Counter source type
    pub source: CounterSourceKind,
    /// Redis key prefix of the flow controller's window counters
    pub key_prefix: String,
    /// Flow controller counters endpoint
    pub http_url: String,
    /// Request timeout (milliseconds)
    pub timeout_ms: u64,
}

/// Thresholds used when nothing has been published yet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitialThresholds {
    pub visit: u64,
    pub attack: u64,
    pub error: u64,
}

impl InitialThresholds {
    pub fn get(&self, dimension: Dimension) -> u64 {
        match dimension {
            Dimension::Visit => self.visit,
            Dimension::Attack => self.attack,
            Dimension::Error => self.error,
        }
    }
}

/// Downward relaxation during sustained calm periods
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaxConfig {
    /// Whether thresholds may move down at all
    pub enabled: bool,
    /// Live traffic below `baseline * calm_ratio` counts as calm
    pub calm_ratio: f64,
    /// Consecutive calm ticks required before relaxing
    pub calm_ticks: u32,
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Thresholds used before the first publication
    pub initial_thresholds: InitialThresholds,
    /// Interval for re-reading the persisted runtime config (0 disables)
    pub config_reload_seconds: u64,
    /// Relaxation settings
    pub relax: RelaxConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            initial_thresholds: InitialThresholds {
                visit: 100,
                attack: 50,
                error: 30,
            },
            config_reload_seconds: 30,
            relax: RelaxConfig {
                enabled: false,
                calm_ratio: 0.5,
                calm_ticks: 10,
            },
        }
    }
}

/// Monitoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Whether to install the Prometheus recorder
    pub metrics_enabled: bool,
}

/// Application configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Redis configuration
    pub redis: RedisConfig,
    /// Store configuration
    pub store: StoreConfig,
    /// Counter source configuration
    pub counters: CounterConfig,
    /// Engine configuration
    pub engine: EngineConfig,
    /// Monitoring configuration
    pub monitoring: MonitoringConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            redis: RedisConfig {
                url: "redis://127.0.0.1:6379".to_string(),
                key_prefix: "adaptive_throttling".to_string(),
                timeout_ms: 500,
            },
            store: StoreConfig {
                backend: StoreBackend::Redis,
                log_retention: 10_000,
            },
            counters: CounterConfig {
                source: CounterSourceKind::Redis,
                key_prefix: "flow_control:window".to_string(),
                http_url: "http://127.0.0.1:9090/counters".to_string(),
                timeout_ms: 500,
            },
            engine: EngineConfig::default(),
            monitoring: MonitoringConfig {
                metrics_enabled: true,
            },
        }
    }
}

/// Traffic dimension, each with its own pipeline and threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dimension {
    Visit,
    Attack,
    Error,
}

impl Dimension {
    pub const ALL: [Dimension; 3] = [Dimension::Visit, Dimension::Attack, Dimension::Error];

    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::Visit => "visit",
            Dimension::Attack => "attack",
            Dimension::Error => "error",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One counter measurement
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrafficSample {
    pub dimension: Dimension,
    pub timestamp: DateTime<Utc>,
    pub count: u64,
}

/// Learned "normal" traffic level for a dimension
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Baseline {
    pub dimension: Dimension,
    pub value: f64,
    pub method: CalculationMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percentile: Option<u64>,
    pub sample_size: usize,
    pub std_dev: f64,
    pub confidence_level: f64,
    /// Fewer than `minSamples` samples backed this value
    pub provisional: bool,
    pub computed_at: DateTime<Utc>,
}

/// Why a threshold moved
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentReason {
    AnomalyDetected,
    SustainedCalm,
    BoundsChanged,
}

impl AdjustmentReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdjustmentReason::AnomalyDetected => "anomaly_detected",
            AdjustmentReason::SustainedCalm => "sustained_calm",
            AdjustmentReason::BoundsChanged => "bounds_changed",
        }
    }
}

/// What initiated an adjustment
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TriggeredBy {
    Auto,
    Config,
}

/// Append-only audit record of a threshold change
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ThrottleAdjustmentLog {
    pub id: String,
    pub dimension: Dimension,
    pub old_threshold: u64,
    pub new_threshold: u64,
    pub baseline_value: Option<f64>,
    pub live_value: Option<u64>,
    pub magnitude: Option<f64>,
    pub adjustment_ratio: f64,
    pub reason: AdjustmentReason,
    pub triggered_by: TriggeredBy,
    pub triggered_at: DateTime<Utc>,
}

/// Per-dimension lifecycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DimensionPhase {
    Learning,
    BaselineEstablished,
    Monitoring,
    Adjusting,
}

/// One value per dimension, serialized as `{visit, attack, error}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DimensionValues<T> {
    pub visit: T,
    pub attack: T,
    pub error: T,
}

impl<T> DimensionValues<T> {
    pub fn from_fn(mut f: impl FnMut(Dimension) -> T) -> Self {
        Self {
            visit: f(Dimension::Visit),
            attack: f(Dimension::Attack),
            error: f(Dimension::Error),
        }
    }

    pub fn get(&self, dimension: Dimension) -> &T {
        match dimension {
            Dimension::Visit => &self.visit,
            Dimension::Attack => &self.attack,
            Dimension::Error => &self.error,
        }
    }
}

/// Detailed state of one dimension pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DimensionStats {
    pub dimension: Dimension,
    pub applied: bool,
    pub phase: DimensionPhase,
    pub current_threshold: u64,
    pub baseline: Option<f64>,
    pub provisional: bool,
    pub sample_count: usize,
    pub anomaly_detected: bool,
    pub magnitude: Option<f64>,
    pub severity: Option<Severity>,
    pub last_adjustment_at: Option<DateTime<Utc>>,
    pub cooldown_remaining: u64,
}

/// Derived, read-only view over the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdaptiveThrottlingStats {
    pub enabled: bool,
    pub current_baseline: DimensionValues<Option<f64>>,
    pub current_threshold: DimensionValues<u64>,
    pub learning_progress: f64,
    pub recent_adjustments: usize,
    pub anomaly_detected: bool,
    pub last_update_time: DateTime<Utc>,
    pub dimensions: Vec<DimensionStats>,
}

pub const DEFAULT_PAGE_SIZE: usize = 10;
pub const MAX_PAGE_SIZE: usize = 100;

/// Filter and pagination for history listings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    #[serde(rename = "type")]
    pub dimension: Option<Dimension>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub page: Option<usize>,
    pub page_size: Option<usize>,
}

impl HistoryQuery {
    /// Resolve `(page, page_size)`, rejecting out-of-range values
    pub fn pagination(&self) -> Result<(usize, usize), String> {
        let page = self.page.unwrap_or(1);
        if page < 1 {
            return Err("page must be at least 1".to_string());
        }
        let page_size = self.page_size.unwrap_or(DEFAULT_PAGE_SIZE);
        if !(1..=MAX_PAGE_SIZE).contains(&page_size) {
            return Err(format!("pageSize must be between 1 and {}", MAX_PAGE_SIZE));
        }
        Ok((page, page_size))
    }

    pub fn matches(&self, dimension: Dimension, at: DateTime<Utc>) -> bool {
        self.dimension.map_or(true, |d| d == dimension)
            && self.start_time.map_or(true, |start| at >= start)
            && self.end_time.map_or(true, |end| at <= end)
    }
}

/// Optional dimension filter
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DimensionQuery {
    #[serde(rename = "type")]
    pub dimension: Option<Dimension>,
}

/// One page of results
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub results: Vec<T>,
    pub total_count: usize,
    pub current_page: usize,
    pub page_size: usize,
    pub total_pages: usize,
}

impl<T> Page<T> {
    pub fn from_items(items: Vec<T>, page: usize, page_size: usize) -> Self {
        let total_count = items.len();
        let total_pages = (total_count + page_size - 1) / page_size;
        let results = items
            .into_iter()
            .skip((page - 1) * page_size)
            .take(page_size)
            .collect();
        Self {
            results,
            total_count,
            current_page: page,
            page_size,
            total_pages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_page_slicing() {
        let page = Page::from_items((1..=23).collect::<Vec<_>>(), 3, 10);
        assert_eq!(page.results, vec![21, 22, 23]);
        assert_eq!(page.total_count, 23);
        assert_eq!(page.total_pages, 3);

        let empty = Page::from_items((1..=5).collect::<Vec<_>>(), 4, 10);
        assert!(empty.results.is_empty());
        assert_eq!(empty.total_pages, 1);
    }

    #[test]
    fn test_history_query_pagination_bounds() {
        assert_eq!(HistoryQuery::default().pagination(), Ok((1, DEFAULT_PAGE_SIZE)));

        let too_big = HistoryQuery {
            page_size: Some(101),
            ..Default::default()
        };
        assert!(too_big.pagination().is_err());

        let zero_page = HistoryQuery {
            page: Some(0),
            ..Default::default()
        };
        assert!(zero_page.pagination().is_err());
    }

    #[test]
    fn test_history_query_matches() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let query = HistoryQuery {
            dimension: Some(Dimension::Attack),
            start_time: Some(at - chrono::Duration::hours(1)),
            end_time: Some(at),
            ..Default::default()
        };
        assert!(query.matches(Dimension::Attack, at));
        assert!(!query.matches(Dimension::Visit, at));
        assert!(!query.matches(Dimension::Attack, at + chrono::Duration::seconds(1)));
    }

    #[test]
    fn test_dimension_wire_names() {
        assert_eq!(serde_json::to_string(&Dimension::Visit).unwrap(), "\"visit\"");
        let parsed: Dimension = serde_json::from_str("\"error\"").unwrap();
        assert_eq!(parsed, Dimension::Error);
    }
}
