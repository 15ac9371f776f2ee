//! Core functionality for the adaptive throttling service.
//!
//! Sampling, baseline calculation, anomaly detection and threshold
//! adjustment, wired together per dimension and driven by the scheduler.

pub mod anomaly_detector;
pub mod baseline;
pub mod counters;
pub mod engine;
pub mod monitoring;
pub mod pipeline;
pub mod sampler;
pub mod scheduler;
pub mod store;
pub mod threshold_adjuster;
pub mod throttle_config;

pub use anomaly_detector::{AnomalyDetector, Detection, Severity};
pub use baseline::BaselineCalculator;
pub use counters::{CounterSource, HttpCounterSource, RedisCounterSource};
pub use engine::{AdaptiveEngine, EngineError};
pub use pipeline::DimensionPipeline;
pub use sampler::{SampleHistory, Sampler};
pub use scheduler::Scheduler;
pub use store::{MemoryStore, RedisStore, StoreError, ThrottleStore};
pub use threshold_adjuster::{AdjustmentError, ThresholdAdjuster};
pub use throttle_config::{ConfigHandle, ConfigValidationError, ThrottleConfig};
