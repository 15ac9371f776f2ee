//! Traffic sampling and rolling sample history.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use log::{debug, warn};

use crate::core::counters::{CounterError, CounterSource};
use crate::core::monitoring;
use crate::models::{Dimension, TrafficSample};

/// Append-only window of samples for one dimension
#[derive(Debug)]
pub struct SampleHistory {
    samples: VecDeque<TrafficSample>,
    /// Bumped on every reset so late baseline results can be discarded
    epoch: u64,
    learning_started_at: DateTime<Utc>,
}

impl SampleHistory {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            samples: VecDeque::new(),
            epoch: 0,
            learning_started_at: now,
        }
    }

    /// Append a sample, evicting anything older than `window` relative to it
    pub fn push(&mut self, sample: TrafficSample, window: Duration) {
        let at = sample.timestamp;
        self.samples.push_back(sample);
        self.prune(at, window);
    }

    /// Drop samples older than `now - window`
    pub fn prune(&mut self, now: DateTime<Utc>, window: Duration) -> usize {
        let cutoff = now - window;
        let before = self.samples.len();
        while self
            .samples
            .front()
            .map_or(false, |oldest| oldest.timestamp < cutoff)
        {
            self.samples.pop_front();
        }
        before - self.samples.len()
    }

    /// Counts of the samples inside `[now - window, now]`
    pub fn counts_within(&self, now: DateTime<Utc>, window: Duration) -> Vec<u64> {
        let cutoff = now - window;
        self.samples
            .iter()
            .filter(|s| s.timestamp >= cutoff && s.timestamp <= now)
            .map(|s| s.count)
            .collect()
    }

    pub fn latest(&self) -> Option<&TrafficSample> {
        self.samples.back()
    }

    pub fn newest_first(&self) -> impl Iterator<Item = &TrafficSample> {
        self.samples.iter().rev()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn learning_started_at(&self) -> DateTime<Utc> {
        self.learning_started_at
    }

    /// Forget every sample and restart the learning window at `now`
    pub fn clear(&mut self, now: DateTime<Utc>) {
        self.samples.clear();
        self.epoch += 1;
        self.learning_started_at = now;
    }
}

/// Reads live counters and turns them into samples
pub struct Sampler {
    source: Arc<dyn CounterSource>,
}

impl Sampler {
    pub fn new(source: Arc<dyn CounterSource>) -> Self {
        Self { source }
    }

    /// Take one measurement. Failures are logged here; the caller skips the tick.
    pub async fn sample(
        &self,
        dimension: Dimension,
        now: DateTime<Utc>,
    ) -> Result<TrafficSample, CounterError> {
        match self.source.read(dimension).await {
            Ok(count) => {
                debug!("Sampled {} = {}", dimension, count);
                monitoring::record_sample(dimension, count);
                Ok(TrafficSample {
                    dimension,
                    timestamp: now,
                    count,
                })
            }
            Err(e) => {
                warn!("Skipping {} sample: {}", dimension, e);
                monitoring::record_sample_failure(dimension);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::counters::MockCounterSource;

    fn sample(at: DateTime<Utc>, count: u64) -> TrafficSample {
        TrafficSample {
            dimension: Dimension::Visit,
            timestamp: at,
            count,
        }
    }

    #[test]
    fn test_push_evicts_outside_window() {
        let start = Utc::now();
        let window = Duration::seconds(100);
        let mut history = SampleHistory::new(start);
        for i in 0..5 {
            history.push(sample(start + Duration::seconds(i * 40), i as u64), window);
        }
        // newest is at +160, so +40 and older fall out
        assert_eq!(history.counts_within(start + Duration::seconds(160), window), vec![2, 3, 4]);
        assert_eq!(history.len(), 3);
        assert_eq!(history.latest().map(|s| s.count), Some(4));
    }

    #[test]
    fn test_lazy_prune_on_read() {
        let start = Utc::now();
        let window = Duration::seconds(60);
        let mut history = SampleHistory::new(start);
        history.push(sample(start, 1), window);
        history.push(sample(start + Duration::seconds(30), 2), window);

        let later = start + Duration::seconds(80);
        assert_eq!(history.counts_within(later, window), vec![2]);
        assert_eq!(history.prune(later, window), 1);
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_clear_restarts_learning() {
        let start = Utc::now();
        let mut history = SampleHistory::new(start);
        history.push(sample(start, 1), Duration::days(1));

        let reset_at = start + Duration::seconds(5);
        history.clear(reset_at);
        assert!(history.is_empty());
        assert_eq!(history.epoch(), 1);
        assert_eq!(history.learning_started_at(), reset_at);

        history.clear(reset_at);
        assert!(history.is_empty());
        assert_eq!(history.epoch(), 2);
    }

    #[tokio::test]
    async fn test_sampler_wraps_counter() {
        let mut source = MockCounterSource::new();
        source
            .expect_read()
            .withf(|d| *d == Dimension::Attack)
            .returning(|_| Ok(17));
        let sampler = Sampler::new(Arc::new(source));

        let now = Utc::now();
        let taken = sampler.sample(Dimension::Attack, now).await.unwrap();
        assert_eq!(taken.count, 17);
        assert_eq!(taken.timestamp, now);
        assert_eq!(taken.dimension, Dimension::Attack);
    }

    #[tokio::test]
    async fn test_sampler_propagates_failure() {
        let mut source = MockCounterSource::new();
        source
            .expect_read()
            .returning(|_| Err(CounterError::Timeout));
        let sampler = Sampler::new(Arc::new(source));
        assert!(sampler.sample(Dimension::Visit, Utc::now()).await.is_err());
    }
}
