//! Background scheduling.
//!
//! One sampling task per dimension, one baseline task and, optionally, a
//! config reload task. Intervals are re-read from the config snapshot
//! before every sleep so updates take effect on the next cycle.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use log::{debug, error, info};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::core::engine::AdaptiveEngine;
use crate::models::Dimension;

pub struct Scheduler {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Spawn every periodic task on the current runtime
    pub fn start(engine: Arc<AdaptiveEngine>) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let mut tasks = Vec::new();

        for dimension in Dimension::ALL {
            tasks.push(tokio::spawn(sampling_loop(Arc::clone(&engine), dimension, rx.clone())));
        }
        tasks.push(tokio::spawn(baseline_loop(Arc::clone(&engine), rx.clone())));

        let reload_seconds = engine.settings().config_reload_seconds;
        if reload_seconds > 0 {
            tasks.push(tokio::spawn(reload_loop(
                engine,
                Duration::from_secs(reload_seconds),
                rx,
            )));
        }

        info!("Started {} background tasks", tasks.len());
        Self { shutdown, tasks }
    }

    /// Signal every task and wait for them to finish their current cycle
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for result in join_all(self.tasks).await {
            if let Err(e) = result {
                error!("Background task ended abnormally: {}", e);
            }
        }
        info!("Background tasks stopped");
    }
}

/// Sleep for `period`; false once shutdown is signalled
async fn wait(period: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(period) => !*shutdown.borrow(),
        _ = shutdown.changed() => false,
    }
}

async fn sampling_loop(
    engine: Arc<AdaptiveEngine>,
    dimension: Dimension,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!("Sampling loop for {} started", dimension);
    loop {
        let period = engine.snapshot().sample_interval();
        if !wait(period, &mut shutdown).await {
            break;
        }
        if let Err(e) = engine.sample_tick(dimension, Utc::now()).await {
            error!("Sampling tick for {} failed: {}", dimension, e);
        }
    }
}

async fn baseline_loop(engine: Arc<AdaptiveEngine>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let period = engine.snapshot().update_interval();
        if !wait(period, &mut shutdown).await {
            break;
        }
        if !engine.snapshot().enabled {
            continue;
        }
        if let Err(e) = engine.recalculate_baselines(None, Utc::now()).await {
            error!("Scheduled baseline recalculation failed: {}", e);
        }
    }
}

async fn reload_loop(
    engine: Arc<AdaptiveEngine>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if !wait(period, &mut shutdown).await {
            break;
        }
        match engine.reload_config(Utc::now()).await {
            Ok(true) => debug!("Config changed in store"),
            Ok(false) => {}
            Err(e) => error!("Config reload failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::counters::MockCounterSource;
    use crate::core::store::MemoryStore;
    use crate::models::EngineConfig;

    #[tokio::test]
    async fn test_shutdown_stops_all_tasks() {
        let mut source = MockCounterSource::new();
        source.expect_read().returning(|_| Ok(0));
        let engine = Arc::new(AdaptiveEngine::new(
            Arc::new(MemoryStore::new(10)),
            Arc::new(source),
            EngineConfig::default(),
        ));

        let scheduler = Scheduler::start(engine);
        assert_eq!(scheduler.tasks.len(), 5);
        tokio::time::timeout(Duration::from_secs(5), scheduler.shutdown())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_reload_task_is_optional() {
        let mut settings = EngineConfig::default();
        settings.config_reload_seconds = 0;
        let engine = Arc::new(AdaptiveEngine::new(
            Arc::new(MemoryStore::new(10)),
            Arc::new(MockCounterSource::new()),
            settings,
        ));

        let scheduler = Scheduler::start(engine);
        assert_eq!(scheduler.tasks.len(), 4);
        scheduler.shutdown().await;
    }
}
