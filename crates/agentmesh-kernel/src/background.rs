//! Periodic maintenance loops: feedback re-analysis, feedback retention,
//! abandoned-span reaping and metrics snapshots.
//!
//! Each loop sleeps for its interval, runs one tick, and exits as soon as the
//! shared shutdown signal flips. A failing tick is logged and the loop keeps
//! going.

use crate::self_improvement::SelfImprovementSystem;
use crate::tracer::Tracer;
use agentmesh_types::config::MeshConfig;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Intervals for each loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopIntervals {
    pub analysis: Duration,
    pub cleanup: Duration,
    pub reap: Duration,
    pub snapshot: Duration,
}

impl LoopIntervals {
    pub fn from_config(config: &MeshConfig) -> Self {
        Self {
            analysis: Duration::from_secs(config.improvement.analysis_interval_secs.max(1)),
            cleanup: Duration::from_secs(config.improvement.cleanup_interval_secs.max(1)),
            reap: Duration::from_secs(config.tracing.reap_interval_secs.max(1)),
            snapshot: Duration::from_secs(config.tracing.snapshot_interval_secs.max(1)),
        }
    }
}

/// Handles to the running maintenance loops.
pub struct BackgroundRuntime {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl BackgroundRuntime {
    /// Spawn every loop on the current tokio runtime.
    pub fn spawn(
        tracer: Arc<Tracer>,
        improvement: Arc<SelfImprovementSystem>,
        intervals: LoopIntervals,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        let sys = Arc::clone(&improvement);
        tasks.push(spawn_loop("analysis", intervals.analysis, shutdown_rx.clone(), move || {
            let sys = Arc::clone(&sys);
            async move {
                let analyzed = sys.run_periodic_analysis().await;
                debug!(analyzed, "Periodic feedback analysis finished");
            }
        }));

        let sys = improvement;
        tasks.push(spawn_loop("cleanup", intervals.cleanup, shutdown_rx.clone(), move || {
            let sys = Arc::clone(&sys);
            async move {
                if let Err(e) = sys.purge_expired().await {
                    warn!(error = %e, "Feedback purge failed");
                }
            }
        }));

        let t = Arc::clone(&tracer);
        tasks.push(spawn_loop("reaper", intervals.reap, shutdown_rx.clone(), move || {
            let t = Arc::clone(&t);
            async move {
                t.reap_expired();
            }
        }));

        let t = tracer;
        tasks.push(spawn_loop("snapshot", intervals.snapshot, shutdown_rx, move || {
            let t = Arc::clone(&t);
            async move {
                t.snapshot_metrics();
            }
        }));

        info!(loops = tasks.len(), "Background maintenance started");
        Self { shutdown_tx, tasks }
    }

    /// Names of loops that are still running.
    pub fn running_loops(&self) -> Vec<&'static str> {
        self.tasks
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .map(|(name, _)| *name)
            .collect()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Signal every loop to stop and wait for them to exit.
    pub async fn shutdown(self) {
        info!("Background maintenance: initiating shutdown");
        let _ = self.shutdown_tx.send(true);
        for (name, handle) in self.tasks {
            if let Err(e) = handle.await {
                warn!(task = name, error = %e, "Background loop ended abnormally");
            }
        }
    }
}

fn spawn_loop<F, Fut>(
    name: &'static str,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    tick: F,
) -> (&'static str, JoinHandle<()>)
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    debug!(task = name, interval_secs = interval.as_secs(), "Starting background loop");
    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {
                    info!(task = name, "Background loop: shutdown signal received");
                    break;
                }
            }
            if *shutdown.borrow() {
                break;
            }
            // Run the tick on its own task so a panic doesn't kill the loop.
            if let Err(e) = tokio::spawn(tick()).await {
                warn!(task = name, error = %e, "Background tick failed");
            }
        }
    });
    (name, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentmesh_types::config::{ImprovementConfig, TracingConfig};
    use agentmesh_types::improvement::NoopIterationEngine;
    use std::collections::HashMap;

    fn fast_intervals() -> LoopIntervals {
        LoopIntervals {
            analysis: Duration::from_millis(10),
            cleanup: Duration::from_millis(10),
            reap: Duration::from_millis(10),
            snapshot: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_loops_tick_and_stop() {
        let config = TracingConfig {
            abandon_after_secs: 0,
            ..TracingConfig::default()
        };
        let tracer = Arc::new(Tracer::in_memory(config));
        let improvement = Arc::new(SelfImprovementSystem::new(
            ImprovementConfig::default(),
            None,
            Arc::new(NoopIterationEngine),
        ));
        let trace_id = tracer.start_trace("left_open", HashMap::new());

        let runtime = BackgroundRuntime::spawn(Arc::clone(&tracer), improvement, fast_intervals());
        assert_eq!(runtime.running_loops().len(), 4);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(tracer.root_span_id(trace_id).is_none());
        assert_eq!(tracer.get_metrics().failed_spans, 1);

        runtime.shutdown().await;
    }

    #[test]
    fn test_intervals_from_config() {
        let intervals = LoopIntervals::from_config(&MeshConfig::default());
        assert_eq!(intervals.analysis, Duration::from_secs(3600));
        assert_eq!(intervals.cleanup, Duration::from_secs(86_400));
    }
}
