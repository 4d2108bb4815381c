// Background sweeper - periodically prunes the engine's in-memory trackers.
//
// Started and stopped explicitly by whoever owns the process lifecycle.

use super::policy_engine::PolicyEngine;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

pub struct Sweeper {
    stop_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<u64>>,
}

impl Sweeper {
    /// Spawn the sweep loop. The first sweep runs one `period` after start.
    pub fn start(engine: Arc<PolicyEngine>, period: Duration) -> Self {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // `interval` fires immediately once; skip that tick.
            ticker.tick().await;

            let mut runs = 0u64;
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        let report = engine.sweep(Utc::now());
                        runs += 1;
                        tracing::debug!(runs, ?report, "Periodic sweep");
                    }
                }
            }
            runs
        });

        tracing::info!(period_secs = period.as_secs(), "Sweeper started");
        Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        }
    }

    /// Stop the loop and wait for it. Returns how many sweeps ran.
    pub async fn stop(mut self) -> u64 {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }

        let runs = match self.handle.take() {
            Some(handle) => match handle.await {
                Ok(runs) => runs,
                Err(e) => {
                    tracing::error!(error = %e, "Sweeper task failed");
                    0
                }
            },
            None => 0,
        };
        tracing::info!(runs, "Sweeper stopped");
        runs
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        // Dropped without `stop`: don't leave the task running.
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::moderation::policy_engine::EngineConfig;
    use crate::core::moderation::test_doubles::{
        MockScorer, MockStore, RecordingActions, RecordingReporter,
    };
    use crate::core::moderation::Collaborators;

    fn engine() -> Arc<PolicyEngine> {
        let collaborators = Collaborators::new(
            Arc::new(MockStore::default()),
            Arc::new(MockScorer::default()),
            Arc::new(RecordingActions::default()),
            Arc::new(RecordingReporter::default()),
        );
        Arc::new(PolicyEngine::new(EngineConfig::default(), collaborators))
    }

    #[tokio::test]
    async fn test_sweeper_runs_until_stopped() {
        let sweeper = Sweeper::start(engine(), Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(150)).await;
        let runs = sweeper.stop().await;
        assert!(runs >= 2, "expected several sweeps, got {}", runs);
    }

    #[tokio::test]
    async fn test_stop_before_first_tick() {
        let sweeper = Sweeper::start(engine(), Duration::from_secs(3600));
        assert_eq!(sweeper.stop().await, 0);
    }
}
