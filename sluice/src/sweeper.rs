//! Background retention sweeps.
//!
//! Two independent periodic tasks: one evicts execution records older
//! than the history retention window, one evicts checkpoints older than
//! the (shorter) checkpoint retention window. Both are idempotent and
//! safe to run alongside active executions; backend errors are logged and
//! the sweep retries on its next tick.

use crate::history::HistoryRecorder;
use crate::store::CheckpointManager;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Handle over the spawned sweep tasks; aborts them on shutdown or drop.
#[derive(Debug)]
pub struct SweeperHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Spawns the history and checkpoint sweeps on the current tokio
    /// runtime.
    #[must_use]
    pub fn spawn(
        history: Arc<HistoryRecorder>,
        checkpoints: Arc<CheckpointManager>,
        interval: Duration,
    ) -> Self {
        let interval = interval.max(Duration::from_millis(10));

        let history_task = tokio::spawn(run_history_sweep(history, interval));
        let checkpoint_task = tokio::spawn(run_checkpoint_sweep(checkpoints, interval));

        Self {
            tasks: vec![history_task, checkpoint_task],
        }
    }

    /// Stops both sweeps.
    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_history_sweep(history: Arc<HistoryRecorder>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let cutoff = Utc::now()
            - chrono::Duration::from_std(history.retention())
                .unwrap_or_else(|_| chrono::Duration::days(7));
        match history.evict_older_than(cutoff).await {
            Ok(0) => {}
            Ok(evicted) => {
                tracing::debug!(evicted, "history sweep evicted records");
            }
            // The backend may be temporarily unreachable; never crash the
            // host process, retry next tick.
            Err(err) => {
                tracing::warn!(error = %err, "history sweep failed; will retry");
            }
        }
    }
}

async fn run_checkpoint_sweep(checkpoints: Arc<CheckpointManager>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let cutoff = Utc::now()
            - chrono::Duration::from_std(checkpoints.retention())
                .unwrap_or_else(|_| chrono::Duration::days(1));
        match checkpoints.evict_older_than(cutoff).await {
            Ok(0) => {}
            Ok(evicted) => {
                tracing::debug!(evicted, "checkpoint sweep evicted entries");
            }
            Err(err) => {
                tracing::warn!(error = %err, "checkpoint sweep failed; will retry");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::record::{ExecutionRecord, ExecutionStatus};
    use crate::history::HistoryConfig;
    use crate::store::{CheckpointConfig, MemoryStore, StateStore};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_sweeps_evict_only_expired_entries() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());

        let history = Arc::new(HistoryRecorder::new(
            store.clone(),
            "etl",
            HistoryConfig::new().with_retention(Duration::from_secs(3600)),
        ));
        let checkpoints = Arc::new(CheckpointManager::new(
            store.clone(),
            "etl",
            CheckpointConfig::new().with_retention(Duration::from_secs(3600)),
        ));

        // One old record (outside the hour) and one fresh record.
        let mut old = ExecutionRecord::begin("p");
        old.started_at = Utc::now() - chrono::Duration::hours(2);
        old.finish(ExecutionStatus::Completed);
        history.record(&old).await.unwrap();

        let mut fresh = ExecutionRecord::begin("p");
        fresh.finish(ExecutionStatus::Completed);
        history.record(&fresh).await.unwrap();

        checkpoints
            .save("p", "cursor", &serde_json::json!({"offset": 1}))
            .await
            .unwrap();

        let mut handle = SweeperHandle::spawn(
            history.clone(),
            checkpoints.clone(),
            Duration::from_millis(20),
        );

        tokio::time::sleep(Duration::from_millis(120)).await;
        handle.shutdown();

        let remaining = history.history(None, 10).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].execution_id, fresh.execution_id);

        // The fresh checkpoint is inside its retention window.
        assert!(checkpoints.load("p", "cursor").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_shutdown_stops_ticking() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let history = Arc::new(HistoryRecorder::new(
            store.clone(),
            "etl",
            HistoryConfig::default(),
        ));
        let checkpoints = Arc::new(CheckpointManager::new(
            store,
            "etl",
            CheckpointConfig::default(),
        ));

        let mut handle =
            SweeperHandle::spawn(history, checkpoints, Duration::from_millis(10));
        handle.shutdown();
        // Dropping after shutdown is a no-op.
        drop(handle);
    }
}
