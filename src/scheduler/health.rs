//! Stuck-worker detection and checkpoint persistence.
//!
//! The monitor never kills a handler thread. A task running past the stuck
//! timeout is failed on behalf of its worker (retry accounting applies), the
//! worker's abort flag is raised and its checkpoint is flagged `Error`. When
//! the wedged handler eventually returns, its completion is rejected as a
//! stale claim.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::manager::FsLayout;
use crate::metrics::IngestMetrics;
use crate::storage::{StoreError, TaskStore};

use super::checkpoint::WorkerState;
use super::task::{TaskId, TaskOutcome, TaskTransition};
use super::worker_pool::{SharedPoolStats, WorkerSlot};

const MIN_TICK: Duration = Duration::from_millis(10);

/// Recorded as the task's error message when the monitor reclaims it.
#[derive(Debug, Clone, Error)]
#[error("worker {worker_id} stuck on task {task_id}: running {elapsed:?}, stuck timeout {timeout:?}")]
pub struct StuckWorkerError {
    pub worker_id: String,
    pub task_id: TaskId,
    pub elapsed: Duration,
    pub timeout: Duration,
}

/// Monitor settings.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub stuck_timeout: Duration,
    pub checkpoint_interval: Duration,
    /// Directory for the JSON checkpoint mirrors.
    pub checkpoint_dir: PathBuf,
}

pub struct HealthMonitor {
    config: HealthConfig,
    store: TaskStore,
    slots: Vec<Arc<WorkerSlot>>,
    layout: FsLayout,
    metrics: IngestMetrics,
    stats: Arc<SharedPoolStats>,
}

impl HealthMonitor {
    pub(crate) fn new(
        config: HealthConfig,
        store: TaskStore,
        slots: Vec<Arc<WorkerSlot>>,
        layout: FsLayout,
        metrics: IngestMetrics,
        stats: Arc<SharedPoolStats>,
    ) -> Self {
        Self {
            config,
            store,
            slots,
            layout,
            metrics,
            stats,
        }
    }

    /// `min(checkpoint_interval, stuck_timeout / 4)`, at least 10 ms.
    pub fn tick_interval(&self) -> Duration {
        self.config
            .checkpoint_interval
            .min(self.config.stuck_timeout / 4)
            .max(MIN_TICK)
    }

    /// Reclaims every task processing for longer than the stuck timeout.
    /// Returns how many were reclaimed.
    pub async fn check_stuck(&self) -> Result<usize, StoreError> {
        let now = Utc::now();
        let timeout = chrono::Duration::from_std(self.config.stuck_timeout)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let cutoff = now.checked_sub_signed(timeout).unwrap_or(now);

        let mut reclaimed = 0;
        for task in self.store.stuck_tasks(cutoff).await? {
            let Some(worker_id) = task.owning_worker_id.clone() else {
                continue;
            };
            let elapsed = task
                .running_for(now)
                .and_then(|d| d.to_std().ok())
                .unwrap_or(self.config.stuck_timeout);
            let stuck = StuckWorkerError {
                worker_id: worker_id.clone(),
                task_id: task.id,
                elapsed,
                timeout: self.config.stuck_timeout,
            };

            let transition = match self
                .store
                .complete(task.id, &worker_id, TaskOutcome::failure(stuck.to_string()))
                .await
            {
                Ok(transition) => transition,
                Err(StoreError::StaleClaim { .. }) => {
                    debug!(task_id = task.id, %worker_id, "Stuck task finished before reclaim");
                    continue;
                }
                Err(e) => return Err(e),
            };

            error!(
                %worker_id,
                task_id = task.id,
                elapsed_ms = elapsed.as_millis() as u64,
                %transition,
                "Worker stuck, task reclaimed"
            );
            self.metrics.stuck_workers_total.inc();
            self.stats.record_stuck();

            let slot = self.slots.iter().find(|s| s.worker_id() == worker_id);
            if let Some(slot) = slot {
                slot.abort(task.id);
                let snapshot = {
                    let mut checkpoint = slot.checkpoint().lock();
                    checkpoint.mark_error();
                    checkpoint.stamp(Utc::now());
                    checkpoint.clone()
                };
                if let Err(e) = self.store.save_checkpoint(&snapshot).await {
                    warn!(%worker_id, error = %e, "Failed to persist error checkpoint");
                }
            }

            if matches!(transition, TaskTransition::Failed { .. }) {
                if let Err(e) = self.layout.move_to_error(&task.file_path) {
                    error!(task_id = task.id, error = %e, "Failed to move stuck file");
                }
            }
            reclaimed += 1;
        }
        Ok(reclaimed)
    }

    /// Stamps and saves every worker checkpoint, mirroring each as JSON.
    pub async fn persist_checkpoints(&self) -> Result<(), StoreError> {
        let now = Utc::now();
        for slot in &self.slots {
            let snapshot = {
                let mut checkpoint = slot.checkpoint().lock();
                checkpoint.stamp(now);
                checkpoint.clone()
            };
            self.store.save_checkpoint(&snapshot).await?;
            if let Err(e) = snapshot.write_json(&self.config.checkpoint_dir) {
                warn!(worker_id = %snapshot.worker_id, error = %e, "Failed to write checkpoint file");
            }
        }
        debug!(workers = self.slots.len(), "Checkpoints persisted");
        Ok(())
    }

    /// Marks every worker stopped and persists a final checkpoint.
    pub async fn persist_stopped(&self) -> Result<(), StoreError> {
        for slot in &self.slots {
            let mut checkpoint = slot.checkpoint().lock();
            checkpoint.state = WorkerState::Stopped;
            checkpoint.current_task = None;
        }
        self.persist_checkpoints().await
    }

    /// Monitor loop. Persists checkpoints one last time before returning.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let tick = self.tick_interval();
        info!(
            tick_ms = tick.as_millis() as u64,
            stuck_timeout_secs = self.config.stuck_timeout.as_secs_f64(),
            "Health monitor started"
        );

        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_persist = Instant::now();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.check_stuck().await {
                error!(error = %e, "Stuck-worker check failed");
            }

            if last_persist.elapsed() >= self.config.checkpoint_interval {
                if let Err(e) = self.persist_checkpoints().await {
                    error!(error = %e, "Checkpoint persistence failed");
                }
                last_persist = Instant::now();
            }
        }

        if let Err(e) = self.persist_checkpoints().await {
            error!(error = %e, "Final checkpoint persistence failed");
        }
        info!("Health monitor stopped");
    }
}
