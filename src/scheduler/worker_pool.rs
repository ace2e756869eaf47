//! Worker pool that drains the task store.
//!
//! Each worker is an independent async task. It takes a ticket from the
//! bounded [`TaskQueue`], claims the next eligible row from the
//! [`TaskStore`], runs the matching handler on a blocking thread and records
//! the outcome. Shutdown is signalled over a broadcast channel; pausing uses
//! a watch channel so paused workers wake up as soon as they are resumed.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::HandlerError;
use crate::handlers::{HandlerContext, SharedRegistry};
use crate::manager::FsLayout;
use crate::metrics::{outcome, IngestMetrics};
use crate::resources::Accelerator;
use crate::storage::{StoreError, TaskStore};

use super::checkpoint::{SharedCheckpoint, WorkerCheckpoint, WorkerState};
use super::queue::TaskQueue;
use super::task::{FileTask, TaskId, TaskOutcome, TaskTransition};

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),

    /// Restoring worker checkpoints failed.
    #[error("Task store error: {0}")]
    Store(#[from] StoreError),
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of workers to spawn.
    pub num_workers: usize,
    /// How long an idle worker waits for a ticket before re-checking
    /// pause and shutdown.
    pub poll_interval: Duration,
    /// Soft deadline handed to handlers through their context.
    pub handler_deadline: Duration,
    /// Maximum time to wait for workers during shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            poll_interval: Duration::from_millis(200),
            handler_deadline: Duration::from_secs(1800),
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_handler_deadline(mut self, deadline: Duration) -> Self {
        self.handler_deadline = deadline;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Everything a worker needs besides its own identity.
#[derive(Clone)]
pub struct PoolContext {
    pub store: TaskStore,
    pub queue: Arc<TaskQueue>,
    pub registry: SharedRegistry,
    pub accelerator: Accelerator,
    pub layout: FsLayout,
    pub metrics: IngestMetrics,
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of workers currently inside a handler.
    pub active_workers: usize,
    /// Attempts that completed successfully.
    pub tasks_completed: u64,
    /// Attempts that failed (retried or terminal).
    pub tasks_failed: u64,
    /// Files completed without running a handler.
    pub duplicates_skipped: u64,
    /// Tasks reclaimed by the health monitor.
    pub stuck_detections: u64,
    /// Average handler duration.
    pub average_task_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of attempts recorded (completed + failed).
    pub fn total_processed(&self) -> u64 {
        self.tasks_completed + self.tasks_failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.tasks_completed as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
#[derive(Debug, Default)]
pub(crate) struct SharedPoolStats {
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    duplicates_skipped: AtomicU64,
    stuck_detections: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn record_completion(&self, duration: Duration) {
        self.tasks_completed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_failure(&self, duration: Duration) {
        self.tasks_failed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_duplicate(&self) {
        self.duplicates_skipped.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_stuck(&self) {
        self.stuck_detections.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let completed = self.tasks_completed.load(Ordering::SeqCst);
        let failed = self.tasks_failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);

        let total = completed + failed;
        let average_task_duration = if total > 0 {
            Duration::from_millis(total_duration_ms / total)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: self.active_workers.load(Ordering::SeqCst) as usize,
            tasks_completed: completed,
            tasks_failed: failed,
            duplicates_skipped: self.duplicates_skipped.load(Ordering::SeqCst),
            stuck_detections: self.stuck_detections.load(Ordering::SeqCst),
            average_task_duration,
        }
    }
}

/// Per-worker state visible to the health monitor: the checkpoint and the
/// abort flag of the attempt in flight.
#[derive(Debug)]
pub struct WorkerSlot {
    worker_id: String,
    checkpoint: SharedCheckpoint,
    in_flight: Mutex<Option<(TaskId, Arc<AtomicBool>)>>,
}

impl WorkerSlot {
    fn new(worker_id: String) -> Self {
        Self {
            checkpoint: SharedCheckpoint::new(WorkerCheckpoint::new(worker_id.clone())),
            worker_id,
            in_flight: Mutex::new(None),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn checkpoint(&self) -> &SharedCheckpoint {
        &self.checkpoint
    }

    /// Raises the abort flag if this worker is still running `task_id`.
    pub fn abort(&self, task_id: TaskId) -> bool {
        match self.lock_in_flight().as_ref() {
            Some((current, flag)) if *current == task_id => {
                flag.store(true, Ordering::SeqCst);
                true
            }
            _ => false,
        }
    }

    fn arm(&self, task_id: TaskId) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(false));
        *self.lock_in_flight() = Some((task_id, Arc::clone(&flag)));
        flag
    }

    fn disarm(&self) {
        *self.lock_in_flight() = None;
    }

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, Option<(TaskId, Arc<AtomicBool>)>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Worker pool that manages multiple workers draining the task store.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    ctx: PoolContext,
    slots: Vec<Arc<WorkerSlot>>,
    shutdown_tx: broadcast::Sender<()>,
    paused_tx: watch::Sender<bool>,
    worker_handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
    is_running: AtomicBool,
}

impl WorkerPool {
    /// Creates a pool. Workers are named `worker-0` .. `worker-{N-1}` so
    /// their checkpoints line up across restarts.
    pub fn new(config: WorkerPoolConfig, ctx: PoolContext) -> Self {
        // Buffer size of 1 is sufficient since we only send once
        let (shutdown_tx, _) = broadcast::channel(1);
        let (paused_tx, _) = watch::channel(false);
        let slots = (0..config.num_workers)
            .map(|i| Arc::new(WorkerSlot::new(format!("worker-{}", i))))
            .collect();

        Self {
            config,
            ctx,
            slots,
            shutdown_tx,
            paused_tx,
            worker_handles: Vec::new(),
            stats: Arc::new(SharedPoolStats::default()),
            is_running: AtomicBool::new(false),
        }
    }

    /// Restores each worker's counters from the store and spawns the workers.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running.
    pub async fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }

        for slot in &self.slots {
            if let Some(previous) = self.ctx.store.load_checkpoint(slot.worker_id()).await? {
                debug!(
                    worker_id = %slot.worker_id(),
                    files_processed = previous.files_processed,
                    files_failed = previous.files_failed,
                    "Restored worker checkpoint"
                );
                *slot.checkpoint().lock() = WorkerCheckpoint::resume_from(previous);
            } else {
                let mut checkpoint = slot.checkpoint().lock();
                checkpoint.state = WorkerState::Idle;
                checkpoint.current_task = None;
            }
        }

        info!(num_workers = self.config.num_workers, "Starting worker pool");

        for slot in &self.slots {
            let worker = Worker {
                slot: Arc::clone(slot),
                ctx: self.ctx.clone(),
                shutdown_rx: self.shutdown_tx.subscribe(),
                paused_rx: self.paused_tx.subscribe(),
                poll_interval: self.config.poll_interval,
                handler_deadline: self.config.handler_deadline,
                stats: Arc::clone(&self.stats),
            };
            self.worker_handles.push(tokio::spawn(worker.run()));
        }

        self.is_running.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Gracefully shuts down all workers.
    ///
    /// Workers finish the attempt in flight; a worker that has just claimed a
    /// task hands it back untouched.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if workers don't stop within
    /// the configured timeout. Their handler threads keep running detached.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");

        // Ignore send error - workers may have already stopped
        let _ = self.shutdown_tx.send(());

        let handles = std::mem::take(&mut self.worker_handles);
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        let shutdown_future = async {
            for handle in handles {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        let result = tokio::time::timeout(self.config.shutdown_timeout, shutdown_future).await;
        self.is_running.store(false, Ordering::SeqCst);
        match result {
            Ok(()) => {
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => {
                aborts.iter().for_each(|a| a.abort());
                Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout))
            }
        }
    }

    /// Stops claiming new tasks. Attempts in flight run to completion.
    pub fn pause(&self) {
        self.paused_tx.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused_tx.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused_tx.borrow()
    }

    /// A receiver following the pause flag, for components that pause
    /// together with the pool.
    pub fn subscribe_paused(&self) -> watch::Receiver<bool> {
        self.paused_tx.subscribe()
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.num_workers)
    }

    pub(crate) fn shared_stats(&self) -> Arc<SharedPoolStats> {
        Arc::clone(&self.stats)
    }

    pub fn slots(&self) -> &[Arc<WorkerSlot>] {
        &self.slots
    }

    /// Snapshots of every worker's checkpoint.
    pub fn checkpoints(&self) -> Vec<WorkerCheckpoint> {
        self.slots.iter().map(|s| s.checkpoint().snapshot()).collect()
    }

    /// Returns whether the pool is currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Returns the number of workers in the pool.
    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }
}

/// A single worker.
struct Worker {
    slot: Arc<WorkerSlot>,
    ctx: PoolContext,
    shutdown_rx: broadcast::Receiver<()>,
    paused_rx: watch::Receiver<bool>,
    poll_interval: Duration,
    handler_deadline: Duration,
    stats: Arc<SharedPoolStats>,
}

impl Worker {
    fn id(&self) -> &str {
        self.slot.worker_id()
    }

    /// Non-blocking check of the shutdown signal.
    fn shutdown_requested(&mut self) -> bool {
        match self.shutdown_rx.try_recv() {
            Ok(()) | Err(broadcast::error::TryRecvError::Closed) => true,
            Err(broadcast::error::TryRecvError::Lagged(_)) => true,
            Err(broadcast::error::TryRecvError::Empty) => false,
        }
    }

    /// Main worker loop.
    async fn run(mut self) {
        info!(worker_id = %self.id(), "Worker started");

        loop {
            if self.shutdown_requested() {
                info!(worker_id = %self.id(), "Worker received shutdown signal");
                break;
            }

            let paused = *self.paused_rx.borrow();
            if paused {
                self.set_state_unless_error(WorkerState::Paused);
                tokio::select! {
                    _ = self.shutdown_rx.recv() => break,
                    changed = self.paused_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                continue;
            }
            self.leave_paused();

            let ticket = tokio::select! {
                _ = self.shutdown_rx.recv() => break,
                ticket = self.ctx.queue.take(self.poll_interval) => ticket,
            };
            if ticket.is_none() {
                debug!(worker_id = %self.id(), "No tasks available");
                // Retries become claimable without anyone issuing a ticket.
                if let Err(e) = self.ctx.queue.refill(&self.ctx.store).await {
                    debug!(worker_id = %self.id(), error = %e, "Queue refill failed");
                }
                continue;
            }
            self.ctx.metrics.queue_depth.set(self.ctx.queue.depth() as i64);

            let task = match self.ctx.store.claim_next(self.id()).await {
                Ok(Some(task)) => {
                    self.ctx.queue.notify_room();
                    task
                }
                Ok(None) => {
                    debug!(worker_id = %self.id(), "Ticket found no claimable task");
                    continue;
                }
                Err(e) => {
                    error!(worker_id = %self.id(), error = %e, "Failed to claim task");
                    tokio::time::sleep(self.poll_interval).await;
                    continue;
                }
            };

            if self.shutdown_requested() {
                if let Err(e) = self.ctx.store.release(task.id, self.id()).await {
                    warn!(worker_id = %self.id(), task_id = task.id, error = %e, "Failed to release task");
                }
                info!(worker_id = %self.id(), task_id = task.id, "Released task on shutdown");
                break;
            }

            self.process(task).await;
        }

        {
            let mut checkpoint = self.slot.checkpoint().lock();
            checkpoint.state = WorkerState::Stopped;
            checkpoint.current_task = None;
        }
        info!(worker_id = %self.id(), "Worker stopped");
    }

    fn set_state_unless_error(&self, state: WorkerState) {
        let mut checkpoint = self.slot.checkpoint().lock();
        if checkpoint.state != WorkerState::Error {
            checkpoint.state = state;
        }
    }

    fn leave_paused(&self) {
        let mut checkpoint = self.slot.checkpoint().lock();
        if checkpoint.state == WorkerState::Paused {
            checkpoint.state = WorkerState::Idle;
        }
    }

    /// Runs one claimed task to a recorded outcome.
    async fn process(&self, task: FileTask) {
        let start_time = Instant::now();
        self.slot.checkpoint().lock().begin(task.id);

        info!(
            worker_id = %self.id(),
            task_id = task.id,
            path = %task.file_path.display(),
            attempt = task.attempt(),
            "Processing task"
        );

        match self
            .ctx
            .store
            .find_completed_by_hash(&task.content_hash, task.id)
            .await
        {
            Ok(Some(original)) => {
                self.finish_duplicate(&task, original.id, start_time).await;
                return;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(worker_id = %self.id(), task_id = task.id, error = %e, "Duplicate lookup failed, running handler");
            }
        }

        let result = self.run_handler(&task).await;
        let duration = start_time.elapsed();
        self.ctx.metrics.task_duration.observe(duration.as_secs_f64());

        match self.ctx.store.complete(task.id, self.id(), result.clone()).await {
            Ok(TaskTransition::Completed) => {
                self.stats.record_completion(duration);
                self.ctx.metrics.record_outcome(outcome::COMPLETED);
                info!(
                    worker_id = %self.id(),
                    task_id = task.id,
                    duration_ms = duration.as_millis() as u64,
                    "Task completed"
                );
                self.move_file(&task, true);
                self.slot.checkpoint().lock().finish(true, duration);
            }
            Ok(TaskTransition::Retrying {
                retry_count,
                backoff,
            }) => {
                self.stats.record_failure(duration);
                self.ctx.metrics.record_outcome(outcome::RETRIED);
                warn!(
                    worker_id = %self.id(),
                    task_id = task.id,
                    retry_count,
                    backoff_ms = backoff.as_millis() as u64,
                    error = ?failure_text(&result),
                    "Task failed, will retry"
                );
                self.slot.checkpoint().lock().finish(false, duration);
            }
            Ok(TaskTransition::Failed { retry_count }) => {
                self.stats.record_failure(duration);
                self.ctx.metrics.record_outcome(outcome::FAILED);
                error!(
                    worker_id = %self.id(),
                    task_id = task.id,
                    retry_count,
                    error = ?failure_text(&result),
                    "Task failed permanently"
                );
                self.move_file(&task, false);
                self.slot.checkpoint().lock().finish(false, duration);
            }
            Err(StoreError::StaleClaim { .. }) => {
                self.ctx.metrics.record_outcome(outcome::STALE);
                warn!(
                    worker_id = %self.id(),
                    task_id = task.id,
                    "Task was reclaimed while running, discarding result"
                );
                self.slot.checkpoint().lock().finish(false, duration);
            }
            Err(e) => {
                error!(worker_id = %self.id(), task_id = task.id, error = %e, "Failed to record outcome");
                self.slot.checkpoint().lock().finish(false, duration);
            }
        }
    }

    /// Completes a task whose content was already processed under another
    /// row, without running a handler.
    async fn finish_duplicate(&self, task: &FileTask, original_id: TaskId, start_time: Instant) {
        let duration = start_time.elapsed();
        match self
            .ctx
            .store
            .complete(task.id, self.id(), TaskOutcome::Success)
            .await
        {
            Ok(_) => {
                self.stats.record_duplicate();
                self.ctx.metrics.duplicates_total.inc();
                self.ctx.metrics.record_outcome(outcome::DUPLICATE);
                info!(
                    worker_id = %self.id(),
                    task_id = task.id,
                    original_task_id = original_id,
                    "Duplicate content, skipped handler"
                );
                self.move_file(task, true);
                self.slot.checkpoint().lock().finish(true, duration);
            }
            Err(e) => {
                warn!(worker_id = %self.id(), task_id = task.id, error = %e, "Failed to complete duplicate task");
                self.slot.checkpoint().lock().finish(false, duration);
            }
        }
    }

    /// Resolves and runs the handler on a blocking thread.
    async fn run_handler(&self, task: &FileTask) -> TaskOutcome {
        let file_name = task.file_name().unwrap_or_default().to_string();
        let (pattern, handler) = {
            let registry = self
                .ctx
                .registry
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let (pattern, handler) = registry.resolve(&file_name);
            (pattern.map(str::to_string), handler)
        };
        debug!(
            worker_id = %self.id(),
            task_id = task.id,
            handler = handler.name(),
            pattern = ?pattern,
            "Resolved handler"
        );

        let abort = self.slot.arm(task.id);
        let ctx = HandlerContext::new(
            self.id(),
            task.id,
            self.ctx.accelerator.clone(),
            Instant::now() + self.handler_deadline,
            abort,
        );
        let path = task.file_path.clone();

        self.stats.increment_active();
        self.ctx.metrics.tasks_in_progress.inc();
        let joined = tokio::task::spawn_blocking(move || handler.handle(&path, &ctx)).await;
        self.ctx.metrics.tasks_in_progress.dec();
        self.stats.decrement_active();
        self.slot.disarm();
        self.ctx
            .metrics
            .accelerator_reserved_bytes
            .set(self.ctx.accelerator.reserved_bytes() as i64);

        match joined {
            Ok(Ok(true)) => TaskOutcome::Success,
            Ok(Ok(false)) => TaskOutcome::failure(HandlerError::failed("handler returned false").to_string()),
            Ok(Err(e)) => TaskOutcome::failure(e.to_string()),
            Err(join) => TaskOutcome::failure(HandlerError::Panicked(panic_message(join)).to_string()),
        }
    }

    fn move_file(&self, task: &FileTask, success: bool) {
        let moved = if success {
            self.ctx.layout.move_to_processed(&task.file_path)
        } else {
            self.ctx.layout.move_to_error(&task.file_path)
        };
        match moved {
            Ok(outcome) => debug!(worker_id = %self.id(), task_id = task.id, ?outcome, "Moved file"),
            Err(e) => error!(
                worker_id = %self.id(),
                task_id = task.id,
                path = %task.file_path.display(),
                error = %e,
                "Failed to move file"
            ),
        }
    }
}

fn failure_text(outcome: &TaskOutcome) -> Option<&str> {
    match outcome {
        TaskOutcome::Failure { error } => Some(error.as_str()),
        TaskOutcome::Success => None,
    }
}

fn panic_message(join: tokio::task::JoinError) -> String {
    match join.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".to_string()),
        Err(join) => join.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::{Handler, HandlerRegistry};
    use crate::scheduler::{NewTask, RetryPolicy, TaskStatus};
    use std::path::Path;
    use std::sync::RwLock;

    struct Harness {
        _dir: tempfile::TempDir,
        ctx: PoolContext,
    }

    async fn harness(handler: Arc<dyn Handler>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let layout = FsLayout::new(
            dir.path().join("watch"),
            dir.path().join("processed"),
            dir.path().join("errors"),
            dir.path().join("state"),
        );
        layout.create_dirs().unwrap();
        let store = TaskStore::in_memory()
            .await
            .unwrap()
            .with_retry_policy(RetryPolicy::immediate());

        Harness {
            _dir: dir,
            ctx: PoolContext {
                store,
                queue: Arc::new(TaskQueue::new(8)),
                registry: Arc::new(RwLock::new(HandlerRegistry::new(handler))),
                accelerator: Accelerator::cpu_only(),
                layout,
                metrics: IngestMetrics::new().unwrap(),
            },
        }
    }

    async fn add_file(ctx: &PoolContext, name: &str, body: &str, max_retries: u32) -> FileTask {
        let path = ctx.layout.watch_dir.join(name);
        std::fs::write(&path, body).unwrap();
        let task = ctx
            .store
            .enqueue(NewTask::new(&path, format!("hash-{}", body)).with_max_retries(max_retries))
            .await
            .unwrap();
        ctx.queue.refill(&ctx.store).await.unwrap();
        task
    }

    async fn wait_for_status(store: &TaskStore, id: TaskId, status: TaskStatus) -> FileTask {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let task = store.get(id).await.unwrap().unwrap();
            if task.status == status {
                return task;
            }
            assert!(Instant::now() < deadline, "task {} stuck in {}", id, task.status);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    fn fast_config(n: usize) -> WorkerPoolConfig {
        WorkerPoolConfig::new(n)
            .with_poll_interval(Duration::from_millis(20))
            .with_shutdown_timeout(Duration::from_secs(5))
    }

    #[test]
    fn test_worker_pool_config_default() {
        let config = WorkerPoolConfig::default();
        assert_eq!(config.num_workers, 4);
        assert_eq!(config.poll_interval, Duration::from_millis(200));
        assert_eq!(config.handler_deadline, Duration::from_secs(1800));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_pool_stats_success_rate() {
        let stats = PoolStats {
            tasks_completed: 3,
            tasks_failed: 1,
            ..Default::default()
        };
        assert_eq!(stats.total_processed(), 4);
        assert!((stats.success_rate() - 75.0).abs() < f64::EPSILON);
        assert_eq!(PoolStats::default().success_rate(), 0.0);
    }

    #[test]
    fn test_slot_abort_only_matches_current_task() {
        let slot = WorkerSlot::new("worker-0".to_string());
        assert!(!slot.abort(1));

        let flag = slot.arm(1);
        assert!(!slot.abort(2));
        assert!(!flag.load(Ordering::SeqCst));
        assert!(slot.abort(1));
        assert!(flag.load(Ordering::SeqCst));

        slot.disarm();
        assert!(!slot.abort(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pool_processes_and_moves_file() {
        let h = harness(Arc::new(|_: &Path, _: &HandlerContext| -> Result<bool, HandlerError> {
            Ok(true)
        }))
        .await;
        let task = add_file(&h.ctx, "a.csv", "x\n1\n", 3).await;

        let mut pool = WorkerPool::new(fast_config(2), h.ctx.clone());
        pool.start().await.unwrap();
        let done = wait_for_status(&h.ctx.store, task.id, TaskStatus::Completed).await;
        pool.shutdown().await.unwrap();

        assert_eq!(done.retry_count, 0);
        assert!(h.ctx.layout.processed_dir.join("a.csv").exists());
        assert!(!task.file_path.exists());
        assert_eq!(pool.stats().tasks_completed, 1);
        assert_eq!(h.ctx.metrics.outcome_count(outcome::COMPLETED), 1);

        let checkpoints = pool.checkpoints();
        assert_eq!(checkpoints.iter().map(|c| c.files_processed).sum::<u64>(), 1);
        assert!(checkpoints.iter().all(|c| c.state == WorkerState::Stopped));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_panic_becomes_terminal_failure() {
        let h = harness(Arc::new(|_: &Path, _: &HandlerContext| -> Result<bool, HandlerError> {
            panic!("boom")
        }))
        .await;
        let task = add_file(&h.ctx, "bad.csv", "x\n", 2).await;

        let mut pool = WorkerPool::new(fast_config(1), h.ctx.clone());
        pool.start().await.unwrap();
        let failed = wait_for_status(&h.ctx.store, task.id, TaskStatus::Failed).await;
        pool.shutdown().await.unwrap();

        assert_eq!(failed.retry_count, 2);
        assert!(failed.error_message.unwrap().contains("boom"));
        assert!(h.ctx.layout.error_dir.join("bad.csv").exists());
        assert_eq!(h.ctx.metrics.outcome_count(outcome::RETRIED), 1);
        assert_eq!(h.ctx.metrics.outcome_count(outcome::FAILED), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_duplicate_content_skips_handler() {
        let calls = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&calls);
        let h = harness(Arc::new(move |_: &Path, _: &HandlerContext| -> Result<bool, HandlerError> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }))
        .await;
        let first = add_file(&h.ctx, "a.csv", "same", 3).await;

        let mut pool = WorkerPool::new(fast_config(1), h.ctx.clone());
        pool.start().await.unwrap();
        wait_for_status(&h.ctx.store, first.id, TaskStatus::Completed).await;

        let second = add_file(&h.ctx, "b.csv", "same", 3).await;
        wait_for_status(&h.ctx.store, second.id, TaskStatus::Completed).await;
        pool.shutdown().await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().duplicates_skipped, 1);
        assert!(h.ctx.layout.processed_dir.join("b.csv").exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pause_stops_claiming() {
        let h = harness(Arc::new(|_: &Path, _: &HandlerContext| -> Result<bool, HandlerError> {
            Ok(true)
        }))
        .await;

        let mut pool = WorkerPool::new(fast_config(1), h.ctx.clone());
        pool.pause();
        pool.start().await.unwrap();
        let task = add_file(&h.ctx, "a.csv", "x", 3).await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(
            h.ctx.store.get(task.id).await.unwrap().unwrap().status,
            TaskStatus::Pending
        );
        assert_eq!(pool.checkpoints()[0].state, WorkerState::Paused);

        pool.resume();
        wait_for_status(&h.ctx.store, task.id, TaskStatus::Completed).await;
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_twice_and_shutdown_when_stopped() {
        let h = harness(Arc::new(|_: &Path, _: &HandlerContext| -> Result<bool, HandlerError> {
            Ok(true)
        }))
        .await;
        let mut pool = WorkerPool::new(fast_config(1), h.ctx.clone());

        assert!(matches!(pool.shutdown().await, Err(PoolError::NotRunning)));
        pool.start().await.unwrap();
        assert!(matches!(pool.start().await, Err(PoolError::AlreadyRunning)));
        pool.shutdown().await.unwrap();
        assert!(!pool.is_running());
    }

    #[tokio::test]
    async fn test_counters_restored_from_store() {
        let h = harness(Arc::new(|_: &Path, _: &HandlerContext| -> Result<bool, HandlerError> {
            Ok(true)
        }))
        .await;
        let mut previous = WorkerCheckpoint::new("worker-0");
        previous.files_processed = 7;
        previous.files_failed = 2;
        h.ctx.store.save_checkpoint(&previous).await.unwrap();

        let mut pool = WorkerPool::new(fast_config(1), h.ctx.clone());
        pool.start().await.unwrap();
        let restored = pool.checkpoints().remove(0);
        pool.shutdown().await.unwrap();

        assert_eq!(restored.files_processed, 7);
        assert_eq!(restored.files_failed, 2);
    }
}
