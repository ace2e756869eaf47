//! The manager facade: wires scanner, store, queue, worker pool, health
//! monitor and accelerator arbiter into one lifecycle.
//!
//! # Example
//!
//! ```rust,ignore
//! use ingest_forge::manager::{Manager, ManagerConfig};
//!
//! let mut manager = Manager::new(ManagerConfig::from_env()?).await?;
//! manager.add_handler("*_qa.csv", Arc::new(my_handler))?;
//! manager.start().await?;
//!
//! tokio::signal::ctrl_c().await?;
//! manager.stop().await?;
//! ```

pub mod config;
pub mod fs_layout;

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde::{Serialize, Serializer};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::ManagerError;
use crate::handlers::{
    ChunkedCsvHandler, CsvSummaryHandler, Handler, HandlerRegistry, SharedRegistry,
};
use crate::metrics::IngestMetrics;
use crate::resources::{Accelerator, DeviceProbe, NvidiaSmiProbe, ResourceArbiter, StaticProbe};
use crate::scanner::{sha256_file, ScanReport, Scanner, ScannerConfig};
use crate::scheduler::{
    HealthConfig, HealthMonitor, PoolContext, PoolStats, TaskQueue, TaskStatus, WorkerCheckpoint,
    WorkerPool, WorkerPoolConfig,
};
use crate::storage::{StoreStats, TaskStore};

pub use config::{AcceleratorMode, ConfigError, ManagerConfig, MAX_WORKERS};
pub use fs_layout::{FsLayout, MoveOutcome};

/// Point-in-time view of a manager.
#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub running: bool,
    pub paused: bool,
    #[serde(rename = "uptime_secs", serialize_with = "serialize_secs")]
    pub uptime: Duration,
    /// Tickets waiting in the bounded queue.
    pub queue_depth: usize,
    /// Tasks completed, over the store's lifetime.
    pub tasks_processed: u64,
    /// Tasks failed terminally, over the store's lifetime.
    pub tasks_failed: u64,
    pub accelerator_available: bool,
    /// Bytes currently reserved by handlers.
    pub accelerator_memory_used: u64,
    pub workers: Vec<WorkerCheckpoint>,
}

fn serialize_secs<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

pub struct Manager {
    config: ManagerConfig,
    layout: FsLayout,
    store: TaskStore,
    queue: Arc<TaskQueue>,
    registry: SharedRegistry,
    accelerator: Accelerator,
    metrics: IngestMetrics,
    scanner: Arc<Scanner>,
    pool: WorkerPool,
    monitor: Arc<HealthMonitor>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    background: Vec<JoinHandle<()>>,
    started_at: Option<Instant>,
}

impl Manager {
    /// Creates a manager, probing for an accelerator unless disabled.
    pub async fn new(config: ManagerConfig) -> Result<Self, ManagerError> {
        match config.accelerator {
            AcceleratorMode::Auto => Self::with_probe(config, &NvidiaSmiProbe::new()).await,
            AcceleratorMode::Off => Self::with_probe(config, &StaticProbe::none()).await,
        }
    }

    /// Creates a manager with an explicit accelerator probe.
    ///
    /// Validates the configuration, creates the directories, opens and
    /// migrates the task store and sizes the accelerator budget.
    pub async fn with_probe(
        config: ManagerConfig,
        probe: &dyn DeviceProbe,
    ) -> Result<Self, ManagerError> {
        config.validate()?;

        let layout = FsLayout::new(
            &config.watch_dir,
            &config.processed_dir,
            &config.error_dir,
            &config.state_dir,
        );
        layout.create_dirs()?;

        let store = TaskStore::open(config.database_path())
            .await?
            .with_retry_policy(config.retry_policy());
        let accelerator =
            ResourceArbiter::detect(probe, config.num_workers, config.safety_factor).await;
        let metrics = IngestMetrics::new()?;

        let default_handler: Arc<dyn Handler> = if accelerator.available() {
            Arc::new(ChunkedCsvHandler::new(&config.processed_dir, config.chunk_rows))
        } else {
            Arc::new(CsvSummaryHandler::new(&config.processed_dir))
        };
        let registry = Arc::new(RwLock::new(HandlerRegistry::new(default_handler)));

        let queue = Arc::new(TaskQueue::new(config.queue_capacity));
        let scanner = Arc::new(
            Scanner::new(
                scanner_config(&config),
                store.clone(),
                Some(Arc::clone(&queue)),
            )?
            .with_layout(layout.clone()),
        );

        let pool = WorkerPool::new(
            WorkerPoolConfig::new(config.num_workers)
                .with_poll_interval(config.poll_interval)
                .with_handler_deadline(config.handler_deadline())
                .with_shutdown_timeout(config.shutdown_timeout),
            PoolContext {
                store: store.clone(),
                queue: Arc::clone(&queue),
                registry: Arc::clone(&registry),
                accelerator: accelerator.clone(),
                layout: layout.clone(),
                metrics: metrics.clone(),
            },
        );
        let monitor = Arc::new(HealthMonitor::new(
            HealthConfig {
                stuck_timeout: config.stuck_timeout,
                checkpoint_interval: config.checkpoint_interval,
                checkpoint_dir: layout.checkpoint_dir(),
            },
            store.clone(),
            pool.slots().to_vec(),
            layout.clone(),
            metrics.clone(),
            pool.shared_stats(),
        ));

        info!(
            watch_dir = %config.watch_dir.display(),
            num_workers = config.num_workers,
            queue_capacity = config.queue_capacity,
            accelerator = accelerator.available(),
            budget_per_worker = accelerator.budget_per_worker(),
            "Manager initialized"
        );

        Ok(Self {
            config,
            layout,
            store,
            queue,
            registry,
            accelerator,
            metrics,
            scanner,
            pool,
            monitor,
            shutdown_tx: None,
            background: Vec::new(),
            started_at: None,
        })
    }

    /// Registers a handler for file names matching `pattern`. Earlier
    /// registrations take precedence. May be called while running.
    pub fn add_handler(&self, pattern: &str, handler: Arc<dyn Handler>) -> Result<(), ManagerError> {
        self.registry
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .add_handler(pattern, handler)
    }

    /// Replaces the handler used when no pattern matches.
    pub fn set_default_handler(&self, handler: Arc<dyn Handler>) {
        self.registry
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .set_default(handler);
    }

    /// Recovers interrupted work and starts the scanner, workers and
    /// health monitor.
    pub async fn start(&mut self) -> Result<(), ManagerError> {
        if self.is_running() {
            return Err(ManagerError::AlreadyRunning);
        }

        for task in self.store.recover_interrupted().await? {
            if task.status == TaskStatus::Failed {
                if let Err(e) = self.layout.move_to_error(&task.file_path) {
                    error!(task_id = task.id, error = %e, "Failed to move recovered file");
                }
            }
        }
        let reconciled = self.reconcile().await?;
        if reconciled > 0 {
            info!(reconciled, "Moved finished files left in the watch directory");
        }
        if let Err(e) = self.queue.refill(&self.store).await {
            warn!(error = %e, "Initial queue refill failed");
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        self.pool.start().await?;

        self.background.push(tokio::spawn(Arc::clone(&self.scanner).run(
            self.config.scan_interval,
            shutdown_tx.subscribe(),
            self.pool.subscribe_paused(),
        )));
        self.background
            .push(tokio::spawn(Arc::clone(&self.monitor).run(shutdown_tx.subscribe())));

        self.shutdown_tx = Some(shutdown_tx);
        self.started_at = Some(Instant::now());
        info!("Manager started");
        Ok(())
    }

    /// Stops scanning, drains the workers (each finishes its attempt in
    /// flight) and persists final checkpoints.
    pub async fn stop(&mut self) -> Result<(), ManagerError> {
        let Some(shutdown_tx) = self.shutdown_tx.take() else {
            return Err(ManagerError::NotRunning);
        };

        info!("Stopping manager");
        let _ = shutdown_tx.send(());
        let pool_result = self.pool.shutdown().await;

        for handle in self.background.drain(..) {
            if let Err(e) = handle.await {
                error!(error = %e, "Background task panicked");
            }
        }

        if let Err(e) = self.monitor.persist_stopped().await {
            error!(error = %e, "Failed to persist final checkpoints");
        }
        self.started_at = None;

        match pool_result {
            Ok(()) => {
                info!("Manager stopped");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Workers did not stop in time");
                Err(e.into())
            }
        }
    }

    /// Stops claiming new tasks and pauses the scanner.
    pub fn pause(&self) {
        self.pool.pause();
        info!("Manager paused");
    }

    pub fn resume(&self) {
        self.pool.resume();
        info!("Manager resumed");
    }

    pub fn is_running(&self) -> bool {
        self.shutdown_tx.is_some()
    }

    pub fn is_paused(&self) -> bool {
        self.pool.is_paused()
    }

    /// Runs one scan pass and returns without waiting for queue room.
    ///
    /// Files beyond the pending limit (`queue_capacity`) are reported as
    /// `deferred` and registered by a later pass, so the call never suspends
    /// on a full or paused pool.
    ///
    /// While stopped, the pass does not wait for file stability (a single
    /// pass cannot observe a file twice) and issues no queue tickets; the
    /// next `start` picks the rows up.
    pub async fn scan_once(&self) -> Result<ScanReport, ManagerError> {
        if self.is_running() {
            return Ok(self.scanner.try_scan().await?);
        }
        let offline = Scanner::new(
            scanner_config(&self.config).with_require_stable(false),
            self.store.clone(),
            None,
        )?
        .with_layout(self.layout.clone());
        Ok(offline.try_scan().await?)
    }

    /// Moves files of terminal rows still sitting in the watch directory
    /// with unchanged content. Closes the window between recording an
    /// outcome and moving the file.
    async fn reconcile(&self) -> Result<usize, ManagerError> {
        let mut moved = 0;
        for status in [TaskStatus::Completed, TaskStatus::Failed] {
            for task in self.store.list_by_status(status).await? {
                if !task.file_path.is_file() {
                    continue;
                }
                let path = task.file_path.clone();
                let hashed = tokio::task::spawn_blocking(move || sha256_file(&path)).await;
                let hash = match hashed {
                    Ok(Ok(hash)) => hash,
                    Ok(Err(e)) => {
                        warn!(path = %task.file_path.display(), error = %e, "File unreadable, skipping reconcile");
                        continue;
                    }
                    Err(e) => {
                        warn!(task_id = task.id, error = %e, "Hashing task panicked");
                        continue;
                    }
                };
                if hash != task.content_hash {
                    continue;
                }

                let outcome = if status == TaskStatus::Completed {
                    self.layout.move_to_processed(&task.file_path)?
                } else {
                    self.layout.move_to_error(&task.file_path)?
                };
                if matches!(outcome, MoveOutcome::Moved(_)) {
                    moved += 1;
                }
            }
        }
        Ok(moved)
    }

    /// Current lifecycle, queue, accelerator and worker state.
    pub async fn stats(&self) -> Result<Stats, ManagerError> {
        let counts = self.store.task_counts().await?;
        let queue_depth = self.queue.depth();
        self.metrics.queue_depth.set(queue_depth as i64);

        Ok(Stats {
            running: self.is_running(),
            paused: self.is_paused(),
            uptime: self.started_at.map(|t| t.elapsed()).unwrap_or_default(),
            queue_depth,
            tasks_processed: counts.completed,
            tasks_failed: counts.failed,
            accelerator_available: self.accelerator.available(),
            accelerator_memory_used: self.accelerator.reserved_bytes(),
            workers: self.pool.checkpoints(),
        })
    }

    /// Task counts by status and the persisted checkpoints.
    pub async fn task_stats(&self) -> Result<StoreStats, ManagerError> {
        Ok(self.store.stats().await?)
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Prometheus text exposition of this manager's metrics.
    pub fn export_metrics(&self) -> String {
        self.metrics
            .accelerator_reserved_bytes
            .set(self.accelerator.reserved_bytes() as i64);
        self.metrics.export()
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn layout(&self) -> &FsLayout {
        &self.layout
    }

    pub fn accelerator(&self) -> &Accelerator {
        &self.accelerator
    }
}

fn scanner_config(config: &ManagerConfig) -> ScannerConfig {
    ScannerConfig::new(&config.watch_dir)
        .with_file_pattern(config.file_pattern.clone())
        .with_require_stable(config.require_stable)
        .with_max_retries(config.max_retries)
        .with_max_pending(config.queue_capacity as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;
    use crate::handlers::HandlerContext;
    use crate::scheduler::NewTask;
    use std::path::Path;

    fn test_config(root: &Path) -> ManagerConfig {
        ManagerConfig::new()
            .with_root(root)
            .with_num_workers(2)
            .with_require_stable(false)
            .with_scan_interval(Duration::from_millis(50))
            .with_poll_interval(Duration::from_millis(20))
            .with_accelerator(AcceleratorMode::Off)
    }

    #[tokio::test]
    async fn test_new_creates_layout() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Manager::new(test_config(dir.path())).await.unwrap();

        assert!(manager.layout().watch_dir.is_dir());
        assert!(manager.layout().checkpoint_dir().is_dir());
        assert!(dir.path().join("state/tasks.db").exists());
        assert!(!manager.accelerator().available());
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let result = Manager::new(test_config(dir.path()).with_num_workers(0)).await;
        assert!(matches!(result, Err(ManagerError::Config(_))));
    }

    #[tokio::test]
    async fn test_lifecycle_errors() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = Manager::new(test_config(dir.path())).await.unwrap();

        assert!(matches!(manager.stop().await, Err(ManagerError::NotRunning)));
        manager.start().await.unwrap();
        assert!(matches!(manager.start().await, Err(ManagerError::AlreadyRunning)));
        manager.stop().await.unwrap();

        let stats = manager.stats().await.unwrap();
        assert!(!stats.running);
        assert_eq!(stats.workers.len(), 2);
    }

    #[tokio::test]
    async fn test_offline_scan_registers_without_stability() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Manager::new(test_config(dir.path()).with_require_stable(true))
            .await
            .unwrap();
        std::fs::write(manager.layout().watch_dir.join("a.csv"), "x\n1\n").unwrap();

        let report = manager.scan_once().await.unwrap();
        assert_eq!(report.enqueued, 1);
        assert_eq!(manager.task_stats().await.unwrap().tasks.pending, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_scan_once_does_not_wait_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = Manager::new(
            test_config(dir.path())
                .with_queue_capacity(1)
                .with_scan_interval(Duration::from_secs(3600)),
        )
        .await
        .unwrap();
        manager.start().await.unwrap();
        // Let the first (empty) scan pass before any file appears.
        tokio::time::sleep(Duration::from_millis(200)).await;
        manager.pause();
        for i in 0..3 {
            std::fs::write(
                manager.layout().watch_dir.join(format!("{}.csv", i)),
                format!("x\n{}\n", i),
            )
            .unwrap();
        }

        let report = tokio::time::timeout(Duration::from_secs(5), manager.scan_once())
            .await
            .expect("scan_once must not wait for room")
            .unwrap();
        assert_eq!(report.enqueued, 1);
        assert_eq!(report.deferred, 2);
        assert_eq!(manager.store().pending_count().await.unwrap(), 1);

        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_offline_scan_respects_pending_limit() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Manager::new(test_config(dir.path()).with_queue_capacity(2))
            .await
            .unwrap();
        for i in 0..5 {
            std::fs::write(
                manager.layout().watch_dir.join(format!("{}.csv", i)),
                format!("x\n{}\n", i),
            )
            .unwrap();
        }

        let report = manager.scan_once().await.unwrap();
        assert_eq!(report.enqueued, 2);
        assert_eq!(report.deferred, 3);
    }

    #[tokio::test]
    async fn test_reconcile_moves_finished_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = Manager::new(test_config(dir.path())).await.unwrap();
        let path = manager.layout().watch_dir.join("done.csv");
        std::fs::write(&path, "x\n1\n").unwrap();
        let hash = sha256_file(&path).unwrap();

        let store = manager.store().clone();
        let task = store.enqueue(NewTask::new(&path, hash)).await.unwrap();
        store.claim_next("worker-old").await.unwrap().unwrap();
        store
            .complete(task.id, "worker-old", crate::scheduler::TaskOutcome::Success)
            .await
            .unwrap();

        manager.start().await.unwrap();
        manager.stop().await.unwrap();

        assert!(!path.exists());
        assert!(manager.layout().processed_dir.join("done.csv").exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_custom_handler_and_metrics() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = Manager::new(test_config(dir.path())).await.unwrap();
        manager
            .add_handler(
                "*.csv",
                Arc::new(|_: &Path, _: &HandlerContext| -> Result<bool, HandlerError> { Ok(true) }),
            )
            .unwrap();
        std::fs::write(manager.layout().watch_dir.join("a.csv"), "x\n1\n").unwrap();

        manager.start().await.unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        while manager.stats().await.unwrap().tasks_processed < 1 {
            assert!(Instant::now() < deadline, "file never processed");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        manager.stop().await.unwrap();

        assert!(manager.layout().processed_dir.join("a.csv").exists());
        assert!(manager
            .export_metrics()
            .contains("ingest_tasks_total{outcome=\"completed\"} 1"));
    }
}
