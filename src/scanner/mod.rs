//! Watch-directory scanner.
//!
//! Each scan lists the watch directory (non-recursive), keeps files matching
//! the configured glob that have been stable for two polls, hashes them and
//! registers the unseen ones in the task store. A scan of an unchanged
//! directory registers nothing.
//!
//! Admission is bounded by the number of *pending* rows, not by queue
//! tickets: rows held back by retry backoff or by a same-content task in
//! progress have no ticket but still wait for a worker. With a limit of `K`
//! the scanner inserts only while fewer than `K` rows are pending, so pending
//! plus processing rows stay at or below `K` plus the worker count.
//! [`Scanner::scan`] waits for room; [`Scanner::try_scan`] reports the
//! overflow as deferred and returns.
//!
//! A file whose path and content match a finished task is moved out of the
//! watch directory (to the processed or error directory) when a layout is
//! attached, instead of being re-hashed on every poll.

pub mod fingerprint;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use globset::{GlobBuilder, GlobMatcher};
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::error::{ManagerError, ScanError};
use crate::manager::{FsLayout, MoveOutcome};
use crate::scheduler::{
    FileTask, NewTask, TaskQueue, TaskStatus, DEFAULT_MAX_RETRIES, DEFAULT_PRIORITY,
};
use crate::storage::{StoreError, TaskStore};

pub use fingerprint::{sha256_file, FileStamp, StabilityTracker};

/// How long a waiting scan sleeps before rechecking the pending count when
/// no claim wakes it.
const ROOM_RECHECK: Duration = Duration::from_millis(100);

/// Scanner settings.
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    pub watch_dir: PathBuf,
    /// Glob applied to file names (case-insensitive).
    pub file_pattern: String,
    /// Wait for two identical size/mtime polls before hashing.
    pub require_stable: bool,
    /// Attempt budget for new tasks.
    pub max_retries: u32,
    pub priority: i32,
    /// Pending rows allowed before new files are held back. `None` admits
    /// everything.
    pub max_pending: Option<u64>,
}

impl ScannerConfig {
    pub fn new(watch_dir: impl Into<PathBuf>) -> Self {
        Self {
            watch_dir: watch_dir.into(),
            file_pattern: "*.csv".to_string(),
            require_stable: true,
            max_retries: DEFAULT_MAX_RETRIES,
            priority: DEFAULT_PRIORITY,
            max_pending: None,
        }
    }

    pub fn with_file_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.file_pattern = pattern.into();
        self
    }

    pub fn with_require_stable(mut self, require_stable: bool) -> Self {
        self.require_stable = require_stable;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_max_pending(mut self, max_pending: u64) -> Self {
        self.max_pending = Some(max_pending);
        self
    }
}

/// What one scan did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    /// Matching files listed.
    pub seen: usize,
    /// Files skipped because they were still changing.
    pub unstable: usize,
    /// Files already tracked by a live task (not hashed).
    pub tracked: usize,
    /// New tasks registered.
    pub enqueued: usize,
    /// Files whose path and content were already recorded.
    pub duplicates: usize,
    /// Files held back because the pending limit was reached.
    pub deferred: usize,
    /// Files skipped because of transient I/O errors.
    pub transient_errors: usize,
}

impl std::fmt::Display for ScanReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "seen={} enqueued={} duplicates={} deferred={} tracked={} unstable={} transient_errors={}",
            self.seen,
            self.enqueued,
            self.duplicates,
            self.deferred,
            self.tracked,
            self.unstable,
            self.transient_errors
        )
    }
}

/// Polls the watch directory and registers new tasks.
pub struct Scanner {
    config: ScannerConfig,
    matcher: GlobMatcher,
    store: TaskStore,
    queue: Option<Arc<TaskQueue>>,
    layout: Option<FsLayout>,
    stability: Mutex<StabilityTracker>,
    /// Serializes the pending-count check with the insert it guards.
    admission: tokio::sync::Mutex<()>,
}

/// What a scan does when the pending limit is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Wait,
    Skip,
}

impl Scanner {
    /// Creates a scanner. Without a queue, tasks are only registered; a
    /// running pool picks them up through its refill step.
    pub fn new(
        config: ScannerConfig,
        store: TaskStore,
        queue: Option<Arc<TaskQueue>>,
    ) -> Result<Self, ManagerError> {
        let matcher = GlobBuilder::new(&config.file_pattern)
            .case_insensitive(true)
            .literal_separator(true)
            .build()
            .map_err(|e| ManagerError::InvalidPattern {
                pattern: config.file_pattern.clone(),
                message: e.to_string(),
            })?
            .compile_matcher();

        Ok(Self {
            config,
            matcher,
            store,
            queue,
            layout: None,
            stability: Mutex::new(StabilityTracker::new()),
            admission: tokio::sync::Mutex::new(()),
        })
    }

    /// Lets the scanner move re-dropped copies of finished files.
    pub fn with_layout(mut self, layout: FsLayout) -> Self {
        self.layout = Some(layout);
        self
    }

    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }

    /// Runs one scan, waiting for room whenever the pending limit is
    /// reached. Only returns early on error; cancel it to stop waiting.
    pub async fn scan(&self) -> Result<ScanReport, ScanError> {
        self.scan_with(Admission::Wait).await
    }

    /// Runs one scan without ever waiting: files over the pending limit
    /// are counted as `deferred` and picked up by a later scan.
    pub async fn try_scan(&self) -> Result<ScanReport, ScanError> {
        self.scan_with(Admission::Skip).await
    }

    async fn scan_with(&self, admission: Admission) -> Result<ScanReport, ScanError> {
        let mut report = ScanReport::default();
        let candidates = self.list_candidates(&mut report)?;

        for path in candidates {
            match self.register(&path, admission).await {
                Ok(Registration::Enqueued) => report.enqueued += 1,
                Ok(Registration::Tracked) => report.tracked += 1,
                Ok(Registration::Duplicate) => report.duplicates += 1,
                Ok(Registration::Deferred) => report.deferred += 1,
                Err(ScanError::TransientIo { path, source }) => {
                    warn!(path = %path.display(), error = %source, "Transient I/O error, will retry");
                    report.transient_errors += 1;
                    self.lock_stability().forget(&path);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(report)
    }

    /// Lists matching, stable files in name order.
    fn list_candidates(&self, report: &mut ScanReport) -> Result<Vec<PathBuf>, ScanError> {
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        let mut stability = self.lock_stability();

        let walker = WalkDir::new(&self.config.watch_dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name();

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) if e.depth() == 0 => {
                    return Err(ScanError::WatchDirUnreadable(
                        self.config.watch_dir.clone(),
                        e.to_string(),
                    ));
                }
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable directory entry");
                    report.transient_errors += 1;
                    continue;
                }
            };

            if !entry.file_type().is_file() || !self.matches(entry.path()) {
                continue;
            }

            let path = entry.path().to_path_buf();
            report.seen += 1;
            seen.insert(path.clone());

            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Cannot stat file, will retry");
                    report.transient_errors += 1;
                    continue;
                }
            };

            let stamp = FileStamp::from_metadata(&metadata);
            let stable = stability.observe(&path, stamp);
            if self.config.require_stable && !stable {
                report.unstable += 1;
                continue;
            }
            candidates.push(path);
        }

        stability.retain_seen(&seen);
        Ok(candidates)
    }

    fn matches(&self, path: &Path) -> bool {
        path.file_name()
            .map(|name| self.matcher.is_match(name))
            .unwrap_or(false)
    }

    async fn register(&self, path: &Path, admission: Admission) -> Result<Registration, ScanError> {
        let existing = self.store.find_by_path(path).await?;
        if existing.as_ref().is_some_and(|t| !t.status.is_terminal()) {
            return Ok(Registration::Tracked);
        }

        let hash = hash_blocking(path.to_path_buf()).await?;
        if let Some(finished) = existing.filter(|t| t.content_hash == hash) {
            self.clear_finished(path, &finished)?;
            return Ok(Registration::Duplicate);
        }

        loop {
            if let Some(registration) = self.try_admit(path, &hash).await? {
                return Ok(registration);
            }
            if admission == Admission::Skip {
                debug!(path = %path.display(), "Pending limit reached, deferring file");
                return Ok(Registration::Deferred);
            }

            match &self.queue {
                Some(queue) => queue.wait_for_room(ROOM_RECHECK).await,
                None => tokio::time::sleep(ROOM_RECHECK).await,
            }
            if !path.is_file() {
                return Err(ScanError::TransientIo {
                    path: path.to_path_buf(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        "file vanished while waiting for admission",
                    ),
                });
            }
        }
    }

    /// Inserts the task if the pending limit allows it. `None` means no
    /// room.
    async fn try_admit(&self, path: &Path, hash: &str) -> Result<Option<Registration>, ScanError> {
        let _admission = self.admission.lock().await;

        if let Some(limit) = self.config.max_pending {
            if self.store.pending_count().await? >= limit {
                return Ok(None);
            }
        }

        let task = NewTask::new(path, hash)
            .with_priority(self.config.priority)
            .with_max_retries(self.config.max_retries);

        match self.store.enqueue(task).await {
            Ok(task) => {
                // A full queue already has enough wake-ups; refill covers
                // the rest.
                if let Some(permit) = self.queue.as_ref().and_then(|q| q.try_reserve()) {
                    permit.admit(task.id);
                }
                info!(task_id = task.id, path = %path.display(), "New task registered");
                Ok(Some(Registration::Enqueued))
            }
            Err(StoreError::DuplicateTask { .. }) => Ok(Some(Registration::Duplicate)),
            Err(e) => Err(e.into()),
        }
    }

    /// Moves a file whose content already finished under the same path.
    fn clear_finished(&self, path: &Path, finished: &FileTask) -> Result<(), ScanError> {
        let Some(layout) = &self.layout else {
            return Ok(());
        };

        let moved = if finished.status == TaskStatus::Completed {
            layout.move_to_processed(path)
        } else {
            layout.move_to_error(path)
        };
        match moved {
            Ok(MoveOutcome::Moved(destination)) => {
                info!(
                    task_id = finished.id,
                    path = %path.display(),
                    destination = %destination.display(),
                    "Finished content dropped again, moved out of watch directory"
                );
                Ok(())
            }
            Ok(MoveOutcome::SourceMissing) => Ok(()),
            Err(source) => Err(ScanError::TransientIo {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    fn lock_stability(&self) -> std::sync::MutexGuard<'_, StabilityTracker> {
        self.stability
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Scan loop: scans every `interval`, then tops up the queue with
    /// tickets for retries and recovered tasks. Stops on shutdown.
    pub async fn run(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown_rx: broadcast::Receiver<()>,
        paused_rx: watch::Receiver<bool>,
    ) {
        info!(watch_dir = %self.config.watch_dir.display(), "Scanner started");

        loop {
            if !*paused_rx.borrow() {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    result = self.scan() => match result {
                        Ok(report) if report.enqueued > 0 => info!(%report, "Scan complete"),
                        Ok(report) => debug!(%report, "Scan complete"),
                        Err(e) => error!(error = %e, "Scan failed"),
                    },
                }

                if let Some(queue) = &self.queue {
                    if let Err(e) = queue.refill(&self.store).await {
                        warn!(error = %e, "Queue refill failed");
                    }
                }
            }

            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        info!("Scanner stopped");
    }
}

enum Registration {
    Enqueued,
    Tracked,
    Duplicate,
    Deferred,
}

async fn hash_blocking(path: PathBuf) -> Result<String, ScanError> {
    let hashed = tokio::task::spawn_blocking({
        let path = path.clone();
        move || sha256_file(&path)
    })
    .await;

    match hashed {
        Ok(Ok(hash)) => Ok(hash),
        Ok(Err(source)) => Err(ScanError::TransientIo { path, source }),
        Err(join) => Err(ScanError::TransientIo {
            path,
            source: std::io::Error::new(std::io::ErrorKind::Other, join.to_string()),
        }),
    }
}
