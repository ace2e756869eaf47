//! Per-worker progress snapshots.
//!
//! Each worker owns one [`WorkerCheckpoint`] behind a [`SharedCheckpoint`].
//! The health monitor reads all of them, persists them to the task store and
//! mirrors them as JSON files, and is the only other writer (when it forces a
//! worker into [`WorkerState::Error`]).

use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::TaskId;

/// Worker state as reported in checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Idle,
    Processing,
    /// Set by the health monitor when the worker's task exceeded the stuck timeout.
    Error,
    Paused,
    Stopped,
}

impl WorkerState {
    /// Returns the string stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Idle => "idle",
            WorkerState::Processing => "processing",
            WorkerState::Error => "error",
            WorkerState::Paused => "paused",
            WorkerState::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(WorkerState::Idle),
            "processing" => Ok(WorkerState::Processing),
            "error" => Ok(WorkerState::Error),
            "paused" => Ok(WorkerState::Paused),
            "stopped" => Ok(WorkerState::Stopped),
            other => Err(format!("unknown worker state '{}'", other)),
        }
    }
}

/// Durable progress snapshot of one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerCheckpoint {
    pub worker_id: String,
    pub state: WorkerState,
    pub current_task: Option<TaskId>,
    pub start_time: DateTime<Utc>,
    pub files_processed: u64,
    pub files_failed: u64,
    /// Accumulated handler time, in seconds.
    pub total_processing_time: f64,
    /// Never decreases; see [`WorkerCheckpoint::stamp`].
    pub last_checkpoint: DateTime<Utc>,
}

impl WorkerCheckpoint {
    /// Creates a fresh idle checkpoint.
    pub fn new(worker_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            worker_id: worker_id.into(),
            state: WorkerState::Idle,
            current_task: None,
            start_time: now,
            files_processed: 0,
            files_failed: 0,
            total_processing_time: 0.0,
            last_checkpoint: now,
        }
    }

    /// Starts a new session from a previously persisted checkpoint, keeping
    /// the counters.
    pub fn resume_from(previous: WorkerCheckpoint) -> Self {
        Self {
            state: WorkerState::Idle,
            current_task: None,
            start_time: Utc::now(),
            ..previous
        }
    }

    /// Marks the start of an attempt.
    pub fn begin(&mut self, task_id: TaskId) {
        self.state = WorkerState::Processing;
        self.current_task = Some(task_id);
    }

    /// Records a finished attempt and returns to idle.
    pub fn finish(&mut self, success: bool, elapsed: Duration) {
        if success {
            self.files_processed += 1;
        } else {
            self.files_failed += 1;
        }
        self.total_processing_time += elapsed.as_secs_f64();
        self.current_task = None;
        if self.state != WorkerState::Error {
            self.state = WorkerState::Idle;
        }
    }

    /// Forces the error state. The task reference is kept for operators.
    pub fn mark_error(&mut self) {
        self.state = WorkerState::Error;
    }

    /// Advances `last_checkpoint`, never moving it backwards.
    pub fn stamp(&mut self, now: DateTime<Utc>) {
        if now > self.last_checkpoint {
            self.last_checkpoint = now;
        }
    }

    /// Average handler time per finished attempt.
    pub fn average_processing_time(&self) -> Duration {
        let attempts = self.files_processed + self.files_failed;
        if attempts == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.total_processing_time / attempts as f64)
    }

    /// Path of the JSON mirror inside `dir`.
    pub fn json_path(dir: &Path, worker_id: &str) -> PathBuf {
        dir.join(format!("{}.json", worker_id))
    }

    /// Writes the JSON mirror atomically (temp file in `dir`, then rename).
    pub fn write_json(&self, dir: &Path) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let target = Self::json_path(dir, &self.worker_id);
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, self)?;
        tmp.flush()?;
        tmp.persist(&target).map_err(|e| e.error)?;
        Ok(target)
    }

    /// Reads a JSON mirror back.
    pub fn read_json(path: &Path) -> std::io::Result<Self> {
        let data = std::fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }
}

/// A checkpoint shared between its worker and the health monitor.
#[derive(Debug, Clone)]
pub struct SharedCheckpoint(Arc<Mutex<WorkerCheckpoint>>);

impl SharedCheckpoint {
    pub fn new(checkpoint: WorkerCheckpoint) -> Self {
        Self(Arc::new(Mutex::new(checkpoint)))
    }

    /// Locks the checkpoint. A poisoned lock is recovered: the data is plain
    /// counters and stays meaningful.
    pub fn lock(&self) -> MutexGuard<'_, WorkerCheckpoint> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns a copy of the current snapshot.
    pub fn snapshot(&self) -> WorkerCheckpoint {
        self.lock().clone()
    }

    pub fn worker_id(&self) -> String {
        self.lock().worker_id.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_strings() {
        for state in [
            WorkerState::Idle,
            WorkerState::Processing,
            WorkerState::Error,
            WorkerState::Paused,
            WorkerState::Stopped,
        ] {
            assert_eq!(state.as_str().parse::<WorkerState>().unwrap(), state);
        }
        assert!("zombie".parse::<WorkerState>().is_err());
    }

    #[test]
    fn test_finish_updates_counters() {
        let mut cp = WorkerCheckpoint::new("worker-0");
        cp.begin(7);
        assert_eq!(cp.state, WorkerState::Processing);
        assert_eq!(cp.current_task, Some(7));

        cp.finish(true, Duration::from_millis(1500));
        cp.begin(8);
        cp.finish(false, Duration::from_millis(500));

        assert_eq!(cp.files_processed, 1);
        assert_eq!(cp.files_failed, 1);
        assert_eq!(cp.state, WorkerState::Idle);
        assert_eq!(cp.current_task, None);
        assert_eq!(cp.average_processing_time(), Duration::from_secs(1));
    }

    #[test]
    fn test_error_state_survives_late_finish() {
        let mut cp = WorkerCheckpoint::new("worker-1");
        cp.begin(3);
        cp.mark_error();
        cp.finish(false, Duration::ZERO);
        assert_eq!(cp.state, WorkerState::Error);
    }

    #[test]
    fn test_stamp_is_monotonic() {
        let mut cp = WorkerCheckpoint::new("worker-0");
        let later = cp.last_checkpoint + chrono::Duration::seconds(10);
        cp.stamp(later);
        assert_eq!(cp.last_checkpoint, later);

        cp.stamp(later - chrono::Duration::seconds(5));
        assert_eq!(cp.last_checkpoint, later);
    }

    #[test]
    fn test_resume_keeps_counters() {
        let mut cp = WorkerCheckpoint::new("worker-2");
        cp.files_processed = 5;
        cp.mark_error();
        cp.current_task = Some(1);

        let resumed = WorkerCheckpoint::resume_from(cp);
        assert_eq!(resumed.files_processed, 5);
        assert_eq!(resumed.state, WorkerState::Idle);
        assert_eq!(resumed.current_task, None);
    }

    #[test]
    fn test_json_mirror_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut cp = WorkerCheckpoint::new("worker-3");
        cp.files_processed = 2;

        let path = cp.write_json(dir.path()).unwrap();
        assert_eq!(path, dir.path().join("worker-3.json"));

        let back = WorkerCheckpoint::read_json(&path).unwrap();
        assert_eq!(back, cp);
    }

    #[test]
    fn test_shared_checkpoint_snapshot() {
        let shared = SharedCheckpoint::new(WorkerCheckpoint::new("worker-4"));
        shared.lock().begin(11);
        assert_eq!(shared.snapshot().current_task, Some(11));
        assert_eq!(shared.worker_id(), "worker-4");
    }
}
