//! Task definitions for the scheduler.
//!
//! This module defines the durable task types tracked by the task store:
//!
//! - `FileTask`: one input file's lifecycle from discovery to a terminal outcome
//! - `NewTask`: what the scanner registers for an unseen file
//! - `TaskStatus`: the task state machine
//! - `TaskOutcome` / `TaskTransition`: the result of a completion
//! - `RetryPolicy`: backoff between failed attempts

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default maximum number of attempts for a task.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default priority for tasks (0 is normal priority).
pub const DEFAULT_PRIORITY: i32 = 0;

/// Row identifier of a task in the store.
pub type TaskId = i64;

/// Status of a file task.
///
/// `Pending -> Processing -> Completed | Pending (retry) | Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting to be claimed.
    Pending,
    /// Claimed by a worker.
    Processing,
    /// Handler succeeded (terminal).
    Completed,
    /// Retries exhausted (terminal).
    Failed,
}

impl TaskStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [TaskStatus; 4] = [
        TaskStatus::Pending,
        TaskStatus::Processing,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ];

    /// Returns the string stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    /// Returns whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(format!("unknown task status '{}'", other)),
        }
    }
}

/// A task registered by the scanner for a newly discovered file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTask {
    /// Absolute or watch-relative path of the file (unique key).
    pub file_path: PathBuf,
    /// Hex SHA-256 of the file content (dedup key).
    pub content_hash: String,
    /// Priority (higher values are claimed first).
    pub priority: i32,
    /// Maximum number of attempts before the task is marked failed.
    pub max_retries: u32,
}

impl NewTask {
    /// Creates a new task with default priority and retry budget.
    pub fn new(file_path: impl Into<PathBuf>, content_hash: impl Into<String>) -> Self {
        Self {
            file_path: file_path.into(),
            content_hash: content_hash.into(),
            priority: DEFAULT_PRIORITY,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the maximum number of attempts.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// Durable record of one file's lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileTask {
    /// Row identifier.
    pub id: TaskId,
    /// Path of the file in the watch directory.
    pub file_path: PathBuf,
    /// Hex SHA-256 of the content at discovery time.
    pub content_hash: String,
    /// Current status.
    pub status: TaskStatus,
    /// Priority (higher values are claimed first).
    pub priority: i32,
    /// When the task was registered.
    pub created_at: DateTime<Utc>,
    /// When the current (or last) attempt was claimed.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Earliest time the task may be claimed again (retry backoff).
    pub available_at: DateTime<Utc>,
    /// Number of failed attempts so far.
    pub retry_count: u32,
    /// Attempt budget.
    pub max_retries: u32,
    /// Last failure reason, kept for postmortem.
    pub error_message: Option<String>,
    /// Worker that owns (or last owned) the task.
    pub owning_worker_id: Option<String>,
}

impl FileTask {
    /// Returns whether another attempt is allowed after a failure.
    pub fn should_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Returns the number of remaining attempts.
    pub fn remaining_attempts(&self) -> u32 {
        self.max_retries.saturating_sub(self.retry_count)
    }

    /// The 1-based number of the attempt currently in progress.
    pub fn attempt(&self) -> u32 {
        self.retry_count + 1
    }

    /// The file's base name, used for handler matching and destination paths.
    pub fn file_name(&self) -> Option<&str> {
        self.file_path.file_name().and_then(|n| n.to_str())
    }

    /// Returns how long the current attempt has been running.
    pub fn running_for(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        match (self.status, self.started_at) {
            (TaskStatus::Processing, Some(started)) => Some(now - started),
            _ => None,
        }
    }

    /// Returns the path as a `&Path`.
    pub fn path(&self) -> &Path {
        &self.file_path
    }
}

/// What a worker (or the health monitor) reports for an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The handler returned `true`.
    Success,
    /// The handler returned `false`, failed, panicked, or the attempt timed out.
    Failure { error: String },
}

impl TaskOutcome {
    /// Creates a failure outcome.
    pub fn failure(error: impl Into<String>) -> Self {
        TaskOutcome::Failure {
            error: error.into(),
        }
    }

    /// Returns whether this is a success.
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Success)
    }
}

/// The state a task landed in after `complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskTransition {
    /// Processing -> Completed.
    Completed,
    /// Processing -> Pending, claimable again after the backoff.
    Retrying { retry_count: u32, backoff: Duration },
    /// Processing -> Failed (retries exhausted).
    Failed { retry_count: u32 },
}

impl TaskTransition {
    /// Returns whether the task reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskTransition::Retrying { .. })
    }
}

impl std::fmt::Display for TaskTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskTransition::Completed => write!(f, "completed"),
            TaskTransition::Retrying { retry_count, .. } => {
                write!(f, "retrying (attempt {} failed)", retry_count)
            }
            TaskTransition::Failed { retry_count } => {
                write!(f, "failed after {} attempts", retry_count)
            }
        }
    }
}

/// Exponential backoff between failed attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay after the first failure.
    pub base: Duration,
    /// Upper bound for any single delay.
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            max: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with the given base and cap.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// A policy without any delay, handy for tests and batch drains.
    pub fn immediate() -> Self {
        Self {
            base: Duration::ZERO,
            max: Duration::ZERO,
        }
    }

    /// Delay before the next attempt, given the number of failures so far.
    ///
    /// `base * 2^(retry_count - 1)`, capped at `max`.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        if retry_count == 0 {
            return Duration::ZERO;
        }
        let exponent = (retry_count - 1).min(20);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }
}
