//! Error types shared across ingest-forge subsystems.
//!
//! Subsystem-local errors live next to the code that raises them
//! (`StoreError` in the task store, `QueueError` in the queue, `PoolError` in
//! the worker pool, `ConfigError` in the manager config). This module holds
//! the cross-cutting ones:
//! - Scanning (transient filesystem trouble)
//! - Handler execution
//! - Accelerator budgeting
//! - The manager facade, which wraps everything else

use std::path::PathBuf;

use thiserror::Error;

use crate::manager::ConfigError;
use crate::scheduler::PoolError;
use crate::storage::{MigrationError, StoreError};

/// Errors raised while scanning the watch directory.
#[derive(Debug, Error)]
pub enum ScanError {
    /// The file was momentarily unreadable (locked, vanished, permission flap).
    /// Logged and retried on the next poll; never becomes a task failure.
    #[error("Transient I/O error on '{path}': {source}")]
    TransientIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Watch directory '{0}' is not readable: {1}")]
    WatchDirUnreadable(PathBuf, String),

    #[error("Task store error: {0}")]
    Store(#[from] StoreError),
}

/// Errors a handler may report for a single file.
///
/// Every variant is caught at the worker-loop boundary and converted into a
/// retry or a terminal failure.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Handler failed: {0}")]
    Failed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// The handler observed its soft deadline or abort flag and gave up.
    #[error("Handler aborted: {0}")]
    Aborted(String),

    #[error("Handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    /// Creates a generic failure with a message.
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }
}

/// Errors raised by the resource arbiter.
#[derive(Debug, Error)]
pub enum ResourceError {
    /// The request does not fit the advisory budget. Handlers catch this and
    /// fall back to the CPU/chunked path.
    #[error("Accelerator budget exhausted: requested {requested} bytes, {available} available")]
    Exhausted { requested: u64, available: u64 },

    #[error("Accelerator probe failed: {0}")]
    ProbeFailed(String),
}

/// Errors surfaced by the [`Manager`](crate::manager::Manager) facade.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Task store error: {0}")]
    Store(#[from] StoreError),

    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),

    #[error("Worker pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Scan error: {0}")]
    Scan(#[from] ScanError),

    #[error("Invalid handler pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("Manager is already running")]
    AlreadyRunning,

    #[error("Manager is not running")]
    NotRunning,

    #[error("Metrics registration failed: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_error_display() {
        let err = ScanError::TransientIo {
            path: PathBuf::from("watch/a.csv"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "locked"),
        };
        let text = err.to_string();
        assert!(text.contains("watch/a.csv"));
        assert!(text.contains("locked"));
    }

    #[test]
    fn test_resource_error_display() {
        let err = ResourceError::Exhausted {
            requested: 2048,
            available: 1024,
        };
        assert!(err.to_string().contains("2048"));
        assert!(err.to_string().contains("1024"));
    }

    #[test]
    fn test_handler_error_helpers() {
        let err = HandlerError::failed("bad header");
        assert!(matches!(err, HandlerError::Failed(_)));
        assert!(err.to_string().contains("bad header"));

        let err = HandlerError::Aborted("deadline".to_string());
        assert!(err.to_string().contains("aborted"));
    }

    #[test]
    fn test_manager_error_display() {
        let err = ManagerError::InvalidPattern {
            pattern: "[".to_string(),
            message: "unclosed class".to_string(),
        };
        assert!(err.to_string().contains("unclosed class"));
        assert!(ManagerError::AlreadyRunning.to_string().contains("already running"));
    }
}
