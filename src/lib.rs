//! ingest-forge: crash-recoverable file ingestion.
//!
//! A scanner watches a directory and records every matching file in a
//! durable SQLite task store. A bounded queue admits tasks to a pool of
//! workers that run pluggable handlers, retry failures with backoff and move
//! each file to a processed or error directory. A health monitor reclaims
//! tasks from stuck workers and persists per-worker checkpoints.

pub mod cli;
pub mod error;
pub mod handlers;
pub mod manager;
pub mod metrics;
pub mod resources;
pub mod scanner;
pub mod scheduler;
pub mod storage;

// Re-export commonly used types
pub use error::{HandlerError, ManagerError, ResourceError, ScanError};
pub use handlers::{Handler, HandlerContext, HandlerRegistry};
pub use manager::{Manager, ManagerConfig, Stats};
pub use scheduler::{FileTask, TaskStatus, WorkerCheckpoint, WorkerState};
pub use storage::{StoreError, TaskStore};
