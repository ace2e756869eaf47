//! Durable task storage.
//!
//! The storage layer is a single SQLite database holding:
//! - **tasks**: one row per input file, from discovery to a terminal outcome
//! - **checkpoints**: one row per worker with its progress counters
//! - **_migrations**: schema bookkeeping
//!
//! # Usage
//!
//! ```rust,ignore
//! use ingest_forge::storage::TaskStore;
//! use ingest_forge::scheduler::{NewTask, TaskOutcome};
//!
//! let store = TaskStore::open("thread_data/tasks.db").await?;
//! store.enqueue(NewTask::new("data/csv_input/a.csv", hash)).await?;
//!
//! if let Some(task) = store.claim_next("worker-0").await? {
//!     store.complete(task.id, "worker-0", TaskOutcome::Success).await?;
//! }
//! ```

pub mod migrations;
pub mod schema;
pub mod task_store;

pub use migrations::{MigrationError, MigrationRunner};
pub use task_store::{StoreError, StoreStats, TaskCounts, TaskStore, INTERRUPTED_MESSAGE};
