//! Task lifecycle, bounded queue, worker pool and health monitoring.
//!
//! - **FileTask**: one file's durable record and its state machine
//! - **TaskQueue**: bounded ticket channel providing backpressure
//! - **WorkerPool**: workers that claim tasks and run handlers
//! - **HealthMonitor**: stuck-worker detection and checkpoint persistence
//!
//! # Architecture
//!
//! ```text
//!    ┌──────────┐  insert   ┌────────────┐
//!    │ Scanner  ├──────────►│ Task Store │◄─────────────┐
//!    └────┬─────┘           └─────┬──────┘              │
//!         │ ticket                │ claim / complete    │ reclaim
//!    ┌────▼─────┐                 │                ┌────┴─────┐
//!    │TaskQueue │                 │                │ Health   │
//!    └────┬─────┘                 │                │ Monitor  │
//!         │                       │                └──────────┘
//!   ┌─────┼─────────────┬─────────┘
//!   ▼     ▼             ▼
//! ┌─────────┐     ┌─────────┐
//! │ Worker 0│ ... │ Worker N│
//! └─────────┘     └─────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use ingest_forge::scheduler::{PoolContext, WorkerPool, WorkerPoolConfig};
//!
//! let mut pool = WorkerPool::new(WorkerPoolConfig::new(4), ctx);
//! pool.start().await?;
//!
//! // Graceful shutdown
//! pool.shutdown().await?;
//! ```

pub mod checkpoint;
pub mod health;
pub mod queue;
pub mod task;
pub mod worker_pool;

pub use checkpoint::{SharedCheckpoint, WorkerCheckpoint, WorkerState};
pub use health::{HealthConfig, HealthMonitor, StuckWorkerError};
pub use queue::{Permit, QueueError, TaskQueue, Ticket};
pub use task::{
    FileTask, NewTask, RetryPolicy, TaskId, TaskOutcome, TaskStatus, TaskTransition,
    DEFAULT_MAX_RETRIES, DEFAULT_PRIORITY,
};
pub use worker_pool::{
    PoolContext, PoolError, PoolStats, WorkerPool, WorkerPoolConfig, WorkerSlot,
};
