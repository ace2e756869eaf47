//! SQLite-backed task store.
//!
//! The store is the single source of truth for file tasks and worker
//! checkpoints. Every state transition is one SQL statement, so concurrent
//! workers never need an explicit transaction:
//!
//! - `enqueue` is an upsert that re-arms a terminal row only when its content changed
//! - `claim_next` is `UPDATE … WHERE id = (SELECT … LIMIT 1) RETURNING *`
//! - `complete` is guarded by `status = 'processing' AND worker_id = ?`

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use thiserror::Error;

use crate::scheduler::checkpoint::{WorkerCheckpoint, WorkerState};
use crate::scheduler::task::{
    FileTask, NewTask, RetryPolicy, TaskId, TaskOutcome, TaskStatus, TaskTransition,
};

use super::migrations::{MigrationError, MigrationRunner};

/// Error message recorded for rows found `processing` at startup.
pub const INTERRUPTED_MESSAGE: &str = "interrupted by restart";

/// Errors that can occur during task store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The path is already tracked by a live task, or by a terminal task with
    /// the same content.
    #[error("Task for '{path}' already exists")]
    DuplicateTask { path: String },

    #[error("Task {0} not found")]
    NotFound(TaskId),

    /// The task is no longer `processing` under this worker (the health
    /// monitor reclaimed it). The caller's result is discarded.
    #[error("Task {task_id} is no longer claimed by {worker_id}")]
    StaleClaim { task_id: TaskId, worker_id: String },

    #[error("Query failed: {0}")]
    Query(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A stored value could not be decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Returns whether the error is the benign duplicate case.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, StoreError::DuplicateTask { .. })
    }
}

/// Task counts grouped by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskCounts {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

impl TaskCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.failed
    }

    /// Count for a single status.
    pub fn get(&self, status: TaskStatus) -> u64 {
        match status {
            TaskStatus::Pending => self.pending,
            TaskStatus::Processing => self.processing,
            TaskStatus::Completed => self.completed,
            TaskStatus::Failed => self.failed,
        }
    }

    fn set(&mut self, status: TaskStatus, count: u64) {
        match status {
            TaskStatus::Pending => self.pending = count,
            TaskStatus::Processing => self.processing = count,
            TaskStatus::Completed => self.completed = count,
            TaskStatus::Failed => self.failed = count,
        }
    }
}

/// Snapshot of the store: task counts plus checkpoints by worker.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub tasks: TaskCounts,
    pub checkpoints: BTreeMap<String, WorkerCheckpoint>,
}

/// Shared by `complete` (failure) and `recover_interrupted`.
/// Binds: ?1 now, ?2 error message, ?3 backoff cap (ms), ?4 backoff base (ms).
const FAILURE_SET_CLAUSE: &str = r#"
    retry_count = retry_count + 1,
    status = CASE WHEN retry_count + 1 >= max_retries THEN 'failed' ELSE 'pending' END,
    completed_at = CASE WHEN retry_count + 1 >= max_retries THEN ?1 ELSE NULL END,
    available_at = CASE WHEN retry_count + 1 >= max_retries THEN available_at
                        ELSE ?1 + MIN(?3, ?4 << MIN(retry_count, 20)) END,
    error_message = ?2
"#;

/// Eligibility of a row for claiming. A row whose content hash is being
/// processed elsewhere waits, so identical files are handled once.
const CLAIMABLE_PREDICATE: &str = r#"
    t.status = 'pending'
    AND t.retry_count < t.max_retries
    AND t.available_at <= ?1
    AND NOT EXISTS (
        SELECT 1 FROM tasks p WHERE p.file_hash = t.file_hash AND p.status = 'processing'
    )
"#;

/// SQLite task store.
#[derive(Clone)]
pub struct TaskStore {
    pool: SqlitePool,
    retry_policy: RetryPolicy,
}

impl TaskStore {
    /// Opens (creating if needed) the database at `path` and applies migrations.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let opts = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(opts)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        let store = Self::from_pool(pool);
        store.run_migrations().await?;

        tracing::info!(path = %path.display(), "Task store opened");
        Ok(store)
    }

    /// Opens a private in-memory database (one connection, lives as long as the pool).
    pub async fn in_memory() -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        let store = Self::from_pool(pool);
        store.run_migrations().await?;
        Ok(store)
    }

    /// Wraps an existing pool. Migrations are not run.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            retry_policy: RetryPolicy::default(),
        }
    }

    /// Sets the backoff applied between failed attempts.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry_policy
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        MigrationRunner::new(self.pool.clone()).run_migrations().await?;
        Ok(())
    }

    /// Closes the pool, waiting for checked-out connections.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    // =========================================================================
    // Task lifecycle
    // =========================================================================

    /// Registers a new pending task.
    ///
    /// A terminal row for the same path whose hash differs is re-armed in
    /// place (the file was replaced with new content). Any other existing row
    /// for the path yields [`StoreError::DuplicateTask`].
    pub async fn enqueue(&self, task: NewTask) -> Result<FileTask, StoreError> {
        let path = task.file_path.to_string_lossy().into_owned();
        let now = Utc::now().timestamp_millis();

        let row = sqlx::query(
            r#"
            INSERT INTO tasks (
                file_path, file_hash, priority, created_at, available_at,
                status, retry_count, max_retries
            ) VALUES (?1, ?2, ?3, ?4, ?4, 'pending', 0, ?5)
            ON CONFLICT(file_path) DO UPDATE SET
                file_hash = excluded.file_hash,
                priority = excluded.priority,
                created_at = excluded.created_at,
                available_at = excluded.available_at,
                status = 'pending',
                retry_count = 0,
                max_retries = excluded.max_retries,
                started_at = NULL,
                completed_at = NULL,
                error_message = NULL,
                worker_id = NULL
            WHERE tasks.status IN ('completed', 'failed')
              AND tasks.file_hash <> excluded.file_hash
            RETURNING *
            "#,
        )
        .bind(&path)
        .bind(&task.content_hash)
        .bind(task.priority)
        .bind(now)
        .bind(i64::from(task.max_retries))
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let task = task_from_row(&row)?;
                tracing::debug!(task_id = task.id, path = %path, "Task enqueued");
                Ok(task)
            }
            None => Err(StoreError::DuplicateTask { path }),
        }
    }

    /// Atomically claims the highest-priority, oldest eligible task.
    ///
    /// Returns `None` when nothing is claimable right now.
    pub async fn claim_next(&self, worker_id: &str) -> Result<Option<FileTask>, StoreError> {
        let now = Utc::now().timestamp_millis();
        let sql = format!(
            r#"
            UPDATE tasks SET status = 'processing', started_at = ?1, worker_id = ?2
            WHERE id = (
                SELECT t.id FROM tasks t
                WHERE {}
                ORDER BY t.priority DESC, t.created_at ASC, t.id ASC
                LIMIT 1
            )
            AND status = 'pending'
            RETURNING *
            "#,
            CLAIMABLE_PREDICATE
        );

        let row = sqlx::query(&sql)
            .bind(now)
            .bind(worker_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(task_from_row).transpose()
    }

    /// Records the outcome of an attempt made by `worker_id`.
    ///
    /// On failure the retry count is incremented; the task goes back to
    /// pending after the backoff, or to failed once the count reaches
    /// `max_retries`.
    pub async fn complete(
        &self,
        task_id: TaskId,
        worker_id: &str,
        outcome: TaskOutcome,
    ) -> Result<TaskTransition, StoreError> {
        let now = Utc::now().timestamp_millis();

        let row = match &outcome {
            TaskOutcome::Success => {
                sqlx::query(
                    r#"
                    UPDATE tasks SET status = 'completed', completed_at = ?1, error_message = NULL
                    WHERE id = ?2 AND status = 'processing' AND worker_id = ?3
                    RETURNING *
                    "#,
                )
                .bind(now)
                .bind(task_id)
                .bind(worker_id)
                .fetch_optional(&self.pool)
                .await?
            }
            TaskOutcome::Failure { error } => {
                let sql = format!(
                    "UPDATE tasks SET {} WHERE id = ?5 AND status = 'processing' AND worker_id = ?6 RETURNING *",
                    FAILURE_SET_CLAUSE
                );
                sqlx::query(&sql)
                    .bind(now)
                    .bind(error)
                    .bind(duration_millis(self.retry_policy.max))
                    .bind(duration_millis(self.retry_policy.base))
                    .bind(task_id)
                    .bind(worker_id)
                    .fetch_optional(&self.pool)
                    .await?
            }
        };

        let Some(row) = row else {
            return Err(StoreError::StaleClaim {
                task_id,
                worker_id: worker_id.to_string(),
            });
        };

        let task = task_from_row(&row)?;
        Ok(self.transition_of(&task))
    }

    /// Returns a claimed task to pending without counting an attempt.
    pub async fn release(&self, task_id: TaskId, worker_id: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks SET status = 'pending', started_at = NULL, worker_id = NULL
            WHERE id = ?1 AND status = 'processing' AND worker_id = ?2
            "#,
        )
        .bind(task_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::StaleClaim {
                task_id,
                worker_id: worker_id.to_string(),
            });
        }
        Ok(())
    }

    /// Treats every `processing` row left by a previous process as a failed
    /// attempt. Must run before any worker starts.
    ///
    /// Returns the affected rows in their new state.
    pub async fn recover_interrupted(&self) -> Result<Vec<FileTask>, StoreError> {
        let now = Utc::now().timestamp_millis();
        let sql = format!(
            "UPDATE tasks SET {} WHERE status = 'processing' RETURNING *",
            FAILURE_SET_CLAUSE
        );

        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(INTERRUPTED_MESSAGE)
            .bind(duration_millis(self.retry_policy.max))
            .bind(duration_millis(self.retry_policy.base))
            .fetch_all(&self.pool)
            .await?;

        let tasks = rows
            .iter()
            .map(task_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        if !tasks.is_empty() {
            tracing::warn!(recovered = tasks.len(), "Recovered interrupted tasks");
        }
        Ok(tasks)
    }

    /// Maps a post-completion row to the transition it represents.
    fn transition_of(&self, task: &FileTask) -> TaskTransition {
        match task.status {
            TaskStatus::Completed => TaskTransition::Completed,
            TaskStatus::Failed => TaskTransition::Failed {
                retry_count: task.retry_count,
            },
            TaskStatus::Pending | TaskStatus::Processing => TaskTransition::Retrying {
                retry_count: task.retry_count,
                backoff: self.retry_policy.backoff(task.retry_count),
            },
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn get(&self, task_id: TaskId) -> Result<Option<FileTask>, StoreError> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    pub async fn find_by_path(&self, path: &Path) -> Result<Option<FileTask>, StoreError> {
        let row = sqlx::query("SELECT * FROM tasks WHERE file_path = ?1")
            .bind(path.to_string_lossy().as_ref())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    /// Finds a completed task with the same content, other than `exclude_id`.
    pub async fn find_completed_by_hash(
        &self,
        content_hash: &str,
        exclude_id: TaskId,
    ) -> Result<Option<FileTask>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM tasks
            WHERE file_hash = ?1 AND status = 'completed' AND id <> ?2
            ORDER BY completed_at ASC, id ASC
            LIMIT 1
            "#,
        )
        .bind(content_hash)
        .bind(exclude_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    pub async fn list_by_status(&self, status: TaskStatus) -> Result<Vec<FileTask>, StoreError> {
        let rows = sqlx::query("SELECT * FROM tasks WHERE status = ?1 ORDER BY id")
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(task_from_row).collect()
    }

    /// Processing tasks whose current attempt started at or before `started_before`.
    pub async fn stuck_tasks(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<FileTask>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM tasks
            WHERE status = 'processing' AND started_at <= ?1
            ORDER BY started_at, id
            "#,
        )
        .bind(started_before.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(task_from_row).collect()
    }

    /// Number of tasks a worker could claim right now.
    pub async fn claimable_count(&self) -> Result<u64, StoreError> {
        let sql = format!("SELECT COUNT(*) FROM tasks t WHERE {}", CLAIMABLE_PREDICATE);
        let (count,): (i64,) = sqlx::query_as(&sql)
            .bind(Utc::now().timestamp_millis())
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    /// Rows waiting for a worker, whether claimable now or held back by
    /// backoff or the same-hash gate.
    pub async fn pending_count(&self) -> Result<u64, StoreError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM tasks WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await?;
        Ok(count.max(0) as u64)
    }

    pub async fn task_counts(&self) -> Result<TaskCounts, StoreError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM tasks GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = TaskCounts::default();
        for (status, count) in rows {
            let status = TaskStatus::from_str(&status).map_err(StoreError::Serialization)?;
            counts.set(status, count.max(0) as u64);
        }
        Ok(counts)
    }

    /// Task counts by status and checkpoints by worker.
    pub async fn stats(&self) -> Result<StoreStats, StoreError> {
        let tasks = self.task_counts().await?;
        let checkpoints = self
            .list_checkpoints()
            .await?
            .into_iter()
            .map(|cp| (cp.worker_id.clone(), cp))
            .collect();
        Ok(StoreStats { tasks, checkpoints })
    }

    // =========================================================================
    // Checkpoints
    // =========================================================================

    /// Upserts a worker checkpoint. `last_checkpoint` never moves backwards.
    pub async fn save_checkpoint(&self, checkpoint: &WorkerCheckpoint) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO checkpoints (
                worker_id, state, current_task, start_time, files_processed,
                files_failed, total_processing_time, last_checkpoint
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(worker_id) DO UPDATE SET
                state = excluded.state,
                current_task = excluded.current_task,
                start_time = excluded.start_time,
                files_processed = excluded.files_processed,
                files_failed = excluded.files_failed,
                total_processing_time = excluded.total_processing_time,
                last_checkpoint = MAX(checkpoints.last_checkpoint, excluded.last_checkpoint)
            "#,
        )
        .bind(&checkpoint.worker_id)
        .bind(checkpoint.state.as_str())
        .bind(checkpoint.current_task)
        .bind(checkpoint.start_time.timestamp_millis())
        .bind(checkpoint.files_processed as i64)
        .bind(checkpoint.files_failed as i64)
        .bind(checkpoint.total_processing_time)
        .bind(checkpoint.last_checkpoint.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_checkpoint(
        &self,
        worker_id: &str,
    ) -> Result<Option<WorkerCheckpoint>, StoreError> {
        let row = sqlx::query("SELECT * FROM checkpoints WHERE worker_id = ?1")
            .bind(worker_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(checkpoint_from_row).transpose()
    }

    pub async fn list_checkpoints(&self) -> Result<Vec<WorkerCheckpoint>, StoreError> {
        let rows = sqlx::query("SELECT * FROM checkpoints ORDER BY worker_id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(checkpoint_from_row).collect()
    }
}

fn duration_millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

fn millis_to_datetime(ms: i64, column: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Serialization(format!("{} out of range: {}", column, ms)))
}

fn optional_datetime(ms: Option<i64>, column: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
    ms.map(|ms| millis_to_datetime(ms, column)).transpose()
}

fn task_from_row(row: &SqliteRow) -> Result<FileTask, StoreError> {
    let status: String = row.try_get("status")?;
    let retry_count: i64 = row.try_get("retry_count")?;
    let max_retries: i64 = row.try_get("max_retries")?;

    Ok(FileTask {
        id: row.try_get("id")?,
        file_path: row.try_get::<String, _>("file_path")?.into(),
        content_hash: row.try_get("file_hash")?,
        status: TaskStatus::from_str(&status).map_err(StoreError::Serialization)?,
        priority: row.try_get("priority")?,
        created_at: millis_to_datetime(row.try_get("created_at")?, "created_at")?,
        started_at: optional_datetime(row.try_get("started_at")?, "started_at")?,
        completed_at: optional_datetime(row.try_get("completed_at")?, "completed_at")?,
        available_at: millis_to_datetime(row.try_get("available_at")?, "available_at")?,
        retry_count: retry_count.max(0) as u32,
        max_retries: max_retries.max(0) as u32,
        error_message: row.try_get("error_message")?,
        owning_worker_id: row.try_get("worker_id")?,
    })
}

fn checkpoint_from_row(row: &SqliteRow) -> Result<WorkerCheckpoint, StoreError> {
    let state: String = row.try_get("state")?;
    let processed: i64 = row.try_get("files_processed")?;
    let failed: i64 = row.try_get("files_failed")?;

    Ok(WorkerCheckpoint {
        worker_id: row.try_get("worker_id")?,
        state: WorkerState::from_str(&state).map_err(StoreError::Serialization)?,
        current_task: row.try_get("current_task")?,
        start_time: millis_to_datetime(row.try_get("start_time")?, "start_time")?,
        files_processed: processed.max(0) as u64,
        files_failed: failed.max(0) as u64,
        total_processing_time: row.try_get("total_processing_time")?,
        last_checkpoint: millis_to_datetime(row.try_get("last_checkpoint")?, "last_checkpoint")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::path::PathBuf;
    use std::sync::Arc;

    async fn open_temp() -> (tempfile::TempDir, TaskStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(dir.path().join("tasks.db"))
            .await
            .unwrap()
            .with_retry_policy(RetryPolicy::immediate());
        (dir, store)
    }

    #[tokio::test]
    async fn test_enqueue_and_claim() {
        let (_dir, store) = open_temp().await;
        let task = store
            .enqueue(NewTask::new("watch/a.csv", "h1"))
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 0);

        let claimed = store.claim_next("worker-0").await.unwrap().unwrap();
        assert_eq!(claimed.id, task.id);
        assert_eq!(claimed.status, TaskStatus::Processing);
        assert_eq!(claimed.owning_worker_id.as_deref(), Some("worker-0"));
        assert!(claimed.started_at.is_some());

        assert!(store.claim_next("worker-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_enqueue_duplicate_path() {
        let (_dir, store) = open_temp().await;
        store.enqueue(NewTask::new("watch/a.csv", "h1")).await.unwrap();

        let err = store
            .enqueue(NewTask::new("watch/a.csv", "h2"))
            .await
            .unwrap_err();
        assert!(err.is_duplicate());
    }

    #[tokio::test]
    async fn test_completed_same_hash_is_duplicate_and_new_hash_rearms() {
        let (_dir, store) = open_temp().await;
        let task = store.enqueue(NewTask::new("watch/a.csv", "h1")).await.unwrap();
        store.claim_next("w").await.unwrap().unwrap();
        store.complete(task.id, "w", TaskOutcome::Success).await.unwrap();

        let err = store
            .enqueue(NewTask::new("watch/a.csv", "h1"))
            .await
            .unwrap_err();
        assert!(err.is_duplicate());

        let rearmed = store.enqueue(NewTask::new("watch/a.csv", "h2")).await.unwrap();
        assert_eq!(rearmed.id, task.id);
        assert_eq!(rearmed.status, TaskStatus::Pending);
        assert_eq!(rearmed.content_hash, "h2");
        assert!(rearmed.completed_at.is_none());
    }

    #[tokio::test]
    async fn test_claim_order_priority_then_insertion() {
        let (_dir, store) = open_temp().await;
        let low = store.enqueue(NewTask::new("a.csv", "h1")).await.unwrap();
        let high = store
            .enqueue(NewTask::new("b.csv", "h2").with_priority(10))
            .await
            .unwrap();
        let low2 = store.enqueue(NewTask::new("c.csv", "h3")).await.unwrap();

        let order: Vec<TaskId> = vec![
            store.claim_next("w").await.unwrap().unwrap().id,
            store.claim_next("w").await.unwrap().unwrap().id,
            store.claim_next("w").await.unwrap().unwrap().id,
        ];
        assert_eq!(order, vec![high.id, low.id, low2.id]);
    }

    #[tokio::test]
    async fn test_same_hash_not_claimed_concurrently() {
        let (_dir, store) = open_temp().await;
        store.enqueue(NewTask::new("a.csv", "same")).await.unwrap();
        store.enqueue(NewTask::new("b.csv", "same")).await.unwrap();

        let first = store.claim_next("w0").await.unwrap().unwrap();
        assert!(store.claim_next("w1").await.unwrap().is_none());
        assert_eq!(store.claimable_count().await.unwrap(), 0);
        assert_eq!(store.pending_count().await.unwrap(), 1);

        store.complete(first.id, "w0", TaskOutcome::Success).await.unwrap();
        let second = store.claim_next("w1").await.unwrap().unwrap();
        assert_ne!(second.id, first.id);

        let done = store
            .find_completed_by_hash("same", second.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.id, first.id);
    }

    #[tokio::test]
    async fn test_failure_retries_then_fails() {
        let (_dir, store) = open_temp().await;
        let task = store
            .enqueue(NewTask::new("a.csv", "h").with_max_retries(3))
            .await
            .unwrap();

        let mut transitions = Vec::new();
        while let Some(claimed) = store.claim_next("w").await.unwrap() {
            let t = store
                .complete(claimed.id, "w", TaskOutcome::failure("boom"))
                .await
                .unwrap();
            transitions.push(t);
        }

        assert_eq!(transitions.len(), 3);
        assert!(matches!(transitions[0], TaskTransition::Retrying { retry_count: 1, .. }));
        assert!(matches!(transitions[1], TaskTransition::Retrying { retry_count: 2, .. }));
        assert_eq!(transitions[2], TaskTransition::Failed { retry_count: 3 });

        let row = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(row.status, TaskStatus::Failed);
        assert_eq!(row.retry_count, row.max_retries);
        assert_eq!(row.error_message.as_deref(), Some("boom"));
        assert!(row.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_backoff_delays_reclaim() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(dir.path().join("tasks.db"))
            .await
            .unwrap()
            .with_retry_policy(RetryPolicy::new(
                Duration::from_secs(60),
                Duration::from_secs(60),
            ));
        store.enqueue(NewTask::new("a.csv", "h")).await.unwrap();
        let claimed = store.claim_next("w").await.unwrap().unwrap();
        let transition = store
            .complete(claimed.id, "w", TaskOutcome::failure("x"))
            .await
            .unwrap();

        assert_eq!(
            transition,
            TaskTransition::Retrying {
                retry_count: 1,
                backoff: Duration::from_secs(60)
            }
        );
        assert!(store.claim_next("w").await.unwrap().is_none());
        let row = store.get(claimed.id).await.unwrap().unwrap();
        assert!(row.available_at > Utc::now() + chrono::Duration::seconds(30));

        // Backed-off rows are not claimable but still pending.
        assert_eq!(store.claimable_count().await.unwrap(), 0);
        assert_eq!(store.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_complete_requires_owner() {
        let (_dir, store) = open_temp().await;
        store.enqueue(NewTask::new("a.csv", "h")).await.unwrap();
        let claimed = store.claim_next("w0").await.unwrap().unwrap();

        let err = store
            .complete(claimed.id, "w1", TaskOutcome::Success)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::StaleClaim { .. }));

        store.complete(claimed.id, "w0", TaskOutcome::Success).await.unwrap();
        let err = store
            .complete(claimed.id, "w0", TaskOutcome::Success)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::StaleClaim { .. }));
    }

    #[tokio::test]
    async fn test_release_does_not_count_attempt() {
        let (_dir, store) = open_temp().await;
        store.enqueue(NewTask::new("a.csv", "h")).await.unwrap();
        let claimed = store.claim_next("w0").await.unwrap().unwrap();
        store.release(claimed.id, "w0").await.unwrap();

        let row = store.get(claimed.id).await.unwrap().unwrap();
        assert_eq!(row.status, TaskStatus::Pending);
        assert_eq!(row.retry_count, 0);
        assert!(row.owning_worker_id.is_none());
    }

    #[tokio::test]
    async fn test_recover_interrupted_counts_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("tasks.db");
        {
            let store = TaskStore::open(&db).await.unwrap();
            store
                .enqueue(NewTask::new("a.csv", "h1").with_max_retries(1))
                .await
                .unwrap();
            store.enqueue(NewTask::new("b.csv", "h2")).await.unwrap();
            store.claim_next("w0").await.unwrap().unwrap();
            store.claim_next("w1").await.unwrap().unwrap();
            store.close().await;
        }

        let store = TaskStore::open(&db)
            .await
            .unwrap()
            .with_retry_policy(RetryPolicy::immediate());
        let recovered = store.recover_interrupted().await.unwrap();
        assert_eq!(recovered.len(), 2);

        let a = store.find_by_path(Path::new("a.csv")).await.unwrap().unwrap();
        assert_eq!(a.status, TaskStatus::Failed);
        assert_eq!(a.error_message.as_deref(), Some(INTERRUPTED_MESSAGE));

        let b = store.find_by_path(Path::new("b.csv")).await.unwrap().unwrap();
        assert_eq!(b.status, TaskStatus::Pending);
        assert_eq!(b.retry_count, 1);
        assert_eq!(store.claimable_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stuck_tasks() {
        let (_dir, store) = open_temp().await;
        store.enqueue(NewTask::new("a.csv", "h")).await.unwrap();
        store.claim_next("w0").await.unwrap().unwrap();

        let past = Utc::now() - chrono::Duration::seconds(60);
        assert!(store.stuck_tasks(past).await.unwrap().is_empty());

        let future = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(store.stuck_tasks(future).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_are_exclusive() {
        let (_dir, store) = open_temp().await;
        for i in 0..40 {
            store
                .enqueue(NewTask::new(format!("f{:03}.csv", i), format!("h{}", i)))
                .await
                .unwrap();
        }

        let store = Arc::new(store);
        let mut handles = Vec::new();
        for w in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let worker = format!("worker-{}", w);
                let mut claimed = Vec::new();
                while let Some(task) = store.claim_next(&worker).await.unwrap() {
                    claimed.push(task.id);
                }
                claimed
            }));
        }

        let mut all = Vec::new();
        for h in handles {
            all.extend(h.await.unwrap());
        }
        let unique: HashSet<_> = all.iter().copied().collect();
        assert_eq!(all.len(), 40);
        assert_eq!(unique.len(), 40);
    }

    #[tokio::test]
    async fn test_checkpoint_upsert_is_monotonic() {
        let store = TaskStore::in_memory().await.unwrap();
        let mut cp = WorkerCheckpoint::new("worker-0");
        cp.files_processed = 3;
        store.save_checkpoint(&cp).await.unwrap();

        let mut older = cp.clone();
        older.last_checkpoint = cp.last_checkpoint - chrono::Duration::seconds(30);
        older.files_processed = 4;
        store.save_checkpoint(&older).await.unwrap();

        let loaded = store.load_checkpoint("worker-0").await.unwrap().unwrap();
        assert_eq!(loaded.files_processed, 4);
        assert_eq!(
            loaded.last_checkpoint.timestamp_millis(),
            cp.last_checkpoint.timestamp_millis()
        );
        assert!(store.load_checkpoint("worker-9").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stats_groups_by_status_and_worker() {
        let store = TaskStore::in_memory()
            .await
            .unwrap()
            .with_retry_policy(RetryPolicy::immediate());
        let a = store.enqueue(NewTask::new("a.csv", "h1")).await.unwrap();
        store.enqueue(NewTask::new("b.csv", "h2")).await.unwrap();
        store.claim_next("w").await.unwrap();
        store.complete(a.id, "w", TaskOutcome::Success).await.unwrap();
        store
            .save_checkpoint(&WorkerCheckpoint::new("w"))
            .await
            .unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.tasks.completed, 1);
        assert_eq!(stats.tasks.pending, 1);
        assert_eq!(stats.tasks.total(), 2);
        assert!(stats.checkpoints.contains_key("w"));

        let pending = store.list_by_status(TaskStatus::Pending).await.unwrap();
        assert_eq!(pending[0].file_path, PathBuf::from("b.csv"));
    }
}
