//! Database schema constants.
//!
//! All timestamps are stored as INTEGER Unix milliseconds so ordering and
//! comparisons in SQL are exact.

/// SQL schema for the tasks table.
pub const CREATE_TASKS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    file_path       TEXT    NOT NULL UNIQUE,
    file_hash       TEXT    NOT NULL,
    priority        INTEGER NOT NULL DEFAULT 0,
    created_at      INTEGER NOT NULL,
    started_at      INTEGER,
    completed_at    INTEGER,
    available_at    INTEGER NOT NULL,
    status          TEXT    NOT NULL DEFAULT 'pending',
    retry_count     INTEGER NOT NULL DEFAULT 0,
    max_retries     INTEGER NOT NULL DEFAULT 3,
    error_message   TEXT,
    worker_id       TEXT,
    CHECK (retry_count <= max_retries)
)
"#;

/// SQL schema for the per-worker checkpoints table.
pub const CREATE_CHECKPOINTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS checkpoints (
    worker_id              TEXT    PRIMARY KEY,
    state                  TEXT    NOT NULL,
    current_task           INTEGER,
    start_time             INTEGER NOT NULL,
    files_processed        INTEGER NOT NULL DEFAULT 0,
    files_failed           INTEGER NOT NULL DEFAULT 0,
    total_processing_time  REAL    NOT NULL DEFAULT 0,
    last_checkpoint        INTEGER NOT NULL
)
"#;

/// SQL for creating all required indexes.
pub const CREATE_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_tasks_claim ON tasks(status, priority DESC, created_at, id);
CREATE INDEX IF NOT EXISTS idx_tasks_hash ON tasks(file_hash, status);
CREATE INDEX IF NOT EXISTS idx_tasks_started ON tasks(status, started_at)
"#;

/// Returns all schema creation statements in the correct order.
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![CREATE_TASKS_TABLE, CREATE_CHECKPOINTS_TABLE, CREATE_INDEXES]
}

/// Table names in the schema.
pub mod tables {
    /// Tasks table name.
    pub const TASKS: &str = "tasks";
    /// Checkpoints table name.
    pub const CHECKPOINTS: &str = "checkpoints";
    /// Migration bookkeeping table name.
    pub const MIGRATIONS: &str = "_migrations";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_schema_statements_order() {
        let statements = all_schema_statements();
        assert_eq!(statements.len(), 3);
        assert!(statements[0].contains("CREATE TABLE IF NOT EXISTS tasks"));
        assert!(statements[1].contains("checkpoints"));
        // Indexes should be last
        assert!(statements[2].contains("CREATE INDEX"));
    }

    #[test]
    fn test_tasks_table_enforces_unique_path() {
        assert!(CREATE_TASKS_TABLE.contains("file_path       TEXT    NOT NULL UNIQUE"));
        assert!(CREATE_TASKS_TABLE.contains("CHECK (retry_count <= max_retries)"));
    }

    #[test]
    fn test_table_constants() {
        assert_eq!(tables::TASKS, "tasks");
        assert_eq!(tables::CHECKPOINTS, "checkpoints");
        assert_eq!(tables::MIGRATIONS, "_migrations");
    }
}
