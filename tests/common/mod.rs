#![allow(dead_code)]

use std::path::Path;
use std::time::{Duration, Instant};

use ingest_forge::manager::{AcceleratorMode, ManagerConfig};
use ingest_forge::storage::{TaskCounts, TaskStore};

/// A fast-ticking configuration rooted in `root` with stability checks and
/// retry backoff disabled.
pub fn config(root: &Path) -> ManagerConfig {
    ManagerConfig::new()
        .with_root(root)
        .with_num_workers(2)
        .with_require_stable(false)
        .with_scan_interval(Duration::from_millis(50))
        .with_poll_interval(Duration::from_millis(20))
        .with_retry_backoff(Duration::ZERO, Duration::ZERO)
        .with_shutdown_timeout(Duration::from_secs(10))
        .with_accelerator(AcceleratorMode::Off)
}

pub fn write_csv(dir: &Path, name: &str, body: &str) {
    std::fs::write(dir.join(name), body).unwrap();
}

/// Polls task counts until `done` holds or ten seconds pass.
pub async fn wait_for_counts(
    store: &TaskStore,
    what: &str,
    done: impl Fn(&TaskCounts) -> bool,
) -> TaskCounts {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let counts = store.task_counts().await.unwrap();
        if done(&counts) {
            return counts;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {}: {:?}", what, counts);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
