//! Prometheus metrics owned by a single manager instance.
//!
//! Each [`IngestMetrics`] carries its own [`Registry`], so several managers
//! (or tests) in one process never collide on metric names.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

/// Outcome label values for `ingest_tasks_total`.
pub mod outcome {
    pub const COMPLETED: &str = "completed";
    pub const RETRIED: &str = "retried";
    pub const FAILED: &str = "failed";
    pub const DUPLICATE: &str = "duplicate";
    pub const STALE: &str = "stale";
}

/// Metrics for one manager.
#[derive(Clone)]
pub struct IngestMetrics {
    registry: Registry,
    /// Finished attempts, labeled by outcome.
    pub tasks_total: IntCounterVec,
    /// Handler duration in seconds.
    pub task_duration: Histogram,
    /// Tickets outstanding in the bounded queue.
    pub queue_depth: IntGauge,
    /// Workers currently inside a handler.
    pub tasks_in_progress: IntGauge,
    pub stuck_workers_total: IntCounter,
    /// Files skipped because identical content was already processed.
    pub duplicates_total: IntCounter,
    pub accelerator_reserved_bytes: IntGauge,
}

impl IngestMetrics {
    /// Creates and registers all metrics in a fresh registry.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let tasks_total = IntCounterVec::new(
            Opts::new("ingest_tasks_total", "Finished task attempts by outcome"),
            &["outcome"],
        )?;

        let task_duration = Histogram::with_opts(
            HistogramOpts::new(
                "ingest_task_duration_seconds",
                "Handler execution duration in seconds",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 600.0, 1800.0]),
        )?;

        let queue_depth = IntGauge::new(
            "ingest_queue_depth",
            "Admitted tasks waiting for a worker",
        )?;

        let tasks_in_progress = IntGauge::new(
            "ingest_tasks_in_progress",
            "Number of tasks currently being processed",
        )?;

        let stuck_workers_total = IntCounter::new(
            "ingest_stuck_workers_total",
            "Tasks reclaimed from workers past the stuck timeout",
        )?;

        let duplicates_total = IntCounter::new(
            "ingest_duplicates_total",
            "Files completed without running a handler because their content was already processed",
        )?;

        let accelerator_reserved_bytes = IntGauge::new(
            "ingest_accelerator_reserved_bytes",
            "Accelerator memory currently reserved by handlers",
        )?;

        registry.register(Box::new(tasks_total.clone()))?;
        registry.register(Box::new(task_duration.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(tasks_in_progress.clone()))?;
        registry.register(Box::new(stuck_workers_total.clone()))?;
        registry.register(Box::new(duplicates_total.clone()))?;
        registry.register(Box::new(accelerator_reserved_bytes.clone()))?;

        Ok(Self {
            registry,
            tasks_total,
            task_duration,
            queue_depth,
            tasks_in_progress,
            stuck_workers_total,
            duplicates_total,
            accelerator_reserved_bytes,
        })
    }

    /// Counts one finished attempt.
    pub fn record_outcome(&self, outcome: &str) {
        self.tasks_total.with_label_values(&[outcome]).inc();
    }

    /// Current count for an outcome label.
    pub fn outcome_count(&self, outcome: &str) -> u64 {
        self.tasks_total.with_label_values(&[outcome]).get()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Encodes all metrics in the Prometheus text exposition format.
    pub fn export(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            return format!("# Error encoding metrics: {}\n", e);
        }

        String::from_utf8(buffer)
            .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
    }
}
