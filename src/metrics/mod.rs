//! Prometheus metrics for the ingestion pipeline.
//!
//! # Example
//!
//! ```ignore
//! use ingest_forge::metrics::{outcome, IngestMetrics};
//!
//! let metrics = IngestMetrics::new()?;
//! metrics.record_outcome(outcome::COMPLETED);
//! let text = metrics.export();
//! ```

pub mod prometheus;

pub use self::prometheus::{outcome, IngestMetrics};
