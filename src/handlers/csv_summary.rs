//! Default CSV handler: writes a JSON summary of the file next to the
//! processed files.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Utc};
use csv::StringRecord;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::HandlerError;

use super::{Handler, HandlerContext};

/// Rows between abort checks.
pub(crate) const ABORT_CHECK_ROWS: usize = 1024;

/// How the file was processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessingMethod {
    Cpu,
    CpuChunked,
    /// Chunked run with an accelerator memory reservation held. Computed on
    /// the CPU like `CpuChunked`.
    Accelerated,
}

/// Statistics of one numeric column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnStats {
    pub count: u64,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
}

/// The summary document written for each processed CSV.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CsvSummary {
    pub filename: String,
    pub processed_at: DateTime<Utc>,
    pub worker_id: String,
    pub rows: u64,
    pub columns: usize,
    pub column_names: Vec<String>,
    pub processing_method: ProcessingMethod,
    /// Number of chunks, for chunked processing.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub chunks: Option<u64>,
    pub duration_ms: u64,
    /// Numeric columns only.
    pub statistics: BTreeMap<String, ColumnStats>,
}

impl CsvSummary {
    /// `<output_dir>/<stem>_<worker_id>_summary.json`
    pub fn output_path(output_dir: &Path, source: &Path, worker_id: &str) -> PathBuf {
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        output_dir.join(format!("{}_{}_summary.json", stem, worker_id))
    }

    /// Writes the summary atomically and returns its path.
    pub fn write(&self, output_dir: &Path, source: &Path) -> Result<PathBuf, HandlerError> {
        std::fs::create_dir_all(output_dir)?;
        let target = Self::output_path(output_dir, source, &self.worker_id);
        let mut tmp = tempfile::NamedTempFile::new_in(output_dir)?;
        serde_json::to_writer_pretty(&mut tmp, self)?;
        tmp.flush()?;
        tmp.persist(&target).map_err(|e| HandlerError::Io(e.error))?;
        Ok(target)
    }
}

#[derive(Debug, Clone, Default)]
struct ColumnAccumulator {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    non_numeric: bool,
}

impl ColumnAccumulator {
    fn push(&mut self, field: &str) {
        let field = field.trim();
        if field.is_empty() || self.non_numeric {
            return;
        }
        match field.parse::<f64>() {
            Ok(v) if v.is_finite() => {
                if self.count == 0 {
                    self.min = v;
                    self.max = v;
                } else {
                    self.min = self.min.min(v);
                    self.max = self.max.max(v);
                }
                self.count += 1;
                self.sum += v;
            }
            _ => self.non_numeric = true,
        }
    }

    fn stats(&self) -> Option<ColumnStats> {
        if self.non_numeric || self.count == 0 {
            return None;
        }
        Some(ColumnStats {
            count: self.count,
            mean: self.sum / self.count as f64,
            min: self.min,
            max: self.max,
        })
    }
}

/// Accumulates rows into a [`CsvSummary`].
pub(crate) struct SummaryBuilder {
    column_names: Vec<String>,
    columns: Vec<ColumnAccumulator>,
    rows: u64,
    started: Instant,
}

impl SummaryBuilder {
    pub(crate) fn new(headers: &StringRecord) -> Self {
        Self {
            column_names: headers.iter().map(str::to_string).collect(),
            columns: vec![ColumnAccumulator::default(); headers.len()],
            rows: 0,
            started: Instant::now(),
        }
    }

    pub(crate) fn push(&mut self, record: &StringRecord) {
        self.rows += 1;
        for (column, field) in self.columns.iter_mut().zip(record.iter()) {
            column.push(field);
        }
    }

    pub(crate) fn rows(&self) -> u64 {
        self.rows
    }

    pub(crate) fn finish(
        self,
        source: &Path,
        worker_id: &str,
        method: ProcessingMethod,
        chunks: Option<u64>,
    ) -> CsvSummary {
        let statistics = self
            .column_names
            .iter()
            .zip(&self.columns)
            .filter_map(|(name, acc)| acc.stats().map(|s| (name.clone(), s)))
            .collect();

        CsvSummary {
            filename: source
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            processed_at: Utc::now(),
            worker_id: worker_id.to_string(),
            rows: self.rows,
            columns: self.column_names.len(),
            column_names: self.column_names,
            processing_method: method,
            chunks,
            duration_ms: self.started.elapsed().as_millis() as u64,
            statistics,
        }
    }
}

/// Reads the whole CSV, computes per-column numeric statistics and writes
/// `<stem>_<worker_id>_summary.json` into the output directory.
///
/// A file without data rows is a failure (`Ok(false)`).
pub struct CsvSummaryHandler {
    output_dir: PathBuf,
}

impl CsvSummaryHandler {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }
}

impl Handler for CsvSummaryHandler {
    fn handle(&self, path: &Path, ctx: &HandlerContext) -> Result<bool, HandlerError> {
        let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
        let headers = reader.headers()?.clone();
        let mut builder = SummaryBuilder::new(&headers);

        for (i, record) in reader.records().enumerate() {
            if i % ABORT_CHECK_ROWS == 0 {
                ctx.checkpoint()?;
            }
            builder.push(&record?);
        }

        if builder.rows() == 0 {
            debug!(path = %path.display(), "CSV has no data rows");
            return Ok(false);
        }

        let summary = builder.finish(path, &ctx.worker_id, ProcessingMethod::Cpu, None);
        let written = summary.write(&self.output_dir, path)?;
        debug!(
            path = %path.display(),
            summary = %written.display(),
            rows = summary.rows,
            "CSV summary written"
        );
        Ok(true)
    }

    fn name(&self) -> &str {
        "csv-summary"
    }
}
