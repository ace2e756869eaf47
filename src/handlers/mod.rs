//! Pluggable file handlers.
//!
//! A [`Handler`] interprets one file. Handlers are registered against glob
//! patterns in a [`HandlerRegistry`]; the first pattern matching the file
//! name wins and unmatched files go to the default handler.
//!
//! Handlers run on a blocking thread. They receive a [`HandlerContext`]
//! carrying the accelerator capability and a cooperative abort signal that
//! long-running handlers should poll between units of work.

pub mod chunked;
pub mod csv_summary;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use globset::{GlobBuilder, GlobMatcher};

use crate::error::{HandlerError, ManagerError};
use crate::resources::Accelerator;
use crate::scheduler::TaskId;

pub use chunked::ChunkedCsvHandler;
pub use csv_summary::{ColumnStats, CsvSummary, CsvSummaryHandler, ProcessingMethod};

/// Processes one file.
///
/// `Ok(true)` means success. `Ok(false)` and `Err(_)` are both failures and
/// count against the task's retry budget.
pub trait Handler: Send + Sync {
    fn handle(&self, path: &Path, ctx: &HandlerContext) -> Result<bool, HandlerError>;

    /// Short name used in logs.
    fn name(&self) -> &str {
        "handler"
    }
}

impl<F> Handler for F
where
    F: Fn(&Path, &HandlerContext) -> Result<bool, HandlerError> + Send + Sync,
{
    fn handle(&self, path: &Path, ctx: &HandlerContext) -> Result<bool, HandlerError> {
        self(path, ctx)
    }

    fn name(&self) -> &str {
        "closure"
    }
}

/// Per-attempt context handed to a handler.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub worker_id: String,
    pub task_id: TaskId,
    pub accelerator: Accelerator,
    /// Soft deadline for this attempt.
    pub deadline: Instant,
    abort: Arc<AtomicBool>,
}

impl HandlerContext {
    pub fn new(
        worker_id: impl Into<String>,
        task_id: TaskId,
        accelerator: Accelerator,
        deadline: Instant,
        abort: Arc<AtomicBool>,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            task_id,
            accelerator,
            deadline,
            abort,
        }
    }

    /// True once the deadline passed or the health monitor raised the abort
    /// flag. Handlers should return [`HandlerError::Aborted`] promptly.
    pub fn should_abort(&self) -> bool {
        self.abort.load(Ordering::SeqCst) || Instant::now() >= self.deadline
    }

    /// Returns `Err(Aborted)` when [`should_abort`](Self::should_abort) holds.
    pub fn checkpoint(&self) -> Result<(), HandlerError> {
        if self.abort.load(Ordering::SeqCst) {
            return Err(HandlerError::Aborted("abort requested".to_string()));
        }
        if Instant::now() >= self.deadline {
            return Err(HandlerError::Aborted("deadline exceeded".to_string()));
        }
        Ok(())
    }
}

struct HandlerEntry {
    pattern: String,
    matcher: GlobMatcher,
    handler: Arc<dyn Handler>,
}

/// Registry shared between the manager (registration) and workers (lookup).
pub type SharedRegistry = Arc<RwLock<HandlerRegistry>>;

/// Ordered (pattern, handler) table with a default fallback.
pub struct HandlerRegistry {
    entries: Vec<HandlerEntry>,
    default: Arc<dyn Handler>,
}

impl HandlerRegistry {
    pub fn new(default: Arc<dyn Handler>) -> Self {
        Self {
            entries: Vec::new(),
            default,
        }
    }

    /// Registers `handler` for file names matching `pattern`
    /// (case-insensitive glob). Earlier registrations take precedence.
    pub fn add_handler(
        &mut self,
        pattern: &str,
        handler: Arc<dyn Handler>,
    ) -> Result<(), ManagerError> {
        let matcher = GlobBuilder::new(pattern)
            .case_insensitive(true)
            .literal_separator(true)
            .build()
            .map_err(|e| ManagerError::InvalidPattern {
                pattern: pattern.to_string(),
                message: e.to_string(),
            })?
            .compile_matcher();

        self.entries.push(HandlerEntry {
            pattern: pattern.to_string(),
            matcher,
            handler,
        });
        Ok(())
    }

    pub fn set_default(&mut self, handler: Arc<dyn Handler>) {
        self.default = handler;
    }

    /// Resolves the handler for a file name. Returns the matched pattern
    /// (`None` for the default) and the handler.
    pub fn resolve(&self, file_name: &str) -> (Option<&str>, Arc<dyn Handler>) {
        self.entries
            .iter()
            .find(|entry| entry.matcher.is_match(file_name))
            .map(|entry| (Some(entry.pattern.as_str()), Arc::clone(&entry.handler)))
            .unwrap_or_else(|| (None, Arc::clone(&self.default)))
    }

    /// Registered patterns, in precedence order.
    pub fn patterns(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.pattern.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Named(&'static str);

    impl Handler for Named {
        fn handle(&self, _path: &Path, _ctx: &HandlerContext) -> Result<bool, HandlerError> {
            Ok(true)
        }

        fn name(&self) -> &str {
            self.0
        }
    }

    fn ctx(deadline: Instant, abort: Arc<AtomicBool>) -> HandlerContext {
        HandlerContext::new("worker-0", 1, Accelerator::cpu_only(), deadline, abort)
    }

    #[test]
    fn test_first_match_wins_and_default_fallback() {
        let mut registry = HandlerRegistry::new(Arc::new(Named("default")));
        registry.add_handler("qa_*.csv", Arc::new(Named("qa"))).unwrap();
        registry.add_handler("*.csv", Arc::new(Named("csv"))).unwrap();

        let (pattern, handler) = registry.resolve("qa_batch.csv");
        assert_eq!(pattern, Some("qa_*.csv"));
        assert_eq!(handler.name(), "qa");

        let (_, handler) = registry.resolve("patients.csv");
        assert_eq!(handler.name(), "csv");

        let (pattern, handler) = registry.resolve("notes.txt");
        assert_eq!(pattern, None);
        assert_eq!(handler.name(), "default");
        assert_eq!(registry.patterns(), vec!["qa_*.csv", "*.csv"]);
    }

    #[test]
    fn test_patterns_are_case_insensitive() {
        let mut registry = HandlerRegistry::new(Arc::new(Named("default")));
        registry.add_handler("*patient*", Arc::new(Named("patient"))).unwrap();

        let (_, handler) = registry.resolve("Patient_Records.CSV");
        assert_eq!(handler.name(), "patient");
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let mut registry = HandlerRegistry::new(Arc::new(Named("default")));
        let err = registry
            .add_handler("[unclosed", Arc::new(Named("x")))
            .unwrap_err();
        assert!(matches!(err, ManagerError::InvalidPattern { .. }));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_closure_handler() {
        let handler = |path: &Path, _ctx: &HandlerContext| -> Result<bool, HandlerError> {
            Ok(path.extension().is_some())
        };
        let c = ctx(
            Instant::now() + Duration::from_secs(60),
            Arc::new(AtomicBool::new(false)),
        );
        assert!(handler.handle(Path::new("a.csv"), &c).unwrap());
        assert_eq!(Handler::name(&handler), "closure");
    }

    #[test]
    fn test_should_abort() {
        let abort = Arc::new(AtomicBool::new(false));
        let c = ctx(Instant::now() + Duration::from_secs(60), Arc::clone(&abort));
        assert!(!c.should_abort());
        assert!(c.checkpoint().is_ok());

        abort.store(true, Ordering::SeqCst);
        assert!(c.should_abort());
        assert!(matches!(c.checkpoint(), Err(HandlerError::Aborted(_))));

        let expired = ctx(Instant::now(), Arc::new(AtomicBool::new(false)));
        assert!(expired.should_abort());
    }
}
