//! Evaluates lines against the compiled filter and reports matches.

use crate::filter::{Labels, Predicate};
use crate::metrics::MetricSink;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// What happened to a single line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineOutcome {
    Matched,
    Unmatched,
    /// The predicate or the sink failed; the line was skipped.
    Skipped,
}

/// Per-batch totals, used for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReportSummary {
    pub lines: usize,
    pub matched: usize,
    pub skipped: usize,
}

/// Shared by every watcher task; holds no per-file state.
pub struct MatchReporter {
    predicate: Arc<dyn Predicate>,
    sink: Arc<dyn MetricSink>,
    label_values: Vec<String>,
    labels: Labels,
}

impl MatchReporter {
    /// `label_values` are attached, in order, to every increment.
    pub fn new(
        predicate: Arc<dyn Predicate>,
        sink: Arc<dyn MetricSink>,
        label_values: Vec<String>,
    ) -> Self {
        Self {
            predicate,
            sink,
            label_values,
            labels: Labels::new(),
        }
    }

    /// Evaluates one line and increments the counter once if it matches.
    pub fn report_line(&self, path: &Path, line: &str) -> LineOutcome {
        debug!(path = %path.display(), line, "new line");

        match self.predicate.evaluate(line, &self.labels) {
            Ok(true) => {}
            Ok(false) => return LineOutcome::Unmatched,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping line that failed to evaluate");
                return LineOutcome::Skipped;
            }
        }

        let label_values: Vec<&str> = self.label_values.iter().map(String::as_str).collect();
        match self.sink.increment(&label_values) {
            Ok(()) => {
                debug!(path = %path.display(), line, "line matched");
                LineOutcome::Matched
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not record match");
                LineOutcome::Skipped
            }
        }
    }

    /// Reports a batch of lines in order.
    pub fn report_lines<I>(&self, path: &Path, lines: I) -> ReportSummary
    where
        I: IntoIterator<Item = String>,
    {
        let mut summary = ReportSummary::default();
        for line in lines {
            summary.lines += 1;
            match self.report_line(path, &line) {
                LineOutcome::Matched => summary.matched += 1,
                LineOutcome::Unmatched => {}
                LineOutcome::Skipped => summary.skipped += 1,
            }
        }
        summary
    }
}
