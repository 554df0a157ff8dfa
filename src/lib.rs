//! Turns log lines into Prometheus counters.
//!
//! Every file found under a folder at startup is tailed on a fixed polling
//! interval. Each new complete line is checked against a LogQL filter, and
//! each match adds one to a counter served on `/metrics`.
//!
//! # Example
//!
//! ```rust,no_run
//! use logmetrics::{Settings, run};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     run(Settings::default(), CancellationToken::new()).await?;
//!     Ok(())
//! }
//! ```

// Internal modules - not part of public API
mod app;
mod config;
mod error;
mod filter;
mod metrics;
mod reader;
mod reporter;
mod stream;
mod supervisor;
mod watcher;

#[cfg(test)]
mod test_helpers;

// Public API exports
pub use app::{Generator, run};
pub use config::{MatchConfig, MetricKind, Settings};
pub use error::{Error, Result};
pub use filter::{EvalError, FilterError, Labels, LogQlPredicate, Predicate, compile};
pub use metrics::{MetricSink, MetricsRegistry};
pub use reader::{DEFAULT_BATCH_BYTES, FileWatcher, Lines, MAX_LINE_BYTES, WatchState};
pub use reporter::{LineOutcome, MatchReporter, ReportSummary};
pub use stream::TailStream;
pub use supervisor::{Supervisor, discover_files};
pub use watcher::{WatcherExit, watch_file};
