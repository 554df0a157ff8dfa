//! The per-file task: tail one file and report its matching lines.

use crate::error::Error;
use crate::reader::{FileWatcher, WatchState};
use crate::reporter::MatchReporter;
use crate::stream::TailStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Why a watcher task ended.
#[derive(Debug)]
pub enum WatcherExit {
    /// The cancellation token fired.
    Cancelled,
    /// An I/O error or an oversized line stopped the file for good.
    Failed(Error),
}

/// Tails `path` until cancelled or until a read fails.
///
/// The state for the file is created here and never leaves this task.
pub async fn watch_file(
    path: PathBuf,
    reporter: Arc<MatchReporter>,
    poll_interval: Duration,
    cancel: CancellationToken,
) -> WatcherExit {
    info!(path = %path.display(), "tailing file");

    let watcher = match FileWatcher::open(WatchState::new(&path)).await {
        Ok(watcher) => watcher,
        Err(e) => {
            error!(path = %path.display(), error = %e, "could not open file, watcher stopped");
            return WatcherExit::Failed(e);
        }
    };

    let mut batches = TailStream::new(watcher, poll_interval, cancel);

    while let Some(batch) = batches.next().await {
        match batch {
            Ok(lines) => {
                let summary = reporter.report_lines(&path, lines);
                if summary.lines > 0 {
                    debug!(
                        path = %path.display(),
                        lines = summary.lines,
                        matched = summary.matched,
                        skipped = summary.skipped,
                        "processed batch"
                    );
                }
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "read failed, watcher stopped");
                return WatcherExit::Failed(e);
            }
        }
    }

    debug!(path = %path.display(), "watcher cancelled");
    WatcherExit::Cancelled
}
