//! Startup file discovery and the fan-out of one watcher task per file.

use crate::error::Result;
use crate::reporter::MatchReporter;
use crate::watcher::{WatcherExit, watch_file};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use walkdir::WalkDir;

/// Lists every regular file below `root`, recursively.
///
/// Any error while walking, including a missing root, fails the whole
/// enumeration.
pub fn discover_files<P: AsRef<Path>>(root: P) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_dir() {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

/// Owns the watcher tasks started at boot.
///
/// Tasks share only the reporter, which is read-only, and the cancellation
/// token. There is no way to add a file once running.
pub struct Supervisor {
    reporter: Arc<MatchReporter>,
    poll_interval: Duration,
    cancel: CancellationToken,
    tasks: JoinSet<(PathBuf, WatcherExit)>,
}

impl Supervisor {
    pub fn new(
        reporter: Arc<MatchReporter>,
        poll_interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            reporter,
            poll_interval,
            cancel,
            tasks: JoinSet::new(),
        }
    }

    /// Starts one independent watcher per path.
    pub fn spawn_all<I>(&mut self, paths: I)
    where
        I: IntoIterator<Item = PathBuf>,
    {
        for path in paths {
            let reporter = Arc::clone(&self.reporter);
            let poll_interval = self.poll_interval;
            let cancel = self.cancel.clone();

            self.tasks.spawn(async move {
                let exit = watch_file(path.clone(), reporter, poll_interval, cancel).await;
                (path, exit)
            });
        }
        info!(watchers = self.tasks.len(), "watchers started");
    }

    /// Number of watcher tasks that have not been collected yet.
    pub fn running(&self) -> usize {
        self.tasks.len()
    }

    /// Waits for every watcher to end, logging how each one stopped.
    ///
    /// Watchers only end on cancellation or on an I/O error, so under normal
    /// operation this never returns.
    pub async fn join_all(&mut self) -> Vec<(PathBuf, WatcherExit)> {
        let mut exits = Vec::new();
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok((path, exit)) => {
                    if let WatcherExit::Failed(e) = &exit {
                        warn!(path = %path.display(), error = %e, "watcher ended");
                    }
                    exits.push((path, exit));
                }
                Err(e) => error!(error = %e, "watcher task panicked"),
            }
        }
        exits
    }
}
