//! Stream of per-tick line batches for one watched file.

use crate::error::Result;
use crate::reader::{FileWatcher, Lines};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Polls a [`FileWatcher`] on a fixed interval and yields its line batches.
///
/// The first tick fires immediately. A tick that found many new bytes is
/// yielded as several bounded batches before the next tick is awaited. The
/// stream ends when `cancel` fires, and ends right after yielding an error: a
/// failed read stops the file for good.
pub struct TailStream {
    inner: BoxStream<'static, Result<Lines>>,
}

impl TailStream {
    pub fn new(watcher: FileWatcher, poll_interval: Duration, cancel: CancellationToken) -> Self {
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let state = TailState {
            watcher,
            ticker,
            cancel,
        };
        let inner = stream::unfold(Some(state), next_batch).boxed();
        Self { inner }
    }
}

struct TailState {
    watcher: FileWatcher,
    ticker: Interval,
    cancel: CancellationToken,
}

async fn next_batch(state: Option<TailState>) -> Option<(Result<Lines>, Option<TailState>)> {
    let mut state = state?;

    loop {
        if state.watcher.in_tick() {
            if state.cancel.is_cancelled() {
                return None;
            }
        } else {
            tokio::select! {
                biased;
                _ = state.cancel.cancelled() => return None,
                _ = state.ticker.tick() => {}
            }
            if let Err(e) = state.watcher.begin_tick().await {
                return Some((Err(e), None));
            }
        }

        match state.watcher.next_batch().await {
            Ok(Some(lines)) => return Some((Ok(lines), Some(state))),
            Ok(None) => continue,
            Err(e) => return Some((Err(e), None)),
        }
    }
}

impl Stream for TailStream {
    type Item = Result<Lines>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}
