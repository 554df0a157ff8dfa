//! Incremental file reading with truncation handling.

use crate::error::{Error, Result};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, BufReader};
use tracing::info;

/// Target size of one batch of lines handed out by [`FileWatcher::next_batch`].
pub const DEFAULT_BATCH_BYTES: usize = 64 * 1024;

/// Longest line accepted, terminator excluded.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Read progress for one watched file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchState {
    path: PathBuf,
    offset: u64,
}

impl WatchState {
    /// A state positioned at the start of `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            offset: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes of the file already consumed as complete lines.
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

/// Owns the open handle and [`WatchState`] of one file and reads it tick by tick.
///
/// A tick starts with [`begin_tick`](Self::begin_tick), which fixes how far
/// the tick may read, and is drained with [`next_batch`](Self::next_batch).
/// Memory use is bounded by the batch size plus one line, however much the
/// file grew.
pub struct FileWatcher {
    state: WatchState,
    reader: BufReader<File>,
    tick_end: Option<u64>,
    batch_bytes: usize,
}

impl FileWatcher {
    /// Opens the file named by `state`.
    pub async fn open(state: WatchState) -> Result<Self> {
        let file = File::open(&state.path).await?;
        Ok(Self {
            state,
            reader: BufReader::new(file),
            tick_end: None,
            batch_bytes: DEFAULT_BATCH_BYTES,
        })
    }

    /// Sets the batch size; a batch closes at the first line that reaches it.
    pub fn with_batch_bytes(mut self, batch_bytes: usize) -> Self {
        self.batch_bytes = batch_bytes.max(1);
        self
    }

    pub fn state(&self) -> &WatchState {
        &self.state
    }

    /// Whether the current tick still has bytes left to hand out.
    pub fn in_tick(&self) -> bool {
        self.tick_end.is_some()
    }

    /// Starts a tick: stats the file and positions the reader at the offset.
    ///
    /// If the file shrank below the current offset it was truncated or
    /// rotated, and reading restarts from the beginning. The size observed
    /// here bounds the tick, so bytes appended while it is drained wait for
    /// the next one.
    pub async fn begin_tick(&mut self) -> Result<()> {
        let current_size = self.reader.get_ref().metadata().await?.len();

        if detect_file_truncation(current_size, self.state.offset) {
            info!(
                path = %self.state.path.display(),
                previous_offset = self.state.offset,
                current_size,
                "file truncated or rotated, reading from the start"
            );
            self.state.offset = 0;
        }

        self.tick_end = calculate_bytes_to_read(current_size, self.state.offset)
            .map(|_| current_size);
        if self.tick_end.is_some() {
            self.reader.seek(SeekFrom::Start(self.state.offset)).await?;
        }
        Ok(())
    }

    /// Reads the next batch of complete lines of the current tick.
    ///
    /// Returns `None` once the tick is exhausted. A trailing line without a
    /// terminator ends the tick and is left unread until a later tick
    /// completes it. A line longer than [`MAX_LINE_BYTES`] is an error.
    pub async fn next_batch(&mut self) -> Result<Option<Lines>> {
        let Some(tick_end) = self.tick_end else {
            return Ok(None);
        };

        let mut buffer = Vec::new();
        while buffer.len() < self.batch_bytes {
            let remaining = tick_end.saturating_sub(self.state.offset);
            if remaining == 0 {
                self.tick_end = None;
                break;
            }

            let start = buffer.len();
            let limit = remaining.min(MAX_LINE_BYTES as u64 + 1);
            let read = (&mut self.reader)
                .take(limit)
                .read_until(b'\n', &mut buffer)
                .await?;

            if read > 0 && buffer.last() == Some(&b'\n') {
                self.state.offset += read as u64;
                continue;
            }

            buffer.truncate(start);
            if read > MAX_LINE_BYTES {
                if !buffer.is_empty() {
                    // Hand out the lines before it; the next call fails on it
                    self.reader.seek(SeekFrom::Start(self.state.offset)).await?;
                    break;
                }
                self.tick_end = None;
                return Err(Error::LineTooLong {
                    path: self.state.path.clone(),
                    limit: MAX_LINE_BYTES,
                });
            }

            // Partial last line, or the file shrank while the tick ran
            self.tick_end = None;
            break;
        }

        if buffer.is_empty() {
            Ok(None)
        } else {
            Ok(Some(Lines::new(buffer)))
        }
    }
}

/// One batch of complete lines, decoded as they are iterated.
#[derive(Debug, Default)]
pub struct Lines {
    buffer: Vec<u8>,
    position: usize,
}

impl Lines {
    fn new(buffer: Vec<u8>) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    /// Bytes of line content this batch covers, terminators included.
    pub fn byte_len(&self) -> usize {
        self.buffer.len()
    }
}

impl Iterator for Lines {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        let rest = self.buffer.get(self.position..).filter(|rest| !rest.is_empty())?;
        let end = rest.iter().position(|&b| b == b'\n').unwrap_or(rest.len());
        self.position += end + 1;

        let line = &rest[..end];
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        Some(String::from_utf8_lossy(line).into_owned())
    }
}

/// Detect if the file was truncated by comparing current size with last position
fn detect_file_truncation(current_size: u64, last_position: u64) -> bool {
    current_size < last_position
}

/// Calculate bytes to read based on current size and last position
fn calculate_bytes_to_read(current_size: u64, last_position: u64) -> Option<u64> {
    if current_size <= last_position {
        None
    } else {
        Some(current_size - last_position)
    }
}
