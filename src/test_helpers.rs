//! Test utilities for creating temporary log files.

use crate::error::Result;
use crate::reader::FileWatcher;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub struct TempLogFile {
    pub path: PathBuf,
    _temp_dir: tempfile::TempDir,
}

impl TempLogFile {
    /// Create a new empty temporary log file for testing
    pub fn new() -> std::io::Result<Self> {
        let temp_dir = tempfile::tempdir()?;
        let path = temp_dir.path().join("test.log");

        File::create(&path)?;

        Ok(Self {
            path,
            _temp_dir: temp_dir,
        })
    }

    /// Create a temporary log file holding exactly `content`
    pub fn with_content(content: &str) -> std::io::Result<Self> {
        let temp_file = Self::new()?;
        temp_file.append_raw(content)?;
        Ok(temp_file)
    }

    /// Append one terminated line
    pub fn append_line(&self, line: &str) -> std::io::Result<()> {
        self.append_raw(&format!("{}\n", line))
    }

    /// Append bytes as-is, without adding a terminator
    pub fn append_raw(&self, content: &str) -> std::io::Result<()> {
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        file.write_all(content.as_bytes())?;
        file.flush()
    }

    /// Replace the whole file content in place
    pub fn write_raw(&self, content: &str) -> std::io::Result<()> {
        std::fs::write(&self.path, content)
    }

    /// Truncate the file (simulate log rotation)
    pub fn truncate(&self) -> std::io::Result<()> {
        File::create(&self.path)?;
        Ok(())
    }

    /// Grow or shrink the file to `len` bytes; growth is sparse zero bytes
    pub fn set_len(&self, len: u64) -> std::io::Result<()> {
        OpenOptions::new().write(true).open(&self.path)?.set_len(len)
    }

    pub fn len(&self) -> u64 {
        std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Run one whole tick and collect every line it yields
pub async fn read_tick(watcher: &mut FileWatcher) -> Result<Vec<String>> {
    watcher.begin_tick().await?;
    let mut lines = Vec::new();
    while let Some(batch) = watcher.next_batch().await? {
        lines.extend(batch);
    }
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temp_log_file_creation() {
        let temp_file = TempLogFile::new().unwrap();
        assert!(temp_file.path().exists());
        assert_eq!(temp_file.len(), 0);
    }

    #[test]
    fn test_with_content_is_verbatim() {
        let temp_file = TempLogFile::with_content("no newline").unwrap();
        let content = std::fs::read_to_string(temp_file.path()).unwrap();
        assert_eq!(content, "no newline");
    }

    #[test]
    fn test_append_line() {
        let temp_file = TempLogFile::new().unwrap();
        temp_file.append_line("line 1").unwrap();
        temp_file.append_line("line 2").unwrap();

        let content = std::fs::read_to_string(temp_file.path()).unwrap();
        assert_eq!(content, "line 1\nline 2\n");
    }

    #[test]
    fn test_truncate_and_rewrite() {
        let temp_file = TempLogFile::with_content("initial content\n").unwrap();
        temp_file.truncate().unwrap();
        assert_eq!(temp_file.len(), 0);

        temp_file.write_raw("a\n").unwrap();
        assert_eq!(temp_file.len(), 2);
    }

    #[test]
    fn test_set_len_grows_sparse() {
        let temp_file = TempLogFile::with_content("a\n").unwrap();
        temp_file.set_len(4096).unwrap();
        assert_eq!(temp_file.len(), 4096);
    }
}
