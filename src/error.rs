//! Error types for the log metrics generator.

use crate::filter::FilterError;
use std::path::PathBuf;
use thiserror::Error;

/// The main error type for log metrics operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors when opening, inspecting or reading watched files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A watched file holds a line longer than the reader accepts.
    #[error("Line too long in {}: exceeds {limit} bytes", .path.display())]
    LineTooLong { path: PathBuf, limit: usize },

    /// The configuration file is not valid JSON or has the wrong shape.
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),

    /// The configuration parsed but holds values that cannot be used.
    #[error("Invalid config: {message}")]
    InvalidConfig { message: String },

    /// The filter expression failed to compile.
    #[error("Filter error: {0}")]
    Filter(#[from] FilterError),

    /// Metric registration or encoding errors from the prometheus crate.
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Errors while enumerating the log folder.
    #[error("Directory walk error: {0}")]
    Walk(#[from] walkdir::Error),

    /// The metrics endpoint could not bind its listen address.
    #[error("Metrics endpoint error: {0}")]
    Bind(#[from] warp::Error),
}

/// A convenient Result type for log metrics operations.
pub type Result<T> = std::result::Result<T, Error>;
