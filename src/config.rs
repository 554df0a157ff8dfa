//! Configuration loading.
//!
//! The match configuration is a small JSON document read once at startup.
//! Everything else the process needs is held in [`Settings`], whose defaults
//! reproduce the fixed paths and port the generator has always used.

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the match configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "./cmd/logmetrics-generator/config.json";

/// Default folder whose files are tailed.
pub const DEFAULT_LOG_ROOT: &str = "./cmd/logmetrics-generator/tmp-logs";

/// Default metrics endpoint port.
pub const DEFAULT_METRICS_PORT: u16 = 8080;

/// The metric and filter expression to drive, read from the config file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MatchConfig {
    /// Name of the counter incremented for every matching line.
    pub name: String,

    /// Kind of metric requested. Only counters are produced, whatever it says.
    #[serde(rename = "type", default)]
    pub kind: MetricKind,

    /// LogQL log selector each line is evaluated against.
    #[serde(rename = "logqlExpr")]
    pub logql_expr: String,
}

impl MatchConfig {
    /// Reads, parses and validates the configuration file at `path`.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json(&data)
    }

    /// Parses and validates a configuration document.
    pub fn from_json(data: &str) -> Result<Self> {
        let config: MatchConfig = serde_json::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !is_valid_metric_name(&self.name) {
            return Err(Error::InvalidConfig {
                message: format!("`{}` is not a valid metric name", self.name),
            });
        }
        if self.logql_expr.trim().is_empty() {
            return Err(Error::InvalidConfig {
                message: "logqlExpr must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

/// Metric kind named by the `type` field.
///
/// The field is informational: a counter is registered for every value, and
/// any other kind is kept as written so startup can warn about it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum MetricKind {
    #[default]
    Counter,
    Unsupported(String),
}

impl<'de> Deserialize<'de> for MetricKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let kind = String::deserialize(deserializer)?;
        if kind.eq_ignore_ascii_case("counter") {
            Ok(MetricKind::Counter)
        } else {
            Ok(MetricKind::Unsupported(kind))
        }
    }
}

/// Prometheus metric names: `[a-zA-Z_:][a-zA-Z0-9_:]*`.
fn is_valid_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' || first == ':' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

/// Runtime settings for the generator process.
#[derive(Debug, Clone)]
pub struct Settings {
    pub config_path: PathBuf,
    pub log_root: PathBuf,
    pub listen_addr: SocketAddr,
    /// Sleep between two reads of the same file.
    pub poll_interval: Duration,
    pub metric_help: String,
    /// Label attached to every increment, as a name and its fixed value.
    pub label_name: String,
    pub label_value: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from(DEFAULT_CONFIG_PATH),
            log_root: PathBuf::from(DEFAULT_LOG_ROOT),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_METRICS_PORT)),
            poll_interval: Duration::from_secs(1),
            metric_help: "Number of debug logs".to_string(),
            label_name: "source".to_string(),
            label_value: "logmetrics-generator".to_string(),
        }
    }
}
