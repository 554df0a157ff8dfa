//! Process startup and lifetime.

use crate::config::{MatchConfig, MetricKind, Settings};
use crate::error::Result;
use crate::filter::compile;
use crate::metrics::{self, MetricsRegistry};
use crate::reporter::MatchReporter;
use crate::supervisor::{Supervisor, discover_files};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// A running generator: the metrics endpoint plus one watcher per file.
pub struct Generator {
    registry: MetricsRegistry,
    local_addr: SocketAddr,
    supervisor: Supervisor,
    server: JoinHandle<()>,
    cancel: CancellationToken,
}

impl Generator {
    /// Performs every startup step and launches the tasks.
    ///
    /// Startup is all-or-nothing: configuration, filter compilation, metric
    /// registration, binding the endpoint and listing the log folder must all
    /// succeed before the first watcher starts.
    pub async fn start(settings: Settings, cancel: CancellationToken) -> Result<Self> {
        let cancel = cancel.child_token();

        let config = MatchConfig::from_path(&settings.config_path)?;
        info!(metric = %config.name, expr = %config.logql_expr, "loaded configuration");
        if let MetricKind::Unsupported(kind) = &config.kind {
            warn!(
                metric = %config.name,
                kind = %kind,
                "only counters are supported, registering a counter"
            );
        }

        // Compiled once; every watcher shares this predicate
        let predicate = compile(&config.logql_expr)?;

        let registry = MetricsRegistry::new();
        let counter = registry.register_counter(
            &config.name,
            &settings.metric_help,
            &[settings.label_name.as_str()],
        )?;

        let (local_addr, server) =
            metrics::serve(registry.clone(), settings.listen_addr, cancel.clone())?;
        info!(addr = %local_addr, "serving metrics on /metrics");
        let server = tokio::spawn(server);

        let files = match discover_files(&settings.log_root) {
            Ok(files) => files,
            Err(e) => {
                cancel.cancel();
                return Err(e);
            }
        };
        info!(
            root = %settings.log_root.display(),
            files = files.len(),
            "discovered log files"
        );

        let reporter = MatchReporter::new(
            Arc::new(predicate),
            Arc::new(counter),
            vec![settings.label_value.clone()],
        );
        let mut supervisor =
            Supervisor::new(Arc::new(reporter), settings.poll_interval, cancel.clone());
        supervisor.spawn_all(files);

        Ok(Self {
            registry,
            local_addr,
            supervisor,
            server,
            cancel,
        })
    }

    /// Address the metrics endpoint is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &MetricsRegistry {
        &self.registry
    }

    /// Number of watcher tasks still tracked.
    pub fn watchers(&self) -> usize {
        self.supervisor.running()
    }

    /// Blocks until cancelled, then waits for every task to finish.
    pub async fn wait(mut self) {
        self.cancel.cancelled().await;
        info!("shutting down");

        self.supervisor.join_all().await;
        if let Err(e) = self.server.await {
            error!(error = %e, "metrics endpoint task failed");
        }
    }
}

impl fmt::Debug for Generator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Generator")
            .field("local_addr", &self.local_addr)
            .field("watchers", &self.supervisor.running())
            .finish()
    }
}

/// Starts the generator and runs it until `cancel` fires.
pub async fn run(settings: Settings, cancel: CancellationToken) -> Result<()> {
    Generator::start(settings, cancel).await?.wait().await;
    Ok(())
}
