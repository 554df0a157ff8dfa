//! Counter registration and the Prometheus scrape endpoint.

use crate::error::Result;
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};
use std::future::Future;
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tracing::error;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

/// Something a match can be reported to.
pub trait MetricSink: Send + Sync {
    /// Adds one to the series identified by `label_values`.
    fn increment(&self, label_values: &[&str]) -> Result<()>;
}

impl MetricSink for IntCounterVec {
    fn increment(&self, label_values: &[&str]) -> Result<()> {
        self.get_metric_with_label_values(label_values)?.inc();
        Ok(())
    }
}

/// An explicit metrics registry, owned by the process rather than global.
#[derive(Clone, Default)]
pub struct MetricsRegistry {
    registry: Registry,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a counter with the given label schema and registers it.
    pub fn register_counter(
        &self,
        name: &str,
        help: &str,
        label_names: &[&str],
    ) -> Result<IntCounterVec> {
        let counter = IntCounterVec::new(Opts::new(name, help), label_names)?;
        self.registry.register(Box::new(counter.clone()))?;
        Ok(counter)
    }

    /// Renders every registered metric in the text exposition format.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

/// The `GET /metrics` route.
pub fn routes(
    registry: MetricsRegistry,
) -> impl Filter<Extract = (warp::reply::Response,), Error = Rejection> + Clone {
    warp::path!("metrics")
        .and(warp::get())
        .and(warp::any().map(move || registry.clone()))
        .and_then(metrics_handler)
}

async fn metrics_handler(
    registry: MetricsRegistry,
) -> std::result::Result<warp::reply::Response, Rejection> {
    match registry.render() {
        Ok(body) => {
            Ok(warp::reply::with_header(body, "content-type", prometheus::TEXT_FORMAT).into_response())
        }
        Err(e) => {
            error!(error = %e, "could not encode metrics");
            Ok(warp::reply::with_status(e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
                .into_response())
        }
    }
}

/// Binds the scrape endpoint on `addr`.
///
/// Binding happens immediately so a taken port is reported to the caller;
/// the returned future serves requests until `cancel` fires.
pub fn serve(
    registry: MetricsRegistry,
    addr: SocketAddr,
    cancel: CancellationToken,
) -> Result<(SocketAddr, impl Future<Output = ()> + Send + 'static)> {
    let (bound, server) = warp::serve(routes(registry))
        .try_bind_with_graceful_shutdown(addr, async move { cancel.cancelled().await })?;
    Ok((bound, server))
}
