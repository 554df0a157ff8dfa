use logmetrics::{Settings, run};
use std::process;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => on_signal.cancel(),
            Err(e) => warn!(error = %e, "could not listen for ctrl-c"),
        }
    });

    if let Err(e) = run(Settings::default(), cancel).await {
        error!(error = %e, "logmetrics-generator failed");
        process::exit(1);
    }
}
