use anyhow::{Context, Result};
use flume::unbounded;
use gaod_backend::config::GaodConfig;
use gaod_backend::runtime::GaodRuntime;
use gaod_backend::server::serve_backend;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,gaod_backend=debug")),
        )
        .init();

    let config = GaodConfig::load();
    let (event_tx, event_rx) = unbounded();

    tracing::info!(
        "Starting Gaod backend (config file: {:?}; env overrides via GAOD_* variables)",
        GaodConfig::config_path()
    );

    let server_rt = tokio::runtime::Runtime::new().context("failed to start server runtime")?;
    server_rt.block_on(async move {
        let runtime = GaodRuntime::bootstrap(config, event_tx)
            .await
            .context("failed to bootstrap backend runtime")?;
        serve_backend(runtime, event_rx).await
    })
}
