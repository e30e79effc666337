use anyhow::{anyhow, Context};
use tokio_util::sync::CancellationToken;
use tracing::info;
use xgpu_core::{init_observability, shutdown_observability, Config};

mod orchestrator;
mod shutdown;

use orchestrator::PluginOrchestrator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = Config::config_path();
    let config = Config::load_from(&config_path)
        .with_context(|| format!("failed to load configuration from {}", config_path.display()))?;

    // Initialize observability before anything logs
    init_observability(&config.log_level, config.metrics_port)
        .map_err(|e| anyhow!("failed to initialize observability: {}", e))?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        vendor_id = %config.vendor_id,
        driver = %config.passthrough_driver,
        "xgpu device plugin starting"
    );

    let shutdown = CancellationToken::new();
    shutdown::cancel_on_signal(shutdown.clone());

    PluginOrchestrator::new(&config, shutdown).run().await;

    info!("xgpu device plugin shutting down");
    shutdown_observability();
    Ok(())
}
