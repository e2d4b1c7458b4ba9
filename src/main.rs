use dotenvy::dotenv;
use tokio::sync::watch;
use tracing::{error, info};

use subledger::infra::{
    config::AppConfig,
    pause_sweeper::run_pause_sweep_loop,
    setup::{init_app_services, init_tracing},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let config = AppConfig::from_env();
    init_tracing(config.log_format);

    let services = init_app_services(config).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = tokio::spawn(run_pause_sweep_loop(
        services.pauses.clone(),
        services.config.pause_sweep_interval,
        services.config.storage_timeout,
        shutdown_rx,
    ));

    info!(backend = %services.config.storage_backend, "Engine running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    info!("Shutdown requested");
    shutdown_tx.send(true).ok();
    if let Err(e) = sweeper.await {
        error!(error = %e, "Pause sweep worker panicked");
    }

    Ok(())
}
