//! imageforge worker
//!
//! Long-running build worker: provisions imagebuilder toolchains on
//! demand, claims queued image requests it has the skills for, and
//! uploads signed results to the server.

use anyhow::Result;
use imageforge_distro::Distributions;
use imageforge_worker::{config, worker::Worker};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to FORGE_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting imageforge worker");

    let distributions = Distributions::load(&config.distributions_file)?;

    let mut worker = match Worker::register(config, distributions).await {
        Ok(worker) => worker,
        Err(e) => {
            error!(error = %e, "Worker registration failed");
            return Err(e);
        }
    };

    // Deregistration on shutdown removes this worker's row and cascades
    // its skills; in-flight builds are left for a sweeper to recover.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    worker.run(shutdown_rx).await?;

    info!("Worker shutdown complete");
    Ok(())
}
