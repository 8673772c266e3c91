//! imageforge server
//!
//! The server is the public face of the build service: it validates and
//! deduplicates build requests, accepts signed artifact uploads from
//! workers, and serves finished images from the download tree.

use anyhow::Result;
use imageforge_distro::Distributions;
use imageforge_server::{api, config, seed, state::AppState};
use imageforge_store::{Database, DbConfig};
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

    info!("Starting imageforge server");
    info!(listen_addr = %config.listen_addr, "Configuration loaded");

    let distributions = Distributions::load(&config.distributions_file)?;

    let db = match Database::connect(&DbConfig {
        database_url: config.database_url.clone(),
        ..Default::default()
    })
    .await
    {
        Ok(db) => db,
        Err(e) => {
            error!(error = %e, "Failed to open database");
            return Err(e.into());
        }
    };

    seed::seed_subtargets(&db, &distributions).await?;

    // The download tree and the failure log directory must exist before
    // the first request lands.
    std::fs::create_dir_all(config.download_dir.join("faillogs"))?;
    std::fs::create_dir_all(&config.temp_dir)?;

    let listen_addr = config.listen_addr;
    let state = AppState::new(db, config, distributions);
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    info!(addr = %listen_addr, "Listening for connections");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received shutdown signal");
        })
        .await?;

    info!("Server shutdown complete");
    Ok(())
}
