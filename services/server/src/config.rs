//! Configuration for the server.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to listen on for HTTP connections.
    pub listen_addr: SocketAddr,

    /// Public base URL used when constructing download links.
    pub server_url: String,

    /// SQLite database URL shared with the workers.
    pub database_url: String,

    /// Root of the public download tree.
    pub download_dir: PathBuf,

    /// Scratch directory for in-flight uploads.
    pub temp_dir: PathBuf,

    /// Root of the network profile overlays.
    pub network_profiles_dir: PathBuf,

    /// Path to the distribution catalogue TOML file.
    pub distributions_file: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("FORGE_LISTEN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8010".to_string())
            .parse()?;

        let server_url = std::env::var("FORGE_SERVER_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8010".to_string());

        let database_url = std::env::var("FORGE_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://imageforge.db".to_string());

        let download_dir = std::env::var("FORGE_DOWNLOAD_DIR")
            .unwrap_or_else(|_| "download".to_string())
            .into();

        let temp_dir = std::env::var("FORGE_TEMP_DIR")
            .unwrap_or_else(|_| "tmp".to_string())
            .into();

        let network_profiles_dir = std::env::var("FORGE_NETWORK_PROFILES_DIR")
            .unwrap_or_else(|_| "network_profiles".to_string())
            .into();

        let distributions_file = std::env::var("FORGE_DISTRIBUTIONS_FILE")
            .unwrap_or_else(|_| "distributions.toml".to_string())
            .into();

        let log_level = std::env::var("FORGE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            listen_addr,
            server_url,
            database_url,
            download_dir,
            temp_dir,
            network_profiles_dir,
            distributions_file,
            log_level,
        })
    }
}
