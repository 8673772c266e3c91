//! Configuration for the worker.

use std::path::PathBuf;

use anyhow::Result;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Worker name reported at registration; defaults to the hostname.
    pub worker_name: String,

    /// Address reported at registration.
    pub worker_address: String,

    /// Server base URL, used for result uploads.
    pub server_url: String,

    /// SQLite database URL shared with the server.
    pub database_url: String,

    /// Root of the extracted imagebuilder trees.
    pub imagebuilder_dir: PathBuf,

    /// Worker-local scratch root for build directories and archives.
    pub temp_dir: PathBuf,

    /// Root of the public download tree; failure logs land under
    /// `faillogs/` here.
    pub download_dir: PathBuf,

    /// Root of the network profile overlays.
    pub network_profiles_dir: PathBuf,

    /// Path to the distribution catalogue TOML file.
    pub distributions_file: PathBuf,

    /// Repositories configuration template installed into each
    /// imagebuilder; `{{ release }}`, `{{ target }}`, `{{ subtarget }}`
    /// and `{{ pkg_arch }}` are substituted.
    pub repositories_template: PathBuf,

    /// Managed build-rules file copied over each imagebuilder's own.
    pub build_rules_file: PathBuf,

    /// Path of the worker's usign secret key; generated when absent.
    pub key_file: PathBuf,

    /// Whether sysupgrade artifacts are signed.
    pub sign_images: bool,

    /// Maximum number of skills this worker takes on; 0 means unlimited.
    pub max_skills: usize,

    /// Idle sleep and heartbeat interval in seconds.
    pub heartbeat_interval_secs: u64,

    /// Heartbeats older than this mark a worker stale.
    pub worker_stale_secs: i64,

    /// Wall-clock timeout for provisioning and build subprocesses.
    pub subprocess_timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let worker_name = std::env::var("FORGE_WORKER_NAME").unwrap_or_else(|_| {
            std::env::var("HOSTNAME").unwrap_or_else(|_| "forge-worker".to_string())
        });

        let worker_address = std::env::var("FORGE_WORKER_ADDRESS").unwrap_or_default();

        let server_url = std::env::var("FORGE_SERVER_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8010".to_string());

        let database_url = std::env::var("FORGE_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://imageforge.db".to_string());

        let imagebuilder_dir = std::env::var("FORGE_IMAGEBUILDER_DIR")
            .unwrap_or_else(|_| "imagebuilder".to_string())
            .into();

        let temp_dir = std::env::var("FORGE_TEMP_DIR")
            .unwrap_or_else(|_| "tmp".to_string())
            .into();

        let download_dir = std::env::var("FORGE_DOWNLOAD_DIR")
            .unwrap_or_else(|_| "download".to_string())
            .into();

        let network_profiles_dir = std::env::var("FORGE_NETWORK_PROFILES_DIR")
            .unwrap_or_else(|_| "network_profiles".to_string())
            .into();

        let distributions_file = std::env::var("FORGE_DISTRIBUTIONS_FILE")
            .unwrap_or_else(|_| "distributions.toml".to_string())
            .into();

        let repositories_template = std::env::var("FORGE_REPOSITORIES_TEMPLATE")
            .unwrap_or_else(|_| "repositories.conf".to_string())
            .into();

        let build_rules_file = std::env::var("FORGE_BUILD_RULES_FILE")
            .unwrap_or_else(|_| "Makefile".to_string())
            .into();

        let key_file = std::env::var("FORGE_KEY_FILE")
            .unwrap_or_else(|_| "worker.sec".to_string())
            .into();

        let sign_images = std::env::var("FORGE_SIGN_IMAGES")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(true);

        let max_skills = std::env::var("FORGE_MAX_SKILLS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);

        let heartbeat_interval_secs = std::env::var("FORGE_HEARTBEAT_INTERVAL")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5);

        let worker_stale_secs = std::env::var("FORGE_WORKER_STALE_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);

        let subprocess_timeout_secs = std::env::var("FORGE_SUBPROCESS_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(3600);

        let log_level = std::env::var("FORGE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            worker_name,
            worker_address,
            server_url,
            database_url,
            imagebuilder_dir,
            temp_dir,
            download_dir,
            network_profiles_dir,
            distributions_file,
            repositories_template,
            build_rules_file,
            key_file,
            sign_images,
            max_skills,
            heartbeat_interval_secs,
            worker_stale_secs,
            subprocess_timeout_secs,
            log_level,
        })
    }
}
