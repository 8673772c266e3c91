//! # imageforge-store
//!
//! The single authority for all persistent state: subtargets, package
//! catalogues, profiles, image requests, imagebuilder requests, workers and
//! their skills, manifests, and built images.
//!
//! The store exposes named operations grouped into typed handles cloned
//! from one connection pool. Every operation is a single transaction; the
//! claim operations (`claim_next_build_job`,
//! `claim_next_imagebuilder_request`) are single `UPDATE ... RETURNING`
//! statements, so two concurrent claimants can never receive the same row.
//!
//! Schema is initialised by an idempotent `CREATE TABLE IF NOT EXISTS`
//! batch at startup. Timestamps are stored as Unix seconds.

mod error;
mod images;
mod imagebuilders;
mod packages;
mod requests;
mod subtargets;
mod types;
mod workers;

pub use error::StoreError;
pub use images::{canonical_image_name, sanitise_network_profile, ImageStore, NewImage, StoredImage};
pub use imagebuilders::{ImagebuilderStore, ProvisionState};
pub use packages::{PackageStore, Profile};
pub use requests::{BuildJob, ImageRequest, NewRequest, RequestStore};
pub use subtargets::{Subtarget, SubtargetStore, Supported};
pub use types::{RequestStatus, SubtargetKey};
pub use workers::{WorkerRecord, WorkerStore};

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::info;

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// SQLite database URL, e.g. `sqlite:///var/lib/imageforge/forge.db`.
    pub database_url: String,

    /// Maximum number of connections in the pool.
    pub max_connections: u32,

    /// Connection acquire timeout.
    pub acquire_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://imageforge.db".to_string(),
            max_connections: 5,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open a database pool and initialise the schema.
    pub async fn connect(config: &DbConfig) -> Result<Self, StoreError> {
        info!(
            max_connections = config.max_connections,
            "Opening database"
        );

        let options = SqliteConnectOptions::from_str(&config.database_url)
            .map_err(StoreError::Connect)?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect_with(options)
            .await
            .map_err(StoreError::Connect)?;

        let db = Self { pool };
        db.init_schema().await?;

        info!("Database ready");
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    ///
    /// The pool is pinned to a single connection; SQLite gives every
    /// connection its own private `:memory:` database otherwise.
    pub async fn connect_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(StoreError::Connect)?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(StoreError::Connect)?;

        let db = Self { pool };
        db.init_schema().await?;
        Ok(db)
    }

    /// Get a reference to the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Check if the database is reachable.
    pub async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    /// Subtarget table handle.
    pub fn subtargets(&self) -> SubtargetStore {
        SubtargetStore::new(self.pool.clone())
    }

    /// Package catalogue, default-package, and profile handle.
    pub fn packages(&self) -> PackageStore {
        PackageStore::new(self.pool.clone())
    }

    /// Image request queue handle.
    pub fn requests(&self) -> RequestStore {
        RequestStore::new(self.pool.clone())
    }

    /// Imagebuilder provisioning queue handle.
    pub fn imagebuilders(&self) -> ImagebuilderStore {
        ImagebuilderStore::new(self.pool.clone())
    }

    /// Worker registry handle.
    pub fn workers(&self) -> WorkerStore {
        WorkerStore::new(self.pool.clone())
    }

    /// Built image and manifest handle.
    pub fn images(&self) -> ImageStore {
        ImageStore::new(self.pool.clone())
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS subtargets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    distro TEXT NOT NULL,
    release TEXT NOT NULL,
    target TEXT NOT NULL,
    subtarget TEXT NOT NULL,
    supported INTEGER NOT NULL DEFAULT 0,
    package_sync INTEGER,
    UNIQUE (distro, release, target, subtarget)
);

CREATE TABLE IF NOT EXISTS packages_available (
    subtarget_id INTEGER NOT NULL REFERENCES subtargets (id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    version TEXT NOT NULL,
    UNIQUE (subtarget_id, name)
);

CREATE TABLE IF NOT EXISTS packages_default (
    subtarget_id INTEGER PRIMARY KEY REFERENCES subtargets (id) ON DELETE CASCADE,
    packages TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS profiles (
    subtarget_id INTEGER NOT NULL REFERENCES subtargets (id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    model TEXT NOT NULL,
    packages TEXT NOT NULL,
    UNIQUE (subtarget_id, name)
);

CREATE TABLE IF NOT EXISTS packages_hashes (
    hash TEXT PRIMARY KEY,
    packages TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS image_requests (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    request_hash TEXT NOT NULL UNIQUE,
    distro TEXT NOT NULL,
    release TEXT NOT NULL,
    target TEXT NOT NULL,
    subtarget TEXT NOT NULL,
    profile TEXT NOT NULL,
    packages_hash TEXT NOT NULL,
    network_profile TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL DEFAULT 'requested',
    image_hash TEXT,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS imagebuilder_requests (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    distro TEXT NOT NULL,
    release TEXT NOT NULL,
    target TEXT NOT NULL,
    subtarget TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'requested',
    created_at INTEGER NOT NULL,
    UNIQUE (distro, release, target, subtarget)
);

CREATE TABLE IF NOT EXISTS workers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    address TEXT NOT NULL,
    public_key TEXT NOT NULL,
    heartbeat INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS worker_skills (
    worker_id INTEGER NOT NULL REFERENCES workers (id) ON DELETE CASCADE,
    subtarget_id INTEGER NOT NULL REFERENCES subtargets (id) ON DELETE CASCADE,
    status TEXT NOT NULL,
    UNIQUE (worker_id, subtarget_id)
);

CREATE TABLE IF NOT EXISTS manifests (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    hash TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS manifest_packages (
    manifest_hash TEXT NOT NULL,
    name TEXT NOT NULL,
    version TEXT NOT NULL,
    UNIQUE (manifest_hash, name)
);

CREATE TABLE IF NOT EXISTS images (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    image_hash TEXT NOT NULL UNIQUE,
    distro TEXT NOT NULL,
    release TEXT NOT NULL,
    target TEXT NOT NULL,
    subtarget TEXT NOT NULL,
    profile TEXT NOT NULL,
    manifest_hash TEXT NOT NULL,
    network_profile TEXT NOT NULL DEFAULT '',
    checksum TEXT NOT NULL,
    filesize INTEGER NOT NULL,
    build_date INTEGER NOT NULL,
    sysupgrade_suffix TEXT NOT NULL,
    subtarget_in_name INTEGER NOT NULL,
    profile_in_name INTEGER NOT NULL,
    vanilla INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_image_requests_status
    ON image_requests (status, distro, release, target, subtarget);
"#;
