//! Subtarget table operations.
//!
//! Subtargets are created when a release manifest is ingested, flipped to
//! supported by the provisioner, and never destroyed.

use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use tracing::debug;

use crate::error::StoreError;
use crate::types::{unix_now, SubtargetKey};

/// How old a package catalogue may grow before intake considers it stale.
pub const PACKAGE_SYNC_MAX_AGE_SECS: i64 = 24 * 60 * 60;

/// Support state of a subtarget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Supported {
    /// Never probed.
    Unknown,
    /// Builds are accepted.
    Yes,
    /// Explicitly marked unbuildable.
    No,
}

impl Supported {
    fn from_i64(v: i64) -> Self {
        match v {
            1 => Self::Yes,
            -1 => Self::No,
            _ => Self::Unknown,
        }
    }

    fn as_i64(self) -> i64 {
        match self {
            Self::Yes => 1,
            Self::No => -1,
            Self::Unknown => 0,
        }
    }
}

/// A row from the subtargets table.
#[derive(Debug, Clone)]
pub struct Subtarget {
    pub id: i64,
    pub key: SubtargetKey,
    pub supported: Supported,
    /// Unix seconds of the last package catalogue refresh.
    pub package_sync: Option<i64>,
}

impl Subtarget {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            key: SubtargetKey {
                distro: row.try_get("distro")?,
                release: row.try_get("release")?,
                target: row.try_get("target")?,
                subtarget: row.try_get("subtarget")?,
            },
            supported: Supported::from_i64(row.try_get("supported")?),
            package_sync: row.try_get("package_sync")?,
        })
    }
}

/// Handle for subtarget operations.
#[derive(Clone)]
pub struct SubtargetStore {
    pool: SqlitePool,
}

impl SubtargetStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Ingest subtargets for a target of a release. Idempotent.
    pub async fn insert_subtargets(
        &self,
        distro: &str,
        release: &str,
        target: &str,
        subtargets: &[String],
    ) -> Result<(), StoreError> {
        debug!(distro, release, target, count = subtargets.len(), "Ingesting subtargets");
        let mut tx = self.pool.begin().await?;
        for subtarget in subtargets {
            sqlx::query(
                "INSERT OR IGNORE INTO subtargets (distro, release, target, subtarget)
                 VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(distro)
            .bind(release)
            .bind(target)
            .bind(subtarget)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Look up a single subtarget row.
    pub async fn get(&self, key: &SubtargetKey) -> Result<Option<Subtarget>, StoreError> {
        let row = sqlx::query(
            "SELECT id, distro, release, target, subtarget, supported, package_sync
             FROM subtargets
             WHERE distro = ?1 AND release = ?2 AND target = ?3 AND subtarget = ?4",
        )
        .bind(&key.distro)
        .bind(&key.release)
        .bind(&key.target)
        .bind(&key.subtarget)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Subtarget::from_row).transpose().map_err(Into::into)
    }

    /// Row id for a subtarget, failing when it was never ingested.
    pub(crate) async fn require_id(&self, key: &SubtargetKey) -> Result<i64, StoreError> {
        let id = sqlx::query_scalar::<_, i64>(
            "SELECT id FROM subtargets
             WHERE distro = ?1 AND release = ?2 AND target = ?3 AND subtarget = ?4",
        )
        .bind(&key.distro)
        .bind(&key.release)
        .bind(&key.target)
        .bind(&key.subtarget)
        .fetch_optional(&self.pool)
        .await?;

        id.ok_or_else(|| StoreError::UnknownSubtarget(key.to_string()))
    }

    /// Flip the supported flag.
    pub async fn set_supported(
        &self,
        key: &SubtargetKey,
        supported: Supported,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE subtargets SET supported = ?1
             WHERE distro = ?2 AND release = ?3 AND target = ?4 AND subtarget = ?5",
        )
        .bind(supported.as_i64())
        .bind(&key.distro)
        .bind(&key.release)
        .bind(&key.target)
        .bind(&key.subtarget)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Whether the package catalogue is missing or older than 24 hours.
    pub async fn outdated(&self, key: &SubtargetKey) -> Result<bool, StoreError> {
        let subtarget = self.get(key).await?;
        let cutoff = unix_now() - PACKAGE_SYNC_MAX_AGE_SECS;
        Ok(match subtarget {
            Some(row) => row.package_sync.map_or(true, |sync| sync < cutoff),
            None => true,
        })
    }

    /// Distinct releases known for a distribution, newest-inserted last.
    pub async fn releases(&self, distro: &str) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT release FROM subtargets WHERE distro = ?1 ORDER BY release",
        )
        .bind(distro)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
