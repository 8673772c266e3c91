//! Worker registry and skills.

use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use tracing::info;

use crate::error::StoreError;
use crate::types::{unix_now, SubtargetKey};

/// A row from the workers table.
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    pub id: i64,
    pub name: String,
    pub address: String,
    pub public_key: String,
    /// Unix seconds of the last heartbeat.
    pub heartbeat: i64,
}

impl WorkerRecord {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            address: row.try_get("address")?,
            public_key: row.try_get("public_key")?,
            heartbeat: row.try_get("heartbeat")?,
        })
    }
}

/// Handle for worker lifecycle operations.
#[derive(Clone)]
pub struct WorkerStore {
    pool: SqlitePool,
}

impl WorkerStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Register a worker, recording its usign public key.
    pub async fn register(
        &self,
        name: &str,
        address: &str,
        public_key: &str,
    ) -> Result<i64, StoreError> {
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO workers (name, address, public_key, heartbeat)
             VALUES (?1, ?2, ?3, ?4)
             RETURNING id",
        )
        .bind(name)
        .bind(address)
        .bind(public_key)
        .bind(unix_now())
        .fetch_one(&self.pool)
        .await?;

        info!(worker_id = id, name, "Registered worker");
        Ok(id)
    }

    /// Refresh the worker's heartbeat timestamp.
    pub async fn heartbeat(&self, worker_id: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE workers SET heartbeat = ?1 WHERE id = ?2")
            .bind(unix_now())
            .bind(worker_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Remove a worker; its skills cascade away.
    pub async fn destroy(&self, worker_id: i64) -> Result<(), StoreError> {
        info!(worker_id, "Destroying worker");
        sqlx::query("DELETE FROM workers WHERE id = ?1")
            .bind(worker_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Fetch a worker row by id.
    pub async fn get(&self, worker_id: i64) -> Result<Option<WorkerRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT id, name, address, public_key, heartbeat FROM workers WHERE id = ?1",
        )
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref()
            .map(WorkerRecord::from_row)
            .transpose()
            .map_err(Into::into)
    }

    /// Record a worker's ability to build for a subtarget and consume the
    /// matching imagebuilder request, in one transaction. Idempotent under
    /// retry.
    pub async fn register_skill(
        &self,
        worker_id: i64,
        key: &SubtargetKey,
        status: &str,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let subtarget_id = sqlx::query_scalar::<_, i64>(
            "SELECT id FROM subtargets
             WHERE distro = ?1 AND release = ?2 AND target = ?3 AND subtarget = ?4",
        )
        .bind(&key.distro)
        .bind(&key.release)
        .bind(&key.target)
        .bind(&key.subtarget)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::UnknownSubtarget(key.to_string()))?;

        sqlx::query(
            "INSERT OR REPLACE INTO worker_skills (worker_id, subtarget_id, status)
             VALUES (?1, ?2, ?3)",
        )
        .bind(worker_id)
        .bind(subtarget_id)
        .bind(status)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "DELETE FROM imagebuilder_requests
             WHERE distro = ?1 AND release = ?2 AND target = ?3 AND subtarget = ?4",
        )
        .bind(&key.distro)
        .bind(&key.release)
        .bind(&key.target)
        .bind(&key.subtarget)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(worker_id, subtarget = %key, status, "Registered worker skill");
        Ok(())
    }

    /// All subtargets any live worker can currently serve.
    pub async fn active_subtargets(&self) -> Result<Vec<SubtargetKey>, StoreError> {
        let rows = sqlx::query(
            "SELECT s.distro, s.release, s.target, s.subtarget
             FROM worker_skills ws
             JOIN subtargets s ON s.id = ws.subtarget_id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(SubtargetKey {
                    distro: row.try_get("distro")?,
                    release: row.try_get("release")?,
                    target: row.try_get("target")?,
                    subtarget: row.try_get("subtarget")?,
                })
            })
            .collect::<Result<_, sqlx::Error>>()
            .map_err(Into::into)
    }
}
