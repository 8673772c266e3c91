//! The imagebuilder provisioning queue.
//!
//! A row here means "no worker currently holds the skill for this
//! subtarget". Rows move `requested -> initialize` when a worker claims
//! them and are deleted by `register_skill` when provisioning completes.

use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::types::{unix_now, SubtargetKey};

/// Result of [`ImagebuilderStore::ensure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionState {
    /// A worker already holds the skill; builds can be claimed.
    Ready,
    /// A provisioning request is queued; the client must poll.
    Requested,
}

fn key_from_row(row: &SqliteRow) -> Result<SubtargetKey, sqlx::Error> {
    Ok(SubtargetKey {
        distro: row.try_get("distro")?,
        release: row.try_get("release")?,
        target: row.try_get("target")?,
        subtarget: row.try_get("subtarget")?,
    })
}

/// Handle for imagebuilder queue operations.
#[derive(Clone)]
pub struct ImagebuilderStore {
    pool: SqlitePool,
}

impl ImagebuilderStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// If a worker holds the matching skill return `Ready`; otherwise
    /// queue a provisioning request (idempotent) and return `Requested`.
    pub async fn ensure(&self, key: &SubtargetKey) -> Result<ProvisionState, StoreError> {
        let ready = sqlx::query_scalar::<_, i64>(
            "SELECT 1 FROM worker_skills ws
             JOIN subtargets s ON s.id = ws.subtarget_id
             WHERE s.distro = ?1 AND s.release = ?2 AND s.target = ?3 AND s.subtarget = ?4
               AND ws.status = 'ready'
             LIMIT 1",
        )
        .bind(&key.distro)
        .bind(&key.release)
        .bind(&key.target)
        .bind(&key.subtarget)
        .fetch_optional(&self.pool)
        .await?;

        if ready.is_some() {
            return Ok(ProvisionState::Ready);
        }

        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO imagebuilder_requests
                (distro, release, target, subtarget, status, created_at)
             VALUES (?1, ?2, ?3, ?4, 'requested', ?5)",
        )
        .bind(&key.distro)
        .bind(&key.release)
        .bind(&key.target)
        .bind(&key.subtarget)
        .bind(unix_now())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted > 0 {
            info!(subtarget = %key, "Queued imagebuilder request");
        }
        Ok(ProvisionState::Requested)
    }

    /// Atomically claim the oldest `requested` row, flipping it to
    /// `initialize`. At most one worker receives any given row.
    pub async fn claim_next(&self) -> Result<Option<SubtargetKey>, StoreError> {
        let row = sqlx::query(
            "UPDATE imagebuilder_requests SET status = 'initialize'
             WHERE id = (
                 SELECT MIN(id) FROM imagebuilder_requests WHERE status = 'requested'
             )
             RETURNING distro, release, target, subtarget",
        )
        .fetch_optional(&self.pool)
        .await?;

        let key = row.as_ref().map(key_from_row).transpose()?;
        if let Some(key) = &key {
            debug!(subtarget = %key, "Claimed imagebuilder request");
        }
        Ok(key)
    }

    /// Return a claimed row to `requested` after a failed provision so
    /// another worker may retry.
    pub async fn release(&self, key: &SubtargetKey) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE imagebuilder_requests SET status = 'requested'
             WHERE distro = ?1 AND release = ?2 AND target = ?3 AND subtarget = ?4",
        )
        .bind(&key.distro)
        .bind(&key.release)
        .bind(&key.target)
        .bind(&key.subtarget)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Peek the next subtarget that needs a worker: the union of queued
    /// provisioning requests and subtargets whose skilled workers have all
    /// gone stale.
    pub async fn worker_needed(
        &self,
        stale_after_secs: i64,
    ) -> Result<Option<SubtargetKey>, StoreError> {
        let cutoff = unix_now() - stale_after_secs;
        let row = sqlx::query(
            "SELECT distro, release, target, subtarget
             FROM imagebuilder_requests WHERE status = 'requested'
             UNION
             SELECT s.distro, s.release, s.target, s.subtarget
             FROM subtargets s
             WHERE EXISTS (
                 SELECT 1 FROM worker_skills ws WHERE ws.subtarget_id = s.id
             )
             AND NOT EXISTS (
                 SELECT 1 FROM worker_skills ws
                 JOIN workers w ON w.id = ws.worker_id
                 WHERE ws.subtarget_id = s.id AND w.heartbeat >= ?1
             )
             LIMIT 1",
        )
        .bind(cutoff)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(key_from_row).transpose().map_err(Into::into)
    }
}
