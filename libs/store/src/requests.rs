//! The image request queue.
//!
//! Requests are deduplicated by `request_hash` and claimed by workers in
//! insertion order (lowest id first) within a subtarget. Claiming is a
//! single `UPDATE ... RETURNING` statement, so concurrent workers can never
//! receive the same row.

use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::types::{unix_now, RequestStatus, SubtargetKey};

/// A new queue row, identity already fingerprinted by the caller.
#[derive(Debug, Clone)]
pub struct NewRequest {
    pub request_hash: String,
    pub key: SubtargetKey,
    pub profile: String,
    pub packages_hash: String,
    pub network_profile: String,
}

/// A row from the image_requests table.
#[derive(Debug, Clone)]
pub struct ImageRequest {
    pub id: i64,
    pub request_hash: String,
    pub key: SubtargetKey,
    pub profile: String,
    pub packages_hash: String,
    pub network_profile: String,
    pub status: RequestStatus,
    pub image_hash: Option<String>,
}

impl ImageRequest {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;
        Ok(Self {
            id: row.try_get("id")?,
            request_hash: row.try_get("request_hash")?,
            key: SubtargetKey {
                distro: row.try_get("distro")?,
                release: row.try_get("release")?,
                target: row.try_get("target")?,
                subtarget: row.try_get("subtarget")?,
            },
            profile: row.try_get("profile")?,
            packages_hash: row.try_get("packages_hash")?,
            network_profile: row.try_get("network_profile")?,
            status: RequestStatus::from_str(&status).unwrap_or(RequestStatus::Requested),
            image_hash: row.try_get("image_hash")?,
        })
    }
}

/// A claimed build job with the package set expanded.
#[derive(Debug, Clone)]
pub struct BuildJob {
    pub id: i64,
    pub request_hash: String,
    pub key: SubtargetKey,
    pub profile: String,
    pub packages: Vec<String>,
    pub network_profile: String,
}

/// Handle for image request queue operations.
#[derive(Clone)]
pub struct RequestStore {
    pool: SqlitePool,
}

impl RequestStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a request if its hash is unseen, otherwise return the
    /// existing row's status. Resubmission never creates a duplicate.
    pub async fn find_or_insert(
        &self,
        request: &NewRequest,
    ) -> Result<RequestStatus, StoreError> {
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO image_requests
                (request_hash, distro, release, target, subtarget, profile,
                 packages_hash, network_profile, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'requested', ?9)",
        )
        .bind(&request.request_hash)
        .bind(&request.key.distro)
        .bind(&request.key.release)
        .bind(&request.key.target)
        .bind(&request.key.subtarget)
        .bind(&request.profile)
        .bind(&request.packages_hash)
        .bind(&request.network_profile)
        .bind(unix_now())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let status: String = sqlx::query_scalar(
            "SELECT status FROM image_requests WHERE request_hash = ?1",
        )
        .bind(&request.request_hash)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        if inserted > 0 {
            info!(request_hash = %request.request_hash, subtarget = %request.key, "Queued image request");
        }
        Ok(RequestStatus::from_str(&status).unwrap_or(RequestStatus::Requested))
    }

    /// Fetch a request row by hash.
    pub async fn get(&self, request_hash: &str) -> Result<Option<ImageRequest>, StoreError> {
        let row = sqlx::query(
            "SELECT id, request_hash, distro, release, target, subtarget, profile,
                    packages_hash, network_profile, status, image_hash
             FROM image_requests WHERE request_hash = ?1",
        )
        .bind(request_hash)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref()
            .map(ImageRequest::from_row)
            .transpose()
            .map_err(Into::into)
    }

    /// Atomically claim the oldest `requested` row matching one of the
    /// worker's skills, flip it to `building`, and return it with the
    /// package set expanded.
    ///
    /// Skills are tried in the order given; the first subtarget with
    /// pending work wins. There is no FIFO guarantee across subtargets.
    pub async fn claim_next_build_job(
        &self,
        skills: &[SubtargetKey],
    ) -> Result<Option<BuildJob>, StoreError> {
        for key in skills {
            if let Some(job) = self.claim_for_subtarget(key).await? {
                return Ok(Some(job));
            }
        }
        Ok(None)
    }

    async fn claim_for_subtarget(
        &self,
        key: &SubtargetKey,
    ) -> Result<Option<BuildJob>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "UPDATE image_requests SET status = 'building'
             WHERE id = (
                 SELECT MIN(id) FROM image_requests
                 WHERE status = 'requested'
                   AND distro = ?1 AND release = ?2 AND target = ?3 AND subtarget = ?4
             )
             RETURNING id, request_hash, profile, packages_hash, network_profile",
        )
        .bind(&key.distro)
        .bind(&key.release)
        .bind(&key.target)
        .bind(&key.subtarget)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };

        let packages_hash: String = row.try_get("packages_hash")?;
        let packages: Option<String> = sqlx::query_scalar(
            "SELECT packages FROM packages_hashes WHERE hash = ?1",
        )
        .bind(&packages_hash)
        .fetch_optional(&mut *tx)
        .await?;
        tx.commit().await?;

        let job = BuildJob {
            id: row.try_get("id")?,
            request_hash: row.try_get("request_hash")?,
            key: key.clone(),
            profile: row.try_get("profile")?,
            packages: packages
                .map(|p| p.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            network_profile: row.try_get("network_profile")?,
        };
        debug!(request_hash = %job.request_hash, subtarget = %key, "Claimed build job");
        Ok(Some(job))
    }

    /// Record a finished build: status `created`, image hash set.
    pub async fn complete_build_job(
        &self,
        request_hash: &str,
        image_hash: &str,
    ) -> Result<(), StoreError> {
        info!(request_hash, image_hash, "Build job complete");
        sqlx::query(
            "UPDATE image_requests SET status = 'created', image_hash = ?1
             WHERE request_hash = ?2",
        )
        .bind(image_hash)
        .bind(request_hash)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Unconditional status write, used for failure states and the final
    /// promotion to `ready`.
    pub async fn set_status(
        &self,
        request_hash: &str,
        status: RequestStatus,
    ) -> Result<(), StoreError> {
        info!(request_hash, status = %status, "Setting request status");
        sqlx::query("UPDATE image_requests SET status = ?1 WHERE request_hash = ?2")
            .bind(status.as_str())
            .bind(request_hash)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
