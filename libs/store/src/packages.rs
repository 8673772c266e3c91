//! Package catalogues, default package lists, device profiles, and
//! content-addressed package sets.

use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use tracing::debug;

use crate::error::StoreError;
use crate::subtargets::SubtargetStore;
use crate::types::{unix_now, SubtargetKey};

/// A device profile: a named starting point with a model label and a
/// device-specific default package list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub name: String,
    pub model: String,
    pub packages: Vec<String>,
}

/// Handle for package and profile operations.
#[derive(Clone)]
pub struct PackageStore {
    pool: SqlitePool,
}

impl PackageStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn subtargets(&self) -> SubtargetStore {
        SubtargetStore::new(self.pool.clone())
    }

    /// Replace the available-package catalogue for a subtarget and stamp
    /// `package_sync`. All-or-nothing: a failure leaves the old catalogue.
    pub async fn insert_packages_available(
        &self,
        key: &SubtargetKey,
        packages: &[(String, String)],
    ) -> Result<(), StoreError> {
        let subtarget_id = self.subtargets().require_id(key).await?;
        debug!(subtarget = %key, count = packages.len(), "Refreshing package catalogue");

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM packages_available WHERE subtarget_id = ?1")
            .bind(subtarget_id)
            .execute(&mut *tx)
            .await?;
        for (name, version) in packages {
            sqlx::query(
                "INSERT OR REPLACE INTO packages_available (subtarget_id, name, version)
                 VALUES (?1, ?2, ?3)",
            )
            .bind(subtarget_id)
            .bind(name)
            .bind(version)
            .execute(&mut *tx)
            .await?;
        }
        sqlx::query("UPDATE subtargets SET package_sync = ?1 WHERE id = ?2")
            .bind(unix_now())
            .bind(subtarget_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Every installable package for a subtarget as `(name, version)`.
    pub async fn get_packages_available(
        &self,
        key: &SubtargetKey,
    ) -> Result<Vec<(String, String)>, StoreError> {
        let subtarget_id = self.subtargets().require_id(key).await?;
        let rows = sqlx::query(
            "SELECT name, version FROM packages_available
             WHERE subtarget_id = ?1 ORDER BY name",
        )
        .bind(subtarget_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| Ok((row.try_get("name")?, row.try_get("version")?)))
            .collect::<Result<_, sqlx::Error>>()
            .map_err(Into::into)
    }

    /// Replace the default package list and profile set for a subtarget in
    /// one transaction. No partial catalogue is ever visible.
    pub async fn insert_profiles(
        &self,
        key: &SubtargetKey,
        default_packages: &[String],
        profiles: &[Profile],
    ) -> Result<(), StoreError> {
        let subtarget_id = self.subtargets().require_id(key).await?;
        debug!(subtarget = %key, profiles = profiles.len(), "Storing profiles");

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT OR REPLACE INTO packages_default (subtarget_id, packages) VALUES (?1, ?2)",
        )
        .bind(subtarget_id)
        .bind(default_packages.join(" "))
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM profiles WHERE subtarget_id = ?1")
            .bind(subtarget_id)
            .execute(&mut *tx)
            .await?;
        for profile in profiles {
            sqlx::query(
                "INSERT INTO profiles (subtarget_id, name, model, packages)
                 VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(subtarget_id)
            .bind(&profile.name)
            .bind(&profile.model)
            .bind(profile.packages.join(" "))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// The package list the toolchain installs with no customisation.
    pub async fn get_default_packages(
        &self,
        key: &SubtargetKey,
    ) -> Result<Option<Vec<String>>, StoreError> {
        let subtarget_id = self.subtargets().require_id(key).await?;
        let packages = sqlx::query_scalar::<_, String>(
            "SELECT packages FROM packages_default WHERE subtarget_id = ?1",
        )
        .bind(subtarget_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(packages.map(|p| split_packages(&p)))
    }

    /// Resolve a submitted profile name to a stored profile.
    ///
    /// Three passes, first match wins: exact name, case-insensitive model
    /// label, then suffix wildcard on the name.
    pub async fn resolve_profile(
        &self,
        key: &SubtargetKey,
        input: &str,
    ) -> Result<Option<Profile>, StoreError> {
        let subtarget_id = self.subtargets().require_id(key).await?;

        let exact = self
            .fetch_profile(
                "SELECT name, model, packages FROM profiles
                 WHERE subtarget_id = ?1 AND name = ?2 LIMIT 1",
                subtarget_id,
                input,
            )
            .await?;
        if exact.is_some() {
            return Ok(exact);
        }

        let by_model = self
            .fetch_profile(
                "SELECT name, model, packages FROM profiles
                 WHERE subtarget_id = ?1 AND lower(model) = lower(?2) LIMIT 1",
                subtarget_id,
                input,
            )
            .await?;
        if by_model.is_some() {
            return Ok(by_model);
        }

        self.fetch_profile(
            "SELECT name, model, packages FROM profiles
             WHERE subtarget_id = ?1 AND name LIKE '%' || ?2 LIMIT 1",
            subtarget_id,
            input,
        )
        .await
    }

    async fn fetch_profile(
        &self,
        sql: &str,
        subtarget_id: i64,
        input: &str,
    ) -> Result<Option<Profile>, StoreError> {
        let row = sqlx::query(sql)
            .bind(subtarget_id)
            .bind(input)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| {
            Ok(Profile {
                name: row.try_get("name")?,
                model: row.try_get("model")?,
                packages: split_packages(row.try_get::<String, _>("packages")?.as_str()),
            })
        })
        .transpose()
        .map_err(|e: sqlx::Error| e.into())
    }

    /// The full package set a profile's image starts from: subtarget
    /// defaults plus the profile's own additions.
    pub async fn get_image_packages(
        &self,
        key: &SubtargetKey,
        profile: &str,
    ) -> Result<Option<Vec<String>>, StoreError> {
        let Some(defaults) = self.get_default_packages(key).await? else {
            return Ok(None);
        };
        let Some(profile) = self.resolve_profile(key, profile).await? else {
            return Ok(None);
        };

        let mut packages = defaults;
        for package in profile.packages {
            if !packages.contains(&package) {
                packages.push(package);
            }
        }
        Ok(Some(packages))
    }

    /// Search profiles by model label for the catalogue API.
    pub async fn models(
        &self,
        distro: &str,
        release: &str,
        search: &str,
    ) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT p.model FROM profiles p
             JOIN subtargets s ON s.id = p.subtarget_id
             WHERE s.distro = ?1 AND s.release = ?2 AND p.model LIKE '%' || ?3 || '%'
             ORDER BY p.model",
        )
        .bind(distro)
        .bind(release)
        .bind(search)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Record a content-addressed package set. Idempotent.
    pub async fn ensure_packages_hash(
        &self,
        hash: &str,
        packages: &[String],
    ) -> Result<(), StoreError> {
        sqlx::query("INSERT OR IGNORE INTO packages_hashes (hash, packages) VALUES (?1, ?2)")
            .bind(hash)
            .bind(packages.join(" "))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Expand a packages hash back into its package list.
    pub async fn get_packages_by_hash(
        &self,
        hash: &str,
    ) -> Result<Option<Vec<String>>, StoreError> {
        let packages = sqlx::query_scalar::<_, String>(
            "SELECT packages FROM packages_hashes WHERE hash = ?1",
        )
        .bind(hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(packages.map(|p| split_packages(&p)))
    }
}

fn split_packages(joined: &str) -> Vec<String> {
    joined.split_whitespace().map(str::to_string).collect()
}
