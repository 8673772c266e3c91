//! Built images and manifests.

use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::types::{unix_now, SubtargetKey};

/// A new image row; `build_date` is stamped at insert time.
#[derive(Debug, Clone)]
pub struct NewImage {
    pub image_hash: String,
    pub key: SubtargetKey,
    pub profile: String,
    pub manifest_hash: String,
    pub network_profile: String,
    pub checksum: String,
    pub filesize: i64,
    /// Trailing part of the sysupgrade filename after the canonical name.
    pub sysupgrade_suffix: String,
    pub subtarget_in_name: bool,
    pub profile_in_name: bool,
    pub vanilla: bool,
}

/// A row from the images table.
#[derive(Debug, Clone)]
pub struct StoredImage {
    pub id: i64,
    pub image_hash: String,
    pub key: SubtargetKey,
    pub profile: String,
    pub manifest_hash: String,
    pub network_profile: String,
    pub checksum: String,
    pub filesize: i64,
    pub build_date: i64,
    pub sysupgrade_suffix: String,
    pub subtarget_in_name: bool,
    pub profile_in_name: bool,
    pub vanilla: bool,
}

impl StoredImage {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            image_hash: row.try_get("image_hash")?,
            key: SubtargetKey {
                distro: row.try_get("distro")?,
                release: row.try_get("release")?,
                target: row.try_get("target")?,
                subtarget: row.try_get("subtarget")?,
            },
            profile: row.try_get("profile")?,
            manifest_hash: row.try_get("manifest_hash")?,
            network_profile: row.try_get("network_profile")?,
            checksum: row.try_get("checksum")?,
            filesize: row.try_get("filesize")?,
            build_date: row.try_get("build_date")?,
            sysupgrade_suffix: row.try_get("sysupgrade_suffix")?,
            subtarget_in_name: row.try_get::<i64, _>("subtarget_in_name")? != 0,
            profile_in_name: row.try_get::<i64, _>("profile_in_name")? != 0,
            vanilla: row.try_get::<i64, _>("vanilla")? != 0,
        })
    }

    /// Directory of this image below the download root:
    /// `<distro>/<release>/<target>/<subtarget>/<profile>[/<manifest_hash>]`.
    /// Vanilla images share the profile directory; customised package sets
    /// get a manifest-hash subdirectory.
    pub fn store_path(&self) -> String {
        let mut parts = vec![
            self.key.distro.as_str(),
            self.key.release.as_str(),
            self.key.target.as_str(),
            self.key.subtarget.as_str(),
            self.profile.as_str(),
        ];
        if !self.vanilla {
            parts.push(self.manifest_hash.as_str());
        }
        parts.join("/")
    }

    /// The published sysupgrade filename.
    pub fn sysupgrade_filename(&self) -> String {
        let name = canonical_image_name(
            &self.key,
            &self.profile,
            &self.manifest_hash,
            &self.network_profile,
            self.subtarget_in_name,
            self.profile_in_name,
            self.vanilla,
        );
        format!("{name}-{}", self.sysupgrade_suffix)
    }
}

/// Assemble the canonical public image name:
/// `<distro>[-<release>][-<manifest_hash>][-<network_profile>]-<target>[-<subtarget>][-<profile>]`.
///
/// `release` is elided for snapshot builds, `manifest_hash` for vanilla
/// builds, and `subtarget`/`profile` when the toolchain already embedded
/// them in the filename.
pub fn canonical_image_name(
    key: &SubtargetKey,
    profile: &str,
    manifest_hash: &str,
    network_profile: &str,
    subtarget_in_name: bool,
    profile_in_name: bool,
    vanilla: bool,
) -> String {
    let mut parts: Vec<&str> = vec![&key.distro];

    if key.release != "snapshot" {
        parts.push(&key.release);
    }
    if !vanilla {
        parts.push(manifest_hash);
    }
    let sanitised;
    if !network_profile.is_empty() {
        sanitised = sanitise_network_profile(network_profile);
        parts.push(&sanitised);
    }
    parts.push(&key.target);
    if subtarget_in_name {
        parts.push(&key.subtarget);
    }
    if profile_in_name {
        parts.push(profile);
    }
    parts.join("-")
}

/// Network profile paths become filename-safe tokens: slashes to dashes,
/// dots to underscores.
pub fn sanitise_network_profile(network_profile: &str) -> String {
    network_profile.replace('/', "-").replace('.', "_")
}

/// Handle for image and manifest operations.
#[derive(Clone)]
pub struct ImageStore {
    pool: SqlitePool,
}

impl ImageStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record a manifest hash, returning its row id. Idempotent.
    pub async fn add_manifest(&self, manifest_hash: &str) -> Result<i64, StoreError> {
        sqlx::query("INSERT OR IGNORE INTO manifests (hash) VALUES (?1)")
            .bind(manifest_hash)
            .execute(&self.pool)
            .await?;

        let id = sqlx::query_scalar::<_, i64>("SELECT id FROM manifests WHERE hash = ?1")
            .bind(manifest_hash)
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }

    /// Record the `(name, version)` pairs of a manifest.
    pub async fn add_manifest_packages(
        &self,
        manifest_hash: &str,
        packages: &[(String, String)],
    ) -> Result<(), StoreError> {
        debug!(manifest_hash, count = packages.len(), "Storing manifest packages");
        let mut tx = self.pool.begin().await?;
        for (name, version) in packages {
            sqlx::query(
                "INSERT OR IGNORE INTO manifest_packages (manifest_hash, name, version)
                 VALUES (?1, ?2, ?3)",
            )
            .bind(manifest_hash)
            .bind(name)
            .bind(version)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Fetch manifest packages by hash.
    pub async fn manifest_packages(
        &self,
        manifest_hash: &str,
    ) -> Result<Vec<(String, String)>, StoreError> {
        let rows = sqlx::query(
            "SELECT name, version FROM manifest_packages
             WHERE manifest_hash = ?1 ORDER BY name",
        )
        .bind(manifest_hash)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| Ok((row.try_get("name")?, row.try_get("version")?)))
            .collect::<Result<_, sqlx::Error>>()
            .map_err(Into::into)
    }

    /// Insert an image if its hash is unseen; return the row id either way.
    pub async fn add_image(&self, image: &NewImage) -> Result<i64, StoreError> {
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO images
                (image_hash, distro, release, target, subtarget, profile, manifest_hash,
                 network_profile, checksum, filesize, build_date, sysupgrade_suffix,
                 subtarget_in_name, profile_in_name, vanilla)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        )
        .bind(&image.image_hash)
        .bind(&image.key.distro)
        .bind(&image.key.release)
        .bind(&image.key.target)
        .bind(&image.key.subtarget)
        .bind(&image.profile)
        .bind(&image.manifest_hash)
        .bind(&image.network_profile)
        .bind(&image.checksum)
        .bind(image.filesize)
        .bind(unix_now())
        .bind(&image.sysupgrade_suffix)
        .bind(image.subtarget_in_name as i64)
        .bind(image.profile_in_name as i64)
        .bind(image.vanilla as i64)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted > 0 {
            info!(image_hash = %image.image_hash, subtarget = %image.key, "Stored image");
        }

        let id = sqlx::query_scalar::<_, i64>("SELECT id FROM images WHERE image_hash = ?1")
            .bind(&image.image_hash)
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }

    /// Fetch an image by its hash.
    pub async fn by_hash(&self, image_hash: &str) -> Result<Option<StoredImage>, StoreError> {
        let row = sqlx::query("SELECT * FROM images WHERE image_hash = ?1")
            .bind(image_hash)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref()
            .map(StoredImage::from_row)
            .transpose()
            .map_err(Into::into)
    }

    /// Fetch the image a completed request produced, if any.
    pub async fn by_request(&self, request_hash: &str) -> Result<Option<StoredImage>, StoreError> {
        let row = sqlx::query(
            "SELECT i.* FROM images i
             JOIN image_requests r ON r.image_hash = i.image_hash
             WHERE r.request_hash = ?1",
        )
        .bind(request_hash)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref()
            .map(StoredImage::from_row)
            .transpose()
            .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SubtargetKey {
        SubtargetKey::new("lede", "17.01.4", "ar71xx", "generic")
    }

    #[test]
    fn canonical_name_full() {
        let name = canonical_image_name(
            &key(),
            "tl-wdr4300-v1",
            "abcdef012345678",
            "",
            true,
            true,
            false,
        );
        assert_eq!(
            name,
            "lede-17.01.4-abcdef012345678-ar71xx-generic-tl-wdr4300-v1"
        );
    }

    #[test]
    fn canonical_name_vanilla_elides_manifest() {
        let name = canonical_image_name(&key(), "tl-wdr4300-v1", "abcdef012345678", "", true, true, true);
        assert_eq!(name, "lede-17.01.4-ar71xx-generic-tl-wdr4300-v1");
    }

    #[test]
    fn canonical_name_snapshot_elides_release() {
        let snapshot = SubtargetKey::new("lede", "snapshot", "ar71xx", "generic");
        let name =
            canonical_image_name(&snapshot, "tl-wdr4300-v1", "abcdef012345678", "", false, false, true);
        assert_eq!(name, "lede-ar71xx");
    }

    #[test]
    fn canonical_name_includes_sanitised_network_profile() {
        let name = canonical_image_name(
            &key(),
            "tl-wdr4300-v1",
            "abcdef012345678",
            "office/ap.v2",
            false,
            false,
            true,
        );
        assert_eq!(name, "lede-17.01.4-office-ap_v2-ar71xx");
    }

    #[test]
    fn store_path_vanilla_and_custom() {
        let mut image = StoredImage {
            id: 1,
            image_hash: "h".into(),
            key: key(),
            profile: "tl-wdr4300-v1".into(),
            manifest_hash: "abcdef012345678".into(),
            network_profile: String::new(),
            checksum: "md5".into(),
            filesize: 1,
            build_date: 0,
            sysupgrade_suffix: "squashfs-sysupgrade.bin".into(),
            subtarget_in_name: true,
            profile_in_name: true,
            vanilla: true,
        };
        assert_eq!(
            image.store_path(),
            "lede/17.01.4/ar71xx/generic/tl-wdr4300-v1"
        );
        image.vanilla = false;
        assert_eq!(
            image.store_path(),
            "lede/17.01.4/ar71xx/generic/tl-wdr4300-v1/abcdef012345678"
        );
    }
}
