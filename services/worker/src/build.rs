//! Image build driver.
//!
//! Takes a claimed build job through the full pipeline: compose the build
//! arguments (package diff, overlay files, extra image name), run the
//! toolchain, harvest the manifest, rename outputs to the requested
//! distribution and release, pick the sysupgrade artifact, sign, archive,
//! and upload.
//!
//! Domain failures are not errors: they transition the request row to the
//! matching failure state and persist the merged build log under
//! `faillogs/<request_hash>.log`.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use md5::{Digest, Md5};
use serde::Serialize;
use tracing::{info, warn};

use imageforge_distro::Distributions;
use imageforge_fingerprint::{self as fingerprint, ImageIdentity};
use imageforge_signing::Keypair;
use imageforge_store::{
    canonical_image_name, sanitise_network_profile, BuildJob, Database, NewImage, RequestStatus,
};

use crate::config::Config;
use crate::error::BuildError;
use crate::provisioner::Provisioner;
use crate::subprocess::{self, SubprocessError};
use crate::uploader;

/// Sysupgrade artifact name patterns, scanned in priority order. The last
/// entry matches anywhere in the name; the others match the tail.
const SYSUPGRADE_SUFFIXES: [&str; 6] = [
    "-squashfs-sysupgrade.bin",
    "-squashfs-sysupgrade.tar",
    "-squashfs.trx",
    "-squashfs.chk",
    "-squashfs.bin",
    "-squashfs-sdcard.img.gz",
];
const SYSUPGRADE_INFIX: &str = "-combined-squashfs";

/// Shared context for build attempts.
pub struct Builder<'a> {
    pub db: &'a Database,
    pub config: &'a Config,
    pub distributions: &'a Distributions,
    pub keypair: &'a Keypair,
    pub client: &'a reqwest::Client,
    pub worker_id: i64,
}

/// Faillog header, stored ahead of the merged subprocess output.
#[derive(Debug, Serialize)]
struct LogHeader<'a> {
    request_hash: &'a str,
    distro: &'a str,
    release: &'a str,
    target: &'a str,
    subtarget: &'a str,
    profile: &'a str,
    packages: &'a [String],
    network_profile: &'a str,
}

impl Builder<'_> {
    /// Drive one claimed job to a terminal or `created`/`ready` state.
    pub async fn build(&self, job: &BuildJob) -> Result<(), BuildError> {
        info!(request_hash = %job.request_hash, subtarget = %job.key, "Starting build");

        let provisioner =
            Provisioner::new(self.config, self.distributions, job.key.clone());
        let Some(imagebuilder_path) = provisioner.installed(self.distributions) else {
            return self
                .fail(job, RequestStatus::BuildFail, b"imagebuilder tree missing on worker")
                .await;
        };

        std::fs::create_dir_all(&self.config.temp_dir)?;
        let build_dir = tempfile::tempdir_in(&self.config.temp_dir)?;

        // Package diff against the profile's full default set.
        let defaults = self
            .db
            .packages()
            .get_image_packages(&job.key, &job.profile)
            .await?
            .unwrap_or_default();
        let vanilla = is_vanilla(&job.packages, &defaults);

        let mut packages = job.packages.clone();
        let network_profile_path = if job.network_profile.is_empty() {
            None
        } else {
            let path = self.config.network_profiles_dir.join(&job.network_profile);
            // Overlays may carry a PACKAGES file naming extra packages to
            // bake in alongside the files.
            let extra = path.join("PACKAGES");
            if let Ok(contents) = std::fs::read_to_string(&extra) {
                packages.extend(contents.split_whitespace().map(str::to_string));
            }
            Some(path)
        };
        if !vanilla {
            packages = diff_packages(&packages, &defaults);
        }

        let mut args = vec![
            "image".to_string(),
            "-j".to_string(),
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
                .to_string(),
            format!("PROFILE={}", job.profile),
        ];
        if let Some(path) = &network_profile_path {
            args.push(format!("FILES={}", path.display()));
        }
        args.push(format!(
            "EXTRA_IMAGE_NAME={}",
            extra_image_name(vanilla, &job.request_hash, &job.network_profile)
        ));
        args.push(format!("PACKAGES={}", packages.join(" ")));
        args.push(format!("BIN_DIR={}", build_dir.path().display()));

        // A fresh catalogue lets the toolchain skip its own index update.
        let fresh = !self.db.subtargets().outdated(&job.key).await?;
        let env: &[(&str, &str)] = if fresh { &[("NO_UPDATE", "1")] } else { &[] };
        let env_remove: &[&str] = if fresh { &[] } else { &["NO_UPDATE"] };

        let out = match subprocess::run(
            "make",
            &args,
            &imagebuilder_path,
            env,
            env_remove,
            Duration::from_secs(self.config.subprocess_timeout_secs),
        )
        .await
        {
            Ok(out) => out,
            Err(SubprocessError::Timeout(timeout)) => {
                let message = format!("build exceeded {timeout:?} wall-clock timeout");
                return self.fail(job, RequestStatus::BuildFail, message.as_bytes()).await;
            }
            Err(other) => return Err(other.into()),
        };
        if !out.success {
            return self.fail(job, RequestStatus::BuildFail, &out.output).await;
        }

        // The manifest pins what actually got installed.
        let Some(manifest_path) = find_by_extension(build_dir.path(), "manifest")? else {
            let mut log = out.output.clone();
            log.extend_from_slice(b"\n\nno manifest produced by build");
            return self.fail(job, RequestStatus::BuildFail, &log).await;
        };
        let manifest_bytes = std::fs::read(&manifest_path)?;
        let manifest_hash = fingerprint::manifest_hash(&manifest_bytes);
        self.db.images().add_manifest(&manifest_hash).await?;
        self.db
            .images()
            .add_manifest_packages(
                &manifest_hash,
                &parse_manifest(&String::from_utf8_lossy(&manifest_bytes)),
            )
            .await?;

        let image_hash = fingerprint::image_hash(&ImageIdentity {
            distro: &job.key.distro,
            release: &job.key.release,
            target: &job.key.target,
            subtarget: &job.key.subtarget,
            profile: &job.profile,
            manifest_hash: &manifest_hash,
            network_profile: &job.network_profile,
        })?;
        let already_created = self.db.images().by_hash(&image_hash).await?.is_some();

        // Outputs carry the toolchain's naming; publish under the
        // requested distribution and release instead.
        let imagebuilder_release = self
            .distributions
            .imagebuilder_release(&job.key.distro, &job.key.release);
        let mut names = Vec::new();
        for entry in std::fs::read_dir(build_dir.path())? {
            let entry = entry?;
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            let renamed = rename_output(
                &name,
                &self.distributions.imagebuilder_prefix,
                &job.key.distro,
                imagebuilder_release,
                &job.key.release,
                &job.request_hash,
                &manifest_hash,
            );
            if renamed != name {
                std::fs::rename(entry.path(), build_dir.path().join(&renamed))?;
            }
            names.push(renamed);
        }
        names.sort();

        let Some(sysupgrade_name) = find_sysupgrade(&names) else {
            let mut log = out.output.clone();
            log.extend_from_slice(b"\n\nno sysupgrade artifact produced, image exceeds flash budget");
            return self.fail(job, RequestStatus::ImagesizeFail, &log).await;
        };
        let sysupgrade_path = build_dir.path().join(&sysupgrade_name);

        let mut subtarget_in_name = sysupgrade_name.contains(&job.key.subtarget);
        let profile_in_name = sysupgrade_name.contains(&job.profile);
        // Profiles named after their subtarget would count the single
        // occurrence twice.
        if job.profile == job.key.subtarget
            && !sysupgrade_name.contains(&format!("{}-{}", job.key.subtarget, job.profile))
        {
            subtarget_in_name = false;
        }

        let name = canonical_image_name(
            &job.key,
            &job.profile,
            &manifest_hash,
            &job.network_profile,
            subtarget_in_name,
            profile_in_name,
            vanilla,
        );
        let sysupgrade_suffix = sysupgrade_name
            .strip_prefix(&format!("{name}-"))
            .unwrap_or(&sysupgrade_name)
            .to_string();

        if self.config.sign_images {
            if let Err(e) = self.keypair.sign_file(&sysupgrade_path) {
                let message = format!("signing failed: {e}");
                return self.fail(job, RequestStatus::SigningFail, message.as_bytes()).await;
            }
        }

        // Publish the build log alongside the artifacts.
        let log_name = format!("{sysupgrade_name}.log");
        std::fs::write(
            build_dir.path().join(&log_name),
            faillog_contents(job, &out.output),
        )?;

        let checksum = {
            let mut hasher = Md5::new();
            hasher.update(std::fs::read(&sysupgrade_path)?);
            hex::encode(hasher.finalize())
        };
        let filesize = std::fs::metadata(&sysupgrade_path)?.len() as i64;

        self.db
            .images()
            .add_image(&NewImage {
                image_hash: image_hash.clone(),
                key: job.key.clone(),
                profile: job.profile.clone(),
                manifest_hash,
                network_profile: job.network_profile.clone(),
                checksum,
                filesize,
                sysupgrade_suffix,
                subtarget_in_name,
                profile_in_name,
                vanilla,
            })
            .await?;
        self.db
            .requests()
            .complete_build_job(&job.request_hash, &image_hash)
            .await?;

        if already_created {
            // Another request already published identical artifacts; the
            // download tree has everything this request needs.
            info!(
                request_hash = %job.request_hash,
                image_hash = %image_hash,
                already_created = true,
                "Image published by an earlier build"
            );
            self.db
                .requests()
                .set_status(&job.request_hash, RequestStatus::Ready)
                .await?;
            return Ok(());
        }

        let archive_path = self.write_archive(&job.request_hash, build_dir.path())?;
        uploader::upload_result(
            self.client,
            &self.config.server_url,
            &job.request_hash,
            self.worker_id,
            &archive_path,
        )
        .await?;

        info!(request_hash = %job.request_hash, image_hash = %image_hash, "Build uploaded");
        Ok(())
    }

    /// Zip every output file and sign the archive for upload.
    fn write_archive(&self, request_hash: &str, build_dir: &Path) -> Result<PathBuf, BuildError> {
        let archive_path = self.config.temp_dir.join(format!("{request_hash}.zip"));
        let file = std::fs::File::create(&archive_path)?;
        let mut archive = zip::ZipWriter::new(file);
        let options = zip::write::FileOptions::default();

        let mut entries: Vec<_> = std::fs::read_dir(build_dir)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_file())
            .collect();
        entries.sort_by_key(|entry| entry.file_name());
        for entry in entries {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            archive.start_file(name.as_str(), options)?;
            archive.write_all(&std::fs::read(entry.path())?)?;
        }
        archive.finish()?;

        self.keypair.sign_file(&archive_path)?;
        Ok(archive_path)
    }

    async fn fail(
        &self,
        job: &BuildJob,
        status: RequestStatus,
        log: &[u8],
    ) -> Result<(), BuildError> {
        warn!(request_hash = %job.request_hash, status = %status, "Build failed");

        let faillogs = self.config.download_dir.join("faillogs");
        std::fs::create_dir_all(&faillogs)?;
        std::fs::write(
            faillogs.join(format!("{}.log", job.request_hash)),
            faillog_contents(job, log),
        )?;

        self.db.requests().set_status(&job.request_hash, status).await?;
        Ok(())
    }
}

fn faillog_contents(job: &BuildJob, output: &[u8]) -> Vec<u8> {
    let header = LogHeader {
        request_hash: &job.request_hash,
        distro: &job.key.distro,
        release: &job.key.release,
        target: &job.key.target,
        subtarget: &job.key.subtarget,
        profile: &job.profile,
        packages: &job.packages,
        network_profile: &job.network_profile,
    };
    let mut contents = serde_json::to_vec_pretty(&header).unwrap_or_default();
    contents.extend_from_slice(b"\n\n");
    contents.extend_from_slice(output);
    contents
}

/// Whether the submitted package set equals the profile's defaults. An
/// empty submission requests no customisation at all.
fn is_vanilla(requested: &[String], defaults: &[String]) -> bool {
    if requested.is_empty() {
        return true;
    }
    let requested: BTreeSet<&str> = requested.iter().map(String::as_str).collect();
    let defaults: BTreeSet<&str> = defaults.iter().map(String::as_str).collect();
    requested == defaults
}

/// Extend the package list with a negative entry for every default
/// package the request did not ask for.
fn diff_packages(packages: &[String], defaults: &[String]) -> Vec<String> {
    let mut result = packages.to_vec();
    for default in defaults {
        if !packages.iter().any(|p| p == default) {
            result.push(format!("-{default}"));
        }
    }
    result
}

/// `EXTRA_IMAGE_NAME` passed to the toolchain: the request hash (elided
/// for vanilla builds) plus the sanitised network profile.
fn extra_image_name(vanilla: bool, request_hash: &str, network_profile: &str) -> String {
    let mut parts = Vec::new();
    if !vanilla {
        parts.push(request_hash.to_string());
    }
    if !network_profile.is_empty() {
        parts.push(sanitise_network_profile(network_profile));
    }
    parts.join("-")
}

/// Rewrite a toolchain output filename for publication.
fn rename_output(
    name: &str,
    imagebuilder_prefix: &str,
    distro: &str,
    imagebuilder_release: &str,
    release: &str,
    request_hash: &str,
    manifest_hash: &str,
) -> String {
    name.replace(imagebuilder_prefix, distro)
        .replace(imagebuilder_release, release)
        .replace(request_hash, manifest_hash)
}

/// First file matching the sysupgrade patterns, in priority order.
fn find_sysupgrade(names: &[String]) -> Option<String> {
    for suffix in SYSUPGRADE_SUFFIXES {
        if let Some(name) = names.iter().find(|name| name.ends_with(suffix)) {
            return Some(name.clone());
        }
    }
    names
        .iter()
        .find(|name| name.contains(SYSUPGRADE_INFIX))
        .cloned()
}

/// Parse `name - version` manifest lines.
fn parse_manifest(manifest: &str) -> Vec<(String, String)> {
    manifest
        .lines()
        .filter_map(|line| {
            let (name, version) = line.split_once(" - ")?;
            Some((name.trim().to_string(), version.trim().to_string()))
        })
        .collect()
}

fn find_by_extension(dir: &Path, extension: &str) -> std::io::Result<Option<PathBuf>> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|e| e == extension) {
            return Ok(Some(path));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vanilla_detection() {
        let defaults = vec!["base-files".to_string(), "busybox".to_string()];
        assert!(is_vanilla(&[], &defaults));
        assert!(is_vanilla(
            &["busybox".to_string(), "base-files".to_string()],
            &defaults
        ));
        assert!(!is_vanilla(&["luci".to_string()], &defaults));
    }

    #[test]
    fn diff_appends_negative_entries() {
        let defaults = vec!["base-files".to_string(), "ppp".to_string()];
        let packages = vec!["base-files".to_string(), "luci".to_string()];
        assert_eq!(
            diff_packages(&packages, &defaults),
            vec!["base-files", "luci", "-ppp"]
        );
    }

    #[test]
    fn extra_image_name_composition() {
        assert_eq!(extra_image_name(true, "aaa111", ""), "");
        assert_eq!(extra_image_name(false, "aaa111", ""), "aaa111");
        assert_eq!(
            extra_image_name(false, "aaa111", "office/ap.v2"),
            "aaa111-office-ap_v2"
        );
        assert_eq!(extra_image_name(true, "aaa111", "office"), "office");
    }

    #[test]
    fn output_renaming() {
        let renamed = rename_output(
            "lede-17.01.4-aaa111-ar71xx-generic-squashfs-sysupgrade.bin",
            "lede",
            "libremesh",
            "17.01.4",
            "17.06",
            "aaa111",
            "mmm0123456789ab",
        );
        assert_eq!(
            renamed,
            "libremesh-17.06-mmm0123456789ab-ar71xx-generic-squashfs-sysupgrade.bin"
        );
    }

    #[test]
    fn sysupgrade_priority_order() {
        let names = vec![
            "x-squashfs.bin".to_string(),
            "x-squashfs-sysupgrade.tar".to_string(),
            "x-squashfs-sysupgrade.bin".to_string(),
        ];
        assert_eq!(
            find_sysupgrade(&names).unwrap(),
            "x-squashfs-sysupgrade.bin"
        );

        let combined = vec!["y-combined-squashfs.img".to_string()];
        assert_eq!(
            find_sysupgrade(&combined).unwrap(),
            "y-combined-squashfs.img"
        );

        assert!(find_sysupgrade(&["kernel.bin".to_string()]).is_none());
    }

    #[test]
    fn manifest_parsing() {
        let manifest = "base-files - 173.2\nluci - git-17.230\nnot a package line\n";
        assert_eq!(
            parse_manifest(manifest),
            vec![
                ("base-files".to_string(), "173.2".to_string()),
                ("luci".to_string(), "git-17.230".to_string()),
            ]
        );
    }
}
