//! Imagebuilder provisioning.
//!
//! For a `(distro, release, target, subtarget)` the provisioner downloads
//! the published toolchain tarball, extracts it under the imagebuilder
//! root, installs the managed repositories configuration and build rules,
//! and harvests the profile and package catalogues into the store.
//!
//! Derived distributions build with a pinned release of the primary
//! distribution's toolchain; the tarball name and URL conventions live in
//! the distribution catalogue. Some releases publish tarballs with the
//! subtarget elided from the name, so the fully-qualified candidate is
//! tried first and the elided one second.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::StreamExt;
use regex::Regex;
use tracing::{debug, info, warn};

use imageforge_distro::Distributions;
use imageforge_store::{Database, Profile, SubtargetKey, Supported};

use crate::config::Config;
use crate::error::ProvisionError;
use crate::subprocess;

/// Name of the build-rules file inside an imagebuilder tree.
const BUILD_RULES_NAME: &str = "Makefile";

/// One imagebuilder instance keyed by subtarget.
pub struct Provisioner {
    key: SubtargetKey,
    /// Release of the primary toolchain this subtarget builds with.
    imagebuilder_release: String,
    /// Directory the extracted tree lands in.
    base_dir: PathBuf,
    temp_dir: PathBuf,
    repositories_template: PathBuf,
    build_rules_file: PathBuf,
    subprocess_timeout: Duration,
}

impl Provisioner {
    pub fn new(config: &Config, distributions: &Distributions, key: SubtargetKey) -> Self {
        let imagebuilder_release = distributions
            .imagebuilder_release(&key.distro, &key.release)
            .to_string();
        let base_dir = config
            .imagebuilder_dir
            .join(&key.distro)
            .join(&key.release)
            .join(&key.target)
            .join(&key.subtarget);

        Self {
            key,
            imagebuilder_release,
            base_dir,
            temp_dir: config.temp_dir.clone(),
            repositories_template: config.repositories_template.clone(),
            build_rules_file: config.build_rules_file.clone(),
            subprocess_timeout: Duration::from_secs(config.subprocess_timeout_secs),
        }
    }

    /// The extracted tree, when a prior provision already produced one.
    ///
    /// Both name variants are probed because the downloaded tarball
    /// dictates the directory name.
    pub fn installed(&self, distributions: &Distributions) -> Option<PathBuf> {
        for subtarget in [Some(self.key.subtarget.as_str()), None] {
            let name =
                distributions.imagebuilder_name(&self.imagebuilder_release, &self.key.target, subtarget);
            let path = self.base_dir.join(&name);
            if path.join(BUILD_RULES_NAME).exists() {
                return Some(path);
            }
        }
        None
    }

    /// Provision the imagebuilder and harvest its catalogues.
    pub async fn run(
        &self,
        db: &Database,
        distributions: &Distributions,
        client: &reqwest::Client,
    ) -> Result<(), ProvisionError> {
        let path = match self.installed(distributions) {
            Some(path) => {
                debug!(subtarget = %self.key, path = %path.display(), "Imagebuilder already present");
                path
            }
            None => self.download_and_extract(distributions, client).await?,
        };

        let pkg_arch = parse_pkg_arch(&std::fs::read_to_string(path.join(".config"))?)
            .ok_or(ProvisionError::MissingPackageArch)?;
        debug!(subtarget = %self.key, pkg_arch, "Parsed package architecture");

        self.install_repositories(&path, &pkg_arch)?;
        std::fs::copy(&self.build_rules_file, path.join(BUILD_RULES_NAME))?;

        if db.packages().get_default_packages(&self.key).await?.is_none() {
            self.harvest_profiles(db, &path).await?;
        }
        if db.subtargets().outdated(&self.key).await? {
            self.harvest_packages(db, &path).await?;
        }

        db.subtargets().set_supported(&self.key, Supported::Yes).await?;
        info!(subtarget = %self.key, "Imagebuilder provisioned");
        Ok(())
    }

    async fn download_and_extract(
        &self,
        distributions: &Distributions,
        client: &reqwest::Client,
    ) -> Result<PathBuf, ProvisionError> {
        let mut chosen = None;
        for subtarget in [Some(self.key.subtarget.as_str()), None] {
            let name =
                distributions.imagebuilder_name(&self.imagebuilder_release, &self.key.target, subtarget);
            let url = distributions.imagebuilder_download_url(
                &self.imagebuilder_release,
                &self.key.target,
                &self.key.subtarget,
                &name,
            );
            let status = client.head(&url).send().await?.status();
            if status != reqwest::StatusCode::NOT_FOUND {
                chosen = Some((name, url));
                break;
            }
            debug!(url, "Imagebuilder candidate not published");
        }
        let Some((name, url)) = chosen else {
            return Err(ProvisionError::NotPublished(self.key.to_string()));
        };

        info!(subtarget = %self.key, url, "Downloading imagebuilder");
        std::fs::create_dir_all(&self.temp_dir)?;
        let staging = tempfile::tempdir_in(&self.temp_dir)?;
        let tarball_path = staging.path().join("imagebuilder.tar.xz");

        let response = client.get(&url).send().await?.error_for_status()?;
        let mut stream = response.bytes_stream();
        let mut tarball = std::fs::File::create(&tarball_path)?;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            std::io::Write::write_all(&mut tarball, &chunk)?;
        }
        drop(tarball);

        let decoder = xz2::read::XzDecoder::new(std::fs::File::open(&tarball_path)?);
        tar::Archive::new(decoder).unpack(staging.path())?;

        std::fs::create_dir_all(&self.base_dir)?;
        let target = self.base_dir.join(&name);
        std::fs::rename(staging.path().join(&name), &target)?;
        info!(subtarget = %self.key, path = %target.display(), "Imagebuilder extracted");
        Ok(target)
    }

    fn install_repositories(&self, path: &Path, pkg_arch: &str) -> Result<(), ProvisionError> {
        let template = std::fs::read_to_string(&self.repositories_template)?;
        let rendered = template
            .replace("{{ release }}", &self.key.release)
            .replace("{{ target }}", &self.key.target)
            .replace("{{ subtarget }}", &self.key.subtarget)
            .replace("{{ pkg_arch }}", pkg_arch);
        std::fs::write(path.join("repositories.conf"), rendered)?;
        Ok(())
    }

    async fn harvest_profiles(&self, db: &Database, path: &Path) -> Result<(), ProvisionError> {
        let out = subprocess::run(
            "make",
            &["info".to_string()],
            path,
            &[],
            &[],
            self.subprocess_timeout,
        )
        .await?;
        if !out.success {
            warn!(subtarget = %self.key, "make info failed:\n{}", String::from_utf8_lossy(&out.output));
            return Err(ProvisionError::CommandFailed { command: "make info" });
        }

        let text = String::from_utf8_lossy(&out.output);
        let default_packages =
            parse_default_packages(&text).ok_or(ProvisionError::MissingDefaultPackages)?;
        let profiles = parse_profiles(&text);
        db.packages()
            .insert_profiles(&self.key, &default_packages, &profiles)
            .await?;
        Ok(())
    }

    async fn harvest_packages(&self, db: &Database, path: &Path) -> Result<(), ProvisionError> {
        let out = subprocess::run(
            "make",
            &["package_list".to_string()],
            path,
            &[],
            &[],
            self.subprocess_timeout,
        )
        .await?;
        if !out.success {
            warn!(
                subtarget = %self.key,
                "make package_list failed:\n{}",
                String::from_utf8_lossy(&out.output)
            );
            return Err(ProvisionError::CommandFailed {
                command: "make package_list",
            });
        }

        let packages = parse_package_list(&String::from_utf8_lossy(&out.output));
        db.packages()
            .insert_packages_available(&self.key, &packages)
            .await?;
        Ok(())
    }
}

/// Extract `CONFIG_TARGET_ARCH_PACKAGES` from a toolchain `.config`.
pub fn parse_pkg_arch(config: &str) -> Option<String> {
    let re = Regex::new(r#"(?m)^CONFIG_TARGET_ARCH_PACKAGES="(.+)""#).expect("static regex");
    re.captures(config).map(|c| c[1].to_string())
}

/// Extract the default package list from `make info` output.
pub fn parse_default_packages(info: &str) -> Option<Vec<String>> {
    let re = Regex::new(r"(?m)^Default Packages: (.+)$").expect("static regex");
    re.captures(info)
        .map(|c| c[1].split_whitespace().map(str::to_string).collect())
}

/// Extract device profiles from `make info` output.
pub fn parse_profiles(info: &str) -> Vec<Profile> {
    let re = Regex::new(r"(?m)^(\S.*):\n    (.+)\n    Packages: (.*)\n").expect("static regex");
    re.captures_iter(info)
        .map(|c| Profile {
            name: c[1].to_string(),
            model: c[2].to_string(),
            packages: c[3].split_whitespace().map(str::to_string).collect(),
        })
        .collect()
}

/// Extract `(name, version)` pairs from `make package_list` output.
pub fn parse_package_list(listing: &str) -> Vec<(String, String)> {
    let re = Regex::new(r"(?m)^(.+?) - (.+?) - .*$").expect("static regex");
    re.captures_iter(listing)
        .map(|c| (c[1].to_string(), c[2].to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pkg_arch_from_config() {
        let config = "CONFIG_TARGET_BOARD=\"ar71xx\"\nCONFIG_TARGET_ARCH_PACKAGES=\"mips_24kc\"\n";
        assert_eq!(parse_pkg_arch(config).as_deref(), Some("mips_24kc"));
        assert_eq!(parse_pkg_arch("CONFIG_TARGET_BOARD=\"x\"\n"), None);
    }

    const INFO: &str = "Current Target: \"ar71xx (Generic)\"\n\
Current Revision: \"r3560\"\n\
Default Packages: base-files libc busybox uclient-fetch\n\
Available Profiles:\n\
\n\
Default:\n    Default Profile (all drivers)\n    Packages: kmod-usb-core\n\
tl-wdr4300-v1:\n    TP-LINK TL-WDR4300v1\n    Packages: kmod-usb-core kmod-usb2\n\
archer-c7-v2:\n    TP-LINK Archer C7 v2\n    Packages: \n";

    #[test]
    fn default_packages_from_info() {
        assert_eq!(
            parse_default_packages(INFO).unwrap(),
            vec!["base-files", "libc", "busybox", "uclient-fetch"]
        );
    }

    #[test]
    fn profiles_from_info() {
        let profiles = parse_profiles(INFO);
        assert_eq!(profiles.len(), 3);
        assert_eq!(profiles[1].name, "tl-wdr4300-v1");
        assert_eq!(profiles[1].model, "TP-LINK TL-WDR4300v1");
        assert_eq!(profiles[1].packages, vec!["kmod-usb-core", "kmod-usb2"]);
        assert!(profiles[2].packages.is_empty());
    }

    #[test]
    fn package_list_lines() {
        let listing = "luci - git-17.230 - LuCI interface\nnano - 2.7.5-1 - small editor\nmalformed line\n";
        let packages = parse_package_list(listing);
        assert_eq!(
            packages,
            vec![
                ("luci".to_string(), "git-17.230".to_string()),
                ("nano".to_string(), "2.7.5-1".to_string()),
            ]
        );
    }
}
