//! Distribution catalogue.
//!
//! The service builds images for a family of distributions that all share
//! one imagebuilder toolchain lineage: the primary distribution publishes
//! the toolchain tarballs, and derived distributions build with a pinned
//! release of that toolchain while keeping their own release numbering.
//!
//! The catalogue is a TOML file loaded once at startup:
//!
//! ```toml
//! default = "lede"
//! imagebuilder_prefix = "lede"
//! imagebuilder_url = "https://downloads.example.org/releases"
//!
//! [distros.lede]
//! latest = "17.01.4"
//!
//! [distros.lede.targets]
//! ar71xx = ["generic"]
//!
//! [distros.libremesh]
//! latest = "17.06"
//! imagebuilder_release = "17.01.4"
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Errors from catalogue loading.
#[derive(Debug, Error)]
pub enum DistroError {
    #[error("failed to read distributions file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse distributions file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("default distribution '{0}' is not defined")]
    MissingDefault(String),
}

/// One distribution's entry.
#[derive(Debug, Clone, Deserialize)]
pub struct Distribution {
    /// Latest release, substituted when a request omits the version.
    pub latest: String,

    /// Release of the primary distribution's imagebuilder this distro
    /// builds with. Unset means the requested release is used directly.
    #[serde(default)]
    pub imagebuilder_release: Option<String>,

    /// Seeded subtargets per target, ingested at server startup.
    #[serde(default)]
    pub targets: BTreeMap<String, Vec<String>>,
}

/// The loaded distribution catalogue.
#[derive(Debug, Clone, Deserialize)]
pub struct Distributions {
    /// Canonical distribution assumed when a request names none.
    pub default: String,

    /// Filename prefix of published imagebuilder tarballs.
    pub imagebuilder_prefix: String,

    /// Base URL the imagebuilder tarballs are downloaded from.
    pub imagebuilder_url: String,

    /// All known distributions by name.
    pub distros: BTreeMap<String, Distribution>,
}

impl Distributions {
    /// Load the catalogue from a TOML file.
    pub fn load(path: &Path) -> Result<Self, DistroError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parse the catalogue from TOML text.
    pub fn from_toml(contents: &str) -> Result<Self, DistroError> {
        let parsed: Self = toml::from_str(contents)?;
        if !parsed.distros.contains_key(&parsed.default) {
            return Err(DistroError::MissingDefault(parsed.default));
        }
        Ok(parsed)
    }

    /// Look up a distribution by name.
    pub fn get(&self, name: &str) -> Option<&Distribution> {
        self.distros.get(name)
    }

    /// All known distribution names.
    pub fn names(&self) -> Vec<&str> {
        self.distros.keys().map(String::as_str).collect()
    }

    /// The release of the primary toolchain used to build `distro` at
    /// `release`.
    pub fn imagebuilder_release<'a>(&'a self, distro: &str, release: &'a str) -> &'a str {
        self.get(distro)
            .and_then(|d| d.imagebuilder_release.as_deref())
            .unwrap_or(release)
    }

    /// Published tarball name of an imagebuilder.
    ///
    /// Some publishers elide the subtarget from the name; callers try the
    /// fully-qualified form first and fall back to `subtarget: None`.
    pub fn imagebuilder_name(
        &self,
        release: &str,
        target: &str,
        subtarget: Option<&str>,
    ) -> String {
        let mut parts = vec![
            self.imagebuilder_prefix.as_str(),
            "imagebuilder",
            release,
            target,
        ];
        if let Some(subtarget) = subtarget {
            parts.push(subtarget);
        }
        format!("{}.Linux-x86_64", parts.join("-"))
    }

    /// Download URL of an imagebuilder tarball.
    pub fn imagebuilder_download_url(
        &self,
        release: &str,
        target: &str,
        subtarget: &str,
        name: &str,
    ) -> String {
        format!(
            "{}/{release}/targets/{target}/{subtarget}/{name}.tar.xz",
            self.imagebuilder_url.trim_end_matches('/')
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
default = "lede"
imagebuilder_prefix = "lede"
imagebuilder_url = "https://downloads.example.org/releases/"

[distros.lede]
latest = "17.01.4"

[distros.lede.targets]
ar71xx = ["generic", "nand"]

[distros.libremesh]
latest = "17.06"
imagebuilder_release = "17.01.4"
"#;

    #[test]
    fn parses_catalogue() {
        let dists = Distributions::from_toml(SAMPLE).unwrap();
        assert_eq!(dists.default, "lede");
        assert_eq!(dists.get("lede").unwrap().latest, "17.01.4");
        assert_eq!(dists.names(), vec!["lede", "libremesh"]);
        assert_eq!(
            dists.get("lede").unwrap().targets["ar71xx"],
            vec!["generic", "nand"]
        );
    }

    #[test]
    fn rejects_undefined_default() {
        let err = Distributions::from_toml(
            r#"
default = "ghost"
imagebuilder_prefix = "lede"
imagebuilder_url = "https://example.org"
[distros.lede]
latest = "17.01.4"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, DistroError::MissingDefault(_)));
    }

    #[test]
    fn derived_distros_pin_the_imagebuilder_release() {
        let dists = Distributions::from_toml(SAMPLE).unwrap();
        assert_eq!(dists.imagebuilder_release("lede", "17.01.4"), "17.01.4");
        assert_eq!(dists.imagebuilder_release("libremesh", "17.06"), "17.01.4");
    }

    #[test]
    fn imagebuilder_naming_and_url() {
        let dists = Distributions::from_toml(SAMPLE).unwrap();
        let name = dists.imagebuilder_name("17.01.4", "ar71xx", Some("generic"));
        assert_eq!(name, "lede-imagebuilder-17.01.4-ar71xx-generic.Linux-x86_64");

        let elided = dists.imagebuilder_name("17.01.4", "ar71xx", None);
        assert_eq!(elided, "lede-imagebuilder-17.01.4-ar71xx.Linux-x86_64");

        assert_eq!(
            dists.imagebuilder_download_url("17.01.4", "ar71xx", "generic", &name),
            "https://downloads.example.org/releases/17.01.4/targets/ar71xx/generic/lede-imagebuilder-17.01.4-ar71xx-generic.Linux-x86_64.tar.xz"
        );
    }
}
