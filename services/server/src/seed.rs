//! Release manifest ingestion.
//!
//! Subtargets exist in the store from the moment a release manifest names
//! them; the provisioner and workers only ever mutate rows created here.
//! The operator's distribution catalogue is the manifest source: every
//! `(target, [subtargets])` entry of a distro's latest release is ingested
//! at server startup and flagged supported.

use imageforge_distro::Distributions;
use imageforge_store::{Database, StoreError, SubtargetKey, Supported};
use tracing::info;

/// Ingest all catalogue-declared subtargets. Idempotent.
pub async fn seed_subtargets(
    db: &Database,
    distributions: &Distributions,
) -> Result<(), StoreError> {
    let subtargets = db.subtargets();

    for (distro, distribution) in &distributions.distros {
        for (target, names) in &distribution.targets {
            subtargets
                .insert_subtargets(distro, &distribution.latest, target, names)
                .await?;
            for name in names {
                let key = SubtargetKey::new(distro, &distribution.latest, target, name);
                subtargets.set_supported(&key, Supported::Yes).await?;
            }
            info!(
                distro,
                release = %distribution.latest,
                target,
                count = names.len(),
                "Ingested subtargets"
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn seeding_is_idempotent_and_marks_supported() {
        let db = Database::connect_in_memory().await.unwrap();
        let distributions = Distributions::from_toml(
            r#"
default = "lede"
imagebuilder_prefix = "lede"
imagebuilder_url = "https://example.org"

[distros.lede]
latest = "17.01.4"

[distros.lede.targets]
ar71xx = ["generic"]
"#,
        )
        .unwrap();

        seed_subtargets(&db, &distributions).await.unwrap();
        seed_subtargets(&db, &distributions).await.unwrap();

        let key = SubtargetKey::new("lede", "17.01.4", "ar71xx", "generic");
        let row = db.subtargets().get(&key).await.unwrap().unwrap();
        assert_eq!(row.supported, Supported::Yes);
        assert_eq!(db.subtargets().releases("lede").await.unwrap(), vec!["17.01.4"]);
    }
}
