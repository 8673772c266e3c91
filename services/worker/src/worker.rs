//! The worker main loop.
//!
//! A worker registers itself with its usign public key, then cycles:
//! claim a build job across its skills and run it; otherwise try to take
//! on a new imagebuilder skill, heartbeat, and sleep. All coordination
//! with other workers and the intake server goes through the store.

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use imageforge_distro::Distributions;
use imageforge_signing::Keypair;
use imageforge_store::{Database, DbConfig, SubtargetKey};

use crate::build::Builder;
use crate::config::Config;
use crate::provisioner::Provisioner;

/// A registered worker and its accumulated skills.
pub struct Worker {
    db: Database,
    config: Config,
    distributions: Distributions,
    keypair: Keypair,
    client: reqwest::Client,
    worker_id: i64,
    skills: Vec<SubtargetKey>,
}

impl Worker {
    /// Open the store, set up signing keys, and register.
    pub async fn register(config: Config, distributions: Distributions) -> Result<Self> {
        let db = Database::connect(&DbConfig {
            database_url: config.database_url.clone(),
            ..Default::default()
        })
        .await?;

        let keypair = if config.key_file.exists() {
            Keypair::load(&config.key_file).context("loading worker key")?
        } else {
            let keypair = Keypair::generate();
            keypair.save(&config.key_file).context("saving worker key")?;
            info!(key_file = %config.key_file.display(), "Generated worker keypair");
            keypair
        };

        let worker_id = db
            .workers()
            .register(
                &config.worker_name,
                &config.worker_address,
                &keypair.public_key(),
            )
            .await?;

        Ok(Self {
            db,
            config,
            distributions,
            keypair,
            client: reqwest::Client::new(),
            worker_id,
            skills: Vec::new(),
        })
    }

    /// The registered worker id.
    pub fn worker_id(&self) -> i64 {
        self.worker_id
    }

    /// Run until shutdown is signaled, then deregister.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            worker_id = self.worker_id,
            name = %self.config.worker_name,
            "Entering work loop"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.db.requests().claim_next_build_job(&self.skills).await {
                Ok(Some(job)) => {
                    let builder = Builder {
                        db: &self.db,
                        config: &self.config,
                        distributions: &self.distributions,
                        keypair: &self.keypair,
                        client: &self.client,
                        worker_id: self.worker_id,
                    };
                    if let Err(e) = builder.build(&job).await {
                        error!(
                            error = %e,
                            request_hash = %job.request_hash,
                            "Build attempt failed"
                        );
                    }
                    continue;
                }
                Ok(None) => {}
                Err(e) => error!(error = %e, "Job claim failed"),
            }

            if self.config.max_skills == 0 || self.skills.len() < self.config.max_skills {
                if let Err(e) = self.add_imagebuilder().await {
                    warn!(error = %e, "Provisioning attempt failed");
                }
            }

            if let Err(e) = self.db.workers().heartbeat(self.worker_id).await {
                warn!(error = %e, "Heartbeat failed");
            }

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(self.config.heartbeat_interval_secs)) => {}
                _ = shutdown.changed() => {}
            }
        }

        info!(worker_id = self.worker_id, "Shutting down, deregistering");
        self.db.workers().destroy(self.worker_id).await?;
        Ok(())
    }

    /// Take on one new imagebuilder skill if any subtarget needs a worker.
    async fn add_imagebuilder(&mut self) -> Result<()> {
        let Some(needed) = self
            .db
            .imagebuilders()
            .worker_needed(self.config.worker_stale_secs)
            .await?
        else {
            return Ok(());
        };
        if self.skills.contains(&needed) {
            debug!(subtarget = %needed, "Already holding the needed skill");
            return Ok(());
        }

        // Prefer the oldest claimable request; subtargets that only lost
        // their workers have no queue row and are provisioned directly.
        let key = match self.db.imagebuilders().claim_next().await? {
            Some(key) => key,
            None => needed,
        };
        if self.skills.contains(&key) {
            return Ok(());
        }

        info!(subtarget = %key, worker_id = self.worker_id, "Provisioning imagebuilder");
        let provisioner = Provisioner::new(&self.config, &self.distributions, key.clone());
        match provisioner.run(&self.db, &self.distributions, &self.client).await {
            Ok(()) => {
                self.db
                    .workers()
                    .register_skill(self.worker_id, &key, "ready")
                    .await?;
                self.skills.push(key);
            }
            Err(e) => {
                error!(subtarget = %key, error = %e, "Provisioning failed");
                // Back to `requested` so another worker may retry.
                self.db.imagebuilders().release(&key).await?;
            }
        }
        Ok(())
    }
}
