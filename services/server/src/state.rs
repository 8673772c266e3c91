//! Application state shared across request handlers.

use std::sync::Arc;

use imageforge_distro::Distributions;
use imageforge_store::Database;

use crate::config::Config;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    db: Database,
    config: Config,
    distributions: Distributions,
}

impl AppState {
    /// Create a new application state.
    pub fn new(db: Database, config: Config, distributions: Distributions) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                db,
                config,
                distributions,
            }),
        }
    }

    /// Get a reference to the database.
    pub fn db(&self) -> &Database {
        &self.inner.db
    }

    /// Get a reference to the server configuration.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Get a reference to the distribution catalogue.
    pub fn distributions(&self) -> &Distributions {
        &self.inner.distributions
    }
}
