//! Service wiring - one store, one scheduler, one metrics engine
//!
//! The daemon, the HTTP API and the CLI subcommands all work through a
//! [`RepairService`] built from the loaded [`Config`].

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

use crate::audit::AuditLog;
use crate::config::{Config, StoreBackend};
use crate::error::StoreError;
use crate::metrics::MetricsEngine;
use crate::scheduler::RepairScheduler;
use crate::store::{MemoryStore, SqliteStore, StoreAdapter};

pub struct RepairService {
    config: Config,
    store: Arc<dyn StoreAdapter>,
    scheduler: Arc<RepairScheduler>,
    metrics: MetricsEngine,
}

impl RepairService {
    pub fn new(store: Arc<dyn StoreAdapter>, config: Config) -> Self {
        let scheduler = Arc::new(RepairScheduler::from_config(store.clone(), &config));
        let metrics = MetricsEngine::new(store.clone());
        Self {
            config,
            store,
            scheduler,
            metrics,
        }
    }

    /// Open the configured backend and wire everything to it
    pub fn open(config: Config) -> Result<Self, StoreError> {
        let store: Arc<dyn StoreAdapter> = match config.store.backend {
            StoreBackend::Memory => {
                info!("Using in-memory store");
                Arc::new(MemoryStore::new())
            }
            StoreBackend::Sqlite => Arc::new(SqliteStore::open(&config.store.path)?),
        };
        Ok(Self::new(store, config))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn StoreAdapter> {
        &self.store
    }

    pub fn scheduler(&self) -> &Arc<RepairScheduler> {
        &self.scheduler
    }

    pub fn metrics(&self) -> &MetricsEngine {
        &self.metrics
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        self.scheduler.engine().audit()
    }

    /// Start the interval loop in the background
    pub fn spawn_scheduler(&self) -> JoinHandle<()> {
        let scheduler = self.scheduler.clone();
        tokio::spawn(async move { scheduler.run().await })
    }

    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }
}
