//! # Orchestration Bootstrap
//!
//! Builds a running [`OrchestrationSystem`] from loaded configuration.
//!
//! - [`SystemBootstrap::in_memory`]: in-process store and barrier, for a single
//!   engine process and for tests
//! - [`SystemBootstrap::postgres`] (feature `postgres`): connects, applies the
//!   schema and uses the PostgreSQL store and barrier so state survives restarts
//!
//! Both modes use the shipped adapters: zip batch source, office-command
//! converter and zip packager, all rooted at `storage.work_dir`.

use std::sync::Arc;

use tracing::info;

use super::context::SystemContext;
use super::orchestration_system::OrchestrationSystem;
use crate::config::{BatchConfig, ConfigManager};
use crate::services::{BatchSource, CommandConverter, Converter, Packager, ZipBatchSource, ZipPackager};

/// The adapters shipped with the crate, configured from `storage`
pub struct DefaultServices {
    pub source: Arc<dyn BatchSource>,
    pub converter: Arc<dyn Converter>,
    pub packager: Arc<dyn Packager>,
}

impl DefaultServices {
    pub fn from_config(config: &BatchConfig) -> Self {
        let storage = &config.storage;
        Self {
            source: Arc::new(ZipBatchSource::from_config(storage)),
            converter: Arc::new(CommandConverter::from_config(storage)),
            packager: Arc::new(ZipPackager::from_config(storage)),
        }
    }
}

pub struct SystemBootstrap;

impl SystemBootstrap {
    /// Start an engine over the in-memory store and barrier
    pub fn in_memory(config_manager: &ConfigManager) -> Arc<OrchestrationSystem> {
        let config = Arc::new(config_manager.config().clone());
        let services = DefaultServices::from_config(&config);

        info!(
            environment = config_manager.environment(),
            work_dir = %config.storage.work_dir.display(),
            "🚀 BOOTSTRAP: Starting in-memory orchestration system"
        );

        let context = SystemContext::in_memory(
            services.source,
            services.converter,
            services.packager,
            config,
        );
        OrchestrationSystem::start(context)
    }

    /// Start an engine over PostgreSQL, applying the schema first
    #[cfg(feature = "postgres")]
    pub async fn postgres(
        config_manager: &ConfigManager,
    ) -> crate::error::Result<Arc<OrchestrationSystem>> {
        use crate::barrier::PgCompletionBarrier;
        use crate::database::{DatabaseConnection, DatabaseMigrations};
        use crate::store::{PgStateStore, StoreError};

        let config = Arc::new(config_manager.config().clone());

        info!(
            environment = config_manager.environment(),
            max_connections = config.database.max_connections,
            "🚀 BOOTSTRAP: Starting PostgreSQL-backed orchestration system"
        );

        let connection = DatabaseConnection::connect(&config.database)
            .await
            .map_err(StoreError::from)?;
        DatabaseMigrations::run_all(connection.pool())
            .await
            .map_err(StoreError::from)?;
        info!("✅ BOOTSTRAP: Database schema ready");

        let pool = connection.pool().clone();
        let services = DefaultServices::from_config(&config);
        let context = SystemContext::new(
            Arc::new(PgStateStore::new(pool.clone())),
            Arc::new(PgCompletionBarrier::new(pool)),
            services.source,
            services.converter,
            services.packager,
            config,
        );
        Ok(OrchestrationSystem::start(context))
    }
}
