use affinity_core::config::{AppConfig, ConfigError, LoadOptions};
use affinity_core::errors::DomainError;
use affinity_db::{connect_with_config, migrations, DbPool};
use affinity_engine::AffinityServices;
use thiserror::Error;
use tracing::info;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub services: AffinityServices,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("service wiring failed: {0}")]
    Wiring(#[source] DomainError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(event_name = "affinity.bootstrap.start", "starting application bootstrap");

    let db_pool =
        connect_with_config(&config.database).await.map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "affinity.bootstrap.database_connected",
        max_connections = config.database.max_connections,
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(event_name = "affinity.bootstrap.migrations_applied", "database migrations applied");

    let services =
        AffinityServices::sqlite(db_pool.clone(), &config).map_err(BootstrapError::Wiring)?;
    info!(
        event_name = "affinity.bootstrap.services_ready",
        refresh_cache = config.pipeline.refresh_cache,
        recalculation_enabled = config.recalculation.enabled,
        "affinity services wired"
    );

    Ok(Application { config, db_pool, services })
}
