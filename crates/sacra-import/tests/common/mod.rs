//! Shared helpers for the import engine integration tests
//!
//! In-memory fixtures need nothing external. [`TestPostgres`] starts a
//! PostgreSQL container with the workspace migrations applied and needs
//! Docker.
#![allow(dead_code)]

use anyhow::{Context, Result};
use sacra_import::{ControllerSettings, ImportController, MemoryJobStore, MemoryRecordStore};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use testcontainers::{core::IntoContainerPort, runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tracing::{debug, info};

/// Initialize tracing for tests
pub fn init_tracing() {
    sacra_common::logging::init_test_logging();
}

/// Write `body` to a temporary file whose name ends in `suffix`
pub fn fixture(suffix: &str, body: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .prefix("register-")
        .suffix(suffix)
        .tempfile()
        .expect("Failed to create fixture file");
    file.write_all(body.as_bytes()).expect("Failed to write fixture");
    file.flush().expect("Failed to flush fixture");
    file
}

/// Controller over fresh in-memory stores
pub struct MemoryHarness {
    pub controller: ImportController,
    pub jobs: Arc<MemoryJobStore>,
    pub records: Arc<MemoryRecordStore>,
}

impl MemoryHarness {
    pub fn new() -> Self {
        Self::with_settings(ControllerSettings::default())
    }

    pub fn with_settings(settings: ControllerSettings) -> Self {
        let jobs = Arc::new(MemoryJobStore::new());
        let records = Arc::new(MemoryRecordStore::new());
        let controller = ImportController::new(jobs.clone(), records.clone(), settings);
        Self {
            controller,
            jobs,
            records,
        }
    }
}

// ============================================================================
// PostgreSQL Test Container
// ============================================================================

/// PostgreSQL test container with migrations applied
pub struct TestPostgres {
    _container: ContainerAsync<Postgres>,
    pool: PgPool,
}

impl TestPostgres {
    pub async fn start() -> Result<Self> {
        info!("Starting PostgreSQL test container...");

        let container = Postgres::default()
            .with_tag("16-alpine")
            .start()
            .await
            .context("Failed to start PostgreSQL container")?;

        let host = container.get_host().await.context("Failed to get container host")?;
        let port = container
            .get_host_port_ipv4(5432.tcp())
            .await
            .context("Failed to get container port")?;

        let connection_string = format!("postgresql://postgres:postgres@{}:{}/postgres", host, port);
        debug!("PostgreSQL connection: {}", connection_string);

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&connection_string)
            .await
            .context("Failed to connect to PostgreSQL")?;

        sqlx::migrate!("../../migrations")
            .run(&pool)
            .await
            .context("Failed to run migrations")?;
        info!("Migrations completed successfully");

        Ok(Self {
            _container: container,
            pool,
        })
    }

    pub fn pool(&self) -> Arc<PgPool> {
        Arc::new(self.pool.clone())
    }
}
