//! Configuration management

use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::str::FromStr;
use std::time::Duration;

use crate::parser::ParserPatterns;
use crate::upsert::SOURCE_SYSTEM_MAX_LEN;

// ============================================================================
// Database Configuration Constants
// ============================================================================

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/sacra";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default minimum database connections in the pool.
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 2;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default database idle timeout in seconds (10 minutes).
pub const DEFAULT_DATABASE_IDLE_TIMEOUT_SECS: u64 = 600;

// ============================================================================
// Import Configuration Constants
// ============================================================================

/// Default number of processed rows between progress flushes.
pub const DEFAULT_PROGRESS_EVERY_ROWS: u64 = 25;

/// Default maximum time between progress flushes in milliseconds.
pub const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 1000;

/// Default timeout for a single record write in seconds.
pub const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 30;

/// Default number of rows returned by a preview.
pub const DEFAULT_PREVIEW_LIMIT: usize = 100;

/// Default capacity of the parser-to-writer row channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Default maximum accepted source file size (50 MB).
pub const DEFAULT_MAX_BYTES: u64 = 50 * 1024 * 1024;

/// Default provenance label stored with imported records.
pub const DEFAULT_SOURCE_SYSTEM: &str = "import";

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportConfig {
    pub database: DatabaseConfig,
    pub import: ImportSettings,
}

/// Database configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

/// Import job tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSettings {
    pub progress_every_rows: u64,
    pub progress_interval_ms: u64,
    pub write_timeout_secs: u64,
    pub preview_limit: usize,
    pub channel_capacity: usize,
    pub max_bytes: u64,
    pub source_system: String,
    /// Tables read from SQL dumps
    pub sql_tables: Vec<String>,
    /// See [`ParserPatterns::sql_insert_pattern`]
    pub sql_insert_pattern: String,
}

impl ImportSettings {
    /// Parser tables with the SQL settings applied
    pub fn parser_patterns(&self) -> ParserPatterns {
        ParserPatterns {
            sql_tables: self.sql_tables.clone(),
            sql_insert_pattern: self.sql_insert_pattern.clone(),
            ..ParserPatterns::default()
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

impl ImportConfig {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let parser = ParserPatterns::default();

        let config = ImportConfig {
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
                max_connections: env_or("DATABASE_MAX_CONNECTIONS", DEFAULT_DATABASE_MAX_CONNECTIONS),
                min_connections: env_or("DATABASE_MIN_CONNECTIONS", DEFAULT_DATABASE_MIN_CONNECTIONS),
                connect_timeout_secs: env_or("DATABASE_CONNECT_TIMEOUT", DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS),
                idle_timeout_secs: env_or("DATABASE_IDLE_TIMEOUT", DEFAULT_DATABASE_IDLE_TIMEOUT_SECS),
            },
            import: ImportSettings {
                progress_every_rows: env_or("IMPORT_PROGRESS_EVERY_ROWS", DEFAULT_PROGRESS_EVERY_ROWS),
                progress_interval_ms: env_or("IMPORT_PROGRESS_INTERVAL_MS", DEFAULT_PROGRESS_INTERVAL_MS),
                write_timeout_secs: env_or("IMPORT_WRITE_TIMEOUT_SECS", DEFAULT_WRITE_TIMEOUT_SECS),
                preview_limit: env_or("IMPORT_PREVIEW_LIMIT", DEFAULT_PREVIEW_LIMIT),
                channel_capacity: env_or("IMPORT_CHANNEL_CAPACITY", DEFAULT_CHANNEL_CAPACITY),
                max_bytes: env_or("IMPORT_MAX_BYTES", DEFAULT_MAX_BYTES),
                source_system: std::env::var("IMPORT_SOURCE_SYSTEM")
                    .unwrap_or_else(|_| DEFAULT_SOURCE_SYSTEM.to_string()),
                sql_tables: std::env::var("IMPORT_SQL_TABLES")
                    .map(|tables| split_list(&tables))
                    .unwrap_or(parser.sql_tables),
                sql_insert_pattern: std::env::var("IMPORT_SQL_INSERT_PATTERN").unwrap_or(parser.sql_insert_pattern),
            },
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }

        if self.database.min_connections > self.database.max_connections {
            anyhow::bail!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                self.database.min_connections,
                self.database.max_connections
            );
        }

        if self.import.progress_every_rows == 0 && self.import.progress_interval_ms == 0 {
            anyhow::bail!("At least one of IMPORT_PROGRESS_EVERY_ROWS and IMPORT_PROGRESS_INTERVAL_MS must be set");
        }

        if self.import.write_timeout_secs == 0 {
            anyhow::bail!("IMPORT_WRITE_TIMEOUT_SECS must be greater than 0");
        }

        if self.import.channel_capacity == 0 {
            anyhow::bail!("IMPORT_CHANNEL_CAPACITY must be greater than 0");
        }

        if self.import.source_system.trim().is_empty() {
            anyhow::bail!("IMPORT_SOURCE_SYSTEM cannot be empty");
        }
        if self.import.source_system.chars().count() > SOURCE_SYSTEM_MAX_LEN {
            anyhow::bail!("IMPORT_SOURCE_SYSTEM must be at most {} characters", SOURCE_SYSTEM_MAX_LEN);
        }

        if self.import.sql_tables.is_empty() {
            anyhow::bail!("IMPORT_SQL_TABLES must name at least one table");
        }
        self.import.parser_patterns().sql_insert_regex()?;

        if self.import.preview_limit == 0 {
            tracing::warn!("IMPORT_PREVIEW_LIMIT is 0 - previews will return no rows");
        }

        Ok(())
    }

    /// Open the shared connection pool
    pub async fn connect(&self) -> anyhow::Result<PgPool> {
        let pool = PgPoolOptions::new()
            .max_connections(self.database.max_connections)
            .min_connections(self.database.min_connections)
            .acquire_timeout(Duration::from_secs(self.database.connect_timeout_secs))
            .idle_timeout(Duration::from_secs(self.database.idle_timeout_secs))
            .connect(&self.database.url)
            .await?;

        tracing::info!(max_connections = self.database.max_connections, "Database pool ready");
        Ok(pool)
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

impl Default for ImportConfig {
    fn default() -> Self {
        let parser = ParserPatterns::default();
        Self {
            database: DatabaseConfig {
                url: DEFAULT_DATABASE_URL.to_string(),
                max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
                min_connections: DEFAULT_DATABASE_MIN_CONNECTIONS,
                connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                idle_timeout_secs: DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
            },
            import: ImportSettings {
                progress_every_rows: DEFAULT_PROGRESS_EVERY_ROWS,
                progress_interval_ms: DEFAULT_PROGRESS_INTERVAL_MS,
                write_timeout_secs: DEFAULT_WRITE_TIMEOUT_SECS,
                preview_limit: DEFAULT_PREVIEW_LIMIT,
                channel_capacity: DEFAULT_CHANNEL_CAPACITY,
                max_bytes: DEFAULT_MAX_BYTES,
                source_system: DEFAULT_SOURCE_SYSTEM.to_string(),
                sql_tables: parser.sql_tables,
                sql_insert_pattern: parser.sql_insert_pattern,
            },
        }
    }
}
