//! Sacra Import Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Import and deduplication engine for sacramental register records.
//!
//! # Overview
//!
//! Parish registers arrive as CSV, JSON, XML or SQL dump exports. This crate
//! turns them into canonical baptism, marriage and funeral records:
//!
//! - **Parsers**: streaming readers that yield one raw record (or one row
//!   error) at a time
//! - **Mapping**: a declarative source-column → canonical-field mapping with
//!   text and date normalization
//! - **Fingerprint**: a SHA-256 digest over each record type's identity fields
//! - **Upsert**: idempotent insert-or-update keyed by tenant and fingerprint
//! - **Jobs**: a `pending → running → done | error` lifecycle with throttled
//!   progress counters
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use sacra_import::{
//!     config::ImportConfig, CreateJobRequest, ControllerSettings, FieldMapping, ImportController,
//!     ImportOptions, PgJobStore, PgRecordStore, RecordType,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ImportConfig::load()?;
//!     let pool = Arc::new(config.connect().await?);
//!     let controller = ImportController::new(
//!         Arc::new(PgJobStore::new(pool.clone())),
//!         Arc::new(PgRecordStore::new(pool)),
//!         ControllerSettings::from(&config),
//!     );
//!
//!     let job = controller
//!         .create_job(CreateJobRequest::new(45, RecordType::Baptisms, "register.csv"))
//!         .await?;
//!     let mapping = FieldMapping::from_path("mapping.yaml").await?;
//!     let job = controller
//!         .run_job(job.id, &mapping, ImportOptions::default(), CancellationToken::new())
//!         .await?;
//!     tracing::info!(status = %job.status, "Import finished");
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod fingerprint;
pub mod jobs;
pub mod mapping;
pub mod models;
pub mod parser;
pub mod records;
pub mod store;
pub mod upsert;

// Re-export commonly used types
pub use error::{ErrorClass, ImportError, ImportResult, ParseError, ParseErrorKind};
pub use jobs::{
    ControllerSettings, CreateJobRequest, FlushPolicy, ImportController, ImportPreview, JobStore, ProgressSink,
    RunningJob,
};
pub use mapping::{DateConfig, FieldMapper, FieldMapping, SuggestionRules};
pub use models::{ImportFormat, ImportJob, ImportOptions, JobCounters, JobStatus, RecordType, RowOutcome};
pub use parser::{ParserPatterns, RawRecord, RecordSource};
pub use records::CanonicalRecord;
pub use store::{MemoryJobStore, MemoryRecordStore, PgJobStore, PgRecordStore};
pub use upsert::{FingerprintedRecord, RecordStore, UpsertEngine};
