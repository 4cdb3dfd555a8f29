//! Import job lifecycle
//!
//! A job is created `pending` before any row is read, moves to `running`
//! when processing starts and ends in `done` or `error`. The
//! [`ImportController`] drives one job through the parsers, the mapper and
//! the upsert engine while a [`ProgressReporter`] persists counters at a
//! bounded cadence.

pub mod controller;
pub mod progress;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::ImportResult;
use crate::models::{ImportFile, ImportJob, JobCounters, JobStatus, NewImportJob};

pub use controller::{
    CanonicalPreviewRow, ControllerSettings, CreateJobRequest, ImportController, ImportPreview, RunningJob,
};
pub use progress::{FlushPolicy, ProgressReporter, ProgressSink, RecordingSink};

/// Persistence for import jobs and their source files
///
/// `transition` must enforce the monotonic status order: it only succeeds
/// when the job is currently in the single predecessor state of `to`.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, job: NewImportJob) -> ImportResult<ImportJob>;

    async fn register_file(&self, file: ImportFile) -> ImportResult<()>;

    async fn file_for_job(&self, job_id: Uuid) -> ImportResult<Option<ImportFile>>;

    /// Move a job to `to`, writing the counters and error text with it
    async fn transition(
        &self,
        job_id: Uuid,
        to: JobStatus,
        counters: JobCounters,
        error_text: Option<String>,
    ) -> ImportResult<ImportJob>;

    /// Persist live counters of a running job
    async fn save_progress(&self, job_id: Uuid, counters: JobCounters) -> ImportResult<()>;

    async fn get_job(&self, job_id: Uuid) -> ImportResult<Option<ImportJob>>;

    /// Jobs of one tenant, newest first
    async fn list_recent(&self, church_id: i64, limit: i64) -> ImportResult<Vec<ImportJob>>;
}
