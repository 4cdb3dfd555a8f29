//! In-memory stores
//!
//! Used by tests and dry experiments. The record store enforces the same
//! column widths as the database schema so oversized values fail the same
//! way, and both stores can be switched to "unavailable" to exercise the
//! fatal path.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use uuid::Uuid;

use crate::error::{ImportError, ImportResult};
use crate::jobs::{JobStore, ProgressSink};
use crate::models::{ImportFile, ImportJob, JobCounters, JobStatus, NewImportJob, RecordType};
use crate::upsert::{FingerprintedRecord, RecordKey, RecordStore, WriteOutcome};

/// A stored canonical row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub id: i64,
    pub record: FingerprintedRecord,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub write_count: u32,
}

fn unavailable() -> ImportError {
    ImportError::FatalIo("store unavailable".to_string())
}

#[derive(Debug)]
pub struct MemoryRecordStore {
    rows: Mutex<HashMap<RecordKey, StoredRecord>>,
    next_id: AtomicI64,
    available: AtomicBool,
    write_delay: Mutex<Duration>,
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            available: AtomicBool::new(true),
            write_delay: Mutex::new(Duration::ZERO),
        }
    }
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Delay every write, for timeout tests
    pub fn set_write_delay(&self, delay: Duration) {
        *self.write_delay.lock().unwrap_or_else(PoisonError::into_inner) = delay;
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: &RecordKey) -> Option<StoredRecord> {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner).get(key).cloned()
    }

    /// Rows of one tenant and type, in insertion order
    pub fn records(&self, church_id: i64, record_type: RecordType) -> Vec<StoredRecord> {
        let rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        let mut found: Vec<StoredRecord> = rows
            .values()
            .filter(|r| r.record.church_id == church_id && r.record.record.record_type() == record_type)
            .cloned()
            .collect();
        found.sort_by_key(|r| r.id);
        found
    }

    fn check_available(&self) -> ImportResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(unavailable())
        }
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn upsert(&self, record: &FingerprintedRecord) -> ImportResult<WriteOutcome> {
        let delay = *self.write_delay.lock().unwrap_or_else(PoisonError::into_inner);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.check_available()?;

        if let Some((field, len, max)) = record.oversized_fields().into_iter().next() {
            return Err(ImportError::Constraint(format!(
                "value too long for column {} ({} > {})",
                field, len, max
            )));
        }

        let now = Utc::now();
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        match rows.get_mut(&record.key()) {
            Some(existing) => {
                existing.record = record.clone();
                existing.updated_at = now;
                existing.write_count += 1;
                Ok(WriteOutcome::Updated)
            },
            None => {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                rows.insert(
                    record.key(),
                    StoredRecord {
                        id,
                        record: record.clone(),
                        created_at: now,
                        updated_at: now,
                        write_count: 1,
                    },
                );
                Ok(WriteOutcome::Inserted)
            },
        }
    }

    async fn exists(&self, key: &RecordKey) -> ImportResult<bool> {
        self.check_available()?;
        Ok(self.rows.lock().unwrap_or_else(PoisonError::into_inner).contains_key(key))
    }
}

#[derive(Debug)]
pub struct MemoryJobStore {
    jobs: Mutex<Vec<ImportJob>>,
    files: Mutex<HashMap<Uuid, ImportFile>>,
    available: AtomicBool,
    progress_writes: AtomicU64,
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self {
            jobs: Mutex::new(Vec::new()),
            files: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            progress_writes: AtomicU64::new(0),
        }
    }
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of live progress writes received
    pub fn progress_writes(&self) -> u64 {
        self.progress_writes.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> ImportResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(unavailable())
        }
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_job(&self, job: NewImportJob) -> ImportResult<ImportJob> {
        self.check_available()?;
        let now = Utc::now();
        let job = ImportJob {
            id: Uuid::new_v4(),
            church_id: job.church_id,
            record_type: job.record_type,
            format: job.format,
            filename: job.filename,
            size_bytes: job.size_bytes,
            status: JobStatus::Pending,
            counters: JobCounters::default(),
            started_at: None,
            finished_at: None,
            error_text: None,
            created_by: job.created_by,
            created_at: now,
            updated_at: now,
        };
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner).push(job.clone());
        Ok(job)
    }

    async fn register_file(&self, file: ImportFile) -> ImportResult<()> {
        self.check_available()?;
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(file.job_id, file);
        Ok(())
    }

    async fn file_for_job(&self, job_id: Uuid) -> ImportResult<Option<ImportFile>> {
        self.check_available()?;
        Ok(self.files.lock().unwrap_or_else(PoisonError::into_inner).get(&job_id).cloned())
    }

    async fn transition(
        &self,
        job_id: Uuid,
        to: JobStatus,
        counters: JobCounters,
        error_text: Option<String>,
    ) -> ImportResult<ImportJob> {
        self.check_available()?;
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        let job = jobs
            .iter_mut()
            .find(|j| j.id == job_id)
            .ok_or(ImportError::JobNotFound(job_id))?;
        if !job.status.can_transition_to(to) {
            return Err(ImportError::InvalidTransition { from: job.status, to });
        }

        let now = Utc::now();
        job.status = to;
        job.counters = counters;
        job.updated_at = now;
        if to == JobStatus::Running {
            job.started_at = Some(now);
        } else if to.is_terminal() {
            job.finished_at = Some(now);
        }
        if error_text.is_some() {
            job.error_text = error_text;
        }
        Ok(job.clone())
    }

    async fn save_progress(&self, job_id: Uuid, counters: JobCounters) -> ImportResult<()> {
        self.check_available()?;
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(job) = jobs.iter_mut().find(|j| j.id == job_id && j.status == JobStatus::Running) {
            job.counters = counters;
            job.updated_at = Utc::now();
            self.progress_writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> ImportResult<Option<ImportJob>> {
        self.check_available()?;
        let jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(jobs.iter().find(|j| j.id == job_id).cloned())
    }

    async fn list_recent(&self, church_id: i64, limit: i64) -> ImportResult<Vec<ImportJob>> {
        self.check_available()?;
        let jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(jobs
            .iter()
            .rev()
            .filter(|j| j.church_id == church_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ProgressSink for MemoryJobStore {
    async fn flush(&self, job_id: Uuid, counters: JobCounters) -> ImportResult<()> {
        self.save_progress(job_id, counters).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::models::ImportFormat;
    use crate::records::{CanonicalRecord, FieldValue};
    use crate::upsert::UpsertEngine;
    use std::sync::Arc;

    fn new_job(church_id: i64) -> NewImportJob {
        NewImportJob {
            church_id,
            record_type: RecordType::Baptisms,
            format: ImportFormat::Csv,
            filename: "parish.csv".to_string(),
            size_bytes: 120,
            created_by: Some(7),
        }
    }

    #[tokio::test]
    async fn test_job_transitions_are_monotonic() {
        let store = MemoryJobStore::new();
        let job = store.create_job(new_job(45)).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);

        let err = store
            .transition(job.id, JobStatus::Done, JobCounters::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ImportError::InvalidTransition {
                from: JobStatus::Pending,
                to: JobStatus::Done
            }
        ));

        let running = store
            .transition(job.id, JobStatus::Running, JobCounters::default(), None)
            .await
            .unwrap();
        assert!(running.started_at.is_some());

        let done = store
            .transition(job.id, JobStatus::Done, JobCounters::default(), None)
            .await
            .unwrap();
        assert!(done.finished_at.is_some());

        assert!(store
            .transition(job.id, JobStatus::Running, JobCounters::default(), None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_progress_only_for_running_jobs() {
        let store = MemoryJobStore::new();
        let job = store.create_job(new_job(45)).await.unwrap();
        let counters = JobCounters {
            total_rows: 3,
            processed_rows: 3,
            inserted_rows: 3,
            ..JobCounters::default()
        };

        store.save_progress(job.id, counters).await.unwrap();
        assert_eq!(store.progress_writes(), 0);

        store
            .transition(job.id, JobStatus::Running, JobCounters::default(), None)
            .await
            .unwrap();
        store.save_progress(job.id, counters).await.unwrap();
        assert_eq!(store.get_job(job.id).await.unwrap().unwrap().counters, counters);
    }

    #[tokio::test]
    async fn test_list_recent_is_newest_first_per_tenant() {
        let store = MemoryJobStore::new();
        let a = store.create_job(new_job(45)).await.unwrap();
        store.create_job(new_job(99)).await.unwrap();
        let b = store.create_job(new_job(45)).await.unwrap();

        let recent = store.list_recent(45, 10).await.unwrap();
        assert_eq!(recent.iter().map(|j| j.id).collect::<Vec<_>>(), vec![b.id, a.id]);
        assert_eq!(store.list_recent(45, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_long_source_system_is_rejected_like_postgres() {
        let store = MemoryRecordStore::new();
        let mut record = CanonicalRecord::new(RecordType::Baptisms);
        record.assign("person_first", FieldValue::Text("Helen Russo".into()));

        let fits = FingerprintedRecord::new(45, &"s".repeat(64), record.clone()).unwrap();
        assert_eq!(store.upsert(&fits).await.unwrap(), WriteOutcome::Inserted);

        let too_long = FingerprintedRecord::new(46, &"s".repeat(65), record).unwrap();
        let err = store.upsert(&too_long).await.unwrap_err();
        assert!(matches!(err, ImportError::Constraint(ref m) if m.contains("source_system")));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_write_times_out_as_fatal() {
        let store = Arc::new(MemoryRecordStore::new());
        store.set_write_delay(Duration::from_secs(60));
        let engine = UpsertEngine::new(store.clone(), Duration::from_secs(1));

        let mut record = CanonicalRecord::new(RecordType::Baptisms);
        record.assign("person_first", FieldValue::Text("Helen Russo".into()));
        let err = engine.apply(45, "import", record).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(store.is_empty());
    }
}
