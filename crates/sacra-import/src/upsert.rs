//! Idempotent record upsert
//!
//! Records are keyed by `(church_id, record type, source_hash)`. Writing a
//! record whose key already exists overwrites the stored row's non-key
//! fields; nothing is ever deleted. Each write is its own unit, bounded by
//! the configured write timeout.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ErrorClass, ImportError, ImportResult};
use crate::fingerprint::fingerprint;
use crate::models::{RecordType, RowOutcome};
use crate::records::CanonicalRecord;

/// Width of the `source_system` column
pub const SOURCE_SYSTEM_MAX_LEN: usize = 64;

/// Unique key of a stored record
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    pub church_id: i64,
    pub record_type: RecordType,
    pub source_hash: String,
}

/// A canonical record with its provenance and fingerprint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintedRecord {
    pub church_id: i64,
    pub source_system: String,
    pub source_hash: String,
    pub record: CanonicalRecord,
}

impl FingerprintedRecord {
    /// Fingerprint `record`; fails validation when it has no identity fields
    pub fn new(church_id: i64, source_system: &str, record: CanonicalRecord) -> ImportResult<Self> {
        let source_hash = fingerprint(&record).ok_or_else(|| {
            ImportError::Validation(format!("{} record has no identity fields", record.record_type()))
        })?;
        Ok(Self {
            church_id,
            source_system: source_system.to_string(),
            source_hash,
            record,
        })
    }

    /// Columns whose value exceeds the store width: `(column, length, max)`
    pub fn oversized_fields(&self) -> Vec<(&'static str, usize, usize)> {
        let mut oversized = self.record.oversized_fields();
        let len = self.source_system.chars().count();
        if len > SOURCE_SYSTEM_MAX_LEN {
            oversized.push(("source_system", len, SOURCE_SYSTEM_MAX_LEN));
        }
        oversized
    }

    pub fn key(&self) -> RecordKey {
        RecordKey {
            church_id: self.church_id,
            record_type: self.record.record_type(),
            source_hash: self.source_hash.clone(),
        }
    }
}

/// What a successful store write did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Inserted,
    Updated,
}

impl From<WriteOutcome> for RowOutcome {
    fn from(outcome: WriteOutcome) -> Self {
        match outcome {
            WriteOutcome::Inserted => RowOutcome::Inserted,
            WriteOutcome::Updated => RowOutcome::Updated,
        }
    }
}

/// Canonical record storage
///
/// `upsert` reports `Inserted` when no row with the record's key existed and
/// `Updated` when one did. Store failures are returned as classified
/// [`ImportError`]s: `Constraint` for a rejected row, `FatalIo` when the
/// store is unreachable.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn upsert(&self, record: &FingerprintedRecord) -> ImportResult<WriteOutcome>;

    /// Whether a row with this key exists
    async fn exists(&self, key: &RecordKey) -> ImportResult<bool>;
}

/// Classifies and writes canonical records
#[derive(Clone)]
pub struct UpsertEngine {
    store: Arc<dyn RecordStore>,
    write_timeout: Duration,
    dry_run: bool,
}

impl UpsertEngine {
    pub fn new(store: Arc<dyn RecordStore>, write_timeout: Duration) -> Self {
        Self {
            store,
            write_timeout,
            dry_run: false,
        }
    }

    /// Classify records against the store without writing them
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Fingerprint and write one record
    ///
    /// Row-level failures come back as `Ok(RowOutcome::Skipped)` or
    /// `Ok(RowOutcome::Error)`. Only fatal errors are returned as `Err`.
    pub async fn apply(
        &self,
        church_id: i64,
        source_system: &str,
        record: CanonicalRecord,
    ) -> ImportResult<RowOutcome> {
        let record = match FingerprintedRecord::new(church_id, source_system, record) {
            Ok(record) => record,
            Err(e) => {
                tracing::debug!(church_id, error = %e, "Skipping record");
                return Ok(RowOutcome::Skipped);
            },
        };

        match self.write(&record).await {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.class() == ErrorClass::Row => {
                tracing::warn!(
                    church_id,
                    record_type = %record.record.record_type(),
                    source_hash = %record.source_hash,
                    error = %e,
                    "Record rejected by store"
                );
                Ok(RowOutcome::Error)
            },
            Err(e) => Err(e),
        }
    }

    async fn write(&self, record: &FingerprintedRecord) -> ImportResult<RowOutcome> {
        if self.dry_run {
            let exists = self.with_timeout(self.store.exists(&record.key())).await?;
            return Ok(if exists { RowOutcome::Updated } else { RowOutcome::Inserted });
        }

        self.with_timeout(self.store.upsert(record)).await.map(RowOutcome::from)
    }

    async fn with_timeout<T>(
        &self,
        fut: impl std::future::Future<Output = ImportResult<T>>,
    ) -> ImportResult<T> {
        tokio::time::timeout(self.write_timeout, fut).await.map_err(|_| {
            ImportError::FatalIo(format!("store write timed out after {:?}", self.write_timeout))
        })?
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::records::FieldValue;
    use crate::store::MemoryRecordStore;

    fn helen() -> CanonicalRecord {
        let mut record = CanonicalRecord::new(RecordType::Baptisms);
        record.assign("person_first", FieldValue::Text("Helen Russo".into()));
        record
    }

    fn engine(store: Arc<MemoryRecordStore>) -> UpsertEngine {
        UpsertEngine::new(store, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_insert_then_update() {
        let store = Arc::new(MemoryRecordStore::new());
        let engine = engine(store.clone());

        assert_eq!(engine.apply(45, "import", helen()).await.unwrap(), RowOutcome::Inserted);
        assert_eq!(engine.apply(45, "import", helen()).await.unwrap(), RowOutcome::Updated);
        assert_eq!(store.len(), 1);

        // another tenant gets its own row
        assert_eq!(engine.apply(46, "import", helen()).await.unwrap(), RowOutcome::Inserted);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_update_overwrites_non_key_fields() {
        let store = Arc::new(MemoryRecordStore::new());
        let engine = engine(store.clone());

        engine.apply(45, "import", helen()).await.unwrap();
        let mut refreshed = helen();
        refreshed.assign("notes", FieldValue::Text("corrected".into()));
        engine.apply(45, "legacy", refreshed.clone()).await.unwrap();

        let key = FingerprintedRecord::new(45, "legacy", refreshed).unwrap().key();
        let stored = store.get(&key).unwrap();
        assert_eq!(stored.record.record.text("notes"), Some("corrected"));
        assert_eq!(stored.record.source_system, "legacy");
    }

    #[tokio::test]
    async fn test_record_without_identity_is_skipped() {
        let store = Arc::new(MemoryRecordStore::new());
        let mut record = CanonicalRecord::new(RecordType::Baptisms);
        record.assign("notes", FieldValue::Text("page torn".into()));

        assert_eq!(engine(store.clone()).apply(45, "import", record).await.unwrap(), RowOutcome::Skipped);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_constraint_failure_is_row_error() {
        let store = Arc::new(MemoryRecordStore::new());
        let mut record = helen();
        record.assign("certificate_no", FieldValue::Text("9".repeat(80)));

        assert_eq!(engine(store.clone()).apply(45, "import", record).await.unwrap(), RowOutcome::Error);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_store_is_fatal() {
        let store = Arc::new(MemoryRecordStore::new());
        store.set_available(false);
        let err = engine(store).apply(45, "import", helen()).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_dry_run_classifies_without_writing() {
        let store = Arc::new(MemoryRecordStore::new());
        engine(store.clone()).apply(45, "import", helen()).await.unwrap();

        let dry = engine(store.clone()).dry_run(true);
        assert_eq!(dry.apply(45, "import", helen()).await.unwrap(), RowOutcome::Updated);

        let mut other = helen();
        other.assign("person_last", FieldValue::Text("Bianchi".into()));
        assert_eq!(dry.apply(45, "import", other).await.unwrap(), RowOutcome::Inserted);
        assert_eq!(store.len(), 1);
    }
}
