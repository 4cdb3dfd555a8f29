//! PostgreSQL stores
//!
//! Canonical tables are written with runtime-built statements derived from
//! the record field tables, so the column lists cannot drift from the
//! record structs. Each upsert runs in its own transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{ImportError, ImportResult};
use crate::jobs::{JobStore, ProgressSink};
use crate::models::{ImportFile, ImportJob, JobCounters, JobStatus, NewImportJob, RecordType};
use crate::records::FieldRef;
use crate::upsert::{FingerprintedRecord, RecordKey, RecordStore, WriteOutcome};

struct Statements {
    insert: String,
    update: String,
    exists: String,
}

impl Statements {
    /// Parameters: $1 church_id, $2 source_system, $3 source_hash, then one
    /// per canonical field in table order
    fn for_type(record_type: RecordType) -> Self {
        let table = record_type.table_name();
        let fields = record_type.fields();

        let columns = fields.iter().map(|f| f.name).collect::<Vec<_>>().join(", ");
        let params = (0..fields.len())
            .map(|i| format!("${}", i + 4))
            .collect::<Vec<_>>()
            .join(", ");
        let assignments = fields
            .iter()
            .enumerate()
            .map(|(i, f)| format!("{} = ${}", f.name, i + 4))
            .collect::<Vec<_>>()
            .join(", ");

        Self {
            insert: format!(
                "INSERT INTO {table} (church_id, source_system, source_hash, {columns}) \
                 VALUES ($1, $2, $3, {params}) \
                 ON CONFLICT (church_id, source_hash) DO NOTHING \
                 RETURNING id"
            ),
            update: format!(
                "UPDATE {table} SET source_system = $2, {assignments}, updated_at = NOW() \
                 WHERE church_id = $1 AND source_hash = $3"
            ),
            exists: format!("SELECT EXISTS(SELECT 1 FROM {table} WHERE church_id = $1 AND source_hash = $2)"),
        }
    }
}

fn bind_record<'q>(
    query: Query<'q, Postgres, PgArguments>,
    record: &FingerprintedRecord,
) -> Query<'q, Postgres, PgArguments> {
    let mut query = query
        .bind(record.church_id)
        .bind(record.source_system.clone())
        .bind(record.source_hash.clone());
    for spec in record.record.fields() {
        query = match record.record.get(spec.name) {
            Some(FieldRef::Text(value)) => query.bind(value.map(str::to_string)),
            Some(FieldRef::Date(value)) => query.bind(value),
            Some(FieldRef::List(values)) => query.bind(Json(values.to_vec())),
            None => query.bind(None::<String>),
        };
    }
    query
}

/// Canonical record store backed by the `*_records` tables
pub struct PgRecordStore {
    pool: Arc<PgPool>,
    baptisms: Statements,
    marriages: Statements,
    funerals: Statements,
}

impl PgRecordStore {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self {
            pool,
            baptisms: Statements::for_type(RecordType::Baptisms),
            marriages: Statements::for_type(RecordType::Marriages),
            funerals: Statements::for_type(RecordType::Funerals),
        }
    }

    fn statements(&self, record_type: RecordType) -> &Statements {
        match record_type {
            RecordType::Baptisms => &self.baptisms,
            RecordType::Marriages => &self.marriages,
            RecordType::Funerals => &self.funerals,
        }
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn upsert(&self, record: &FingerprintedRecord) -> ImportResult<WriteOutcome> {
        let statements = self.statements(record.record.record_type());
        let mut tx = self.pool.begin().await.map_err(ImportError::from_store)?;

        let inserted = bind_record(sqlx::query(&statements.insert), record)
            .fetch_optional(&mut *tx)
            .await
            .map_err(ImportError::from_store)?;

        let outcome = match inserted {
            Some(row) => {
                let id: i64 = row.try_get("id").map_err(ImportError::from_store)?;
                tracing::trace!(id, source_hash = %record.source_hash, "Record inserted");
                WriteOutcome::Inserted
            },
            None => {
                let result = bind_record(sqlx::query(&statements.update), record)
                    .execute(&mut *tx)
                    .await
                    .map_err(ImportError::from_store)?;
                if result.rows_affected() == 0 {
                    return Err(ImportError::Constraint(format!(
                        "conflicting row for {} vanished before update",
                        record.source_hash
                    )));
                }
                WriteOutcome::Updated
            },
        };

        tx.commit().await.map_err(ImportError::from_store)?;
        Ok(outcome)
    }

    async fn exists(&self, key: &RecordKey) -> ImportResult<bool> {
        sqlx::query_scalar::<_, bool>(&self.statements(key.record_type).exists)
            .bind(key.church_id)
            .bind(&key.source_hash)
            .fetch_one(&*self.pool)
            .await
            .map_err(ImportError::from_store)
    }
}

const JOB_COLUMNS: &str = "id, church_id, record_type, format, filename, size_bytes, status, \
     total_rows, processed_rows, inserted_rows, updated_rows, skipped_rows, error_rows, \
     started_at, finished_at, error_text, created_by, created_at, updated_at";

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    church_id: i64,
    record_type: String,
    format: String,
    filename: String,
    size_bytes: i64,
    status: String,
    total_rows: i64,
    processed_rows: i64,
    inserted_rows: i64,
    updated_rows: i64,
    skipped_rows: i64,
    error_rows: i64,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    error_text: Option<String>,
    created_by: Option<i64>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for ImportJob {
    type Error = ImportError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(ImportJob {
            id: row.id,
            church_id: row.church_id,
            record_type: row.record_type.parse()?,
            format: row.format.parse()?,
            filename: row.filename,
            size_bytes: row.size_bytes,
            status: row.status.parse()?,
            counters: JobCounters {
                total_rows: row.total_rows,
                processed_rows: row.processed_rows,
                inserted_rows: row.inserted_rows,
                updated_rows: row.updated_rows,
                skipped_rows: row.skipped_rows,
                error_rows: row.error_rows,
            },
            started_at: row.started_at,
            finished_at: row.finished_at,
            error_text: row.error_text,
            created_by: row.created_by,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Job store backed by `import_jobs` and `import_files`
pub struct PgJobStore {
    pool: Arc<PgPool>,
}

impl PgJobStore {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    async fn status_of(&self, job_id: Uuid) -> ImportResult<Option<JobStatus>> {
        let status: Option<String> = sqlx::query_scalar("SELECT status FROM import_jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&*self.pool)
            .await
            .map_err(ImportError::from_store)?;
        status.map(|s| s.parse()).transpose()
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create_job(&self, job: NewImportJob) -> ImportResult<ImportJob> {
        let sql = format!(
            "INSERT INTO import_jobs (id, church_id, record_type, format, filename, size_bytes, status, created_by) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             RETURNING {JOB_COLUMNS}"
        );
        let row: JobRow = sqlx::query_as(&sql)
            .bind(Uuid::new_v4())
            .bind(job.church_id)
            .bind(job.record_type.as_str())
            .bind(job.format.as_str())
            .bind(&job.filename)
            .bind(job.size_bytes)
            .bind(JobStatus::Pending.as_str())
            .bind(job.created_by)
            .fetch_one(&*self.pool)
            .await
            .map_err(ImportError::from_store)?;
        row.try_into()
    }

    async fn register_file(&self, file: ImportFile) -> ImportResult<()> {
        sqlx::query(
            "INSERT INTO import_files (job_id, storage_path, original_name, mime_type, size_bytes, sha256) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(file.job_id)
        .bind(&file.storage_path)
        .bind(&file.original_name)
        .bind(&file.mime_type)
        .bind(file.size_bytes)
        .bind(&file.sha256)
        .execute(&*self.pool)
        .await
        .map_err(ImportError::from_store)?;
        Ok(())
    }

    async fn file_for_job(&self, job_id: Uuid) -> ImportResult<Option<ImportFile>> {
        sqlx::query_as::<_, ImportFile>(
            "SELECT job_id, storage_path, original_name, mime_type, size_bytes, sha256 \
             FROM import_files WHERE job_id = $1",
        )
        .bind(job_id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(ImportError::from_store)
    }

    async fn transition(
        &self,
        job_id: Uuid,
        to: JobStatus,
        counters: JobCounters,
        error_text: Option<String>,
    ) -> ImportResult<ImportJob> {
        let Some(from) = JobStatus::predecessor_of(to) else {
            let current = self.status_of(job_id).await?.ok_or(ImportError::JobNotFound(job_id))?;
            return Err(ImportError::InvalidTransition { from: current, to });
        };

        let sql = format!(
            "UPDATE import_jobs SET \
                 status = $2, \
                 started_at = CASE WHEN $2 = 'running' THEN NOW() ELSE started_at END, \
                 finished_at = CASE WHEN $2 IN ('done', 'error') THEN NOW() ELSE finished_at END, \
                 total_rows = $4, processed_rows = $5, inserted_rows = $6, \
                 updated_rows = $7, skipped_rows = $8, error_rows = $9, \
                 error_text = COALESCE($10, error_text), \
                 updated_at = NOW() \
             WHERE id = $1 AND status = $3 \
             RETURNING {JOB_COLUMNS}"
        );
        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(job_id)
            .bind(to.as_str())
            .bind(from.as_str())
            .bind(counters.total_rows)
            .bind(counters.processed_rows)
            .bind(counters.inserted_rows)
            .bind(counters.updated_rows)
            .bind(counters.skipped_rows)
            .bind(counters.error_rows)
            .bind(error_text)
            .fetch_optional(&*self.pool)
            .await
            .map_err(ImportError::from_store)?;

        match row {
            Some(row) => row.try_into(),
            None => match self.status_of(job_id).await? {
                Some(current) => Err(ImportError::InvalidTransition { from: current, to }),
                None => Err(ImportError::JobNotFound(job_id)),
            },
        }
    }

    async fn save_progress(&self, job_id: Uuid, counters: JobCounters) -> ImportResult<()> {
        let result = sqlx::query(
            "UPDATE import_jobs SET \
                 total_rows = $2, processed_rows = $3, inserted_rows = $4, \
                 updated_rows = $5, skipped_rows = $6, error_rows = $7, updated_at = NOW() \
             WHERE id = $1 AND status = 'running'",
        )
        .bind(job_id)
        .bind(counters.total_rows)
        .bind(counters.processed_rows)
        .bind(counters.inserted_rows)
        .bind(counters.updated_rows)
        .bind(counters.skipped_rows)
        .bind(counters.error_rows)
        .execute(&*self.pool)
        .await
        .map_err(ImportError::from_store)?;

        if result.rows_affected() == 0 {
            tracing::debug!(job_id = %job_id, "Progress not saved; job is not running");
        }
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> ImportResult<Option<ImportJob>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM import_jobs WHERE id = $1");
        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(job_id)
            .fetch_optional(&*self.pool)
            .await
            .map_err(ImportError::from_store)?;
        row.map(ImportJob::try_from).transpose()
    }

    async fn list_recent(&self, church_id: i64, limit: i64) -> ImportResult<Vec<ImportJob>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM import_jobs WHERE church_id = $1 \
             ORDER BY created_at DESC LIMIT $2"
        );
        let rows: Vec<JobRow> = sqlx::query_as(&sql)
            .bind(church_id)
            .bind(limit)
            .fetch_all(&*self.pool)
            .await
            .map_err(ImportError::from_store)?;
        rows.into_iter().map(ImportJob::try_from).collect()
    }
}

#[async_trait]
impl ProgressSink for PgJobStore {
    async fn flush(&self, job_id: Uuid, counters: JobCounters) -> ImportResult<()> {
        self.save_progress(job_id, counters).await
    }
}
