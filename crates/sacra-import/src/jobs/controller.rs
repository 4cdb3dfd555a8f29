//! Import job controller
//!
//! Drives one job at a time per call: `pending → running → done`, or
//! `running → error` on a fatal condition. Rows are read lazily from a
//! [`RecordSource`], mapped, fingerprinted and written one by one. Row-level
//! failures are counted; fatal ones end the job.

use futures::StreamExt;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use uuid::Uuid;

use super::progress::{FlushPolicy, ProgressReporter, ProgressSink};
use super::JobStore;
use crate::config::{
    ImportConfig, DEFAULT_CHANNEL_CAPACITY, DEFAULT_MAX_BYTES, DEFAULT_PREVIEW_LIMIT, DEFAULT_SOURCE_SYSTEM,
    DEFAULT_WRITE_TIMEOUT_SECS,
};
use crate::error::{ImportError, ImportResult, ParseError};
use crate::fingerprint::fingerprint;
use crate::mapping::{DateConfig, FieldMapper, FieldMapping, SuggestionRules};
use crate::models::{
    ImportFile, ImportFormat, ImportJob, ImportOptions, JobCounters, JobStatus, NewImportJob, RecordType,
    RowOutcome,
};
use crate::parser::{self, ParserPatterns, RecordSource};
use crate::records::CanonicalRecord;
use crate::upsert::{RecordStore, UpsertEngine};

/// Bytes read from the head of a file for format sniffing
const SNIFF_BYTES: usize = 512;

/// Upper bound for job listings
const MAX_LIST_LIMIT: i64 = 100;

const DEFAULT_LIST_LIMIT: i64 = 20;

/// Controller tuning and injected pattern tables
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub flush: FlushPolicy,
    pub write_timeout: Duration,
    pub channel_capacity: usize,
    pub preview_limit: usize,
    pub max_file_bytes: u64,
    /// Provenance label for runs that do not set their own
    pub source_system: String,
    pub patterns: ParserPatterns,
    pub dates: DateConfig,
    pub suggestions: SuggestionRules,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            flush: FlushPolicy::default(),
            write_timeout: Duration::from_secs(DEFAULT_WRITE_TIMEOUT_SECS),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            preview_limit: DEFAULT_PREVIEW_LIMIT,
            max_file_bytes: DEFAULT_MAX_BYTES,
            source_system: DEFAULT_SOURCE_SYSTEM.to_string(),
            patterns: ParserPatterns::default(),
            dates: DateConfig::default(),
            suggestions: SuggestionRules::default(),
        }
    }
}

impl From<&ImportConfig> for ControllerSettings {
    fn from(config: &ImportConfig) -> Self {
        let import = &config.import;
        Self {
            flush: FlushPolicy {
                every_rows: import.progress_every_rows,
                interval: if import.progress_interval_ms == 0 {
                    Duration::MAX
                } else {
                    Duration::from_millis(import.progress_interval_ms)
                },
            },
            write_timeout: Duration::from_secs(import.write_timeout_secs),
            channel_capacity: import.channel_capacity,
            preview_limit: import.preview_limit,
            max_file_bytes: import.max_bytes,
            source_system: import.source_system.clone(),
            patterns: import.parser_patterns(),
            ..Self::default()
        }
    }
}

/// Everything needed to register a new job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateJobRequest {
    pub church_id: i64,
    pub record_type: RecordType,
    /// Detected from name, content type and content when absent
    pub format: Option<ImportFormat>,
    /// Where the uploaded file is stored
    pub path: PathBuf,
    /// Name the file was uploaded under
    pub original_name: Option<String>,
    pub content_type: Option<String>,
    pub created_by: Option<i64>,
}

impl CreateJobRequest {
    pub fn new(church_id: i64, record_type: RecordType, path: impl Into<PathBuf>) -> Self {
        Self {
            church_id,
            record_type,
            format: None,
            path: path.into(),
            original_name: None,
            content_type: None,
            created_by: None,
        }
    }

    pub fn format(mut self, format: ImportFormat) -> Self {
        self.format = Some(format);
        self
    }

    fn display_name(&self) -> String {
        self.original_name.clone().unwrap_or_else(|| {
            self.path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.path.display().to_string())
        })
    }
}

/// Sample of a source file for mapping review
#[derive(Debug, Clone, Serialize)]
pub struct ImportPreview {
    pub format: ImportFormat,
    /// Field names across the sampled records, in first-seen order
    pub detected_fields: Vec<String>,
    pub records: Vec<BTreeMap<String, Option<String>>>,
    pub suggested_mapping: FieldMapping,
    pub parse_errors: Vec<ParseError>,
}

/// One sampled row after mapping and fingerprinting
#[derive(Debug, Clone, Serialize)]
pub struct CanonicalPreviewRow {
    pub row: u64,
    pub record: Option<CanonicalRecord>,
    pub source_hash: Option<String>,
    pub error: Option<String>,
}

/// Handle to a job running on the runtime
pub struct RunningJob {
    job_id: Uuid,
    cancel: CancellationToken,
    handle: JoinHandle<ImportResult<ImportJob>>,
}

impl RunningJob {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the job to reach a terminal state
    pub async fn wait(self) -> ImportResult<ImportJob> {
        self.handle
            .await
            .map_err(|e| ImportError::FatalIo(format!("Import task failed: {}", e)))?
    }
}

/// Creates, runs and queries import jobs
#[derive(Clone)]
pub struct ImportController {
    jobs: Arc<dyn JobStore>,
    records: Arc<dyn RecordStore>,
    progress: Arc<dyn ProgressSink>,
    settings: Arc<ControllerSettings>,
    running: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
}

impl ImportController {
    /// Progress is flushed through the job store itself
    pub fn new<J>(jobs: Arc<J>, records: Arc<dyn RecordStore>, settings: ControllerSettings) -> Self
    where
        J: JobStore + ProgressSink + 'static,
    {
        let progress: Arc<dyn ProgressSink> = jobs.clone();
        Self::with_progress_sink(jobs, records, progress, settings)
    }

    pub fn with_progress_sink(
        jobs: Arc<dyn JobStore>,
        records: Arc<dyn RecordStore>,
        progress: Arc<dyn ProgressSink>,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            jobs,
            records,
            progress,
            settings: Arc::new(settings),
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    /// Register a pending job and its source file. No row is read.
    #[instrument(skip(self, request), fields(church_id = request.church_id, record_type = %request.record_type))]
    pub async fn create_job(&self, request: CreateJobRequest) -> ImportResult<ImportJob> {
        let metadata = tokio::fs::metadata(&request.path)
            .await
            .map_err(|e| ImportError::FatalIo(format!("Cannot read {}: {}", request.path.display(), e)))?;
        let size = metadata.len();
        if size > self.settings.max_file_bytes {
            return Err(ImportError::Validation(format!(
                "file is {} bytes; the limit is {}",
                size, self.settings.max_file_bytes
            )));
        }

        let original_name = request.display_name();
        let format = match request.format {
            Some(format) => format,
            None => detect_format(&request.path, Some(&original_name), request.content_type.as_deref()).await?,
        };

        let checksum_path = request.path.clone();
        let sha256 = tokio::task::spawn_blocking(move || sacra_common::checksum::compute_file_checksum(checksum_path))
            .await
            .map_err(|e| ImportError::FatalIo(format!("Checksum task failed: {}", e)))??;

        let size_bytes = i64::try_from(size).unwrap_or(i64::MAX);
        let job = self
            .jobs
            .create_job(NewImportJob {
                church_id: request.church_id,
                record_type: request.record_type,
                format,
                filename: original_name.clone(),
                size_bytes,
                created_by: request.created_by,
            })
            .await?;

        self.jobs
            .register_file(ImportFile {
                job_id: job.id,
                storage_path: request.path.display().to_string(),
                original_name,
                mime_type: request.content_type,
                size_bytes,
                sha256,
            })
            .await?;

        tracing::info!(
            job_id = %job.id,
            format = %format,
            size_bytes,
            filename = %job.filename,
            "Import job created"
        );
        Ok(job)
    }

    /// Run a pending job to a terminal state
    ///
    /// Returns the terminal job. A fatal condition during processing ends the
    /// job in `error` and is reported through the job, not as `Err`; `Err`
    /// means the job could not be driven at all (unknown job, job not pending,
    /// job store unreachable). An empty mapping is replaced by the one
    /// suggested from the file's first rows.
    #[instrument(skip(self, mapping, options, cancel), fields(job_id = %job_id))]
    pub async fn run_job(
        &self,
        job_id: Uuid,
        mapping: &FieldMapping,
        options: ImportOptions,
        cancel: CancellationToken,
    ) -> ImportResult<ImportJob> {
        let mut counters = JobCounters::default();
        let job = self.jobs.transition(job_id, JobStatus::Running, counters, None).await?;
        tracing::info!(
            job_id = %job_id,
            church_id = job.church_id,
            record_type = %job.record_type,
            format = %job.format,
            dry_run = options.dry_run,
            "Import job running"
        );

        match self.process(&job, mapping, &options, &cancel, &mut counters).await {
            Ok(()) => {
                let job = self.jobs.transition(job_id, JobStatus::Done, counters, None).await?;
                tracing::info!(
                    job_id = %job_id,
                    total = counters.total_rows,
                    inserted = counters.inserted_rows,
                    updated = counters.updated_rows,
                    skipped = counters.skipped_rows,
                    errors = counters.error_rows,
                    "Import job done"
                );
                Ok(job)
            },
            Err(e) => {
                if matches!(e, ImportError::Cancelled) {
                    tracing::info!(job_id = %job_id, processed = counters.processed_rows, "Import job cancelled");
                } else {
                    tracing::error!(
                        job_id = %job_id,
                        processed = counters.processed_rows,
                        error = %e,
                        "Import job failed"
                    );
                }
                match self.jobs.transition(job_id, JobStatus::Error, counters, Some(e.to_string())).await {
                    Ok(job) => Ok(job),
                    Err(store_err) => {
                        tracing::error!(job_id = %job_id, error = %store_err, "Could not record job failure");
                        Err(e)
                    },
                }
            },
        }
    }

    async fn process(
        &self,
        job: &ImportJob,
        mapping: &FieldMapping,
        options: &ImportOptions,
        cancel: &CancellationToken,
        counters: &mut JobCounters,
    ) -> ImportResult<()> {
        let file = self
            .jobs
            .file_for_job(job.id)
            .await?
            .ok_or_else(|| ImportError::FatalIo(format!("No source file registered for job {}", job.id)))?;

        let mapping = if mapping.is_empty() {
            let sampled = self.sample(PathBuf::from(&file.storage_path), job.format, None).await?;
            let fields = parser::detected_fields(&sampled);
            let suggested = self.suggest_mapping(job.record_type, fields.iter().map(String::as_str));
            tracing::info!(
                job_id = %job.id,
                targets = ?suggested.targets().map(|(target, _)| target).collect::<Vec<_>>(),
                "No mapping supplied, using suggested mapping"
            );
            suggested
        } else {
            mapping.clone()
        };

        let mapper = FieldMapper::new(job.record_type, mapping, &self.settings.dates);
        let engine =
            UpsertEngine::new(self.records.clone(), self.settings.write_timeout).dry_run(options.dry_run);
        let mut reporter = ProgressReporter::new(self.progress.clone(), job.id, self.settings.flush);

        let mut source = RecordSource::open(
            &file.storage_path,
            job.format,
            self.settings.patterns.clone(),
            self.settings.channel_capacity,
        )
        .await?;

        let source_system = options.source_system.as_deref().unwrap_or(&self.settings.source_system);
        let mut row: u64 = 0;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ImportError::Cancelled),
                next = source.next() => next,
            };
            let Some(item) = next else {
                break;
            };
            row += 1;
            counters.inc_total();

            let checked = item.and_then(|raw| mapper.map(&*raw).into_checked(row));
            let outcome = match checked {
                Ok(record) => engine.apply(job.church_id, source_system, record).await?,
                Err(e) => {
                    tracing::warn!(job_id = %job.id, row, error = %e, "Row rejected");
                    RowOutcome::Error
                },
            };
            counters.record(outcome);
            reporter.observe(counters).await?;
        }

        source.finish().await
    }

    /// Run a pending job on the runtime; it can be cancelled through the
    /// returned handle or [`ImportController::cancel_job`]
    pub fn spawn_job(&self, job_id: Uuid, mapping: FieldMapping, options: ImportOptions) -> RunningJob {
        let cancel = CancellationToken::new();
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job_id, cancel.clone());

        let controller = self.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let result = controller.run_job(job_id, &mapping, options, token).await;
            controller
                .running
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&job_id);
            result
        });

        RunningJob {
            job_id,
            cancel,
            handle,
        }
    }

    /// Request cancellation of a spawned job. Returns false when the job is
    /// not running under this controller.
    pub fn cancel_job(&self, job_id: Uuid) -> bool {
        let running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        match running.get(&job_id) {
            Some(token) => {
                tracing::info!(job_id = %job_id, "Cancellation requested");
                token.cancel();
                true
            },
            None => false,
        }
    }

    pub async fn get_job(&self, job_id: Uuid) -> ImportResult<ImportJob> {
        self.jobs.get_job(job_id).await?.ok_or(ImportError::JobNotFound(job_id))
    }

    /// Newest first; `limit` defaults to 20 and is clamped to 1..=100
    pub async fn list_recent_jobs(&self, church_id: i64, limit: Option<i64>) -> ImportResult<Vec<ImportJob>> {
        let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
        self.jobs.list_recent(church_id, limit).await
    }

    pub fn suggest_mapping<'a, I>(&self, record_type: RecordType, fields: I) -> FieldMapping
    where
        I: IntoIterator<Item = &'a str>,
    {
        self.settings.suggestions.suggest(record_type, fields)
    }

    /// Read the first rows of a file without creating a job
    #[instrument(skip(self, path), fields(path = %path.as_ref().display()))]
    pub async fn preview(
        &self,
        path: impl AsRef<Path>,
        format: Option<ImportFormat>,
        record_type: RecordType,
        limit: Option<usize>,
    ) -> ImportResult<ImportPreview> {
        let path = path.as_ref().to_path_buf();
        let format = match format {
            Some(format) => format,
            None => detect_format(&path, None, None).await?,
        };
        let rows = self.sample(path, format, limit).await?;

        let detected_fields = parser::detected_fields(&rows);
        let suggested_mapping = self.suggest_mapping(record_type, detected_fields.iter().map(String::as_str));

        let mut records = Vec::new();
        let mut parse_errors = Vec::new();
        for row in rows {
            match row {
                Ok(record) => records.push(record.to_map()),
                Err(e) => parse_errors.push(e),
            }
        }

        Ok(ImportPreview {
            format,
            detected_fields,
            records,
            suggested_mapping,
            parse_errors,
        })
    }

    /// Map and fingerprint the first rows of a file. The store is not read.
    pub async fn preview_canonical(
        &self,
        path: impl AsRef<Path>,
        format: Option<ImportFormat>,
        record_type: RecordType,
        mapping: &FieldMapping,
        limit: Option<usize>,
    ) -> ImportResult<Vec<CanonicalPreviewRow>> {
        let path = path.as_ref().to_path_buf();
        let format = match format {
            Some(format) => format,
            None => detect_format(&path, None, None).await?,
        };
        let rows = self.sample(path, format, limit).await?;
        let mapper = FieldMapper::new(record_type, mapping.clone(), &self.settings.dates);

        let preview = rows
            .into_iter()
            .zip(1u64..)
            .map(|(item, row)| match item.and_then(|raw| mapper.map(&*raw).into_checked(row)) {
                Ok(record) => CanonicalPreviewRow {
                    row,
                    source_hash: fingerprint(&record),
                    record: Some(record),
                    error: None,
                },
                Err(e) => CanonicalPreviewRow {
                    row,
                    record: None,
                    source_hash: None,
                    error: Some(e.to_string()),
                },
            })
            .collect();
        Ok(preview)
    }

    async fn sample(
        &self,
        path: PathBuf,
        format: ImportFormat,
        limit: Option<usize>,
    ) -> ImportResult<Vec<parser::RowResult>> {
        let limit = limit
            .unwrap_or(self.settings.preview_limit)
            .min(self.settings.preview_limit.max(1));
        let patterns = self.settings.patterns.clone();
        tokio::task::spawn_blocking(move || parser::read_rows(&path, format, &patterns, limit))
            .await
            .map_err(|e| ImportError::FatalIo(format!("Preview task failed: {}", e)))?
    }
}

/// Detect the format of a stored file from its name, declared content type
/// and first bytes
pub async fn detect_format(
    path: &Path,
    file_name: Option<&str>,
    content_type: Option<&str>,
) -> ImportResult<ImportFormat> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| ImportError::FatalIo(format!("Cannot open {}: {}", path.display(), e)))?;
    let mut head = vec![0u8; SNIFF_BYTES];
    let mut filled = 0;
    while filled < head.len() {
        let n = file.read(&mut head[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    head.truncate(filled);

    let name = file_name.or_else(|| path.file_name().and_then(|n| n.to_str()));
    Ok(ImportFormat::detect(name, content_type, &head))
}
