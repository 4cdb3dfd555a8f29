//! Core types for the import engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::ImportError;

/// Sacrament record type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    Baptisms,
    Marriages,
    Funerals,
}

impl RecordType {
    pub const ALL: [RecordType; 3] = [RecordType::Baptisms, RecordType::Marriages, RecordType::Funerals];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::Baptisms => "baptisms",
            RecordType::Marriages => "marriages",
            RecordType::Funerals => "funerals",
        }
    }

    /// Canonical store table for this record type
    pub fn table_name(&self) -> &'static str {
        match self {
            RecordType::Baptisms => "baptism_records",
            RecordType::Marriages => "marriage_records",
            RecordType::Funerals => "funeral_records",
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordType {
    type Err = ImportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "baptisms" | "baptism" => Ok(RecordType::Baptisms),
            "marriages" | "marriage" => Ok(RecordType::Marriages),
            "funerals" | "funeral" => Ok(RecordType::Funerals),
            other => Err(ImportError::Validation(format!("Unknown record type: {}", other))),
        }
    }
}

/// Leading tokens of a SQL dump: statements or comments
const SQL_LEADS: &[&str] = &["INSERT", "--", "/*", "CREATE", "SET"];

/// Keyword leads must be followed by whitespace, so a CSV header such as
/// `Settlement,Name` is not a `SET` statement
fn leads_with(text: &str, lead: &str) -> bool {
    let is_keyword = lead.starts_with(|c: char| c.is_ascii_alphabetic());
    text.strip_prefix(lead)
        .is_some_and(|rest| !is_keyword || rest.starts_with(char::is_whitespace))
}

/// Source file format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportFormat {
    Csv,
    Json,
    Sql,
    Xml,
}

impl ImportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportFormat::Csv => "csv",
            ImportFormat::Json => "json",
            ImportFormat::Sql => "sql",
            ImportFormat::Xml => "xml",
        }
    }

    /// Detect the format from the file name, then the declared content type,
    /// then the first bytes of the content. Falls back to CSV.
    pub fn detect(file_name: Option<&str>, content_type: Option<&str>, head: &[u8]) -> Self {
        file_name
            .and_then(Self::from_extension)
            .or_else(|| content_type.and_then(Self::from_content_type))
            .or_else(|| Self::sniff(head))
            .unwrap_or(ImportFormat::Csv)
    }

    fn from_extension(file_name: &str) -> Option<Self> {
        let ext = Path::new(file_name).extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "csv" | "tsv" | "txt" => Some(ImportFormat::Csv),
            "json" => Some(ImportFormat::Json),
            "sql" => Some(ImportFormat::Sql),
            "xml" => Some(ImportFormat::Xml),
            _ => None,
        }
    }

    fn from_content_type(content_type: &str) -> Option<Self> {
        let ct = content_type.to_ascii_lowercase();
        if ct.contains("json") {
            Some(ImportFormat::Json)
        } else if ct.contains("xml") {
            Some(ImportFormat::Xml)
        } else if ct.contains("sql") {
            Some(ImportFormat::Sql)
        } else if ct.contains("csv") || ct.contains("vnd.ms-excel") {
            Some(ImportFormat::Csv)
        } else {
            None
        }
    }

    fn sniff(head: &[u8]) -> Option<Self> {
        let text = String::from_utf8_lossy(head);
        let text = text.trim_start_matches('\u{feff}').trim_start();
        let upper = text.to_ascii_uppercase();
        if text.starts_with('[') || text.starts_with('{') {
            Some(ImportFormat::Json)
        } else if text.starts_with('<') {
            Some(ImportFormat::Xml)
        } else if SQL_LEADS.iter().any(|lead| leads_with(&upper, lead)) || upper.contains("INSERT INTO") {
            Some(ImportFormat::Sql)
        } else {
            None
        }
    }
}

impl fmt::Display for ImportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImportFormat {
    type Err = ImportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(ImportFormat::Csv),
            "json" => Ok(ImportFormat::Json),
            "sql" => Ok(ImportFormat::Sql),
            "xml" => Ok(ImportFormat::Xml),
            other => Err(ImportError::Validation(format!("Unknown import format: {}", other))),
        }
    }
}

/// Import job status
///
/// Transitions are monotonic: `pending -> running -> done | error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Done)
                | (JobStatus::Running, JobStatus::Error)
        )
    }

    /// The only status a job may be in before moving to `next`
    pub fn predecessor_of(next: JobStatus) -> Option<JobStatus> {
        match next {
            JobStatus::Pending => None,
            JobStatus::Running => Some(JobStatus::Pending),
            JobStatus::Done | JobStatus::Error => Some(JobStatus::Running),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ImportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "done" => Ok(JobStatus::Done),
            "error" => Ok(JobStatus::Error),
            other => Err(ImportError::Validation(format!("Unknown job status: {}", other))),
        }
    }
}

/// Per-record outcome reported by the upsert engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowOutcome {
    Inserted,
    Updated,
    Skipped,
    Error,
}

/// Job progress counters
///
/// `processed_rows` always equals the sum of the four outcome counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounters {
    pub total_rows: i64,
    pub processed_rows: i64,
    pub inserted_rows: i64,
    pub updated_rows: i64,
    pub skipped_rows: i64,
    pub error_rows: i64,
}

impl JobCounters {
    /// Count one row read from the source
    pub fn inc_total(&mut self) {
        self.total_rows += 1;
    }

    /// Record the outcome of one processed row
    pub fn record(&mut self, outcome: RowOutcome) {
        self.processed_rows += 1;
        match outcome {
            RowOutcome::Inserted => self.inserted_rows += 1,
            RowOutcome::Updated => self.updated_rows += 1,
            RowOutcome::Skipped => self.skipped_rows += 1,
            RowOutcome::Error => self.error_rows += 1,
        }
    }
}

/// Import job (maps to import_jobs table)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportJob {
    pub id: Uuid,
    pub church_id: i64,
    pub record_type: RecordType,
    pub format: ImportFormat,
    pub filename: String,
    pub size_bytes: i64,
    pub status: JobStatus,
    #[serde(flatten)]
    pub counters: JobCounters,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_text: Option<String>,
    pub created_by: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parameters for a new pending job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewImportJob {
    pub church_id: i64,
    pub record_type: RecordType,
    pub format: ImportFormat,
    pub filename: String,
    pub size_bytes: i64,
    pub created_by: Option<i64>,
}

/// Uploaded source file (maps to import_files table)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ImportFile {
    pub job_id: Uuid,
    pub storage_path: String,
    pub original_name: String,
    pub mime_type: Option<String>,
    pub size_bytes: i64,
    pub sha256: String,
}

/// Per-run options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportOptions {
    /// Provenance label stored with every written record; the controller's
    /// configured label when unset
    pub source_system: Option<String>,
    /// Classify rows without writing them
    pub dry_run: bool,
}
