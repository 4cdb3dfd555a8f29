//! Import error taxonomy
//!
//! Errors fall into two classes. Fatal errors (unreadable file, unreachable
//! store, cancellation) abort the job and move it to `error`. Row errors
//! (parse, validation, constraint) are counted at the row boundary and never
//! escape the row loop.

use serde::Serialize;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::models::JobStatus;

/// Result type alias for import operations
pub type ImportResult<T> = std::result::Result<T, ImportError>;

/// How an error affects the job that hit it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Aborts the job
    Fatal,
    /// Counted against one row; the job continues
    Row,
}

/// What went wrong with a single source row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseErrorKind {
    /// The row or element could not be tokenized
    Malformed,
    /// The row is not valid UTF-8
    Encoding,
    /// The row has a different number of values than its header/column list
    ArityMismatch,
    /// The element is not a record (e.g. a JSON scalar inside the record array)
    NotARecord,
    /// An identity date was supplied but matched no known format
    UnparseableDate,
    /// The source ended in the middle of a record
    Truncated,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ParseErrorKind::Malformed => "malformed",
            ParseErrorKind::Encoding => "encoding",
            ParseErrorKind::ArityMismatch => "arity mismatch",
            ParseErrorKind::NotARecord => "not a record",
            ParseErrorKind::UnparseableDate => "unparseable date",
            ParseErrorKind::Truncated => "truncated",
        };
        f.write_str(s)
    }
}

/// A single row that failed to parse
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("row {row}: {kind}: {message}")]
pub struct ParseError {
    /// 1-based position of the row among the source's records
    pub row: u64,
    pub kind: ParseErrorKind,
    pub message: String,
}

impl ParseError {
    pub fn new(row: u64, kind: ParseErrorKind, message: impl Into<String>) -> Self {
        Self {
            row,
            kind,
            message: message.into(),
        }
    }
}

/// Import engine errors
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("Fatal I/O error: {0}")]
    FatalIo(String),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Constraint error: {0}")]
    Constraint(String),

    #[error("cancelled")]
    Cancelled,

    #[error("Invalid job transition from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("Import job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Mapping error: {0}")]
    Mapping(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ImportError {
    /// Classify the error for the row loop
    pub fn class(&self) -> ErrorClass {
        match self {
            ImportError::Parse(_) | ImportError::Validation(_) | ImportError::Constraint(_) => {
                ErrorClass::Row
            },
            _ => ErrorClass::Fatal,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Fatal
    }

    /// Classify a store driver error
    ///
    /// Connection, pool and transport failures mean the store is unreachable.
    /// Errors reported by the database for one statement are constraint
    /// errors for that row, except the connection-exception (08),
    /// operator-intervention (57) and insufficient-resources (53) classes.
    pub fn from_store(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db) => {
                let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
                if code.starts_with("08") || code.starts_with("57") || code.starts_with("53") {
                    ImportError::FatalIo(format!("store unavailable ({}): {}", code, db.message()))
                } else if code.is_empty() {
                    ImportError::Constraint(db.message().to_string())
                } else {
                    ImportError::Constraint(format!("{} ({})", db.message(), code))
                }
            },
            sqlx::Error::Io(e) => ImportError::FatalIo(format!("store I/O error: {}", e)),
            sqlx::Error::Tls(e) => ImportError::FatalIo(format!("store TLS error: {}", e)),
            sqlx::Error::Protocol(msg) => ImportError::FatalIo(format!("store protocol error: {}", msg)),
            sqlx::Error::Configuration(e) => ImportError::FatalIo(format!("store configuration error: {}", e)),
            sqlx::Error::PoolTimedOut => ImportError::FatalIo("store connection pool timed out".to_string()),
            sqlx::Error::PoolClosed => ImportError::FatalIo("store connection pool closed".to_string()),
            sqlx::Error::WorkerCrashed => ImportError::FatalIo("store connection worker crashed".to_string()),
            other => ImportError::Constraint(other.to_string()),
        }
    }
}

impl From<std::io::Error> for ImportError {
    fn from(err: std::io::Error) -> Self {
        ImportError::FatalIo(err.to_string())
    }
}

impl From<sacra_common::SacraError> for ImportError {
    fn from(err: sacra_common::SacraError) -> Self {
        match err {
            sacra_common::SacraError::Io(e) => ImportError::FatalIo(e.to_string()),
            sacra_common::SacraError::Config(msg) => ImportError::Config(msg),
            other => ImportError::FatalIo(other.to_string()),
        }
    }
}
