//! Format parsers
//!
//! Every format turns a source file into a sequence of [`RawRecord`]s. The
//! full-import path runs the parser on a blocking thread and hands rows over
//! a bounded channel, so a file is never held in memory. The preview path
//! collects a capped number of rows into a vector.
//!
//! A malformed row is yielded as `Err(ParseError)` and parsing continues.
//! Only a source that cannot be read at all, or that contains no record
//! container, fails the whole parse.

mod csv;
mod json;
mod sql;
mod xml;

use futures::Stream;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::io::{BufRead, BufReader};
use std::ops::ControlFlow;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::{ImportError, ImportResult, ParseError};
use crate::models::ImportFormat;

/// One source row, keyed by source column name
pub trait RawRecord: Debug + Send + Sync {
    /// Value of a source column; `None` when the column is missing or the
    /// source marks the value as null
    fn get(&self, field: &str) -> Option<&str>;

    /// Column names in source order
    fn field_names(&self) -> Vec<&str>;

    fn to_map(&self) -> BTreeMap<String, Option<String>> {
        self.field_names()
            .into_iter()
            .map(|name| (name.to_string(), self.get(name).map(str::to_string)))
            .collect()
    }
}

/// Row from a format with a shared header (CSV, SQL column list)
#[derive(Debug, Clone)]
pub struct IndexedRecord {
    names: Arc<Vec<String>>,
    values: Vec<Option<String>>,
}

impl IndexedRecord {
    pub fn new(names: Arc<Vec<String>>, values: Vec<Option<String>>) -> Self {
        Self { names, values }
    }
}

impl RawRecord for IndexedRecord {
    fn get(&self, field: &str) -> Option<&str> {
        let idx = self.names.iter().position(|n| n == field)?;
        self.values.get(idx)?.as_deref()
    }

    fn field_names(&self) -> Vec<&str> {
        self.names.iter().map(String::as_str).collect()
    }
}

/// Row whose fields are carried individually (JSON objects, XML elements)
#[derive(Debug, Clone, Default)]
pub struct MapRecord {
    fields: Vec<(String, Option<String>)>,
}

impl MapRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a field, keeping the first position if it repeats
    pub fn insert(&mut self, name: impl Into<String>, value: Option<String>) {
        let name = name.into();
        match self.fields.iter_mut().find(|(n, _)| *n == name) {
            Some((_, slot)) => *slot = value,
            None => self.fields.push((name, value)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.iter().any(|(n, _)| n == name)
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut record = Self::new();
        for (k, v) in pairs {
            record.insert(k, Some(v.into()));
        }
        record
    }
}

impl RawRecord for MapRecord {
    fn get(&self, field: &str) -> Option<&str> {
        self.fields.iter().find(|(n, _)| n == field).and_then(|(_, v)| v.as_deref())
    }

    fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|(n, _)| n.as_str()).collect()
    }
}

pub type BoxedRecord = Box<dyn RawRecord>;

/// A parsed row or the reason it could not be parsed
pub type RowResult = Result<BoxedRecord, ParseError>;

/// Callback a parser feeds rows into; `Break` stops the parse early
pub(crate) type Emit<'a> = dyn FnMut(RowResult) -> ControlFlow<()> + 'a;

/// Detection tables for the structured formats
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParserPatterns {
    /// Keys under which a JSON object may wrap the record array
    pub json_wrapper_keys: Vec<String>,
    /// Element paths (suffix-matched, `/`-separated) whose elements are records
    pub xml_record_paths: Vec<String>,
    /// Root element names treated as a single record
    pub xml_single_roots: Vec<String>,
    /// Tables whose INSERT statements are read from SQL dumps
    pub sql_tables: Vec<String>,
    /// Regex matched against a SQL statement's text up to its `VALUES`
    /// keyword, comments removed. Must capture a `table` group and may
    /// capture a `columns` group.
    pub sql_insert_pattern: String,
}

pub const DEFAULT_SQL_INSERT_PATTERN: &str = r#"(?is)^\s*INSERT\s+(?:IGNORE\s+)?INTO\s+(?P<table>(?:[`"\[]?\w+[`"\]]?\.)?[`"\[]?\w+[`"\]]?)\s*(?:\((?P<columns>[^)]*)\))?\s*VALUES$"#;

impl Default for ParserPatterns {
    fn default() -> Self {
        let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            json_wrapper_keys: strings(&["records", "data", "items"]),
            xml_record_paths: strings(&[
                "records/record",
                "rows/row",
                "items/item",
                "data/record",
                "baptisms/baptism",
                "marriages/marriage",
                "funerals/funeral",
            ]),
            xml_single_roots: strings(&["record", "row", "item", "baptism", "marriage", "funeral"]),
            sql_tables: strings(&["baptism_records", "marriage_records", "funeral_records"]),
            sql_insert_pattern: DEFAULT_SQL_INSERT_PATTERN.to_string(),
        }
    }
}

impl ParserPatterns {
    /// Compile `sql_insert_pattern`
    pub fn sql_insert_regex(&self) -> ImportResult<Regex> {
        let insert = Regex::new(&self.sql_insert_pattern)
            .map_err(|e| ImportError::Config(format!("Invalid SQL insert pattern: {}", e)))?;
        if !insert.capture_names().flatten().any(|name| name == "table") {
            return Err(ImportError::Config(
                "SQL insert pattern must capture a `table` group".to_string(),
            ));
        }
        Ok(insert)
    }
}

/// Run the parser for `format` over `reader`, feeding rows into `emit`
pub(crate) fn parse_with<R: BufRead>(
    format: ImportFormat,
    reader: R,
    patterns: &ParserPatterns,
    emit: &mut Emit<'_>,
) -> ImportResult<()> {
    match format {
        ImportFormat::Csv => csv::parse(reader, emit),
        ImportFormat::Json => json::parse(reader, patterns, emit),
        ImportFormat::Xml => xml::parse(reader, patterns, emit),
        ImportFormat::Sql => sql::parse(reader, patterns, emit),
    }
}

fn open_file(path: &Path) -> ImportResult<BufReader<std::fs::File>> {
    let file = std::fs::File::open(path)
        .map_err(|e| ImportError::FatalIo(format!("Cannot open {}: {}", path.display(), e)))?;
    Ok(BufReader::new(file))
}

/// Lazily parsed rows of one source file
///
/// Rows are produced by a blocking parser task and delivered through a
/// bounded channel. Dropping the source stops the parser at its next row.
pub struct RecordSource {
    rows: ReceiverStream<RowResult>,
    task: JoinHandle<ImportResult<()>>,
}

impl RecordSource {
    /// Open `path` and start parsing it. An unopenable file fails here.
    pub async fn open(
        path: impl AsRef<Path>,
        format: ImportFormat,
        patterns: ParserPatterns,
        capacity: usize,
    ) -> ImportResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| ImportError::FatalIo(format!("Cannot open {}: {}", path.display(), e)))?
            .into_std()
            .await;
        let reader = BufReader::new(file);
        let (tx, rx) = mpsc::channel(capacity.max(1));

        let task = tokio::task::spawn_blocking(move || {
            let mut forward = |row: RowResult| match tx.blocking_send(row) {
                Ok(()) => ControlFlow::Continue(()),
                Err(_) => ControlFlow::Break(()),
            };
            let result = parse_with(format, reader, &patterns, &mut forward);
            if let Err(ref e) = result {
                tracing::error!(path = %path.display(), format = %format, error = %e, "Source parse failed");
            }
            result
        });

        Ok(Self {
            rows: ReceiverStream::new(rx),
            task,
        })
    }

    /// Stop reading and report whether the parse failed as a whole
    pub async fn finish(self) -> ImportResult<()> {
        drop(self.rows);
        self.task
            .await
            .map_err(|e| ImportError::FatalIo(format!("Parser task failed: {}", e)))?
    }
}

impl Stream for RecordSource {
    type Item = RowResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rows).poll_next(cx)
    }
}

/// Read at most `limit` rows (records and row errors) into memory
pub fn read_rows(
    path: impl AsRef<Path>,
    format: ImportFormat,
    patterns: &ParserPatterns,
    limit: usize,
) -> ImportResult<Vec<RowResult>> {
    let reader = open_file(path.as_ref())?;
    read_rows_from(reader, format, patterns, limit)
}

pub fn read_rows_from<R: BufRead>(
    reader: R,
    format: ImportFormat,
    patterns: &ParserPatterns,
    limit: usize,
) -> ImportResult<Vec<RowResult>> {
    let mut rows = Vec::new();
    if limit == 0 {
        return Ok(rows);
    }
    let mut collect = |row: RowResult| {
        rows.push(row);
        if rows.len() >= limit {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    };
    parse_with(format, reader, patterns, &mut collect)?;
    Ok(rows)
}

/// Column names across the given rows, in first-seen order
pub fn detected_fields(rows: &[RowResult]) -> Vec<String> {
    let mut fields: Vec<String> = Vec::new();
    for record in rows.iter().filter_map(|r| r.as_ref().ok()) {
        for name in record.field_names() {
            if !fields.iter().any(|f| f == name) {
                fields.push(name.to_string());
            }
        }
    }
    fields
}
