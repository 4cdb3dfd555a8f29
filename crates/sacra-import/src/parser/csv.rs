//! Delimited text parser

use std::io::BufRead;
use std::sync::Arc;

use super::{Emit, IndexedRecord, RowResult};
use crate::error::{ImportError, ImportResult, ParseError, ParseErrorKind};

const DELIMITERS: [u8; 4] = [b',', b';', b'\t', b'|'];

/// Pick the delimiter that occurs most often on the header line
fn sniff_delimiter(head: &[u8]) -> u8 {
    let line = head.split(|b| *b == b'\n').next().unwrap_or_default();
    DELIMITERS
        .iter()
        .copied()
        .map(|d| (d, line.iter().filter(|b| **b == d).count()))
        .filter(|(_, n)| *n > 0)
        .max_by_key(|(_, n)| *n)
        .map(|(d, _)| d)
        .unwrap_or(b',')
}

pub(super) fn parse<R: BufRead>(mut reader: R, emit: &mut Emit<'_>) -> ImportResult<()> {
    let delimiter = sniff_delimiter(reader.fill_buf()?);

    let mut rdr = ::csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .delimiter(delimiter)
        .trim(::csv::Trim::All)
        .from_reader(reader);

    let headers: Vec<String> = rdr
        .headers()
        .map_err(|e| ImportError::FatalIo(format!("Cannot read CSV header: {}", e)))?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').trim().to_string())
        .collect();
    if headers.iter().all(String::is_empty) {
        return Err(ImportError::FatalIo("CSV source has no header row".to_string()));
    }
    let width = headers.len();
    let headers = Arc::new(headers);

    let mut record = ::csv::StringRecord::new();
    let mut row = 0u64;
    loop {
        let item: RowResult = match rdr.read_record(&mut record) {
            Ok(false) => break,
            Ok(true) => {
                if record.iter().all(str::is_empty) {
                    continue;
                }
                row += 1;
                if record.len() > width {
                    Err(ParseError::new(
                        row,
                        ParseErrorKind::ArityMismatch,
                        format!("{} values for {} columns", record.len(), width),
                    ))
                } else {
                    let values = record
                        .iter()
                        .map(|v| if v.is_empty() { None } else { Some(v.to_string()) })
                        .collect();
                    Ok(Box::new(IndexedRecord::new(headers.clone(), values)))
                }
            },
            Err(e) => {
                if let ::csv::ErrorKind::Io(io) = e.kind() {
                    return Err(ImportError::FatalIo(format!("Cannot read CSV source: {}", io)));
                }
                row += 1;
                let kind = match e.kind() {
                    ::csv::ErrorKind::Utf8 { .. } => ParseErrorKind::Encoding,
                    _ => ParseErrorKind::Malformed,
                };
                Err(ParseError::new(row, kind, e.to_string()))
            },
        };

        if emit(item).is_break() {
            break;
        }
    }

    tracing::debug!(rows = row, columns = width, "CSV parse finished");
    Ok(())
}
