//! XML parser
//!
//! Walks the element tree looking for record elements: any element whose
//! path ends with one of the configured container paths, or a root element
//! named like a single record. Attributes and descendant text of a record
//! element become its fields; deeper descendants are keyed by their dotted
//! path below the record (`parents.father`).

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::io::BufRead;

use super::{Emit, MapRecord, ParserPatterns, RowResult};
use crate::error::{ImportError, ImportResult, ParseError, ParseErrorKind};

struct OpenRecord {
    depth: usize,
    record: MapRecord,
    text: String,
    error: Option<String>,
}

impl OpenRecord {
    fn new(depth: usize) -> Self {
        Self {
            depth,
            record: MapRecord::new(),
            text: String::new(),
            error: None,
        }
    }

    /// Add a field; repeated names get a `_2`, `_3`, ... suffix
    fn add(&mut self, name: String, value: &str) {
        let value = value.trim();
        if value.is_empty() {
            return;
        }
        let mut key = name.clone();
        let mut n = 2;
        while self.record.contains(&key) {
            key = format!("{}_{}", name, n);
            n += 1;
        }
        self.record.insert(key, Some(value.to_string()));
    }

    fn add_attributes(&mut self, prefix: Option<&str>, element: &BytesStart<'_>) {
        for attr in element.attributes() {
            let attr = match attr {
                Ok(attr) => attr,
                Err(e) => {
                    self.error.get_or_insert_with(|| e.to_string());
                    continue;
                },
            };
            if attr.key.as_ref().starts_with(b"xmlns") {
                continue;
            }
            let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
            let name = match prefix {
                Some(p) => format!("{}.{}", p, key),
                None => key,
            };
            match attr.unescape_value() {
                Ok(value) => self.add(name, &value),
                Err(e) => {
                    self.error.get_or_insert_with(|| e.to_string());
                },
            }
        }
    }

    fn finish(self, row: u64) -> RowResult {
        if let Some(error) = self.error {
            return Err(ParseError::new(row, ParseErrorKind::Malformed, error));
        }
        if self.record.is_empty() {
            return Err(ParseError::new(row, ParseErrorKind::NotARecord, "record element has no fields"));
        }
        Ok(Box::new(self.record))
    }
}

struct RecordMatcher {
    paths: Vec<Vec<String>>,
    roots: Vec<String>,
}

impl RecordMatcher {
    fn new(patterns: &ParserPatterns) -> Self {
        let paths = patterns
            .xml_record_paths
            .iter()
            .map(|p| p.split('/').filter(|s| !s.is_empty()).map(str::to_string).collect::<Vec<_>>())
            .filter(|p| !p.is_empty())
            .collect();
        Self {
            paths,
            roots: patterns.xml_single_roots.clone(),
        }
    }

    fn is_record(&self, stack: &[String]) -> bool {
        let suffix_match = self.paths.iter().any(|path| {
            stack.len() >= path.len()
                && stack[stack.len() - path.len()..]
                    .iter()
                    .zip(path)
                    .all(|(a, b)| a.eq_ignore_ascii_case(b))
        });
        suffix_match || (stack.len() == 1 && self.roots.iter().any(|r| r.eq_ignore_ascii_case(&stack[0])))
    }
}

fn element_name(element: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(element.local_name().as_ref()).into_owned()
}

pub(super) fn parse<R: BufRead>(
    reader: R,
    patterns: &ParserPatterns,
    emit: &mut Emit<'_>,
) -> ImportResult<()> {
    let matcher = RecordMatcher::new(patterns);
    let mut xml = Reader::from_reader(reader);
    xml.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut stack: Vec<String> = Vec::new();
    let mut open: Option<OpenRecord> = None;
    let mut row = 0u64;

    loop {
        let event = match xml.read_event_into(&mut buf) {
            Ok(event) => event,
            Err(quick_xml::Error::Io(e)) => {
                return Err(ImportError::FatalIo(format!("Cannot read XML source: {}", e)));
            },
            Err(e) => {
                if row == 0 {
                    return Err(ImportError::FatalIo(format!("Cannot parse XML source: {}", e)));
                }
                let failed_row = if open.is_some() { row } else { row + 1 };
                let message = format!("at byte {}: {}", xml.buffer_position(), e);
                tracing::warn!(row = failed_row, error = %message, "XML source is malformed");
                emit(Err(ParseError::new(failed_row, ParseErrorKind::Malformed, message)));
                return Ok(());
            },
        };

        match event {
            Event::Start(element) => {
                let name = element_name(&element);
                stack.push(name);
                if let Some(rec) = open.as_mut() {
                    rec.text.clear();
                    let path = stack[rec.depth..].join(".");
                    rec.add_attributes(Some(&path), &element);
                } else if matcher.is_record(&stack) {
                    row += 1;
                    let mut rec = OpenRecord::new(stack.len());
                    rec.add_attributes(None, &element);
                    open = Some(rec);
                }
            },
            Event::Empty(element) => {
                stack.push(element_name(&element));
                if let Some(rec) = open.as_mut() {
                    let path = stack[rec.depth..].join(".");
                    rec.add_attributes(Some(&path), &element);
                } else if matcher.is_record(&stack) {
                    row += 1;
                    let mut rec = OpenRecord::new(stack.len());
                    rec.add_attributes(None, &element);
                    if emit(rec.finish(row)).is_break() {
                        return Ok(());
                    }
                }
                stack.pop();
            },
            Event::Text(text) => {
                if let Some(rec) = open.as_mut() {
                    match text.unescape() {
                        Ok(value) => rec.text.push_str(&value),
                        Err(e) => {
                            rec.error.get_or_insert_with(|| e.to_string());
                        },
                    }
                }
            },
            Event::CData(data) => {
                if let Some(rec) = open.as_mut() {
                    rec.text.push_str(&String::from_utf8_lossy(&data));
                }
            },
            Event::End(_) => {
                let closes_record = open.as_ref().is_some_and(|rec| rec.depth == stack.len());
                if closes_record {
                    if let Some(rec) = open.take() {
                        if emit(rec.finish(row)).is_break() {
                            return Ok(());
                        }
                    }
                } else if let Some(rec) = open.as_mut() {
                    let path = stack[rec.depth..].join(".");
                    let text = std::mem::take(&mut rec.text);
                    rec.add(path, &text);
                }
                stack.pop();
            },
            Event::Eof => break,
            _ => {},
        }
        buf.clear();
    }

    if open.is_some() {
        emit(Err(ParseError::new(row, ParseErrorKind::Truncated, "source ended inside a record element")));
    }
    if row == 0 {
        return Err(ImportError::FatalIo("No record elements found in XML source".to_string()));
    }

    tracing::debug!(rows = row, "XML parse finished");
    Ok(())
}
