//! SQL dump parser
//!
//! Reads `INSERT INTO <table> (<columns>) VALUES (...), (...)` statements for
//! allow-listed tables and yields one record per value tuple as soon as the
//! tuple closes. Only the statement head is buffered, so a dump holding one
//! extended INSERT on a single line is read in constant memory. Everything
//! else in the dump (DDL, other tables, comments) is skipped.

use regex::Regex;
use std::io::{self, BufRead};
use std::sync::Arc;

use super::{Emit, IndexedRecord, ParserPatterns, RowResult};
use crate::error::{ImportError, ImportResult, ParseError, ParseErrorKind};

/// Longest statement head kept while looking for `VALUES`
const HEAD_LIMIT: usize = 64 * 1024;

type Tuple = Vec<Option<String>>;

/// Statement text before its values
enum Head {
    Insert {
        table: String,
        columns: Option<Arc<Vec<String>>>,
    },
    Other,
}

enum TupleStep {
    Tuple(Tuple),
    /// The rest of the statement has been skipped
    Malformed(String),
    End,
}

enum ScanError {
    Io(io::Error),
    Malformed(String),
}

impl From<io::Error> for ScanError {
    fn from(e: io::Error) -> Self {
        ScanError::Io(e)
    }
}

fn malformed<T>(message: &str) -> Result<T, ScanError> {
    Err(ScanError::Malformed(message.to_string()))
}

/// Character reader over a dump, with one character of lookahead
struct SqlReader<R> {
    reader: R,
    peeked: Option<char>,
}

impl<R: BufRead> SqlReader<R> {
    fn new(reader: R) -> Self {
        Self { reader, peeked: None }
    }

    fn next_byte(&mut self) -> io::Result<Option<u8>> {
        let byte = self.reader.fill_buf()?.first().copied();
        if byte.is_some() {
            self.reader.consume(1);
        }
        Ok(byte)
    }

    /// Invalid UTF-8 decodes as U+FFFD
    fn decode(&mut self) -> io::Result<Option<char>> {
        let Some(first) = self.next_byte()? else {
            return Ok(None);
        };
        let width = match first {
            0x00..=0x7f => return Ok(Some(char::from(first))),
            0xc0..=0xdf => 2,
            0xe0..=0xef => 3,
            0xf0..=0xf7 => 4,
            _ => return Ok(Some(char::REPLACEMENT_CHARACTER)),
        };
        let mut bytes = [first, 0, 0, 0];
        for slot in bytes.iter_mut().take(width).skip(1) {
            match self.reader.fill_buf()?.first().copied() {
                Some(b) if b & 0xc0 == 0x80 => {
                    *slot = b;
                    self.reader.consume(1);
                },
                _ => return Ok(Some(char::REPLACEMENT_CHARACTER)),
            }
        }
        Ok(Some(
            std::str::from_utf8(&bytes[..width])
                .ok()
                .and_then(|s| s.chars().next())
                .unwrap_or(char::REPLACEMENT_CHARACTER),
        ))
    }

    fn next(&mut self) -> io::Result<Option<char>> {
        match self.peeked.take() {
            Some(c) => Ok(Some(c)),
            None => self.decode(),
        }
    }

    fn peek(&mut self) -> io::Result<Option<char>> {
        if self.peeked.is_none() {
            self.peeked = self.decode()?;
        }
        Ok(self.peeked)
    }

    fn next_if_eq(&mut self, expected: char) -> io::Result<bool> {
        if self.peek()? == Some(expected) {
            self.peeked = None;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn skip_line(&mut self) -> io::Result<()> {
        while let Some(c) = self.next()? {
            if c == '\n' {
                break;
            }
        }
        Ok(())
    }

    /// Past the closing `*/`; the opening one is already consumed
    fn skip_block_comment(&mut self) -> io::Result<()> {
        while let Some(c) = self.next()? {
            if c == '*' && self.next_if_eq('/')? {
                break;
            }
        }
        Ok(())
    }

    /// Past the closing quote, copying the raw text into `out` when given
    fn copy_quoted(&mut self, quote: char, mut out: Option<&mut String>) -> io::Result<()> {
        let mut escaped = false;
        while let Some(c) = self.next()? {
            if let Some(out) = out.as_mut() {
                out.push(c);
            }
            if escaped {
                escaped = false;
            } else if c == '\\' && quote != '`' {
                escaped = true;
            } else if c == quote {
                if !self.next_if_eq(quote)? {
                    break;
                }
                if let Some(out) = out.as_mut() {
                    out.push(quote);
                }
            }
        }
        Ok(())
    }

    /// Read up to the values of the next statement. An INSERT head matching
    /// `insert` leaves the reader at its first tuple; any other statement is
    /// consumed through its `;`.
    fn next_head(&mut self, insert: &Regex) -> io::Result<Option<Head>> {
        let mut head = String::new();
        loop {
            let Some(c) = self.next()? else {
                return Ok((!head.trim().is_empty()).then_some(Head::Other));
            };
            let text = head.trim_end();
            if (c.is_whitespace() || c == '(') && head.len() < HEAD_LIMIT && ends_with_values(text) {
                if let Some(found) = match_insert(insert, text) {
                    self.peeked = Some(c);
                    return Ok(Some(found));
                }
            }
            match c {
                '\'' | '"' | '`' => {
                    let keep = head.len() < HEAD_LIMIT;
                    head.push(c);
                    self.copy_quoted(c, keep.then_some(&mut head))?;
                },
                '-' if at_token_boundary(&head) && self.next_if_eq('-')? => {
                    self.skip_line()?;
                    head.push(' ');
                },
                '#' if head.trim().is_empty() => self.skip_line()?,
                '/' if self.next_if_eq('*')? => {
                    self.skip_block_comment()?;
                    head.push(' ');
                },
                ';' if head.trim().is_empty() => head.clear(),
                ';' => return Ok(Some(Head::Other)),
                _ if head.len() < HEAD_LIMIT => head.push(c),
                _ => {},
            }
        }
    }

    /// Through the `;` ending the current statement
    fn skip_statement(&mut self) -> io::Result<()> {
        while let Some(c) = self.next()? {
            match c {
                '\'' | '"' | '`' => self.copy_quoted(c, None)?,
                '/' if self.next_if_eq('*')? => self.skip_block_comment()?,
                '-' if self.next_if_eq('-')? => self.skip_line()?,
                ';' => break,
                _ => {},
            }
        }
        Ok(())
    }

    fn skip_whitespace(&mut self) -> io::Result<()> {
        while self.peek()?.is_some_and(char::is_whitespace) {
            self.peeked = None;
        }
        Ok(())
    }

    /// Whitespace and comments between tuples
    fn skip_gap(&mut self) -> io::Result<()> {
        loop {
            match self.peek()? {
                Some(c) if c.is_whitespace() => self.peeked = None,
                Some('-') => {
                    self.peeked = None;
                    if !self.next_if_eq('-')? {
                        return Ok(());
                    }
                    self.skip_line()?;
                },
                Some('/') => {
                    self.peeked = None;
                    if !self.next_if_eq('*')? {
                        return Ok(());
                    }
                    self.skip_block_comment()?;
                },
                _ => return Ok(()),
            }
        }
    }

    fn next_tuple(&mut self) -> io::Result<TupleStep> {
        self.skip_gap()?;
        if self.next_if_eq(',')? {
            self.skip_gap()?;
        }
        match self.peek()? {
            None => Ok(TupleStep::End),
            Some(';') => {
                self.peeked = None;
                Ok(TupleStep::End)
            },
            Some('(') => {
                self.peeked = None;
                match self.read_values() {
                    Ok(values) => Ok(TupleStep::Tuple(values)),
                    Err(ScanError::Malformed(message)) => self.abandon(message),
                    Err(ScanError::Io(e)) => Err(e),
                }
            },
            // trailing clause such as ON CONFLICT / ON DUPLICATE KEY
            Some(c) if c.is_alphabetic() => {
                self.skip_statement()?;
                Ok(TupleStep::End)
            },
            Some(c) => self.abandon(format!("expected '(' but found '{}'", c)),
        }
    }

    fn abandon(&mut self, message: String) -> io::Result<TupleStep> {
        self.skip_statement()?;
        Ok(TupleStep::Malformed(message))
    }

    fn read_values(&mut self) -> Result<Tuple, ScanError> {
        let mut values = Vec::new();
        loop {
            self.skip_whitespace()?;
            let value = match self.peek()? {
                Some(q @ ('\'' | '"')) => {
                    self.peeked = None;
                    Some(self.read_quoted(q)?)
                },
                Some(_) => self.read_bare()?,
                None => return malformed("unterminated value tuple"),
            };
            values.push(value);
            self.skip_whitespace()?;
            match self.peek()? {
                Some(',') => self.peeked = None,
                Some(')') => {
                    self.peeked = None;
                    return Ok(values);
                },
                Some(c) => return Err(ScanError::Malformed(format!("unexpected '{}' in value tuple", c))),
                None => return malformed("unterminated value tuple"),
            }
        }
    }

    fn read_quoted(&mut self, quote: char) -> Result<String, ScanError> {
        let mut out = String::new();
        loop {
            match self.next()? {
                None => return malformed("unterminated string literal"),
                Some('\\') => match self.next()? {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('r') => out.push('\r'),
                    Some('0') => out.push('\0'),
                    Some(c) => out.push(c),
                    None => return malformed("unterminated string literal"),
                },
                Some(c) if c == quote => {
                    if self.next_if_eq(quote)? {
                        out.push(quote);
                    } else {
                        return Ok(out);
                    }
                },
                Some(c) => out.push(c),
            }
        }
    }

    /// Unquoted token; the bare word NULL is an absent value
    fn read_bare(&mut self) -> Result<Option<String>, ScanError> {
        let mut token = String::new();
        let mut depth = 0usize;
        while let Some(c) = self.peek()? {
            match c {
                ',' | ')' if depth == 0 => break,
                '(' => depth += 1,
                ')' => depth -= 1,
                _ => {},
            }
            token.push(c);
            self.peeked = None;
        }
        let token = token.trim();
        if token.is_empty() {
            malformed("empty value in tuple")
        } else if token.eq_ignore_ascii_case("NULL") {
            Ok(None)
        } else {
            Ok(Some(token.to_string()))
        }
    }
}

fn at_token_boundary(head: &str) -> bool {
    head.chars()
        .last()
        .is_none_or(|c| c.is_whitespace() || c == ',' || c == '(')
}

fn ends_with_values(head: &str) -> bool {
    head.get(head.len().saturating_sub(6)..)
        .is_some_and(|tail| tail.eq_ignore_ascii_case("VALUES"))
}

fn match_insert(insert: &Regex, head: &str) -> Option<Head> {
    let caps = insert.captures(head)?;
    let table = caps.name("table")?.as_str();
    let table = unquote_ident(table.rsplit('.').next().unwrap_or(table));
    let columns = caps
        .name("columns")
        .map(|m| Arc::new(m.as_str().split(',').map(unquote_ident).collect()));
    Some(Head::Insert { table, columns })
}

fn unquote_ident(ident: &str) -> String {
    ident.trim().trim_matches(|c| matches!(c, '`' | '"' | '[' | ']')).to_string()
}

pub(super) fn parse<R: BufRead>(
    reader: R,
    patterns: &ParserPatterns,
    emit: &mut Emit<'_>,
) -> ImportResult<()> {
    let insert = patterns.sql_insert_regex()?;
    let read_error = |e: io::Error| ImportError::FatalIo(format!("Cannot read SQL source: {}", e));
    let mut sql = SqlReader::new(reader);
    let mut row = 0u64;
    let mut matched = 0usize;

    while let Some(head) = sql.next_head(&insert).map_err(read_error)? {
        let Head::Insert { table, columns } = head else {
            continue;
        };
        if !patterns.sql_tables.iter().any(|t| t.eq_ignore_ascii_case(&table)) {
            tracing::debug!(table = %table, "Skipping INSERT for table outside the allow-list");
            sql.skip_statement().map_err(read_error)?;
            continue;
        }
        matched += 1;

        let Some(columns) = columns else {
            row += 1;
            let err = ParseError::new(
                row,
                ParseErrorKind::Malformed,
                format!("INSERT INTO {} has no column list", table),
            );
            if emit(Err(err)).is_break() {
                return Ok(());
            }
            sql.skip_statement().map_err(read_error)?;
            continue;
        };

        loop {
            let item: RowResult = match sql.next_tuple().map_err(read_error)? {
                TupleStep::End => break,
                TupleStep::Tuple(values) if values.len() != columns.len() => Err(ParseError::new(
                    row + 1,
                    ParseErrorKind::ArityMismatch,
                    format!("{} values for {} columns", values.len(), columns.len()),
                )),
                TupleStep::Tuple(values) => Ok(Box::new(IndexedRecord::new(columns.clone(), values))),
                TupleStep::Malformed(message) => Err(ParseError::new(row + 1, ParseErrorKind::Malformed, message)),
            };
            row += 1;
            let statement_abandoned = item.as_ref().is_err_and(|e| e.kind == ParseErrorKind::Malformed);
            if emit(item).is_break() {
                return Ok(());
            }
            if statement_abandoned {
                break;
            }
        }
    }

    if matched == 0 {
        return Err(ImportError::FatalIo(format!(
            "No INSERT statements for {} found in SQL source",
            patterns.sql_tables.join(", ")
        )));
    }

    tracing::debug!(rows = row, statements = matched, "SQL parse finished");
    Ok(())
}
