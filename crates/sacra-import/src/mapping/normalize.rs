//! Value normalization: whitespace and dates

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// Trim and collapse internal whitespace runs; empty results are absent
pub fn normalize_text(raw: &str) -> Option<String> {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

/// Fallback formats, tried after any caller-supplied ones.
/// ISO, US, EU and long-textual month forms, in that order.
pub const DEFAULT_FALLBACK_FORMATS: &[&str] = &[
    "YYYY-MM-DD",
    "MM/DD/YYYY",
    "M/D/YYYY",
    "YYYY/MM/DD",
    "DD/MM/YYYY",
    "D/M/YYYY",
    "MMM D, YYYY",
    "MMMM D, YYYY",
    "D-M-YYYY",
    "DD-MMM-YYYY",
];

/// Year assumed for dates written without one ("2/15")
pub const DEFAULT_YEARLESS_YEAR: i32 = 2001;

/// Date parsing tables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateConfig {
    /// Formats tried after the mapping's own list
    pub fallback_formats: Vec<String>,
    /// Year used by the generic parse for month/day-only values
    pub yearless_year: i32,
}

impl Default for DateConfig {
    fn default() -> Self {
        Self {
            fallback_formats: DEFAULT_FALLBACK_FORMATS.iter().map(|s| s.to_string()).collect(),
            yearless_year: DEFAULT_YEARLESS_YEAR,
        }
    }
}

impl DateConfig {
    /// Day-first ordering: EU forms ahead of US forms
    pub fn day_first() -> Self {
        let formats = [
            "YYYY-MM-DD",
            "DD/MM/YYYY",
            "D/M/YYYY",
            "D-M-YYYY",
            "DD.MM.YYYY",
            "YYYY/MM/DD",
            "MM/DD/YYYY",
            "M/D/YYYY",
            "D MMMM YYYY",
            "MMM D, YYYY",
            "MMMM D, YYYY",
            "DD-MMM-YYYY",
        ];
        Self {
            fallback_formats: formats.iter().map(|s| s.to_string()).collect(),
            ..Self::default()
        }
    }
}

const TOKENS: &[(&str, &str)] = &[
    ("YYYY", "%Y"),
    ("YY", "%y"),
    ("MMMM", "%B"),
    ("MMM", "%b"),
    ("MM", "%m"),
    ("M", "%m"),
    ("DD", "%d"),
    ("D", "%d"),
    ("HH", "%H"),
    ("H", "%H"),
    ("mm", "%M"),
    ("ss", "%S"),
];

/// Translate a `YYYY-MM-DD` style pattern into a chrono format string.
/// Patterns that already contain `%` are taken as chrono formats.
pub fn translate_format(pattern: &str) -> String {
    if pattern.contains('%') {
        return pattern.to_string();
    }

    let mut out = String::with_capacity(pattern.len() + 4);
    let mut rest = pattern;
    'scan: while !rest.is_empty() {
        for (token, spec) in TOKENS {
            if let Some(tail) = rest.strip_prefix(token) {
                out.push_str(spec);
                rest = tail;
                continue 'scan;
            }
        }
        let mut chars = rest.chars();
        if let Some(c) = chars.next() {
            out.push(c);
        }
        rest = chars.as_str();
    }
    out
}

const GENERIC_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
];

const GENERIC_DATE_FORMATS: &[&str] = &[
    "%Y%m%d",
    "%d %B %Y",
    "%d %b %Y",
    "%B %d %Y",
    "%b %d %Y",
    "%A, %B %d, %Y",
    "%a, %d %b %Y",
    "%a %b %d %Y",
    "%Y.%m.%d",
];

/// Ordered date parser: mapping formats, then fallbacks, then a generic attempt
#[derive(Debug, Clone)]
pub struct DateParser {
    formats: Vec<String>,
    yearless_year: i32,
}

impl DateParser {
    pub fn new(preferred: &[String], config: &DateConfig) -> Self {
        let formats = preferred
            .iter()
            .chain(config.fallback_formats.iter())
            .map(|p| translate_format(p))
            .collect();
        Self {
            formats,
            yearless_year: config.yearless_year,
        }
    }

    /// First successful parse wins; total failure is `None`
    pub fn parse(&self, raw: &str) -> Option<NaiveDate> {
        let value = normalize_text(raw)?;
        self.formats
            .iter()
            .find_map(|fmt| NaiveDate::parse_from_str(&value, fmt).ok())
            .or_else(|| self.parse_generic(&value))
    }

    fn parse_generic(&self, value: &str) -> Option<NaiveDate> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
            return Some(dt.date_naive());
        }
        if let Ok(dt) = DateTime::parse_from_rfc2822(value) {
            return Some(dt.date_naive());
        }
        if let Some(dt) = GENERIC_DATETIME_FORMATS
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        {
            return Some(dt.date());
        }
        if let Some(date) = GENERIC_DATE_FORMATS
            .iter()
            .find_map(|fmt| NaiveDate::parse_from_str(value, fmt).ok())
        {
            return Some(date);
        }
        if value.len() == 4 && value.bytes().all(|b| b.is_ascii_digit()) {
            let year = value.parse().ok()?;
            return NaiveDate::from_ymd_opt(year, 1, 1);
        }
        self.parse_yearless(value)
    }

    /// "2/15", "2-15" or "February 15" with the configured default year
    fn parse_yearless(&self, value: &str) -> Option<NaiveDate> {
        let with_year = format!("{} {}", value, self.yearless_year);
        ["%m/%d %Y", "%m-%d %Y", "%B %d %Y", "%b %d %Y"]
            .iter()
            .find_map(|fmt| NaiveDate::parse_from_str(&with_year, fmt).ok())
            .filter(|d| d.year() == self.yearless_year)
    }
}

impl Default for DateParser {
    fn default() -> Self {
        Self::new(&[], &DateConfig::default())
    }
}
