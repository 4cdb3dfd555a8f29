//! Field mapping and normalization
//!
//! A [`FieldMapping`] says which source columns feed which canonical field.
//! [`FieldMapper`] applies it to one raw record at a time, normalizing text,
//! parsing dates and assembling list fields. Unmapped source columns are
//! ignored.
//!
//! Two document shapes are accepted, in JSON or YAML:
//!
//! ```yaml
//! # canonical -> source
//! columns:
//!   person_first: First Name
//!   godparents: [Godparent 1, Godparent 2]
//! date_formats: [DD/MM/YYYY]
//! ```
//!
//! ```json
//! {"Date": "baptism_date", "Name": "person_first", "godparents": ["gp1", "gp2"]}
//! ```
//!
//! In the flat shape a string value names the canonical field for the key's
//! source column, and a list value names the source columns for the key's
//! canonical field.

pub mod normalize;
pub mod suggest;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{ImportError, ImportResult, ParseError, ParseErrorKind};
use crate::models::RecordType;
use crate::parser::RawRecord;
use crate::records::{CanonicalRecord, FieldKind, FieldValue};

pub use normalize::{normalize_text, DateConfig, DateParser};
pub use suggest::{SuggestionRule, SuggestionRules};

/// Source-to-canonical column mapping plus preferred date formats
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawMapping", into = "MappingDocument")]
pub struct FieldMapping {
    columns: BTreeMap<String, Vec<String>>,
    date_formats: Vec<String>,
}

impl FieldMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map one source column onto a canonical field. Mapping several
    /// columns onto the same field keeps them in call order.
    pub fn map(mut self, source: impl Into<String>, canonical: impl Into<String>) -> Self {
        self.add(source.into(), canonical.into());
        self
    }

    /// Map several source columns onto one (list) field, in order
    pub fn map_list<I, S>(mut self, canonical: impl Into<String>, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let canonical = canonical.into();
        for source in sources {
            self.add(source.into(), canonical.clone());
        }
        self
    }

    pub fn with_date_formats<I, S>(mut self, formats: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.date_formats = formats.into_iter().map(Into::into).collect();
        self
    }

    fn add(&mut self, source: String, canonical: String) {
        let sources = self.columns.entry(canonical).or_default();
        if !sources.contains(&source) {
            sources.push(source);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Source columns feeding a canonical field
    pub fn sources(&self, canonical: &str) -> &[String] {
        self.columns.get(canonical).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn targets(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.columns.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn date_formats(&self) -> &[String] {
        &self.date_formats
    }

    /// Canonical names this mapping targets that the record type lacks
    pub fn unknown_targets(&self, record_type: RecordType) -> Vec<String> {
        self.columns
            .keys()
            .filter(|name| record_type.field(name).is_none())
            .cloned()
            .collect()
    }

    pub fn from_json_str(text: &str) -> ImportResult<Self> {
        serde_json::from_str(text).map_err(|e| ImportError::Mapping(format!("Invalid JSON mapping: {}", e)))
    }

    pub fn from_yaml_str(text: &str) -> ImportResult<Self> {
        serde_yaml::from_str(text).map_err(|e| ImportError::Mapping(format!("Invalid YAML mapping: {}", e)))
    }

    /// Load a mapping file; `.json` is read as JSON, anything else as YAML
    pub async fn from_path(path: impl AsRef<Path>) -> ImportResult<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            ImportError::Mapping(format!("Cannot read mapping file {}: {}", path.display(), e))
        })?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json_str(&text)
        } else {
            Self::from_yaml_str(&text)
        }
    }
}

type RawMapping = BTreeMap<String, serde_json::Value>;

#[derive(Serialize)]
struct MappingDocument {
    columns: BTreeMap<String, SourceColumns>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    date_formats: Vec<String>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum SourceColumns {
    One(String),
    Many(Vec<String>),
}

impl From<FieldMapping> for MappingDocument {
    fn from(mapping: FieldMapping) -> Self {
        let columns = mapping
            .columns
            .into_iter()
            .map(|(canonical, mut sources)| {
                let value = if sources.len() == 1 {
                    SourceColumns::One(sources.remove(0))
                } else {
                    SourceColumns::Many(sources)
                };
                (canonical, value)
            })
            .collect();
        Self {
            columns,
            date_formats: mapping.date_formats,
        }
    }
}

fn string_list(key: &str, value: &serde_json::Value) -> Result<Vec<String>, String> {
    match value {
        serde_json::Value::String(s) => Ok(vec![s.clone()]),
        serde_json::Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| format!("`{}` must list column names as strings", key))
            })
            .collect(),
        _ => Err(format!("`{}` must be a string or a list of strings", key)),
    }
}

impl TryFrom<RawMapping> for FieldMapping {
    type Error = String;

    fn try_from(raw: RawMapping) -> Result<Self, Self::Error> {
        let mut mapping = FieldMapping::default();

        for (key, value) in &raw {
            match key.as_str() {
                "date_formats" | "dateFormats" => {
                    mapping.date_formats = string_list(key, value)?;
                },
                "columns" => {
                    let columns = value
                        .as_object()
                        .ok_or_else(|| "`columns` must map canonical fields to source columns".to_string())?;
                    for (canonical, sources) in columns {
                        for source in string_list(canonical, sources)? {
                            mapping.add(source, canonical.clone());
                        }
                    }
                },
                _ => match value {
                    serde_json::Value::String(canonical) => mapping.add(key.clone(), canonical.clone()),
                    serde_json::Value::Array(_) => {
                        for source in string_list(key, value)? {
                            mapping.add(source, key.clone());
                        }
                    },
                    serde_json::Value::Null => {},
                    _ => return Err(format!("Unsupported mapping value for `{}`", key)),
                },
            }
        }

        Ok(mapping)
    }
}

/// A date value that was supplied but matched no format
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnparsedDate {
    pub field: &'static str,
    pub raw: String,
}

/// Output of mapping one raw record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedRecord {
    pub record: CanonicalRecord,
    pub unparsed_dates: Vec<UnparsedDate>,
}

impl MappedRecord {
    /// Reject the row when an identity date was supplied but unparseable.
    /// Other unparseable dates stay absent.
    pub fn into_checked(self, row: u64) -> Result<CanonicalRecord, ParseError> {
        let identity_dates = self.record.record_type().identity_date_fields();
        if let Some(bad) = self.unparsed_dates.iter().find(|d| identity_dates.contains(&d.field)) {
            return Err(ParseError::new(
                row,
                ParseErrorKind::UnparseableDate,
                format!("{} value {:?} matches no date format", bad.field, bad.raw),
            ));
        }
        Ok(self.record)
    }
}

/// Applies a [`FieldMapping`] to raw records of one record type
#[derive(Debug, Clone)]
pub struct FieldMapper {
    record_type: RecordType,
    mapping: FieldMapping,
    dates: DateParser,
}

impl FieldMapper {
    pub fn new(record_type: RecordType, mapping: FieldMapping, date_config: &DateConfig) -> Self {
        let unknown = mapping.unknown_targets(record_type);
        if !unknown.is_empty() {
            tracing::warn!(
                record_type = %record_type,
                fields = ?unknown,
                "Mapping targets fields this record type does not have; they will be ignored"
            );
        }
        let dates = DateParser::new(mapping.date_formats(), date_config);
        Self {
            record_type,
            mapping,
            dates,
        }
    }

    pub fn record_type(&self) -> RecordType {
        self.record_type
    }

    pub fn mapping(&self) -> &FieldMapping {
        &self.mapping
    }

    pub fn map(&self, raw: &dyn RawRecord) -> MappedRecord {
        let mut record = CanonicalRecord::new(self.record_type);
        let mut unparsed_dates = Vec::new();

        for (canonical, sources) in self.mapping.targets() {
            let Some(spec) = self.record_type.field(canonical) else {
                continue;
            };

            match spec.kind {
                FieldKind::Text { .. } => {
                    if let Some(value) = sources.iter().find_map(|s| raw.get(s).and_then(normalize_text)) {
                        record.assign(spec.name, FieldValue::Text(value));
                    }
                },
                FieldKind::Date => {
                    let Some(value) = sources.iter().find_map(|s| raw.get(s).and_then(normalize_text)) else {
                        continue;
                    };
                    match self.dates.parse(&value) {
                        Some(date) => {
                            record.assign(spec.name, FieldValue::Date(date));
                        },
                        None => unparsed_dates.push(UnparsedDate {
                            field: spec.name,
                            raw: value,
                        }),
                    }
                },
                FieldKind::List => {
                    let values: Vec<String> =
                        sources.iter().filter_map(|s| raw.get(s).and_then(normalize_text)).collect();
                    record.assign(spec.name, FieldValue::List(values));
                },
            }
        }

        MappedRecord { record, unparsed_dates }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::parser::MapRecord;
    use chrono::NaiveDate;

    fn baptism_mapper(mapping: FieldMapping) -> FieldMapper {
        FieldMapper::new(RecordType::Baptisms, mapping, &DateConfig::default())
    }

    #[test]
    fn test_list_field_drops_empty_values() {
        let raw = MapRecord::from_pairs([
            ("First", "Anna"),
            ("godparent1", "Peter Jones"),
            ("godparent2", ""),
        ]);
        let mapping = FieldMapping::new()
            .map("First", "person_first")
            .map_list("godparents", ["godparent1", "godparent2"]);

        let mapped = baptism_mapper(mapping).map(&raw);
        let CanonicalRecord::Baptism(record) = mapped.record else {
            panic!("expected a baptism record");
        };
        assert_eq!(record.godparents, vec!["Peter Jones".to_string()]);
    }

    #[test]
    fn test_text_is_normalized_and_unmapped_columns_ignored() {
        let raw = MapRecord::from_pairs([("Name", "  Helen \t  Russo "), ("Parish", "St. Mary"), ("Notes", "   ")]);
        let mapping = FieldMapping::new().map("Name", "person_first").map("Notes", "notes");

        let mapped = baptism_mapper(mapping).map(&raw);
        assert_eq!(mapped.record.text("person_first"), Some("Helen Russo"));
        assert_eq!(mapped.record.text("notes"), None);
        assert_eq!(mapped.record.text("place_name"), None);
    }

    #[test]
    fn test_identity_date_failure_rejects_row() {
        let raw = MapRecord::from_pairs([("Name", "Helen Russo"), ("Date", "sometime in spring")]);
        let mapping = FieldMapping::new().map("Name", "person_first").map("Date", "baptism_date");

        let mapped = baptism_mapper(mapping).map(&raw);
        assert_eq!(mapped.unparsed_dates.len(), 1);
        let err = mapped.into_checked(5).unwrap_err();
        assert_eq!(err.row, 5);
        assert_eq!(err.kind, ParseErrorKind::UnparseableDate);
    }

    #[test]
    fn test_non_identity_date_failure_is_absent() {
        let raw = MapRecord::from_pairs([("Name", "Helen Russo"), ("Born", "unknown")]);
        let mapping = FieldMapping::new().map("Name", "person_first").map("Born", "birth_date");

        let record = baptism_mapper(mapping).map(&raw).into_checked(1).unwrap();
        assert_eq!(record.date("birth_date"), None);
        assert_eq!(record.text("person_first"), Some("Helen Russo"));
    }

    #[test]
    fn test_flat_json_mapping() {
        let mapping = FieldMapping::from_json_str(
            r#"{"Date": "baptism_date", "Name": "person_first", "godparents": ["gp1", "gp2"], "dateFormats": ["DD.MM.YYYY"]}"#,
        )
        .unwrap();
        assert_eq!(mapping.sources("baptism_date"), ["Date".to_string()]);
        assert_eq!(mapping.sources("godparents"), ["gp1".to_string(), "gp2".to_string()]);
        assert_eq!(mapping.date_formats(), ["DD.MM.YYYY".to_string()]);
    }

    #[test]
    fn test_yaml_columns_mapping() {
        let mapping = FieldMapping::from_yaml_str(
            "columns:\n  person_first: First Name\n  godparents:\n    - Sponsor 1\n    - Sponsor 2\ndate_formats:\n  - DD/MM/YYYY\n",
        )
        .unwrap();
        assert_eq!(mapping.sources("person_first"), ["First Name".to_string()]);
        assert_eq!(mapping.sources("godparents").len(), 2);

        let raw = MapRecord::from_pairs([("First Name", "Marco"), ("When", "03/04/1950")]);
        let mapping = mapping.map("When", "baptism_date");
        let record = baptism_mapper(mapping).map(&raw).into_checked(1).unwrap();
        assert_eq!(record.date("baptism_date"), NaiveDate::from_ymd_opt(1950, 4, 3));
    }

    #[test]
    fn test_mapping_rejects_bad_values() {
        assert!(FieldMapping::from_json_str(r#"{"Date": 5}"#).is_err());
        assert!(FieldMapping::from_json_str(r#"{"columns": "person_first"}"#).is_err());
    }

    #[test]
    fn test_unknown_targets() {
        let mapping = FieldMapping::new().map("Groom", "groom_first").map("Name", "person_first");
        assert_eq!(mapping.unknown_targets(RecordType::Baptisms), vec!["groom_first".to_string()]);
    }

    #[test]
    fn test_serialized_mapping_reloads() {
        let mapping = FieldMapping::new()
            .map("Name", "person_first")
            .map_list("godparents", ["gp1", "gp2"])
            .with_date_formats(["DD/MM/YYYY"]);
        let json = serde_json::to_string(&mapping).unwrap();
        assert_eq!(FieldMapping::from_json_str(&json).unwrap(), mapping);
    }
}
