//! Record fingerprints
//!
//! The fingerprint is the SHA-256 of a record type's identity tuple joined
//! with `|`. The tuple always has the same width: missing components are
//! empty strings. Dates enter the tuple in ISO form. A `|` or `\` inside a
//! component is backslash-escaped, so component boundaries are unambiguous.

use chrono::NaiveDate;
use sacra_common::checksum::sha256_hex;

use crate::records::{BaptismRecord, CanonicalRecord, FuneralRecord, MarriageRecord};

pub const FIELD_DELIMITER: &str = "|";

/// Ordered identity components of one record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityTuple(Vec<String>);

impl IdentityTuple {
    pub fn components(&self) -> &[String] {
        &self.0
    }

    /// True when no component carries a value
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(String::is_empty)
    }

    pub fn joined(&self) -> String {
        self.0.iter().map(|c| escape(c)).collect::<Vec<_>>().join(FIELD_DELIMITER)
    }

    pub fn hash(&self) -> String {
        sha256_hex(self.joined().as_bytes())
    }
}

fn escape(component: &str) -> String {
    component.replace('\\', "\\\\").replace(FIELD_DELIMITER, "\\|")
}

fn join_present(parts: &[&Option<String>], sep: &str) -> String {
    parts
        .iter()
        .filter_map(|p| p.as_deref())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(sep)
}

fn iso(date: Option<NaiveDate>) -> String {
    date.map(|d| d.format("%Y-%m-%d").to_string()).unwrap_or_default()
}

fn text(value: &Option<String>) -> String {
    value.clone().unwrap_or_default()
}

fn register_ref(book: &Option<String>, page: &Option<String>, entry: &Option<String>) -> String {
    join_present(&[book, page, entry], "/")
}

fn baptism_identity(r: &BaptismRecord) -> Vec<String> {
    vec![
        join_present(&[&r.person_first, &r.person_middle, &r.person_last], " "),
        iso(r.baptism_date),
        text(&r.certificate_no),
        register_ref(&r.book_no, &r.page_no, &r.entry_no),
    ]
}

fn marriage_identity(r: &MarriageRecord) -> Vec<String> {
    vec![
        join_present(&[&r.groom_first, &r.groom_middle, &r.groom_last], " "),
        join_present(&[&r.bride_first, &r.bride_middle, &r.bride_last], " "),
        iso(r.marriage_date),
        text(&r.certificate_no),
        register_ref(&r.book_no, &r.page_no, &r.entry_no),
    ]
}

fn funeral_identity(r: &FuneralRecord) -> Vec<String> {
    vec![
        join_present(&[&r.deceased_first, &r.deceased_middle, &r.deceased_last], " "),
        iso(r.funeral_date.or(r.death_date)),
        text(&r.certificate_no),
        register_ref(&r.book_no, &r.page_no, &r.entry_no),
    ]
}

pub fn identity_tuple(record: &CanonicalRecord) -> IdentityTuple {
    IdentityTuple(match record {
        CanonicalRecord::Baptism(r) => baptism_identity(r),
        CanonicalRecord::Marriage(r) => marriage_identity(r),
        CanonicalRecord::Funeral(r) => funeral_identity(r),
    })
}

/// Fingerprint of a record, or `None` when it has no identity at all
pub fn fingerprint(record: &CanonicalRecord) -> Option<String> {
    let identity = identity_tuple(record);
    if identity.is_empty() {
        None
    } else {
        Some(identity.hash())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::models::RecordType;
    use crate::records::FieldValue;

    fn baptism(name: &str, date: (i32, u32, u32)) -> CanonicalRecord {
        let mut record = CanonicalRecord::new(RecordType::Baptisms);
        record.assign("person_first", FieldValue::Text(name.to_string()));
        record.assign(
            "baptism_date",
            FieldValue::Date(NaiveDate::from_ymd_opt(date.0, date.1, date.2).unwrap()),
        );
        record
    }

    #[test]
    fn test_tuple_width_is_fixed() {
        let record = baptism("Helen Russo", (2001, 2, 15));
        let identity = identity_tuple(&record);
        assert_eq!(identity.components().len(), 4);
        assert_eq!(identity.joined(), "Helen Russo|2001-02-15||");
        assert_eq!(fingerprint(&record), Some(sha256_hex(b"Helen Russo|2001-02-15||")));
    }

    #[test]
    fn test_names_and_register_refs_drop_empty_parts() {
        let mut record = CanonicalRecord::new(RecordType::Marriages);
        record.assign("groom_first", FieldValue::Text("Paul".into()));
        record.assign("groom_last", FieldValue::Text("Smith".into()));
        record.assign("bride_first", FieldValue::Text("Ann".into()));
        record.assign("book_no", FieldValue::Text("3".into()));
        record.assign("entry_no", FieldValue::Text("12".into()));
        assert_eq!(identity_tuple(&record).joined(), "Paul Smith|Ann|||3/12");
    }

    #[test]
    fn test_funeral_date_falls_back_to_death_date() {
        let mut record = CanonicalRecord::new(RecordType::Funerals);
        record.assign("deceased_first", FieldValue::Text("Anna".into()));
        record.assign("death_date", FieldValue::Date(NaiveDate::from_ymd_opt(1990, 5, 1).unwrap()));
        assert_eq!(identity_tuple(&record).joined(), "Anna|1990-05-01||");

        record.assign("funeral_date", FieldValue::Date(NaiveDate::from_ymd_opt(1990, 5, 4).unwrap()));
        assert_eq!(identity_tuple(&record).joined(), "Anna|1990-05-04||");
    }

    #[test]
    fn test_non_identity_fields_do_not_change_hash() {
        let mut a = baptism("Helen Russo", (2001, 2, 15));
        let b = a.clone();
        a.assign("notes", FieldValue::Text("80".into()));
        a.assign("officiant_name", FieldValue::Text("Fr. Luca".into()));
        a.assign("godparents", FieldValue::List(vec!["Peter Jones".into()]));
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_identity_fields_change_hash() {
        let a = baptism("Helen Russo", (2001, 2, 15));
        let b = baptism("Helen Russo", (2001, 2, 16));
        let c = baptism("Helen Rossi", (2001, 2, 15));
        assert_ne!(fingerprint(&a), fingerprint(&b));
        assert_ne!(fingerprint(&a), fingerprint(&c));
    }

    #[test]
    fn test_delimiter_inside_component_is_escaped() {
        let mut split = CanonicalRecord::new(RecordType::Baptisms);
        split.assign("person_first", FieldValue::Text("Ana".into()));
        split.assign("certificate_no", FieldValue::Text("12|3".into()));

        let mut shifted = CanonicalRecord::new(RecordType::Baptisms);
        shifted.assign("person_first", FieldValue::Text("Ana".into()));
        shifted.assign("certificate_no", FieldValue::Text("12".into()));
        shifted.assign("book_no", FieldValue::Text("3".into()));

        assert_eq!(identity_tuple(&split).joined(), "Ana||12\\|3|");
        assert_eq!(identity_tuple(&shifted).joined(), "Ana||12|3");
        assert_ne!(fingerprint(&split), fingerprint(&shifted));

        let mut backslash = CanonicalRecord::new(RecordType::Baptisms);
        backslash.assign("person_first", FieldValue::Text("Ana".into()));
        backslash.assign("certificate_no", FieldValue::Text("12\\".into()));
        backslash.assign("book_no", FieldValue::Text("|3".into()));
        assert_ne!(fingerprint(&backslash), fingerprint(&split));
    }

    #[test]
    fn test_empty_identity_has_no_fingerprint() {
        let mut record = CanonicalRecord::new(RecordType::Baptisms);
        record.assign("notes", FieldValue::Text("illegible".into()));
        assert_eq!(fingerprint(&record), None);
    }
}
