//! Canonical record schemas
//!
//! Each sacrament type has a fixed field set. The field tables double as the
//! column list for the store, so a field's `max_len` matches the width of its
//! column.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::models::RecordType;

/// Storage kind of a canonical field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Free text; `None` means unbounded
    Text { max_len: Option<usize> },
    Date,
    /// Ordered list of names, stored as a JSON array
    List,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
}

/// Normalized value ready to assign to a canonical field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Text(String),
    Date(NaiveDate),
    List(Vec<String>),
}

/// Borrowed view of a canonical field's current value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldRef<'a> {
    Text(Option<&'a str>),
    Date(Option<NaiveDate>),
    List(&'a [String]),
}

macro_rules! canonical_record {
    (
        $(#[$meta:meta])*
        $name:ident {
            text { $($text:ident : $len:expr),* $(,)? }
            dates { $($date:ident),* $(,)? }
            lists { $($list:ident),* $(,)? }
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
        pub struct $name {
            $(pub $text: Option<String>,)*
            $(pub $date: Option<NaiveDate>,)*
            $(pub $list: Vec<String>,)*
        }

        impl $name {
            pub const FIELDS: &'static [FieldSpec] = &[
                $(FieldSpec { name: stringify!($text), kind: FieldKind::Text { max_len: $len } },)*
                $(FieldSpec { name: stringify!($date), kind: FieldKind::Date },)*
                $(FieldSpec { name: stringify!($list), kind: FieldKind::List },)*
            ];

            /// Assign a value; returns false when the field is unknown or
            /// the value kind does not match
            pub fn assign(&mut self, field: &str, value: FieldValue) -> bool {
                $(
                    if field == stringify!($text) {
                        if let FieldValue::Text(v) = value {
                            self.$text = Some(v);
                            return true;
                        }
                        return false;
                    }
                )*
                $(
                    if field == stringify!($date) {
                        if let FieldValue::Date(v) = value {
                            self.$date = Some(v);
                            return true;
                        }
                        return false;
                    }
                )*
                $(
                    if field == stringify!($list) {
                        if let FieldValue::List(v) = value {
                            self.$list = v;
                            return true;
                        }
                        return false;
                    }
                )*
                let _ = value;
                false
            }

            pub fn get(&self, field: &str) -> Option<FieldRef<'_>> {
                $(
                    if field == stringify!($text) {
                        return Some(FieldRef::Text(self.$text.as_deref()));
                    }
                )*
                $(
                    if field == stringify!($date) {
                        return Some(FieldRef::Date(self.$date));
                    }
                )*
                $(
                    if field == stringify!($list) {
                        return Some(FieldRef::List(&self.$list));
                    }
                )*
                None
            }
        }
    };
}

canonical_record! {
    /// Baptism register entry
    BaptismRecord {
        text {
            person_first: Some(100),
            person_middle: Some(100),
            person_last: Some(100),
            certificate_no: Some(50),
            book_no: Some(50),
            page_no: Some(50),
            entry_no: Some(50),
            father_name: Some(200),
            mother_name: Some(200),
            officiant_name: Some(150),
            place_name: Some(255),
            notes: None,
            source_row_id: Some(100),
        }
        dates { birth_date, baptism_date }
        lists { godparents }
    }
}

canonical_record! {
    /// Marriage register entry
    MarriageRecord {
        text {
            groom_first: Some(100),
            groom_middle: Some(100),
            groom_last: Some(100),
            bride_first: Some(100),
            bride_middle: Some(100),
            bride_last: Some(100),
            certificate_no: Some(50),
            book_no: Some(50),
            page_no: Some(50),
            entry_no: Some(50),
            officiant_name: Some(150),
            place_name: Some(255),
            notes: None,
            source_row_id: Some(100),
        }
        dates { marriage_date }
        lists { witnesses }
    }
}

canonical_record! {
    /// Funeral register entry
    FuneralRecord {
        text {
            deceased_first: Some(100),
            deceased_middle: Some(100),
            deceased_last: Some(100),
            certificate_no: Some(50),
            book_no: Some(50),
            page_no: Some(50),
            entry_no: Some(50),
            burial_place: Some(255),
            cause_of_death: Some(255),
            officiant_name: Some(150),
            place_name: Some(255),
            notes: None,
            source_row_id: Some(100),
        }
        dates { birth_date, death_date, funeral_date }
        lists {}
    }
}

impl RecordType {
    /// Canonical field set for this record type
    pub fn fields(&self) -> &'static [FieldSpec] {
        match self {
            RecordType::Baptisms => BaptismRecord::FIELDS,
            RecordType::Marriages => MarriageRecord::FIELDS,
            RecordType::Funerals => FuneralRecord::FIELDS,
        }
    }

    pub fn field(&self, name: &str) -> Option<&'static FieldSpec> {
        self.fields().iter().find(|f| f.name == name)
    }

    /// Date fields that take part in the identity tuple
    pub fn identity_date_fields(&self) -> &'static [&'static str] {
        match self {
            RecordType::Baptisms => &["baptism_date"],
            RecordType::Marriages => &["marriage_date"],
            RecordType::Funerals => &["funeral_date", "death_date"],
        }
    }
}

/// A canonical record of any type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "record_type", rename_all = "snake_case")]
pub enum CanonicalRecord {
    Baptism(BaptismRecord),
    Marriage(MarriageRecord),
    Funeral(FuneralRecord),
}

impl CanonicalRecord {
    /// Empty record of the given type
    pub fn new(record_type: RecordType) -> Self {
        match record_type {
            RecordType::Baptisms => CanonicalRecord::Baptism(BaptismRecord::default()),
            RecordType::Marriages => CanonicalRecord::Marriage(MarriageRecord::default()),
            RecordType::Funerals => CanonicalRecord::Funeral(FuneralRecord::default()),
        }
    }

    pub fn record_type(&self) -> RecordType {
        match self {
            CanonicalRecord::Baptism(_) => RecordType::Baptisms,
            CanonicalRecord::Marriage(_) => RecordType::Marriages,
            CanonicalRecord::Funeral(_) => RecordType::Funerals,
        }
    }

    pub fn fields(&self) -> &'static [FieldSpec] {
        self.record_type().fields()
    }

    pub fn assign(&mut self, field: &str, value: FieldValue) -> bool {
        match self {
            CanonicalRecord::Baptism(r) => r.assign(field, value),
            CanonicalRecord::Marriage(r) => r.assign(field, value),
            CanonicalRecord::Funeral(r) => r.assign(field, value),
        }
    }

    pub fn get(&self, field: &str) -> Option<FieldRef<'_>> {
        match self {
            CanonicalRecord::Baptism(r) => r.get(field),
            CanonicalRecord::Marriage(r) => r.get(field),
            CanonicalRecord::Funeral(r) => r.get(field),
        }
    }

    pub fn text(&self, field: &str) -> Option<&str> {
        match self.get(field) {
            Some(FieldRef::Text(v)) => v,
            _ => None,
        }
    }

    pub fn date(&self, field: &str) -> Option<NaiveDate> {
        match self.get(field) {
            Some(FieldRef::Date(v)) => v,
            _ => None,
        }
    }

    /// Text fields whose value exceeds the column width
    pub fn oversized_fields(&self) -> Vec<(&'static str, usize, usize)> {
        self.fields()
            .iter()
            .filter_map(|spec| match (spec.kind, self.get(spec.name)) {
                (FieldKind::Text { max_len: Some(max) }, Some(FieldRef::Text(Some(v)))) => {
                    let len = v.chars().count();
                    (len > max).then_some((spec.name, len, max))
                },
                _ => None,
            })
            .collect()
    }
}
