//! Streaming JSON parser
//!
//! Accepts a top-level array of objects, an object wrapping that array under
//! one of the configured keys, or a single bare object. Array elements are
//! deserialized one at a time.

use serde::de::{self, DeserializeSeed, Deserializer, IgnoredAny, MapAccess, SeqAccess, Visitor};
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::io::BufRead;

use super::{Emit, MapRecord, ParserPatterns, RowResult};
use crate::error::{ImportError, ImportResult, ParseError, ParseErrorKind};

const STOPPED: &str = "record consumer stopped";

struct Walk<'w, 'e> {
    emit: &'w mut Emit<'e>,
    wrapper_keys: &'w [String],
    row: u64,
    in_records: bool,
    stopped: bool,
}

impl Walk<'_, '_> {
    /// Forward a row; false once the consumer wants no more
    fn push(&mut self, item: RowResult) -> bool {
        if (self.emit)(item).is_break() {
            self.stopped = true;
        }
        !self.stopped
    }

    fn stream<'de, A: SeqAccess<'de>>(&mut self, mut seq: A) -> Result<(), A::Error> {
        self.in_records = true;
        while let Some(element) = seq.next_element::<Element>()? {
            self.row += 1;
            let item: RowResult = match element {
                Element::Object(record) => Ok(Box::new(record)),
                Element::Other(kind) => Err(ParseError::new(
                    self.row,
                    ParseErrorKind::NotARecord,
                    format!("expected an object, found {}", kind),
                )),
            };
            if !self.push(item) {
                return Err(de::Error::custom(STOPPED));
            }
        }
        Ok(())
    }
}

/// Scalar text of a JSON value; nested values keep their compact JSON form
fn value_text(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        nested => Some(nested.to_string()),
    }
}

/// One element of the record array
enum Element {
    Object(MapRecord),
    Other(&'static str),
}

impl<'de> Deserialize<'de> for Element {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ElementVisitor;

        impl<'de> Visitor<'de> for ElementVisitor {
            type Value = Element;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a JSON value")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Element, A::Error> {
                let mut record = MapRecord::new();
                while let Some((key, value)) = map.next_entry::<String, Value>()? {
                    record.insert(key, value_text(value));
                }
                Ok(Element::Object(record))
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Element, A::Error> {
                while seq.next_element::<IgnoredAny>()?.is_some() {}
                Ok(Element::Other("an array"))
            }

            fn visit_str<E: de::Error>(self, _: &str) -> Result<Element, E> {
                Ok(Element::Other("a string"))
            }

            fn visit_bool<E: de::Error>(self, _: bool) -> Result<Element, E> {
                Ok(Element::Other("a boolean"))
            }

            fn visit_i64<E: de::Error>(self, _: i64) -> Result<Element, E> {
                Ok(Element::Other("a number"))
            }

            fn visit_u64<E: de::Error>(self, _: u64) -> Result<Element, E> {
                Ok(Element::Other("a number"))
            }

            fn visit_f64<E: de::Error>(self, _: f64) -> Result<Element, E> {
                Ok(Element::Other("a number"))
            }

            fn visit_unit<E: de::Error>(self) -> Result<Element, E> {
                Ok(Element::Other("null"))
            }
        }

        deserializer.deserialize_any(ElementVisitor)
    }
}

/// Value under a wrapper key: streamed when it is an array, captured otherwise
struct WrapperValue<'a, 'w, 'e>(&'a mut Walk<'w, 'e>);

impl<'de> DeserializeSeed<'de> for WrapperValue<'_, '_, '_> {
    type Value = Option<Value>;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Self::Value, D::Error> {
        deserializer.deserialize_any(self)
    }
}

impl<'de> Visitor<'de> for WrapperValue<'_, '_, '_> {
    type Value = Option<Value>;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a record array or a field value")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, seq: A) -> Result<Self::Value, A::Error> {
        self.0.stream(seq)?;
        Ok(None)
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
        let mut object = serde_json::Map::new();
        while let Some((key, value)) = map.next_entry::<String, Value>()? {
            object.insert(key, value);
        }
        Ok(Some(Value::Object(object)))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
        Ok(Some(Value::String(v.to_string())))
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<Self::Value, E> {
        Ok(Some(Value::Bool(v)))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
        Ok(Some(Value::from(v)))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
        Ok(Some(Value::from(v)))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
        Ok(Some(Value::from(v)))
    }

    fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
        Ok(Some(Value::Null))
    }
}

/// The document root
struct TopLevel<'a, 'w, 'e>(&'a mut Walk<'w, 'e>);

impl<'de> DeserializeSeed<'de> for TopLevel<'_, '_, '_> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        deserializer.deserialize_any(self)
    }
}

impl<'de> Visitor<'de> for TopLevel<'_, '_, '_> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an array of records or an object")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, seq: A) -> Result<(), A::Error> {
        self.0.stream(seq)
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<(), A::Error> {
        let walk = self.0;
        let mut single = MapRecord::new();

        while let Some(key) = map.next_key::<String>()? {
            if !walk.in_records && walk.wrapper_keys.iter().any(|k| *k == key) {
                if let Some(value) = map.next_value_seed(WrapperValue(&mut *walk))? {
                    single.insert(key, value_text(value));
                }
            } else {
                let value: Value = map.next_value()?;
                if !walk.in_records {
                    single.insert(key, value_text(value));
                }
            }
        }

        if !walk.in_records {
            walk.in_records = true;
            walk.row += 1;
            walk.push(Ok(Box::new(single)));
        }
        Ok(())
    }
}

pub(super) fn parse<R: BufRead>(
    reader: R,
    patterns: &ParserPatterns,
    emit: &mut Emit<'_>,
) -> ImportResult<()> {
    let mut walk = Walk {
        emit,
        wrapper_keys: &patterns.json_wrapper_keys,
        row: 0,
        in_records: false,
        stopped: false,
    };
    let mut de = serde_json::Deserializer::from_reader(reader);
    let result = TopLevel(&mut walk).deserialize(&mut de).and_then(|()| de.end());

    match result {
        Ok(()) => Ok(()),
        Err(_) if walk.stopped => Ok(()),
        Err(e) if e.is_io() => Err(ImportError::FatalIo(format!("Cannot read JSON source: {}", e))),
        Err(e) if walk.in_records => {
            let kind = if e.is_eof() {
                ParseErrorKind::Truncated
            } else {
                ParseErrorKind::Malformed
            };
            let row = walk.row + 1;
            tracing::warn!(row, error = %e, "JSON source is malformed after the last good record");
            walk.push(Err(ParseError::new(row, kind, e.to_string())));
            Ok(())
        },
        Err(e) => Err(ImportError::FatalIo(format!("No JSON record container found: {}", e))),
    }
}
