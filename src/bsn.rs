//! Serialization and deserialization helpers: the single-line JSON codec
//! that documents travel through on their way to and from the data file.
//!
//! One document serializes to one line of JSON with no embedded newline
//! (JSON string escaping takes care of `\n` and `\r`). Datetimes are
//! encoded as `{"$$date": <ms_since_epoch>}` envelopes and rehydrated on
//! the way back in.

use bson::{ Bson, Document };
use chrono::{ LocalResult, TimeZone, Utc };
use serde_json::{ Map, Number, Value };
use crate::error::{ Error, ErrorKind, Result };
use crate::ext::BsonExt;

/// Methods for dynamically type-checking JSON.
pub trait JsonExt: Sized {
    /// Ensures that this tree of values doesn't contain integers which are
    /// not expressible by `i64` (e.g. too big `u64`s) and converts it into
    /// a `Bson` tree. Objects whose only key is `$$date` rehydrate into
    /// datetimes. Preservation of the order of keys in maps is ensured by
    /// the `preserve_order` feature of the `serde_json` crate.
    fn try_into_bson(self) -> Result<Bson>;
}

impl JsonExt for Value {
    fn try_into_bson(self) -> Result<Bson> {
        match self {
            Value::Null => Ok(Bson::Null),
            Value::Bool(b) => Ok(Bson::Boolean(b)),

            // We need the value to be representable by either an `i64` or
            // an `f64`; a `u64` beyond the `i64` range is neither.
            Value::Number(n) => {
                if let Some(int) = n.as_i64() {
                    Ok(Bson::I64(int))
                } else if n.is_f64() {
                    match n.as_f64() {
                        Some(float) => Ok(Bson::FloatingPoint(float)),
                        None => Err(Error::new(
                            ErrorKind::JsonTranscoding,
                            format!("value `{}` can't be represented in BSON", n)
                        )),
                    }
                } else {
                    Err(Error::new(
                        ErrorKind::JsonTranscoding,
                        format!("value `{}` can't be represented in BSON", n)
                    ))
                }
            }

            Value::String(s) => Ok(Bson::String(s)),

            // Check transitively if every element of the array is correct.
            Value::Array(values) => values
                .into_iter()
                .map(JsonExt::try_into_bson)
                .collect::<Result<Vec<_>>>()
                .map(Bson::from),

            // A `{"$$date": ms}` envelope rehydrates into a datetime; any
            // other object converts key by key. Map keys are always OK
            // because they're strings.
            Value::Object(values) => {
                if let Some(instant) = date_envelope(&values) {
                    return datetime_from_millis(instant);
                }

                values
                    .into_iter()
                    .map(|(k, v)| v.try_into_bson().map(|v| (k, v)))
                    .collect::<Result<Document>>()
                    .map(Bson::Document)
            }
        }
    }
}

/// Extracts the payload of a `{"$$date": ms}` envelope, if this is one.
#[allow(clippy::cast_possible_truncation)]
fn date_envelope(values: &Map<String, Value>) -> Option<i64> {
    if values.len() != 1 {
        return None;
    }

    values.get("$$date").and_then(|ms| {
        ms.as_i64().or_else(|| ms.as_f64().map(|x| x as i64))
    })
}

/// Millisecond timestamp to datetime; out-of-range instants are rejected.
fn datetime_from_millis(instant: i64) -> Result<Bson> {
    match Utc.timestamp_millis_opt(instant) {
        LocalResult::Single(datetime) => Ok(Bson::UtcDatetime(datetime)),
        _ => Err(Error::new(
            ErrorKind::JsonTranscoding,
            format!("timestamp `{}` out of datetime range", instant)
        )),
    }
}

/// Converts a BSON tree into a JSON tree fit for the line format.
fn bson_to_json(bson: &Bson) -> Result<Value> {
    match *bson {
        Bson::Null => Ok(Value::Null),
        Bson::Boolean(b) => Ok(Value::Bool(b)),
        Bson::I32(n) => Ok(Value::Number(n.into())),
        Bson::I64(n) => Ok(Value::Number(n.into())),
        Bson::FloatingPoint(x) => Number::from_f64(x)
            .map(Value::Number)
            .ok_or_else(|| Error::new(
                ErrorKind::JsonTranscoding,
                format!("non-finite number `{}` can't be serialized", x)
            )),
        Bson::String(ref s) => Ok(Value::String(s.clone())),
        Bson::UtcDatetime(datetime) => {
            let mut envelope = Map::new();
            envelope.insert(
                String::from("$$date"),
                Value::Number(datetime.timestamp_millis().into()),
            );
            Ok(Value::Object(envelope))
        }
        Bson::Array(ref values) => values
            .iter()
            .map(bson_to_json)
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Bson::Document(ref doc) => doc
            .iter()
            .map(|(k, v)| bson_to_json(v).map(|v| (k.clone(), v)))
            .collect::<Result<Map<_, _>>>()
            .map(Value::Object),
        ref other => Err(Error::new(
            ErrorKind::JsonTranscoding,
            format!("value of type {:?} can't be serialized", other.element_type())
        )),
    }
}

/// Checks a single field name against the forbidden-name rules.
fn check_key(key: &str, value: &Bson) -> Result<()> {
    let sentinel = match key {
        "$$date" => value.as_number().is_some(),
        "$$deleted" => *value == Bson::Boolean(true),
        "$$indexCreated" | "$$indexRemoved" => true,
        _ => false,
    };

    if key.starts_with('$') && !sentinel {
        return Err(Error::new(
            ErrorKind::InvalidFieldName,
            format!("field names cannot begin with the $ character: `{}`", key)
        ));
    }

    if key.contains('.') {
        return Err(Error::new(
            ErrorKind::InvalidFieldName,
            format!("field names cannot contain a .: `{}`", key)
        ));
    }

    Ok(())
}

/// Recursively validates every field name of a document against the
/// forbidden-name rules (no `$` prefix, no `.`), exempting the persisted
/// log's sentinels.
pub fn validate_document(doc: &Document) -> Result<()> {
    for (key, value) in doc.iter() {
        check_key(key, value)?;
        validate_value(value)?;
    }

    Ok(())
}

/// Recursive step of [`validate_document`].
fn validate_value(value: &Bson) -> Result<()> {
    match *value {
        Bson::Document(ref doc) => validate_document(doc),
        Bson::Array(ref values) => values.iter().map(validate_value).collect(),
        _ => Ok(()),
    }
}

/// Deep-copies a document, dropping any field whose name starts with `$`
/// or contains a `.` (recursively). Used when accepting user-provided
/// bodies that may still carry query operators, e.g. upsert synthesis.
pub fn deep_copy_strict(doc: &Document) -> Document {
    doc.iter()
        .filter(|&(key, _)| !key.starts_with('$') && !key.contains('.'))
        .map(|(key, value)| (key.clone(), copy_value_strict(value)))
        .collect()
}

/// Recursive step of [`deep_copy_strict`].
fn copy_value_strict(value: &Bson) -> Bson {
    match *value {
        Bson::Document(ref doc) => Bson::Document(deep_copy_strict(doc)),
        Bson::Array(ref values) => {
            Bson::Array(values.iter().map(copy_value_strict).collect())
        }
        ref other => other.clone(),
    }
}

/// Serializes a document into one line of JSON, after validating its field
/// names. The output is guaranteed not to contain a raw newline.
pub fn serialize_line(doc: &Document) -> Result<String> {
    validate_document(doc)?;
    let json = bson_to_json(&Bson::Document(doc.clone()))?;
    serde_json::to_string(&json).map_err(From::from)
}

/// The inverse of [`serialize_line`].
pub fn deserialize_line(line: &str) -> Result<Document> {
    let json: Value = serde_json::from_str(line)?;

    match json.try_into_bson()? {
        Bson::Document(doc) => Ok(doc),
        other => Err(Error::new(
            ErrorKind::JsonTranscoding,
            format!("expected a document line, got {:?}", other.element_type())
        )),
    }
}
