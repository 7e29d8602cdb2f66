//! Convenience extension traits and the value-model primitives: kind
//! classification, truthiness, strict deep equality, the total order across
//! kinds, and dot-path extraction.

use std::cmp::Ordering;
use bson::{ Bson, Document };
use crate::literal::BsonType;

/// Methods for dynamically inspecting loosely-typed values.
#[allow(clippy::stutter)]
pub trait BsonExt {
    /// The kind of this value, as a mask bit.
    fn bson_type(&self) -> BsonType;

    /// Ensures that the value can be interpreted as a boolean,
    /// and performs the conversion.
    fn try_as_bool(&self) -> Option<bool>;

    /// JavaScript-style truthiness: `null`, `false`, `0`, `NaN` and the
    /// empty string are falsy; everything else is truthy.
    fn is_truthy(&self) -> bool;

    /// The numeric value, if this is any of the numeric representations.
    fn as_number(&self) -> Option<f64>;

    /// The value as an exact integer: any integer representation, or a
    /// float with a zero fractional part.
    fn as_integer(&self) -> Option<i64>;
}

impl BsonExt for Bson {
    fn bson_type(&self) -> BsonType {
        match *self {
            Bson::Null              => BsonType::NULL,
            Bson::Boolean(_)        => BsonType::BOOL,
            Bson::FloatingPoint(_)  => BsonType::DOUBLE,
            Bson::I32(_)            => BsonType::INT,
            Bson::I64(_)            => BsonType::LONG,
            Bson::String(_)         => BsonType::STRING,
            Bson::UtcDatetime(_)    => BsonType::DATE,
            Bson::RegExp(..)        => BsonType::REGEX,
            Bson::Array(_)          => BsonType::ARRAY,
            Bson::Document(_)       => BsonType::DOCUMENT,
            _                       => BsonType::FOREIGN,
        }
    }

    #[allow(clippy::float_cmp)]
    fn try_as_bool(&self) -> Option<bool> {
        match *self {
            Bson::Boolean(b) => Some(b),
            Bson::I32(0) | Bson::I64(0) => Some(false),
            Bson::I32(1) | Bson::I64(1) => Some(true),
            Bson::FloatingPoint(x) if x == 0.0 => Some(false),
            Bson::FloatingPoint(x) if x == 1.0 => Some(true),
            _ => None,
        }
    }

    fn is_truthy(&self) -> bool {
        match *self {
            Bson::Null => false,
            Bson::Boolean(b) => b,
            Bson::FloatingPoint(x) => x != 0.0 && !x.is_nan(),
            Bson::I32(n) => n != 0,
            Bson::I64(n) => n != 0,
            Bson::String(ref s) => !s.is_empty(),
            _ => true,
        }
    }

    #[allow(clippy::cast_lossless)]
    fn as_number(&self) -> Option<f64> {
        match *self {
            Bson::FloatingPoint(x) => Some(x),
            Bson::I32(n) => Some(n as f64),
            Bson::I64(n) => Some(n as f64),
            _ => None,
        }
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_lossless)]
    fn as_integer(&self) -> Option<i64> {
        match *self {
            Bson::I32(n) => Some(n as i64),
            Bson::I64(n) => Some(n),
            Bson::FloatingPoint(x) if x.fract() == 0.0 => Some(x as i64),
            _ => None,
        }
    }
}

/// Strict deep equality.
///
/// Values of mismatched kinds are never equal (a number is never equal to a
/// string, an array is never equal to a non-array). Numbers compare by
/// numeric value regardless of representation; datetimes compare by instant;
/// arrays compare element-wise; documents compare their key *sets* and the
/// associated values, irrespective of key order.
#[allow(clippy::float_cmp)]
pub fn things_equal(a: &Bson, b: &Bson) -> bool {
    if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
        return x == y;
    }

    match (a, b) {
        (&Bson::Null, &Bson::Null) => true,
        (&Bson::Boolean(x), &Bson::Boolean(y)) => x == y,
        (&Bson::String(ref x), &Bson::String(ref y)) => x == y,
        (&Bson::UtcDatetime(x), &Bson::UtcDatetime(y)) => {
            x.timestamp_millis() == y.timestamp_millis()
        }
        (&Bson::Array(ref x), &Bson::Array(ref y)) => {
            x.len() == y.len()
                && x.iter().zip(y.iter()).all(|(p, q)| things_equal(p, q))
        }
        (&Bson::Document(ref x), &Bson::Document(ref y)) => documents_equal(x, y),
        (&Bson::RegExp(ref xp, ref xo), &Bson::RegExp(ref yp, ref yo)) => {
            xp == yp && xo == yo
        }
        _ => false,
    }
}

/// Key-order-insensitive document equality.
fn documents_equal(a: &Document, b: &Document) -> bool {
    a.len() == b.len()
        && a.iter().all(|(key, value)| {
            b.get(key).map_or(false, |other| things_equal(value, other))
        })
}

/// Rank of a kind in the total order:
/// `null < number < string < bool < datetime < array < object`.
/// (`undefined` sorts below everything; it is modeled as `Option::None`
/// and handled by [`compare_maybe`].)
fn type_rank(value: &Bson) -> u8 {
    let kind = value.bson_type();

    if kind == BsonType::NULL {
        0
    } else if BsonType::NUMBER.contains(kind) {
        1
    } else if kind == BsonType::STRING {
        2
    } else if kind == BsonType::BOOL {
        3
    } else if kind == BsonType::DATE {
        4
    } else if kind == BsonType::ARRAY {
        5
    } else if kind == BsonType::DOCUMENT {
        6
    } else if kind == BsonType::REGEX {
        7
    } else {
        8
    }
}

/// The total order across all value kinds, used by sorting and by the index
/// tree comparator.
pub fn compare_things(a: &Bson, b: &Bson) -> Ordering {
    let rank_order = type_rank(a).cmp(&type_rank(b));
    if rank_order != Ordering::Equal {
        return rank_order;
    }

    match (a, b) {
        (&Bson::Null, &Bson::Null) => Ordering::Equal,
        (&Bson::Boolean(x), &Bson::Boolean(y)) => x.cmp(&y),
        (&Bson::String(ref x), &Bson::String(ref y)) => x.cmp(y),
        (&Bson::UtcDatetime(x), &Bson::UtcDatetime(y)) => {
            x.timestamp_millis().cmp(&y.timestamp_millis())
        }
        (&Bson::Array(ref x), &Bson::Array(ref y)) => compare_arrays(x, y),
        (&Bson::Document(ref x), &Bson::Document(ref y)) => compare_documents(x, y),
        (&Bson::RegExp(ref xp, ref xo), &Bson::RegExp(ref yp, ref yo)) => {
            xp.cmp(yp).then_with(|| xo.cmp(yo))
        }
        _ => match (a.as_number(), b.as_number()) {
            // Same rank, both numeric. NaN can't come out of the line format
            // but may be handed in through the API; treat it as equal to
            // itself so the comparator stays total.
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            // Kinds the document model rejects still need a deterministic
            // order for the comparator to be total.
            _ => format!("{:?}", a).cmp(&format!("{:?}", b)),
        },
    }
}

/// Lexicographic element-wise comparison; ties broken by length.
fn compare_arrays(a: &[Bson], b: &[Bson]) -> Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        let order = compare_things(x, y);
        if order != Ordering::Equal {
            return order;
        }
    }

    a.len().cmp(&b.len())
}

/// Documents compare by their (key, value) pairs taken in sorted-key order:
/// key name first, then value; ties broken by pair count.
fn compare_documents(a: &Document, b: &Document) -> Ordering {
    let mut a_keys: Vec<&String> = a.keys().collect();
    let mut b_keys: Vec<&String> = b.keys().collect();
    a_keys.sort();
    b_keys.sort();

    for (ka, kb) in a_keys.iter().zip(b_keys.iter()) {
        let key_order = ka.cmp(kb);
        if key_order != Ordering::Equal {
            return key_order;
        }

        // Both lookups are infallible: the keys come from the documents.
        if let (Some(va), Some(vb)) = (a.get(ka), b.get(kb)) {
            let value_order = compare_things(va, vb);
            if value_order != Ordering::Equal {
                return value_order;
            }
        }
    }

    a_keys.len().cmp(&b_keys.len())
}

/// The total order extended with `undefined` (`None`), which sorts below
/// every defined value.
pub fn compare_maybe(a: Option<&Bson>, b: Option<&Bson>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => compare_things(x, y),
    }
}

/// Walks a dot-notation path into a document.
///
/// Numeric path segments index into arrays. When a segment traverses an
/// array element-wise (i.e. the segment is not an index), the result is the
/// projected array of the remaining path applied to each element; elements
/// lacking the path are omitted from the projection.
///
/// ```
/// # #[macro_use]
/// # extern crate bson;
/// # extern crate medlar;
/// #
/// # use medlar::ext::get_dot_value;
/// #
/// # fn main() {
/// let doc = doc!{
///     "planets": [
///         { "name": "Earth", "moons": 1 },
///         { "name": "Mars",  "moons": 2 },
///     ],
/// };
///
/// assert_eq!(get_dot_value(&doc, "planets.name"),
///            Some(bson!(["Earth", "Mars"])));
/// assert_eq!(get_dot_value(&doc, "planets.1.name"),
///            Some(bson!("Mars")));
/// assert_eq!(get_dot_value(&doc, "planets.1.rings"), None);
/// # }
/// ```
pub fn get_dot_value(doc: &Document, path: &str) -> Option<Bson> {
    let parts: Vec<&str> = path.split('.').collect();
    let (head, tail) = parts.split_first()?;
    doc.get(*head).and_then(|value| walk_dot_path(value, tail))
}

/// Recursive step of [`get_dot_value`] on an arbitrary value.
fn walk_dot_path(value: &Bson, parts: &[&str]) -> Option<Bson> {
    let (head, tail) = match parts.split_first() {
        Some(split) => split,
        None => return Some(value.clone()),
    };

    match *value {
        Bson::Document(ref doc) => {
            doc.get(*head).and_then(|inner| walk_dot_path(inner, tail))
        }
        Bson::Array(ref array) => match head.parse::<usize>() {
            Ok(index) => {
                array.get(index).and_then(|inner| walk_dot_path(inner, tail))
            }
            Err(_) => Some(Bson::Array(
                array
                    .iter()
                    .filter_map(|element| walk_dot_path(element, parts))
                    .collect()
            )),
        },
        _ => None,
    }
}
