//! The query evaluator: decides whether a document matches a query
//! document.
//!
//! A query has two syntactic layers. At the top level, `$or`, `$and` and
//! `$not` combine subqueries. Every other key is a (possibly dotted) field
//! path whose value is either a literal to deep-compare against, or an
//! operator document such as `{ "$lt": 5, "$gte": 1 }`.
//!
//! When the target field holds an array, a predicate matches if any element
//! satisfies it, with two exceptions: a whole-array literal requires exact
//! element-wise equality, and the array-specific operators `$size` and
//! `$elemMatch` apply to the array itself.

use bson::{ Bson, Document };
use regex::RegexBuilder;
use crate::error::{ Error, ErrorKind, Result };
use crate::ext::{ get_dot_value, compare_things, things_equal, BsonExt };
use crate::literal::{ BsonType, RegexOpts };

/// Decides whether `doc` matches `query`.
pub fn match_query(query: &Document, doc: &Document) -> Result<bool> {
    for (key, value) in query.iter() {
        let part = if key.starts_with('$') {
            match_logical(key, value, doc)?
        } else {
            match_query_part(doc, key, value)?
        };

        if !part {
            return Ok(false);
        }
    }

    Ok(true)
}

/// Top-level logical operators.
fn match_logical(operator: &str, argument: &Bson, doc: &Document) -> Result<bool> {
    match operator {
        "$or" => {
            for subquery in subqueries(operator, argument)? {
                if match_query(subquery, doc)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        "$and" => {
            for subquery in subqueries(operator, argument)? {
                if !match_query(subquery, doc)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        "$not" => match *argument {
            Bson::Document(ref subquery) => match_query(subquery, doc).map(|m| !m),
            _ => Err(Error::new(
                ErrorKind::InvalidQuery,
                "$not operator used without a query"
            )),
        },
        _ => Err(Error::new(
            ErrorKind::InvalidQuery,
            format!("unknown logical operator {}", operator)
        )),
    }
}

/// The argument of `$or`/`$and` must be a non-degenerate array of queries.
fn subqueries<'a>(operator: &str, argument: &'a Bson) -> Result<Vec<&'a Document>> {
    let array = match *argument {
        Bson::Array(ref array) => array,
        _ => return Err(Error::new(
            ErrorKind::InvalidQuery,
            format!("{} operator used without an array", operator)
        )),
    };

    array
        .iter()
        .map(|element| match *element {
            Bson::Document(ref subquery) => Ok(subquery),
            _ => Err(Error::new(
                ErrorKind::InvalidQuery,
                format!("{} operands must be queries", operator)
            )),
        })
        .collect()
}

/// One per-field predicate: resolves the dot path and matches the value.
fn match_query_part(doc: &Document, path: &str, query_value: &Bson) -> Result<bool> {
    match_value(get_dot_value(doc, path).as_ref(), query_value, false)
}

/// Operators which apply to an array target as a whole instead of fanning
/// out over its elements.
fn is_array_operator(operator: &str) -> bool {
    operator == "$size" || operator == "$elemMatch"
}

/// Matches a resolved value (`None` meaning the field is absent) against
/// the query-side value.
fn match_value(
    obj_value: Option<&Bson>,
    query_value: &Bson,
    treat_array_as_value: bool,
) -> Result<bool> {
    // Array fan-out, unless something forces whole-array treatment.
    if let Some(&Bson::Array(ref array)) = obj_value {
        if !treat_array_as_value {
            // A whole-array literal asks for an exact match.
            if let Bson::Array(_) = *query_value {
                return match_value(obj_value, query_value, true);
            }

            // Array-specific operators apply to the array itself.
            if let Bson::Document(ref operators) = *query_value {
                if operators.keys().any(|key| is_array_operator(key)) {
                    return match_value(obj_value, query_value, true);
                }
            }

            for element in array {
                if match_value(Some(element), query_value, false)? {
                    return Ok(true);
                }
            }
            return Ok(false);
        }
    }

    // An operator document applies each comparison in turn.
    if let Bson::Document(ref operators) = *query_value {
        let dollar_keys = operators.keys().filter(|k| k.starts_with('$')).count();

        if dollar_keys != 0 {
            if dollar_keys != operators.len() {
                return Err(Error::new(
                    ErrorKind::InvalidQuery,
                    "you cannot mix operators and normal fields"
                ));
            }

            for (operator, argument) in operators.iter() {
                if !match_comparison(operator, obj_value, argument)? {
                    return Ok(false);
                }
            }
            return Ok(true);
        }
    }

    // A bare regular expression matches like `$regex`.
    if let Bson::RegExp(..) = *query_value {
        return regex_match(obj_value, query_value);
    }

    // Literal deep equality; an absent field never matches a literal.
    Ok(obj_value.map_or(false, |value| things_equal(value, query_value)))
}

/// Kinds admitted by the ordering comparisons: numbers, strings and
/// datetimes, and only against a value of the same kind.
fn comparable(a: &Bson, b: &Bson) -> bool {
    let class = |value: &Bson| {
        let kind = value.bson_type();
        if BsonType::NUMBER.contains(kind) { BsonType::NUMBER } else { kind }
    };

    class(a) == class(b) && BsonType::COMPARABLE.contains(class(a))
}

/// A single comparison operator applied to a resolved value.
fn match_comparison(
    operator: &str,
    value: Option<&Bson>,
    argument: &Bson,
) -> Result<bool> {
    use std::cmp::Ordering::*;

    match operator {
        "$lt" | "$lte" | "$gt" | "$gte" => {
            let target = match value {
                Some(target) if comparable(target, argument) => target,
                _ => return Ok(false),
            };

            Ok(match (operator, compare_things(target, argument)) {
                ("$lt",  Less) => true,
                ("$lte", Less) | ("$lte", Equal) => true,
                ("$gt",  Greater) => true,
                ("$gte", Greater) | ("$gte", Equal) => true,
                _ => false,
            })
        }
        "$eq" => Ok(value.map_or(false, |v| things_equal(v, argument))),
        "$ne" => Ok(!value.map_or(false, |v| things_equal(v, argument))),
        "$in" => {
            let candidates = in_operand(operator, argument)?;
            Ok(value.map_or(false, |v| {
                candidates.iter().any(|candidate| things_equal(v, candidate))
            }))
        }
        "$nin" => {
            let candidates = in_operand(operator, argument)?;
            // Also matches when the field is absent.
            Ok(!value.map_or(false, |v| {
                candidates.iter().any(|candidate| things_equal(v, candidate))
            }))
        }
        "$exists" => Ok(value.is_some() == argument.is_truthy()),
        "$regex" => match *argument {
            Bson::RegExp(..) => regex_match(value, argument),
            _ => Err(Error::new(
                ErrorKind::InvalidQuery,
                "$regex operator called with a non-regexp"
            )),
        },
        "$size" => {
            let array = match value {
                Some(&Bson::Array(ref array)) => array,
                _ => return Ok(false),
            };
            let wanted = argument.as_integer().ok_or_else(|| Error::new(
                ErrorKind::InvalidQuery,
                "$size operator called without an integer"
            ))?;

            Ok(wanted >= 0 && array.len() as i64 == wanted)
        }
        "$elemMatch" => {
            let array = match value {
                Some(&Bson::Array(ref array)) => array,
                _ => return Ok(false),
            };

            for element in array {
                if element_matches(element, argument)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        _ => Err(Error::new(
            ErrorKind::InvalidQuery,
            format!("unknown comparison function {}", operator)
        )),
    }
}

/// The argument of `$in`/`$nin` must be an array.
fn in_operand<'a>(operator: &str, argument: &'a Bson) -> Result<&'a [Bson]> {
    match *argument {
        Bson::Array(ref array) => Ok(array),
        _ => Err(Error::new(
            ErrorKind::InvalidQuery,
            format!("{} operator called with a non-array", operator)
        )),
    }
}

/// Matches one value against a condition that may be a full query (when
/// both sides are documents) or a bare predicate. Shared between
/// `$elemMatch` and the `$pull` update modifier.
pub(crate) fn element_matches(element: &Bson, condition: &Bson) -> Result<bool> {
    match (element, condition) {
        (&Bson::Document(ref doc), &Bson::Document(ref query)) => {
            match_query(query, doc)
        }
        _ => match_value(Some(element), condition, true),
    }
}

/// Evaluates a `Bson::RegExp` against a resolved value. Non-string targets
/// never match; unsupported option characters and malformed patterns are
/// query errors.
fn regex_match(value: Option<&Bson>, regex: &Bson) -> Result<bool> {
    let (pattern, options) = match *regex {
        Bson::RegExp(ref pattern, ref options) => (pattern, options),
        _ => unreachable!("regex_match called with a non-regexp"),
    };

    let target = match value {
        Some(&Bson::String(ref target)) => target,
        _ => return Ok(false),
    };

    let flags = RegexOpts::from_option_string(options).ok_or_else(|| Error::new(
        ErrorKind::InvalidQuery,
        format!("unsupported regular expression options `{}`", options)
    ))?;

    let compiled = RegexBuilder::new(pattern)
        .case_insensitive(flags.contains(RegexOpts::IGNORE_CASE))
        .multi_line(flags.contains(RegexOpts::LINE_ANCHOR))
        .dot_matches_new_line(flags.contains(RegexOpts::DOT_NEWLINE))
        .ignore_whitespace(flags.contains(RegexOpts::EXTENDED))
        .build()
        .map_err(|error| Error::new(
            ErrorKind::InvalidQuery,
            format!("invalid regular expression: {}", error)
        ))?;

    Ok(compiled.is_match(target))
}
