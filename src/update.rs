//! Applying update documents: either a pure replacement body, or a set of
//! `$`-modifiers (`$set`, `$unset`, `$inc`, `$min`, `$max`, `$push`,
//! `$addToSet`, `$pop`, `$pull`). Mixing the two modes is an error, and no
//! update may change a document's `_id`.

use bson::{ Bson, Document };
use crate::error::{ Error, ErrorKind, Result };
use crate::ext::{ compare_things, things_equal, BsonExt };
use crate::query::element_matches;

/// Computes the updated version of `doc` according to `update`, leaving
/// `doc` itself untouched. The caller decides what to do with the result;
/// a failed modifier therefore rolls back by simply discarding it.
pub fn modify(doc: &Document, update: &Document) -> Result<Document> {
    let dollar_keys = update.keys().filter(|k| k.starts_with('$')).count();

    if let Some(new_id) = update.get("_id") {
        if !doc.get("_id").map_or(false, |old_id| things_equal(old_id, new_id)) {
            return Err(Error::new(
                ErrorKind::InvalidModifier,
                "you cannot change a document's _id"
            ));
        }
    }

    let new_doc = if dollar_keys == 0 {
        // Pure replacement: take the update body, keep the old `_id`.
        let mut new_doc = update.clone();
        if let Some(id) = doc.get("_id") {
            new_doc.insert("_id", id.clone());
        }
        new_doc
    } else if dollar_keys != update.len() {
        return Err(Error::new(
            ErrorKind::InvalidModifier,
            "you cannot mix modifiers and normal fields"
        ));
    } else {
        let mut root = Bson::Document(doc.clone());

        for (modifier, argument) in update.iter() {
            let fields = match *argument {
                Bson::Document(ref fields) => fields,
                _ => return Err(Error::new(
                    ErrorKind::InvalidModifier,
                    format!("modifier {}'s argument must be an object", modifier)
                )),
            };

            for (field, value) in fields.iter() {
                let path: Vec<&str> = field.split('.').collect();
                apply_modifier(&mut root, modifier, &path, value)?;
            }
        }

        match root {
            Bson::Document(new_doc) => new_doc,
            _ => unreachable!("modifier application changed the root kind"),
        }
    };

    // The modifier walk above can't rename `_id` away, but `$set`/`$unset`
    // can still try to alter it; reject the result wholesale.
    let id_preserved = match (doc.get("_id"), new_doc.get("_id")) {
        (None, None) => true,
        (Some(old), Some(new)) => things_equal(old, new),
        _ => false,
    };

    if !id_preserved {
        return Err(Error::new(
            ErrorKind::InvalidModifier,
            "you cannot change a document's _id"
        ));
    }

    Ok(new_doc)
}

/// Walks the dot path down to the final segment and applies the modifier
/// there. Missing intermediate segments are created as empty objects
/// (except for `$unset`, which never creates anything); existing
/// non-container segments silently stop the walk.
fn apply_modifier(
    container: &mut Bson,
    modifier: &str,
    path: &[&str],
    value: &Bson,
) -> Result<()> {
    if path.len() == 1 {
        return apply_last_step(container, modifier, path[0], value);
    }

    let (head, rest) = (path[0], &path[1..]);

    match *container {
        Bson::Document(ref mut doc) => {
            if doc.get(head).is_none() {
                if modifier == "$unset" {
                    return Ok(());
                }
                doc.insert(head, Document::new());
            }

            match doc.get_mut(head) {
                Some(inner) => match *inner {
                    Bson::Document(_) | Bson::Array(_) => {
                        apply_modifier(inner, modifier, rest, value)
                    }
                    // A non-container in the middle of the path: the update
                    // quietly has no effect on this field.
                    _ => Ok(()),
                },
                None => Ok(()),
            }
        }
        Bson::Array(ref mut array) => {
            let index = match head.parse::<usize>() {
                Ok(index) => index,
                Err(_) => return Ok(()),
            };

            match array.get_mut(index) {
                Some(inner) => match *inner {
                    Bson::Document(_) | Bson::Array(_) => {
                        apply_modifier(inner, modifier, rest, value)
                    }
                    _ => Ok(()),
                },
                None => Ok(()),
            }
        }
        _ => Ok(()),
    }
}

/// Reads the current value of the final path segment.
fn last_step_get<'a>(container: &'a Bson, field: &str) -> Option<&'a Bson> {
    match *container {
        Bson::Document(ref doc) => doc.get(field),
        Bson::Array(ref array) => {
            field.parse::<usize>().ok().and_then(|index| array.get(index))
        }
        _ => None,
    }
}

/// Writes the final path segment. Out-of-range array indices extend the
/// array, padding the gap with nulls (the JSON rendition of a hole).
fn last_step_set(container: &mut Bson, field: &str, value: Bson) {
    match *container {
        Bson::Document(ref mut doc) => {
            doc.insert(field, value);
        }
        Bson::Array(ref mut array) => {
            if let Ok(index) = field.parse::<usize>() {
                if index >= array.len() {
                    array.resize(index + 1, Bson::Null);
                }
                array[index] = value;
            }
        }
        _ => {}
    }
}

/// Removes the final path segment; array elements become nulls rather than
/// shifting their neighbors.
fn last_step_unset(container: &mut Bson, field: &str) {
    match *container {
        Bson::Document(ref mut doc) => {
            doc.remove(field);
        }
        Bson::Array(ref mut array) => {
            if let Ok(index) = field.parse::<usize>() {
                if index < array.len() {
                    array[index] = Bson::Null;
                }
            }
        }
        _ => {}
    }
}

/// Applies a single modifier at its final path segment.
#[allow(clippy::cast_precision_loss)]
fn apply_last_step(
    container: &mut Bson,
    modifier: &str,
    field: &str,
    value: &Bson,
) -> Result<()> {
    match modifier {
        "$set" => {
            last_step_set(container, field, value.clone());
            Ok(())
        }
        "$unset" => {
            last_step_unset(container, field);
            Ok(())
        }
        "$inc" => {
            let increment = value.as_number().ok_or_else(|| Error::new(
                ErrorKind::InvalidModifier,
                "$inc modifier called with a non-number argument"
            ))?;

            let new_value = match last_step_get(container, field) {
                None => value.clone(),
                Some(current) => match current.as_number() {
                    Some(base) => {
                        match (current.as_integer(), value.as_integer()) {
                            // Keep integer representations integral.
                            (Some(a), Some(b)) => Bson::I64(a + b),
                            _ => Bson::FloatingPoint(base + increment),
                        }
                    }
                    None => return Err(Error::new(
                        ErrorKind::InvalidModifier,
                        "don't use the $inc modifier on non-number fields"
                    )),
                },
            };

            last_step_set(container, field, new_value);
            Ok(())
        }
        "$min" | "$max" => {
            let replace = match last_step_get(container, field) {
                None => true,
                Some(current) => {
                    let ordering = compare_things(value, current);
                    if modifier == "$min" {
                        ordering == std::cmp::Ordering::Less
                    } else {
                        ordering == std::cmp::Ordering::Greater
                    }
                }
            };

            if replace {
                last_step_set(container, field, value.clone());
            }
            Ok(())
        }
        "$push" => apply_push(container, field, value),
        "$addToSet" => apply_add_to_set(container, field, value),
        "$pop" => {
            let array = mutable_array(container, field, "$pop")?;
            let direction = value.as_integer().filter(|d| d.abs() == 1)
                .ok_or_else(|| Error::new(
                    ErrorKind::InvalidModifier,
                    "$pop modifier called without 1 or -1"
                ))?;

            if !array.is_empty() {
                if direction == 1 {
                    array.pop();
                } else {
                    array.remove(0);
                }
            }
            Ok(())
        }
        "$pull" => {
            let array = mutable_array(container, field, "$pull")?;

            let mut kept = Vec::with_capacity(array.len());
            for element in array.drain(..) {
                if !pulled(&element, value)? {
                    kept.push(element);
                }
            }
            *array = kept;
            Ok(())
        }
        _ => Err(Error::new(
            ErrorKind::InvalidModifier,
            format!("unknown modifier {}", modifier)
        )),
    }
}

/// `$pull` removes elements equal to the argument, or matching it when the
/// argument is a query document.
fn pulled(element: &Bson, condition: &Bson) -> Result<bool> {
    match *condition {
        Bson::Document(_) => {
            if things_equal(element, condition) {
                return Ok(true);
            }
            element_matches(element, condition)
        }
        _ => Ok(things_equal(element, condition)),
    }
}

/// Fetches the target array of an array modifier, creating an empty one
/// when the field is absent. A present non-array target is an error.
fn mutable_array<'a>(
    container: &'a mut Bson,
    field: &str,
    modifier: &str,
) -> Result<&'a mut Vec<Bson>> {
    if last_step_get(container, field).is_none() {
        last_step_set(container, field, Bson::Array(Vec::new()));
    }

    match *container {
        Bson::Document(ref mut doc) => match doc.get_mut(field) {
            Some(&mut Bson::Array(ref mut array)) => Ok(array),
            _ => Err(Error::new(
                ErrorKind::InvalidModifier,
                format!("can't {} an element on non-array values", modifier)
            )),
        },
        Bson::Array(ref mut outer) => {
            let index = field.parse::<usize>().map_err(|_| Error::new(
                ErrorKind::InvalidModifier,
                format!("can't {} an element on non-array values", modifier)
            ))?;

            match outer.get_mut(index) {
                Some(&mut Bson::Array(ref mut array)) => Ok(array),
                _ => Err(Error::new(
                    ErrorKind::InvalidModifier,
                    format!("can't {} an element on non-array values", modifier)
                )),
            }
        }
        _ => Err(Error::new(
            ErrorKind::InvalidModifier,
            format!("can't {} an element on non-array values", modifier)
        )),
    }
}

/// `$push`, with the `$each` and `$slice` sub-operators.
fn apply_push(container: &mut Bson, field: &str, value: &Bson) -> Result<()> {
    // `{ "$slice": n }` alone behaves as `{ "$each": [], "$slice": n }`.
    let suboperators = match *value {
        Bson::Document(ref doc)
            if doc.contains_key("$each") || doc.contains_key("$slice") => Some(doc),
        _ => None,
    };

    let array = mutable_array(container, field, "$push")?;

    let suboperators = match suboperators {
        Some(doc) => doc,
        None => {
            array.push(value.clone());
            return Ok(());
        }
    };

    if suboperators.keys().any(|k| k != "$each" && k != "$slice") {
        return Err(Error::new(
            ErrorKind::InvalidModifier,
            "can only use $slice in conjunction with $each when $push to array"
        ));
    }

    match suboperators.get("$each") {
        Some(&Bson::Array(ref elements)) => array.extend(elements.iter().cloned()),
        Some(_) => return Err(Error::new(
            ErrorKind::InvalidModifier,
            "$each requires an array value"
        )),
        None => {}
    }

    if let Some(slice) = suboperators.get("$slice") {
        let slice = slice.as_integer().ok_or_else(|| Error::new(
            ErrorKind::InvalidModifier,
            "$slice requires an integer value"
        ))?;

        let length = array.len();
        let (start, end) = if slice == 0 {
            (0, 0)
        } else if slice > 0 {
            (0, length.min(slice as usize))
        } else {
            (length.saturating_sub(slice.unsigned_abs() as usize), length)
        };

        *array = array[start..end].to_vec();
    }

    Ok(())
}

/// `$addToSet`, with the `$each` sub-operator.
fn apply_add_to_set(container: &mut Bson, field: &str, value: &Bson) -> Result<()> {
    let each = match *value {
        Bson::Document(ref doc) if doc.contains_key("$each") => {
            if doc.len() > 1 {
                return Err(Error::new(
                    ErrorKind::InvalidModifier,
                    "can't use another field in conjunction with $each"
                ));
            }

            match doc.get("$each") {
                Some(&Bson::Array(ref elements)) => Some(elements.clone()),
                _ => return Err(Error::new(
                    ErrorKind::InvalidModifier,
                    "$each requires an array value"
                )),
            }
        }
        _ => None,
    };

    let array = mutable_array(container, field, "$addToSet")?;

    for element in each.unwrap_or_else(|| vec![value.clone()]) {
        if !array.iter().any(|existing| things_equal(existing, &element)) {
            array.push(element);
        }
    }

    Ok(())
}
