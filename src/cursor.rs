//! The lazy query form: a `Cursor` accumulates sorting, pagination,
//! projection and an optional user predicate, and only touches the
//! datastore when `exec()` is called.

use std::fmt;
use bson::{ Bson, Document };
use crate::coll::Collection;
use crate::error::{ Error, ErrorKind, Result };
use crate::ext::{ compare_maybe, get_dot_value, BsonExt };
use crate::literal::Order;
use crate::update::modify;

/// A user-supplied predicate evaluated against each matched document, the
/// moral equivalent of a `$where` clause. Documents cannot carry function
/// values, so the predicate travels beside the query instead of inside it.
pub type WherePredicate = Box<dyn Fn(&Document) -> bool>;

/// A lazily-executed query against one collection.
///
/// ```no_run
/// # #[macro_use]
/// # extern crate bson;
/// # extern crate medlar;
/// #
/// # use medlar::coll::{ Collection, CollectionOptions };
/// # use medlar::literal::Order;
/// # use medlar::error::Result;
/// #
/// # fn main() -> Result<()> {
/// # let collection = Collection::new(CollectionOptions::default())?;
/// let adults = collection
///     .cursor(doc!{ "age": { "$gte": 18 } })
///     .sort(doc!{ "age": Order::Descending })
///     .skip(10)
///     .limit(5)
///     .projection(doc!{ "name": 1, "age": 1 })
///     .exec()?;
/// # Ok(())
/// # }
/// ```
pub struct Cursor {
    /// The collection the query runs against.
    coll: Collection,
    /// The filter.
    query: Document,
    /// Sort specification: field to `±1`, applied in key order.
    sort: Option<Document>,
    /// Number of leading results to drop (after sorting).
    skip: Option<usize>,
    /// Maximum number of results to yield (after sorting and skipping).
    limit: Option<usize>,
    /// Projection specification: field to `1` (keep) or `0` (omit).
    projection: Option<Document>,
    /// Extra user predicate.
    where_pred: Option<WherePredicate>,
}

impl Cursor {
    /// Creates a cursor over a collection; used by `Collection::cursor`.
    pub(crate) fn new(coll: Collection, query: Document) -> Self {
        Cursor {
            coll,
            query,
            sort: None,
            skip: None,
            limit: None,
            projection: None,
            where_pred: None,
        }
    }

    /// Sorts the results. Keys are sort fields mapped to `±1` (or
    /// [`Order`](crate::literal::Order)), significant first.
    pub fn sort(mut self, spec: Document) -> Self {
        self.sort = Some(spec);
        self
    }

    /// Skips the first `n` results.
    pub fn skip(mut self, n: usize) -> Self {
        self.skip = Some(n);
        self
    }

    /// Yields at most `n` results.
    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    /// Restricts the returned fields. Keys map to `1` (keep only these) or
    /// `0` (omit these); one cursor uses only one of the two modes, except
    /// for `_id` which may be included or excluded alongside either.
    pub fn projection(mut self, spec: Document) -> Self {
        self.projection = Some(spec);
        self
    }

    /// Adds a user predicate that each matched document must also satisfy.
    /// A panic inside the predicate surfaces to the caller without
    /// corrupting the datastore.
    pub fn filter_where<F>(mut self, predicate: F) -> Self
        where F: Fn(&Document) -> bool + 'static
    {
        self.where_pred = Some(Box::new(predicate));
        self
    }

    /// Runs the query and returns deep copies of the matching documents.
    pub fn exec(self) -> Result<Vec<Document>> {
        let coll = self.coll.clone();
        coll.exec_cursor(self)
    }

    /// The filter this cursor was created with.
    pub(crate) fn query(&self) -> &Document {
        &self.query
    }

    /// Applies the user predicate, if any.
    pub(crate) fn accepted_by_where(&self, doc: &Document) -> bool {
        self.where_pred.as_ref().map_or(true, |predicate| predicate(doc))
    }

    /// Applies sort, skip and limit to the matched documents.
    pub(crate) fn arrange(&self, mut docs: Vec<Document>) -> Result<Vec<Document>> {
        if let Some(ref spec) = self.sort {
            let keys = sort_keys(spec)?;

            docs.sort_by(|a, b| {
                for &(ref field, direction) in &keys {
                    let order = compare_maybe(
                        get_dot_value(a, field).as_ref(),
                        get_dot_value(b, field).as_ref(),
                    );
                    let order = match direction {
                        Order::Ascending => order,
                        Order::Descending => order.reverse(),
                    };
                    if order != std::cmp::Ordering::Equal {
                        return order;
                    }
                }
                std::cmp::Ordering::Equal
            });
        }

        let skip = self.skip.unwrap_or(0);
        let mut arranged: Vec<Document> = docs.into_iter().skip(skip).collect();

        if let Some(limit) = self.limit {
            arranged.truncate(limit);
        }

        Ok(arranged)
    }

    /// Applies the projection to one result document.
    pub(crate) fn project(&self, doc: &Document) -> Result<Document> {
        match self.projection {
            Some(ref spec) => apply_projection(spec, doc),
            None => Ok(doc.clone()),
        }
    }
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("query", &self.query)
            .field("sort", &self.sort)
            .field("skip", &self.skip)
            .field("limit", &self.limit)
            .field("projection", &self.projection)
            .field("where", &self.where_pred.is_some())
            .finish()
    }
}

/// Validates a sort specification into (field, direction) pairs.
fn sort_keys(spec: &Document) -> Result<Vec<(String, Order)>> {
    spec.iter()
        .map(|(field, direction)| {
            Order::from_bson(direction)
                .map(|order| (field.clone(), order))
                .ok_or_else(|| Error::new(
                    ErrorKind::InvalidQuery,
                    format!("sort direction for `{}` must be 1 or -1", field)
                ))
        })
        .collect()
}

/// The two projection modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProjectionMode {
    /// Keep only the listed fields.
    Keep,
    /// Omit the listed fields.
    Omit,
}

/// Applies a `{field: 1/0, ...}` projection to one document. The listed
/// fields (other than `_id`) must all use the same mode; `_id` is kept by
/// default and may be excluded alongside either mode.
fn apply_projection(spec: &Document, doc: &Document) -> Result<Document> {
    let keep_id = spec.get("_id").map_or(true, BsonExt::is_truthy);
    let mut mode: Option<ProjectionMode> = None;
    let mut fields: Vec<&String> = Vec::with_capacity(spec.len());

    for (field, action) in spec.iter() {
        if field == "_id" {
            continue;
        }

        let field_mode = match action.try_as_bool() {
            Some(true) => ProjectionMode::Keep,
            Some(false) => ProjectionMode::Omit,
            None => return Err(Error::new(
                ErrorKind::InvalidQuery,
                format!("projection for `{}` must be 1 or 0", field)
            )),
        };

        if *mode.get_or_insert(field_mode) != field_mode {
            return Err(Error::new(
                ErrorKind::InvalidQuery,
                "can't both keep and omit fields except for _id"
            ));
        }

        fields.push(field);
    }

    let mut projected = match mode {
        // Only `_id` was mentioned (or the projection is empty): keep
        // everything.
        None => doc.clone(),
        Some(ProjectionMode::Keep) => {
            // Rebuild from scratch via `$set`, which re-creates dot paths.
            let mut picks = Document::new();
            for field in fields {
                if let Some(value) = get_dot_value(doc, field) {
                    picks.insert(field.clone(), value);
                }
            }

            if picks.is_empty() {
                Document::new()
            } else {
                modify(&Document::new(), &doc!{ "$set": Bson::Document(picks) })?
            }
        }
        Some(ProjectionMode::Omit) => {
            // Strip the listed fields via `$unset`.
            let mut drops = Document::new();
            for field in fields {
                drops.insert(field.clone(), true);
            }

            modify(doc, &doc!{ "$unset": Bson::Document(drops) })?
        }
    };

    if keep_id {
        if let Some(id) = doc.get("_id") {
            projected.insert("_id", id.clone());
        }
    } else {
        projected.remove("_id");
    }

    Ok(projected)
}
