//! Secondary indexes: one balanced-tree-backed mapping per indexed field
//! path, from projected key to the set of documents producing that key.
//!
//! The tree is a `BTreeMap` over a total-order key wrapper; documents are
//! shared `Rc`s, so every index (and the datastore itself) sees the same
//! logical document. Batch insertions and updates record what they did and
//! undo it on failure, so a unique violation in the middle of an array
//! fan-out or a multi-document update leaves the index untouched.

use std::cmp::Ordering;
use std::collections::{ BTreeMap, HashSet };
use std::ops::Bound;
use std::rc::Rc;
use bson::{ Bson, Document };
use crate::error::{ Error, ErrorKind, Result };
use crate::ext::{ compare_maybe, compare_things, get_dot_value, BsonExt };

/// A document shared between the datastore and every index.
pub type SharedDoc = Rc<Document>;

/// A key projected from a document by an index's field path. `None` stands
/// for `undefined`: the document lacks the field. Undefined sorts below
/// every defined value.
#[derive(Debug, Clone)]
pub struct Key(Option<Bson>);

impl Key {
    /// A key for a present value.
    pub fn of(value: Bson) -> Self {
        Key(Some(value))
    }

    /// The key for an absent field.
    pub fn undefined() -> Self {
        Key(None)
    }

    /// The underlying value; `None` for `undefined`.
    pub fn value(&self) -> Option<&Bson> {
        self.0.as_ref()
    }

    /// The value rendered for error reporting (`undefined` becomes null).
    fn reportable(&self) -> Bson {
        self.0.clone().unwrap_or(Bson::Null)
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Key {}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_maybe(self.0.as_ref(), other.0.as_ref())
    }
}

/// The attributes of an index, as accepted by `ensure_index` and as
/// persisted in `$$indexCreated` envelopes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexOptions {
    /// The indexed field path (dot notation for nested fields).
    pub field_name: String,
    /// Reject two documents sharing a key.
    pub unique: bool,
    /// Skip documents lacking the field instead of indexing them under
    /// `undefined`.
    pub sparse: bool,
    /// Time-to-live in seconds counted from the indexed timestamp field.
    pub expire_after_seconds: Option<f64>,
}

impl IndexOptions {
    /// A plain, non-unique, non-sparse index over a field.
    pub fn field<S: Into<String>>(field_name: S) -> Self {
        IndexOptions {
            field_name: field_name.into(),
            ..Default::default()
        }
    }

    /// Parses the payload of an `$$indexCreated` envelope.
    pub fn from_document(doc: &Document) -> Result<Self> {
        let field_name = match doc.get("fieldName") {
            Some(&Bson::String(ref name)) => name.clone(),
            _ => return Err(Error::new(
                ErrorKind::InvalidQuery,
                "cannot create an index without a fieldName"
            )),
        };

        Ok(IndexOptions {
            field_name,
            unique: doc.get("unique").map_or(false, BsonExt::is_truthy),
            sparse: doc.get("sparse").map_or(false, BsonExt::is_truthy),
            expire_after_seconds: doc
                .get("expireAfterSeconds")
                .and_then(BsonExt::as_number),
        })
    }

    /// Renders the payload of an `$$indexCreated` envelope.
    pub fn to_document(&self) -> Document {
        let mut doc = doc!{ "fieldName": self.field_name.clone() };

        if self.unique {
            doc.insert("unique", true);
        }
        if self.sparse {
            doc.insert("sparse", true);
        }
        if let Some(ttl) = self.expire_after_seconds {
            doc.insert("expireAfterSeconds", ttl);
        }

        doc
    }
}

/// One index over one field path.
#[derive(Debug)]
pub struct Index {
    /// The attributes this index was created with.
    options: IndexOptions,
    /// Projected key to the documents producing it.
    tree: BTreeMap<Key, Vec<SharedDoc>>,
}

impl Index {
    /// Creates an empty index.
    pub fn new(options: IndexOptions) -> Self {
        Index {
            options,
            tree: BTreeMap::new(),
        }
    }

    /// The indexed field path.
    pub fn field_name(&self) -> &str {
        &self.options.field_name
    }

    /// Whether this index enforces key uniqueness across documents.
    pub fn unique(&self) -> bool {
        self.options.unique
    }

    /// Whether documents lacking the field are skipped.
    pub fn sparse(&self) -> bool {
        self.options.sparse
    }

    /// The TTL in seconds, if this is a TTL index.
    pub fn expire_after_seconds(&self) -> Option<f64> {
        self.options.expire_after_seconds
    }

    /// The attributes this index was created with.
    pub fn options(&self) -> &IndexOptions {
        &self.options
    }

    /// The number of distinct keys currently in the tree.
    pub fn num_keys(&self) -> usize {
        self.tree.len()
    }

    /// Projects the keys of a document. `None` means the document takes no
    /// part in this index (sparse index, absent field). An array-valued
    /// field yields one key per *distinct* element.
    fn project_keys(&self, doc: &Document) -> Option<Vec<Key>> {
        match get_dot_value(doc, &self.options.field_name) {
            None => {
                if self.options.sparse {
                    None
                } else {
                    Some(vec![Key::undefined()])
                }
            }
            Some(Bson::Array(elements)) => {
                let mut distinct: Vec<Bson> = Vec::with_capacity(elements.len());
                for element in elements {
                    let duplicate = distinct.iter().any(|seen| {
                        compare_things(seen, &element) == Ordering::Equal
                    });
                    if !duplicate {
                        distinct.push(element);
                    }
                }
                Some(distinct.into_iter().map(Key::of).collect())
            }
            Some(value) => Some(vec![Key::of(value)]),
        }
    }

    /// Inserts a document. On a unique violation in the middle of an array
    /// fan-out, every key already inserted for this call is taken out again
    /// before the error is reported.
    pub fn insert(&mut self, doc: &SharedDoc) -> Result<()> {
        let keys = match self.project_keys(doc) {
            Some(keys) => keys,
            None => return Ok(()),
        };

        let mut inserted: Vec<Key> = Vec::with_capacity(keys.len());

        for key in keys {
            if self.options.unique && !self.tree.get(&key).map_or(true, Vec::is_empty) {
                let error = Error::unique_violated(
                    key.reportable(),
                    self.options.field_name.clone(),
                );
                for done in inserted {
                    self.delete_key(&done, doc);
                }
                return Err(error);
            }

            self.tree.entry(key.clone()).or_insert_with(Vec::new).push(doc.clone());
            inserted.push(key);
        }

        Ok(())
    }

    /// Inserts many documents; all-or-nothing.
    pub fn insert_all(&mut self, docs: &[SharedDoc]) -> Result<()> {
        for (position, doc) in docs.iter().enumerate() {
            if let Err(error) = self.insert(doc) {
                for done in &docs[..position] {
                    self.remove(done);
                }
                return Err(error);
            }
        }

        Ok(())
    }

    /// Removes a document, deleting every key it projects.
    pub fn remove(&mut self, doc: &SharedDoc) {
        if let Some(keys) = self.project_keys(doc) {
            for key in keys {
                self.delete_key(&key, doc);
            }
        }
    }

    /// Replaces `old` with `new`. On failure (the new document violates the
    /// unique constraint), the old document is restored first.
    pub fn update(&mut self, old: &SharedDoc, new: &SharedDoc) -> Result<()> {
        self.remove(old);

        if let Err(error) = self.insert(new) {
            // Re-inserting what was just removed cannot fail.
            let _ = self.insert(old);
            return Err(error);
        }

        Ok(())
    }

    /// Applies a batch of replacements atomically with respect to this
    /// index: on any failure, the already-applied pairs are undone in
    /// reverse order.
    pub fn update_batch(&mut self, pairs: &[(SharedDoc, SharedDoc)]) -> Result<()> {
        for (position, &(ref old, ref new)) in pairs.iter().enumerate() {
            if let Err(error) = self.update(old, new) {
                for &(ref done_old, ref done_new) in pairs[..position].iter().rev() {
                    let _ = self.update(done_new, done_old);
                }
                return Err(error);
            }
        }

        Ok(())
    }

    /// Undoes a committed batch of replacements; the datastore calls this
    /// when another index refused the same batch.
    pub fn revert_batch(&mut self, pairs: &[(SharedDoc, SharedDoc)]) {
        for &(ref old, ref new) in pairs.iter().rev() {
            let _ = self.update(new, old);
        }
    }

    /// Wipes the index.
    pub fn reset(&mut self) {
        self.tree.clear();
    }

    /// The documents whose projected key equals `key`.
    pub fn get_matching(&self, key: &Bson) -> Vec<SharedDoc> {
        self.tree
            .get(&Key::of(key.clone()))
            .cloned()
            .unwrap_or_default()
    }

    /// The union of matches over several keys, de-duplicated by `_id`
    /// (an array-valued document can match more than one key).
    pub fn get_matching_many(&self, keys: &[Bson]) -> Vec<SharedDoc> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut matches = Vec::new();

        for key in keys {
            for doc in self.get_matching(key) {
                let fresh = match doc.get_str("_id") {
                    Ok(id) => seen.insert(id.to_owned()),
                    Err(_) => true,
                };
                if fresh {
                    matches.push(doc);
                }
            }
        }

        matches
    }

    /// The documents whose key falls within the bounds described by an
    /// operator document (`$gt`/`$gte` and/or `$lt`/`$lte`), in key order.
    pub fn get_between_bounds(&self, bounds: &Document) -> Vec<SharedDoc> {
        let mut lower = Bound::Unbounded;
        let mut upper = Bound::Unbounded;

        for (operator, value) in bounds.iter() {
            let key = Key::of(value.clone());
            match operator.as_str() {
                "$gt"  => lower = Bound::Excluded(key),
                "$gte" => lower = Bound::Included(key),
                "$lt"  => upper = Bound::Excluded(key),
                "$lte" => upper = Bound::Included(key),
                _ => {}
            }
        }

        // An inverted or empty interval must not reach `BTreeMap::range`,
        // which panics on it.
        {
            let bound_key = |bound: &Bound<Key>| match *bound {
                Bound::Included(ref key) | Bound::Excluded(ref key) => Some(key.clone()),
                Bound::Unbounded => None,
            };

            if let (Some(low), Some(high)) = (bound_key(&lower), bound_key(&upper)) {
                match low.cmp(&high) {
                    Ordering::Greater => return Vec::new(),
                    Ordering::Equal => {
                        let both_inclusive = match (&lower, &upper) {
                            (&Bound::Included(_), &Bound::Included(_)) => true,
                            _ => false,
                        };
                        if !both_inclusive {
                            return Vec::new();
                        }
                    }
                    Ordering::Less => {}
                }
            }
        }

        self.tree
            .range((lower, upper))
            .flat_map(|(_, docs)| docs.iter().cloned())
            .collect()
    }

    /// Every indexed document, in key order.
    pub fn get_all(&self) -> Vec<SharedDoc> {
        self.tree
            .values()
            .flat_map(|docs| docs.iter().cloned())
            .collect()
    }

    /// Removes one document from one key's entry list.
    fn delete_key(&mut self, key: &Key, doc: &SharedDoc) {
        let emptied = match self.tree.get_mut(key) {
            Some(docs) => {
                docs.retain(|existing| !Rc::ptr_eq(existing, doc));
                docs.is_empty()
            }
            None => false,
        };

        if emptied {
            self.tree.remove(key);
        }
    }
}
