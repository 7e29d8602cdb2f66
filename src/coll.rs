//! The datastore: a collection of schema-free documents over one data
//! file, with MongoDB-style querying, secondary indexes, TTL expiration
//! and crash-safe persistence.
//!
//! Every stateful operation runs through the collection's
//! [`Executor`](crate::exec::Executor), one at a time, so operations
//! submitted in program order complete in that order and each observes the
//! effects of all of its predecessors. Mutations keep the indexes and the
//! data file consistent with total rollback: a unique violation or an I/O
//! failure in the middle of a batch leaves both exactly as they were.

use std::cell::RefCell;
use std::fmt;
use std::path::PathBuf;
use std::rc::Rc;
use bson::{ Bson, Document };
use chrono::{ DateTime, LocalResult, TimeZone, Utc };
use crate::bsn;
use crate::cursor::Cursor;
use crate::error::{ Error, ErrorKind, Result, ResultExt };
use crate::exec::Executor;
use crate::ext::{ get_dot_value, BsonExt };
use crate::index::{ Index, IndexOptions, SharedDoc };
use crate::persist::{
    Persistence,
    SerializationHook,
    DEFAULT_CORRUPT_ALERT_THRESHOLD,
};
use crate::query::match_query;
use crate::uid;
use crate::update::modify;

/// Configuration of a collection.
pub struct CollectionOptions {
    /// Path of the primary data file. Empty or absent forces
    /// `in_memory_only`.
    pub filename: Option<PathBuf>,
    /// Skip all persistence.
    pub in_memory_only: bool,
    /// Perform `load_database` during construction; its failure becomes
    /// the error of [`Collection::new`].
    pub autoload: bool,
    /// Auto-manage `createdAt`/`updatedAt` timestamp fields.
    pub timestamp_data: bool,
    /// Fraction in `[0, 1]` of malformed data file lines above which a
    /// load is refused.
    pub corrupt_alert_threshold: f64,
    /// Per-line transform applied after serialization. Must be declared
    /// together with `before_deserialization`, its inverse.
    pub after_serialization: Option<SerializationHook>,
    /// Per-line transform applied before deserialization.
    pub before_deserialization: Option<SerializationHook>,
}

impl Default for CollectionOptions {
    fn default() -> Self {
        CollectionOptions {
            filename: None,
            in_memory_only: false,
            autoload: false,
            timestamp_data: false,
            corrupt_alert_threshold: DEFAULT_CORRUPT_ALERT_THRESHOLD,
            after_serialization: None,
            before_deserialization: None,
        }
    }
}

impl fmt::Debug for CollectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CollectionOptions")
            .field("filename", &self.filename)
            .field("in_memory_only", &self.in_memory_only)
            .field("autoload", &self.autoload)
            .field("timestamp_data", &self.timestamp_data)
            .field("corrupt_alert_threshold", &self.corrupt_alert_threshold)
            .field("hooks", &self.after_serialization.is_some())
            .finish()
    }
}

/// Options of an `update` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOptions {
    /// Update every match instead of only the first.
    pub multi: bool,
    /// Insert a document synthesized from the query (or the replacement
    /// body) when nothing matches.
    pub upsert: bool,
    /// Return the updated documents in the outcome.
    pub return_updated_docs: bool,
}

/// Options of a `remove` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoveOptions {
    /// Remove every match instead of only the first.
    pub multi: bool,
}

/// The outcome of an `update` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateOutcome {
    /// How many documents were written.
    pub num_affected: usize,
    /// The updated documents, when `return_updated_docs` was requested.
    pub updated_docs: Option<Vec<Document>>,
    /// Whether the update inserted rather than modified.
    pub upserted: bool,
}

/// The in-memory state: one index per indexed field, the `_id` index
/// always first.
#[derive(Debug)]
struct State {
    /// All indexes; `indexes[0]` is the unique `_id` index.
    indexes: Vec<Index>,
}

impl State {
    /// A state holding nothing but the empty `_id` index.
    fn fresh() -> Self {
        State {
            indexes: vec![Index::new(IndexOptions {
                field_name: String::from("_id"),
                unique: true,
                sparse: false,
                expire_after_seconds: None,
            })],
        }
    }

    /// The index over a field, if one exists.
    fn index(&self, field_name: &str) -> Option<&Index> {
        self.indexes.iter().find(|index| index.field_name() == field_name)
    }

    /// The always-present `_id` index.
    fn id_index(&self) -> &Index {
        &self.indexes[0]
    }
}

/// Shared innards of a collection.
struct Inner {
    /// The persistence layer (or its in-memory stub).
    persistence: Persistence,
    /// The FIFO queue all stateful operations run through.
    executor: Executor,
    /// Whether `createdAt`/`updatedAt` are auto-managed.
    timestamp_data: bool,
    /// Documents and indexes.
    state: RefCell<State>,
    /// Observers of the `compaction.done` event.
    compaction_listeners: RefCell<Vec<Rc<dyn Fn()>>>,
}

/// An embedded, single-file datastore of schema-free documents.
///
/// Cloning is cheap and yields a handle to the same datastore. A
/// collection is single-threaded by design; the data file is exclusively
/// owned by one collection instance.
#[derive(Clone)]
pub struct Collection {
    /// The shared innards.
    inner: Rc<Inner>,
}

impl Collection {
    /// Opens a collection.
    ///
    /// An empty or absent `filename` yields an in-memory collection. With
    /// `autoload` set, the data file is loaded before this returns and any
    /// load failure is returned here.
    pub fn new(options: CollectionOptions) -> Result<Self> {
        let CollectionOptions {
            filename,
            in_memory_only,
            autoload,
            timestamp_data,
            corrupt_alert_threshold,
            after_serialization,
            before_deserialization,
        } = options;

        let filename = match filename {
            Some(path) if !in_memory_only && !path.as_os_str().is_empty() => Some(path),
            _ => None,
        };

        let persistence = Persistence::new(
            filename,
            corrupt_alert_threshold,
            after_serialization,
            before_deserialization,
        )?;

        let coll = Collection {
            inner: Rc::new(Inner {
                persistence,
                executor: Executor::new(),
                timestamp_data,
                state: RefCell::new(State::fresh()),
                compaction_listeners: RefCell::new(Vec::new()),
            }),
        };

        if autoload {
            coll.load_database().context("error while autoloading the database")?;
        }

        Ok(coll)
    }

    /// Loads (or reloads) the data file: reconciles it with its side file,
    /// replays the log, rebuilds every recorded index, then compacts.
    ///
    /// On a corruption or I/O failure the in-memory state is left as it
    /// was; when a recorded unique index cannot be built over the replayed
    /// documents, loading fails and the in-memory state is empty.
    pub fn load_database(&self) -> Result<()> {
        self.inner.executor.run(|| self.load_database_inner())
    }

    fn load_database_inner(&self) -> Result<()> {
        let raw = self.inner.persistence.load()?;
        let docs: Vec<SharedDoc> = raw.docs.into_iter().map(Rc::new).collect();

        let mut state = State::fresh();

        if let Err(error) = state.indexes[0].insert_all(&docs) {
            *self.inner.state.borrow_mut() = State::fresh();
            return Err(error).context("duplicate _id in replayed data file");
        }

        for options in raw.indexes {
            if options.field_name == "_id" {
                continue;
            }

            let mut index = Index::new(options);
            if let Err(error) = index.insert_all(&docs) {
                *self.inner.state.borrow_mut() = State::fresh();
                return Err(error).context("can't rebuild index recorded in data file");
            }
            state.indexes.push(index);
        }

        *self.inner.state.borrow_mut() = state;

        // Collapse the replayed log into a minimal snapshot.
        self.compact_inner()
    }

    /// A synchronous snapshot of every live document.
    pub fn get_all_data(&self) -> Vec<Document> {
        self.inner.executor.run(|| {
            let state = self.inner.state.borrow();
            state
                .id_index()
                .get_all()
                .iter()
                .map(|doc| (**doc).clone())
                .collect()
        })
    }

    /// Inserts one document. A missing (or falsy) `_id` is replaced with a
    /// fresh 16-character alphanumeric id. Returns the document as stored.
    pub fn insert_one(&self, doc: Document) -> Result<Document> {
        self.inner
            .executor
            .run(|| self.insert_inner(vec![doc]))
            .map(|mut docs| docs.remove(0))
    }

    /// Inserts a batch of documents, all-or-nothing: a unique violation or
    /// an I/O failure anywhere leaves the datastore untouched.
    pub fn insert_many(&self, docs: Vec<Document>) -> Result<Vec<Document>> {
        self.inner.executor.run(|| self.insert_inner(docs))
    }

    fn insert_inner(&self, docs: Vec<Document>) -> Result<Vec<Document>> {
        let prepared = docs
            .into_iter()
            .map(|doc| self.prepare_for_insertion(doc))
            .collect::<Result<Vec<_>>>()?;
        let shared: Vec<SharedDoc> = prepared.into_iter().map(Rc::new).collect();

        self.add_to_indexes(&shared)?;

        let written = self
            .inner
            .persistence
            .persist_new_state(shared.iter().map(|doc| doc.as_ref()));
        if let Err(error) = written {
            self.remove_from_indexes(&shared);
            return Err(error);
        }

        Ok(shared.iter().map(|doc| (**doc).clone()).collect())
    }

    /// Validation, `_id` assignment and timestamping of a new document.
    fn prepare_for_insertion(&self, mut doc: Document) -> Result<Document> {
        let missing_id = doc.get("_id").map_or(true, |id| !id.is_truthy());
        if missing_id {
            doc.insert("_id", uid::new_document_id());
        }

        if self.inner.timestamp_data {
            let now = Bson::UtcDatetime(now_ms());
            if !doc.contains_key("createdAt") {
                doc.insert("createdAt", now.clone());
            }
            if !doc.contains_key("updatedAt") {
                doc.insert("updatedAt", now);
            }
        }

        bsn::validate_document(&doc)?;
        Ok(doc)
    }

    /// Adds a batch to every index; on any rejection, changes to prior
    /// indexes are undone.
    fn add_to_indexes(&self, docs: &[SharedDoc]) -> Result<()> {
        let mut state = self.inner.state.borrow_mut();

        for position in 0..state.indexes.len() {
            if let Err(error) = state.indexes[position].insert_all(docs) {
                for already in 0..position {
                    for doc in docs {
                        state.indexes[already].remove(doc);
                    }
                }
                return Err(error);
            }
        }

        Ok(())
    }

    /// Removes a batch from every index.
    fn remove_from_indexes(&self, docs: &[SharedDoc]) {
        let mut state = self.inner.state.borrow_mut();
        for index in &mut state.indexes {
            for doc in docs {
                index.remove(doc);
            }
        }
    }

    /// Starts a lazy query; finish it with
    /// [`exec()`](crate::cursor::Cursor::exec).
    pub fn cursor(&self, query: Document) -> Cursor {
        Cursor::new(self.clone(), query)
    }

    /// Returns deep copies of every document matching the query.
    pub fn find(&self, query: Document) -> Result<Vec<Document>> {
        self.cursor(query).exec()
    }

    /// Returns the first document matching the query, if any.
    pub fn find_one(&self, query: Document) -> Result<Option<Document>> {
        self.cursor(query).limit(1).exec().map(|mut docs| {
            if docs.is_empty() {
                None
            } else {
                Some(docs.remove(0))
            }
        })
    }

    /// Counts the documents matching the query.
    pub fn count(&self, query: Document) -> Result<usize> {
        self.inner.executor.run(|| {
            let candidates = self.get_candidates(&query)?;
            let mut matches = 0;

            for doc in candidates {
                if match_query(&query, &doc)? {
                    matches += 1;
                }
            }

            Ok(matches)
        })
    }

    /// Runs a cursor: candidate selection, match, user predicate, sort,
    /// pagination, projection; the results are deep copies.
    pub(crate) fn exec_cursor(&self, cursor: Cursor) -> Result<Vec<Document>> {
        self.inner.executor.run(|| {
            let candidates = self.get_candidates(cursor.query())?;
            let mut matched = Vec::new();

            for doc in candidates {
                if match_query(cursor.query(), &doc)? && cursor.accepted_by_where(&doc) {
                    matched.push((*doc).clone());
                }
            }

            let arranged = cursor.arrange(matched)?;
            arranged.iter().map(|doc| cursor.project(doc)).collect()
        })
    }

    /// Updates the documents matching `query` according to `update` (a set
    /// of `$`-modifiers or a replacement body).
    ///
    /// With `upsert` set and nothing matching, a document synthesized from
    /// the query (stripped of operators), or the replacement body itself,
    /// is inserted instead. Without `multi`, only the first match is
    /// touched.
    pub fn update(
        &self,
        query: Document,
        update: Document,
        options: UpdateOptions,
    ) -> Result<UpdateOutcome> {
        self.inner.executor.run(|| self.update_inner(&query, &update, options))
    }

    fn update_inner(
        &self,
        query: &Document,
        update: &Document,
        options: UpdateOptions,
    ) -> Result<UpdateOutcome> {
        let candidates = self.get_candidates(query)?;
        let mut matched: Vec<SharedDoc> = Vec::new();

        for doc in candidates {
            if match_query(query, &doc)? {
                matched.push(doc);
                if !options.multi {
                    break;
                }
            }
        }

        if matched.is_empty() {
            if !options.upsert {
                return Ok(UpdateOutcome::default());
            }

            let has_modifiers = update.keys().any(|k| k.starts_with('$'));
            let to_insert = if has_modifiers {
                // Base the new document on the query, stripped of all
                // operators, then apply the modifiers to it.
                modify(&bsn::deep_copy_strict(query), update)?
            } else {
                bsn::validate_document(update)?;
                update.clone()
            };

            let inserted = self.insert_inner(vec![to_insert])?;
            return Ok(UpdateOutcome {
                num_affected: 1,
                updated_docs: if options.return_updated_docs {
                    Some(inserted)
                } else {
                    None
                },
                upserted: true,
            });
        }

        let mut pairs: Vec<(SharedDoc, SharedDoc)> = Vec::with_capacity(matched.len());

        for old in &matched {
            let mut new_doc = modify(old, update)?;

            if self.inner.timestamp_data {
                if let Some(created) = old.get("createdAt") {
                    new_doc.insert("createdAt", created.clone());
                }
                new_doc.insert("updatedAt", Bson::UtcDatetime(now_ms()));
            }

            bsn::validate_document(&new_doc)?;
            pairs.push((old.clone(), Rc::new(new_doc)));
        }

        self.update_indexes(&pairs)?;

        let written = self
            .inner
            .persistence
            .persist_new_state(pairs.iter().map(|&(_, ref new)| new.as_ref()));
        if let Err(error) = written {
            let mut state = self.inner.state.borrow_mut();
            for index in &mut state.indexes {
                index.revert_batch(&pairs);
            }
            return Err(error);
        }

        Ok(UpdateOutcome {
            num_affected: pairs.len(),
            updated_docs: if options.return_updated_docs {
                Some(pairs.iter().map(|&(_, ref new)| (**new).clone()).collect())
            } else {
                None
            },
            upserted: false,
        })
    }

    /// Applies a replacement batch to every index, undoing everything on
    /// the first rejection.
    fn update_indexes(&self, pairs: &[(SharedDoc, SharedDoc)]) -> Result<()> {
        let mut state = self.inner.state.borrow_mut();

        for position in 0..state.indexes.len() {
            if let Err(error) = state.indexes[position].update_batch(pairs) {
                for already in 0..position {
                    state.indexes[already].revert_batch(pairs);
                }
                return Err(error);
            }
        }

        Ok(())
    }

    /// Removes the documents matching the query, appending one tombstone
    /// per removed document. Without `multi`, only the first match goes.
    /// Returns the number of removed documents.
    pub fn remove(&self, query: Document, options: RemoveOptions) -> Result<usize> {
        self.inner.executor.run(|| self.remove_inner(&query, options))
    }

    fn remove_inner(&self, query: &Document, options: RemoveOptions) -> Result<usize> {
        let candidates = self.get_candidates(query)?;
        let mut removed: Vec<SharedDoc> = Vec::new();
        let mut tombstones: Vec<Document> = Vec::new();

        for doc in candidates {
            if match_query(query, &doc)? {
                if let Some(id) = doc.get("_id") {
                    tombstones.push(doc!{ "$$deleted": true, "_id": id.clone() });
                }
                removed.push(doc);
                if !options.multi {
                    break;
                }
            }
        }

        {
            let mut state = self.inner.state.borrow_mut();
            for index in &mut state.indexes {
                for doc in &removed {
                    index.remove(doc);
                }
            }
        }

        if let Err(error) = self.inner.persistence.persist_new_state(&tombstones) {
            let mut state = self.inner.state.borrow_mut();
            for index in &mut state.indexes {
                for doc in &removed {
                    let _ = index.insert(doc);
                }
            }
            return Err(error);
        }

        Ok(removed.len())
    }

    /// Creates an index. Idempotent per field name: re-declaring an
    /// existing index is a no-op and the original options are retained.
    /// Creation over pre-existing data that violates a unique constraint
    /// fails and the partial index is discarded.
    pub fn ensure_index(&self, options: IndexOptions) -> Result<()> {
        self.inner.executor.run(|| self.ensure_index_inner(options))
    }

    fn ensure_index_inner(&self, options: IndexOptions) -> Result<()> {
        if options.field_name.is_empty() {
            return Err(Error::new(
                ErrorKind::InvalidQuery,
                "cannot create an index without a fieldName"
            ));
        }

        {
            let state = self.inner.state.borrow();
            if state.index(&options.field_name).is_some() {
                return Ok(());
            }
        }

        let envelope = doc!{ "$$indexCreated": options.to_document() };
        let mut index = Index::new(options);

        {
            let state = self.inner.state.borrow();
            index.insert_all(&state.id_index().get_all())?;
        }

        self.inner.state.borrow_mut().indexes.push(index);

        if let Err(error) = self.inner.persistence.persist_new_state(Some(&envelope)) {
            self.inner.state.borrow_mut().indexes.pop();
            return Err(error);
        }

        Ok(())
    }

    /// Destroys an index (the `_id` index excepted) and records the
    /// removal in the log.
    pub fn remove_index(&self, field_name: &str) -> Result<()> {
        self.inner.executor.run(|| {
            if field_name == "_id" {
                return Err(Error::new(
                    ErrorKind::InvalidQuery,
                    "cannot remove the _id index"
                ));
            }

            {
                let mut state = self.inner.state.borrow_mut();
                state.indexes.retain(|index| index.field_name() != field_name);
            }

            let envelope = doc!{ "$$indexRemoved": field_name };
            self.inner.persistence.persist_new_state(Some(&envelope))
        })
    }

    /// Compacts the data file down to the minimal snapshot of the current
    /// state, then notifies the `compaction.done` observers.
    pub fn compact_datafile(&self) -> Result<()> {
        self.inner.executor.run(|| self.compact_inner())
    }

    fn compact_inner(&self) -> Result<()> {
        if self.inner.persistence.in_memory() {
            return Ok(());
        }

        {
            let state = self.inner.state.borrow();
            let docs = state.id_index().get_all();
            let index_options: Vec<IndexOptions> = state.indexes[1..]
                .iter()
                .map(|index| index.options().clone())
                .collect();

            self.inner.persistence.persist_cached_database(
                docs.iter().map(|doc| doc.as_ref()),
                &index_options,
            )?;
        }

        let listeners: Vec<Rc<dyn Fn()>> =
            self.inner.compaction_listeners.borrow().clone();
        for listener in listeners {
            listener();
        }

        Ok(())
    }

    /// Registers an observer of the `compaction.done` event, called after
    /// each successful compaction.
    pub fn on_compaction<F: Fn() + 'static>(&self, listener: F) {
        self.inner.compaction_listeners.borrow_mut().push(Rc::new(listener));
    }

    /// Resolves the candidate documents for a query and applies the TTL
    /// gate: candidates whose indexed timestamp has expired are withheld
    /// from the result, and their removal is scheduled right behind the
    /// current operation.
    fn get_candidates(&self, query: &Document) -> Result<Vec<SharedDoc>> {
        let (raw, ttl_specs) = {
            let state = self.inner.state.borrow();
            let ttl_specs: Vec<(String, f64)> = state
                .indexes
                .iter()
                .filter_map(|index| {
                    index
                        .expire_after_seconds()
                        .map(|ttl| (index.field_name().to_owned(), ttl))
                })
                .collect();

            (candidates_from_indexes(&state, query)?, ttl_specs)
        };

        if ttl_specs.is_empty() {
            return Ok(raw);
        }

        let now = Utc::now().timestamp_millis();
        let mut fresh = Vec::with_capacity(raw.len());

        for doc in raw {
            let expired = ttl_specs.iter().any(|&(ref field, seconds)| {
                match get_dot_value(&doc, field) {
                    #[allow(clippy::cast_possible_truncation)]
                    Some(Bson::UtcDatetime(stamp)) => {
                        stamp.timestamp_millis() + ((seconds * 1000.0) as i64) < now
                    }
                    _ => false,
                }
            });

            if expired {
                if let Some(id) = doc.get("_id").cloned() {
                    let coll = self.clone();
                    self.inner.executor.defer(Box::new(move || {
                        let _ = coll.remove(
                            doc!{ "_id": id },
                            RemoveOptions { multi: false },
                        );
                    }));
                }
            } else {
                fresh.push(doc);
            }
        }

        Ok(fresh)
    }
}

impl fmt::Debug for Collection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.inner.persistence.filename() {
            Some(path) => write!(f, "Collection({})", path.display()),
            None => write!(f, "Collection(:memory:)"),
        }
    }
}

/// Picks the candidate documents for a query via the narrowest applicable
/// index lookup. The first top-level clause usable as an equality wins,
/// then the first `$in`, then the first pure range; a query with no
/// indexable clause scans everything.
fn candidates_from_indexes(state: &State, query: &Document) -> Result<Vec<SharedDoc>> {
    // Equality against an indexed field.
    for (key, value) in query.iter() {
        if !key.starts_with('$') && is_basic(value) {
            if let Some(index) = state.index(key) {
                return Ok(index.get_matching(value));
            }
        }
    }

    // `$in` against an indexed field.
    for (key, value) in query.iter() {
        if let Bson::Document(ref operators) = *value {
            if let Some(keys) = operators.get("$in") {
                if let Some(index) = state.index(key) {
                    return match *keys {
                        Bson::Array(ref elements) => {
                            Ok(index.get_matching_many(elements))
                        }
                        _ => Err(Error::new(
                            ErrorKind::InvalidQuery,
                            "$in operator called with a non-array"
                        )),
                    };
                }
            }
        }
    }

    // A pure range against an indexed field.
    for (key, value) in query.iter() {
        if let Bson::Document(ref operators) = *value {
            let pure_range = !operators.is_empty()
                && operators.keys().all(|operator| {
                    operator == "$lt" || operator == "$lte"
                        || operator == "$gt" || operator == "$gte"
                });

            if pure_range {
                if let Some(index) = state.index(key) {
                    return Ok(index.get_between_bounds(operators));
                }
            }
        }
    }

    Ok(state.id_index().get_all())
}

/// Kinds usable as index equality keys.
fn is_basic(value: &Bson) -> bool {
    match *value {
        Bson::Null
        | Bson::Boolean(_)
        | Bson::FloatingPoint(_)
        | Bson::I32(_)
        | Bson::I64(_)
        | Bson::String(_)
        | Bson::UtcDatetime(_) => true,
        _ => false,
    }
}

/// The current instant truncated to milliseconds, so that stored
/// timestamps survive the line format unchanged.
fn now_ms() -> DateTime<Utc> {
    let now = Utc::now();

    match Utc.timestamp_millis_opt(now.timestamp_millis()) {
        LocalResult::Single(truncated) => truncated,
        _ => now,
    }
}

#[cfg(test)]
mod tests {
    use bson::Bson;
    use crate::error::ErrorKind;
    use crate::index::IndexOptions;
    use super::*;

    fn memory() -> Collection {
        Collection::new(CollectionOptions::default()).unwrap()
    }

    #[test]
    fn insert_assigns_ids() {
        let coll = memory();

        let doc = coll.insert_one(doc!{ "a": 1 }).unwrap();
        let id = doc.get_str("_id").unwrap();
        assert_eq!(id.len(), 16);

        // A supplied truthy id is kept; a falsy one is replaced.
        let doc = coll.insert_one(doc!{ "_id": "custom", "a": 2 }).unwrap();
        assert_eq!(doc.get_str("_id").unwrap(), "custom");

        let doc = coll.insert_one(doc!{ "_id": "", "a": 3 }).unwrap();
        assert_ne!(doc.get_str("_id").unwrap(), "");
    }

    #[test]
    fn inserted_docs_are_findable() {
        let coll = memory();
        coll.insert_one(doc!{ "a": 1, "kind": "odd" }).unwrap();
        coll.insert_one(doc!{ "a": 2, "kind": "even" }).unwrap();
        coll.insert_one(doc!{ "a": 3, "kind": "odd" }).unwrap();

        assert_eq!(coll.find(doc!{ "kind": "odd" }).unwrap().len(), 2);
        assert_eq!(coll.count(doc!{ "a": { "$gte": 2 } }).unwrap(), 2);
        assert!(coll.find_one(doc!{ "a": 4 }).unwrap().is_none());
        assert_eq!(coll.get_all_data().len(), 3);
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let coll = memory();
        coll.insert_one(doc!{ "_id": "same" }).unwrap();

        let error = coll.insert_one(doc!{ "_id": "same" }).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::UniqueViolated);
        assert_eq!(coll.get_all_data().len(), 1);
    }

    #[test]
    fn update_modifies_matches() {
        let coll = memory();
        coll.insert_one(doc!{ "a": 1, "n": 0 }).unwrap();
        coll.insert_one(doc!{ "a": 2, "n": 0 }).unwrap();

        let outcome = coll
            .update(
                doc!{},
                doc!{ "$inc": { "n": 1 } },
                UpdateOptions { multi: true, ..Default::default() },
            )
            .unwrap();
        assert_eq!(outcome.num_affected, 2);
        assert!(!outcome.upserted);
        assert_eq!(coll.count(doc!{ "n": 1 }).unwrap(), 2);

        // Non-multi touches only the first match.
        let outcome = coll
            .update(doc!{}, doc!{ "$inc": { "n": 1 } }, UpdateOptions::default())
            .unwrap();
        assert_eq!(outcome.num_affected, 1);
        assert_eq!(coll.count(doc!{ "n": 2 }).unwrap(), 1);
    }

    #[test]
    fn upsert_synthesizes_from_query() {
        let coll = memory();

        let outcome = coll
            .update(
                doc!{ "$or": [ { "a": 4 }, { "a": 5 } ] },
                doc!{ "$set": { "hello": "world" }, "$inc": { "bloup": 3 } },
                UpdateOptions {
                    upsert: true,
                    return_updated_docs: true,
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(outcome.num_affected, 1);
        assert!(outcome.upserted);

        let docs = outcome.updated_docs.unwrap();
        assert_eq!(docs[0].get_str("hello").unwrap(), "world");
        assert_eq!(docs[0].get("bloup").and_then(BsonExt::as_integer), Some(3));
        assert!(docs[0].get_str("_id").is_ok());
        assert_eq!(coll.get_all_data().len(), 1);
    }

    #[test]
    fn upsert_uses_replacement_bodies_verbatim() {
        let coll = memory();

        let outcome = coll
            .update(
                doc!{ "missing": true },
                doc!{ "fresh": "doc" },
                UpdateOptions { upsert: true, ..Default::default() },
            )
            .unwrap();

        assert!(outcome.upserted);
        assert_eq!(coll.count(doc!{ "fresh": "doc" }).unwrap(), 1);
    }

    #[test]
    fn remove_honors_multi() {
        let coll = memory();
        for n in 0..3 {
            coll.insert_one(doc!{ "n": n }).unwrap();
        }

        assert_eq!(coll.remove(doc!{ "n": { "$gte": 0 } },
                               RemoveOptions::default()).unwrap(),
                   1);
        assert_eq!(coll.remove(doc!{ "n": { "$gte": 0 } },
                               RemoveOptions { multi: true }).unwrap(),
                   2);
        assert!(coll.get_all_data().is_empty());
    }

    #[test]
    fn unique_index_rolls_back_bulk_inserts() {
        let coll = memory();
        coll.ensure_index(IndexOptions {
            unique: true,
            ..IndexOptions::field("a")
        }).unwrap();

        let error = coll
            .insert_many(vec![
                doc!{ "a": 5, "b": "hello" },
                doc!{ "a": 42, "b": "world" },
                doc!{ "a": 5, "b": "bloup" },
                doc!{ "a": 7 },
            ])
            .unwrap_err();

        assert_eq!(error.kind(), ErrorKind::UniqueViolated);
        assert!(coll.find(doc!{}).unwrap().is_empty());
    }

    #[test]
    fn ensure_index_is_idempotent_and_checked() {
        let coll = memory();
        coll.insert_one(doc!{ "a": 1 }).unwrap();
        coll.insert_one(doc!{ "a": 1 }).unwrap();

        coll.ensure_index(IndexOptions::field("b")).unwrap();
        // Re-declaring with different options is a no-op, not an error.
        coll.ensure_index(IndexOptions {
            unique: true,
            ..IndexOptions::field("b")
        }).unwrap();
        coll.insert_one(doc!{ "b": 9 }).unwrap();
        coll.insert_one(doc!{ "b": 9 }).unwrap();

        // Creating a unique index over violating data fails outright.
        let error = coll.ensure_index(IndexOptions {
            unique: true,
            ..IndexOptions::field("a")
        }).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::UniqueViolated);

        // The partial index is gone: inserting another duplicate works.
        coll.insert_one(doc!{ "a": 1 }).unwrap();

        assert!(coll.ensure_index(IndexOptions::field("")).is_err());
    }

    #[test]
    fn update_rolls_back_across_indexes() {
        let coll = memory();
        coll.ensure_index(IndexOptions {
            unique: true,
            ..IndexOptions::field("u")
        }).unwrap();

        coll.insert_one(doc!{ "_id": "1", "u": 1, "tag": "x" }).unwrap();
        coll.insert_one(doc!{ "_id": "2", "u": 2, "tag": "x" }).unwrap();

        // Both matches would move to u = 9; the second violates, so the
        // first must roll back too.
        let error = coll
            .update(
                doc!{ "tag": "x" },
                doc!{ "$set": { "u": 9 } },
                UpdateOptions { multi: true, ..Default::default() },
            )
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::UniqueViolated);

        assert_eq!(coll.count(doc!{ "u": 1 }).unwrap(), 1);
        assert_eq!(coll.count(doc!{ "u": 2 }).unwrap(), 1);
        assert_eq!(coll.count(doc!{ "u": 9 }).unwrap(), 0);
    }

    #[test]
    fn id_updates_are_rejected() {
        let coll = memory();
        coll.insert_one(doc!{ "_id": "stay", "a": 1 }).unwrap();

        let error = coll
            .update(
                doc!{ "_id": "stay" },
                doc!{ "$set": { "_id": "go" } },
                UpdateOptions::default(),
            )
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::InvalidModifier);
        assert_eq!(coll.count(doc!{ "_id": "stay" }).unwrap(), 1);
    }

    #[test]
    fn timestamps_are_managed_when_asked() {
        let coll = Collection::new(CollectionOptions {
            timestamp_data: true,
            ..Default::default()
        }).unwrap();

        let doc = coll.insert_one(doc!{ "a": 1 }).unwrap();
        assert!(doc.get_utc_datetime("createdAt").is_ok());
        assert!(doc.get_utc_datetime("updatedAt").is_ok());

        // User-supplied timestamps are preserved verbatim.
        let stamp = Bson::UtcDatetime(now_ms());
        let doc = coll
            .insert_one(doc!{ "a": 2, "createdAt": stamp.clone() })
            .unwrap();
        assert_eq!(doc.get("createdAt"), Some(&stamp));

        // Updates refresh updatedAt but keep createdAt.
        coll.update(
            doc!{ "a": 1 },
            doc!{ "$set": { "b": 1 } },
            UpdateOptions::default(),
        ).unwrap();
        let updated = coll.find_one(doc!{ "a": 1 }).unwrap().unwrap();
        assert!(updated.get_utc_datetime("createdAt").is_ok());
        assert!(updated.get_utc_datetime("updatedAt").is_ok());
    }

    #[test]
    fn forbidden_field_names_do_not_get_in() {
        let coll = memory();

        assert_eq!(coll.insert_one(doc!{ "$bad": 1 }).unwrap_err().kind(),
                   ErrorKind::InvalidFieldName);
        assert_eq!(coll.insert_one(doc!{ "a.b": 1 }).unwrap_err().kind(),
                   ErrorKind::InvalidFieldName);
        assert!(coll.get_all_data().is_empty());
    }

    #[test]
    fn remove_index_forgets_the_field() {
        let coll = memory();
        coll.ensure_index(IndexOptions {
            unique: true,
            ..IndexOptions::field("a")
        }).unwrap();
        coll.insert_one(doc!{ "a": 1 }).unwrap();

        coll.remove_index("a").unwrap();
        // Uniqueness is no longer enforced.
        coll.insert_one(doc!{ "a": 1 }).unwrap();

        assert!(coll.remove_index("_id").is_err());
    }

    #[test]
    fn sort_skip_limit_project() {
        let coll = memory();
        for n in &[3, 1, 2, 5, 4] {
            coll.insert_one(doc!{ "n": *n, "tag": "t" }).unwrap();
        }

        let docs = coll
            .cursor(doc!{})
            .sort(doc!{ "n": 1 })
            .skip(1)
            .limit(3)
            .projection(doc!{ "n": 1, "_id": 0 })
            .exec()
            .unwrap();

        assert_eq!(docs, vec![
            doc!{ "n": 2 },
            doc!{ "n": 3 },
            doc!{ "n": 4 },
        ]);
    }
}
