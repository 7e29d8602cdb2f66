//! # Medlar: the embedded single-file document store
//!
//! This library is an embedded, in-process datastore for JSON-like
//! documents with MongoDB-flavored querying, secondary indexes, and
//! crash-safe persistence over a single append-only file. It is meant for
//! desktop and server applications that want durable, schema-free storage
//! without bolting on an external database.
//!
//! ### Documents
//!
//! Documents are loosely-typed BSON [`Document`](bson::Document)s, most
//! conveniently written with the `doc!` macro. Top-level and nested field
//! names must not begin with `$` nor contain a `.`; every stored document
//! carries a string `_id` (16 random alphanumeric characters when
//! auto-assigned) which is immutable once set.
//!
//! ```
//! #[macro_use]
//! extern crate bson;
//! extern crate medlar;
//!
//! use medlar::prelude::*;
//!
//! # fn main() -> MedlarResult<()> {
//! // No filename: an in-memory collection, no persistence.
//! let users = Collection::new(CollectionOptions::default())?;
//!
//! users.insert_one(doc!{
//!     "name": "Eve Sdropper",
//!     "age": 24,
//!     "languages": ["rust", "french"],
//! })?;
//!
//! let found = users.find_one(doc!{ "languages": "rust" })?;
//! assert!(found.is_some());
//! # Ok(())
//! # }
//! ```
//!
//! ### Durable collections
//!
//! Give the collection a `filename` and it persists every operation as
//! one line of an append-only log, compacted on load (and on demand)
//! through a crash-safe temp-file-and-rename protocol. Reopening the same
//! file restores the exact previous state, indexes included.
//!
//! ```no_run
//! # #[macro_use]
//! # extern crate bson;
//! # extern crate medlar;
//! #
//! # use medlar::prelude::*;
//! #
//! # fn main() -> MedlarResult<()> {
//! let db = Collection::new(CollectionOptions {
//!     filename: Some("users.db".into()),
//!     autoload: true,
//!     ..Default::default()
//! })?;
//!
//! db.insert_one(doc!{ "name": "Robert Tables" })?; // xkcd.com/327
//! # Ok(())
//! # }
//! ```
//!
//! ### Querying
//!
//! Queries are documents too. A field name (dot notation allowed) maps to
//! either a literal to deep-compare against or an operator document using
//! `$lt`/`$lte`/`$gt`/`$gte`, `$eq`/`$ne`, `$in`/`$nin`, `$exists`,
//! `$regex`, `$size` and `$elemMatch`; `$or`, `$and` and `$not` combine
//! whole subqueries. Array-valued fields match when any element does.
//!
//! The eager forms [`find`](coll::Collection::find),
//! [`find_one`](coll::Collection::find_one) and
//! [`count`](coll::Collection::count) share their machinery with the lazy
//! [`cursor`](coll::Collection::cursor) form:
//!
//! ```
//! # #[macro_use]
//! # extern crate bson;
//! # extern crate medlar;
//! #
//! # use medlar::prelude::*;
//! #
//! # fn main() -> MedlarResult<()> {
//! # let users = Collection::new(CollectionOptions::default())?;
//! # users.insert_many(vec![
//! #     doc!{ "name": "a", "age": 31 },
//! #     doc!{ "name": "b", "age": 62 },
//! # ])?;
//! let seniors = users
//!     .cursor(doc!{ "age": { "$gte": 60 } })
//!     .sort(doc!{ "age": Order::Descending })
//!     .limit(10)
//!     .projection(doc!{ "name": 1, "age": 1 })
//!     .exec()?;
//! # assert_eq!(seniors.len(), 1);
//! # Ok(())
//! # }
//! ```
//!
//! ### Updating
//!
//! An update document is either a pure replacement body or a set of
//! modifiers: `$set`, `$unset`, `$inc`, `$min`/`$max`, `$push` (with
//! `$each` and `$slice`), `$addToSet`, `$pop` and `$pull`. With `upsert`,
//! a missing match inserts a document synthesized from the query:
//!
//! ```
//! # #[macro_use]
//! # extern crate bson;
//! # extern crate medlar;
//! #
//! # use medlar::prelude::*;
//! #
//! # fn main() -> MedlarResult<()> {
//! # let stats = Collection::new(CollectionOptions::default())?;
//! stats.update(
//!     doc!{ "page": "/index" },
//!     doc!{ "$inc": { "hits": 1 } },
//!     UpdateOptions { upsert: true, ..Default::default() },
//! )?;
//! # assert_eq!(stats.count(doc!{ "page": "/index" })?, 1);
//! # Ok(())
//! # }
//! ```
//!
//! ### Indexes
//!
//! [`ensure_index`](coll::Collection::ensure_index) creates a secondary
//! index over a (possibly dotted) field path, with `unique` and `sparse`
//! variants; an index over `_id` always exists. Array-valued fields fan
//! out to one entry per distinct element. An index with
//! `expire_after_seconds` turns into a TTL index: documents whose indexed
//! timestamp is too old vanish from reads and are reaped shortly after.
//! Index creations and removals are persisted, so a reopened datastore
//! rebuilds them.
//!
//! Mutations are transactional with respect to the indexes: when a batch
//! insert or a multi-document update runs into a unique violation halfway
//! through, everything already applied is rolled back and both the
//! in-memory state and the data file stay as they were.
//!
//! ### Concurrency model
//!
//! Every collection owns a FIFO executor through which all stateful
//! operations pass, one at a time; operations issued in program order
//! complete in that order, and each observes all earlier effects. A
//! collection is deliberately single-threaded (`!Send`, `!Sync`): give
//! each datastore to one thread, and give each data file to exactly one
//! collection.

#![doc(html_root_url = "https://docs.rs/medlar/0.1.2")]
#![deny(missing_debug_implementations, missing_copy_implementations,
        trivial_casts, trivial_numeric_casts,
        unsafe_code,
        unstable_features,
        anonymous_parameters, bare_trait_objects,
        variant_size_differences,
        unused_import_braces, unused_qualifications, missing_docs)]
#![allow(clippy::single_match, clippy::match_same_arms, clippy::match_ref_pats,
         clippy::clone_on_ref_ptr, clippy::needless_pass_by_value)]
#![deny(clippy::wrong_pub_self_convention, clippy::used_underscore_binding,
        clippy::stutter, clippy::similar_names, clippy::pub_enum_variant_names,
        clippy::missing_docs_in_private_items,
        clippy::non_ascii_literal, clippy::unicode_not_nfc,
        clippy::result_unwrap_used, clippy::option_unwrap_used,
        clippy::option_map_unwrap_or_else, clippy::option_map_unwrap_or,
        clippy::filter_map,
        clippy::shadow_unrelated, clippy::shadow_reuse, clippy::shadow_same,
        clippy::int_plus_one, clippy::string_add_assign, clippy::if_not_else,
        clippy::invalid_upcast_comparisons,
        clippy::cast_precision_loss, clippy::cast_lossless,
        clippy::cast_possible_wrap, clippy::cast_possible_truncation,
        clippy::mutex_integer, clippy::mut_mut, clippy::items_after_statements,
        clippy::print_stdout, clippy::mem_forget, clippy::maybe_infinite_iter)]

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate bson;
#[macro_use]
extern crate serde_derive;
#[macro_use]
extern crate log;
extern crate chrono;
extern crate rand;
extern crate regex;
extern crate serde;
extern crate serde_json;

pub mod coll;
pub mod cursor;
pub mod index;
pub mod query;
pub mod update;
pub mod persist;
pub mod storage;
pub mod exec;
pub mod uid;
pub mod literal;
pub mod error;
pub mod prelude;

pub mod bsn;
pub mod ext;
