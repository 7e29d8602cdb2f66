//! The Medlar prelude provides re-exports of the most commonly used types
//! for convenience, including ones from the `bson` crate.

pub use crate::{
    coll::{
        Collection,
        CollectionOptions,
        RemoveOptions,
        UpdateOptions,
        UpdateOutcome,
    },
    cursor::Cursor,
    index::IndexOptions,
    literal::{ regex, Order, RegexOpts },
    error::Error as MedlarError,
    error::Result as MedlarResult,
    error::{ ErrorKind, ResultExt },
};
pub use bson::{ bson, doc, Bson, Document };
