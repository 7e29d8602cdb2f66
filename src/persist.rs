//! The persistence layer: an append-only log of one record per line over a
//! single file.
//!
//! A record is the line serialization of either a live document, a
//! `{"$$deleted": true, "_id": ...}` tombstone, an `$$indexCreated`
//! envelope, or an `$$indexRemoved` envelope. Replaying the log from the
//! top yields the current state; compaction rewrites the file down to the
//! minimal snapshot through the crash-safe replacement protocol of
//! [`storage`](crate::storage).

use std::collections::HashMap;
use std::fmt;
use std::path::{ Path, PathBuf };
use bson::{ Bson, Document };
use crate::bsn;
use crate::error::{ Error, ErrorKind, Result };
use crate::index::IndexOptions;
use crate::storage;
use crate::uid;

/// The default fraction of malformed lines above which a load is refused.
pub const DEFAULT_CORRUPT_ALERT_THRESHOLD: f64 = 0.1;

/// A per-line text transform. Declared in bijective pairs:
/// `before(after(line)) == line`.
pub type SerializationHook = Box<dyn Fn(&str) -> String>;

/// The outcome of replaying a data file: the live documents (in first-seen
/// order) and the indexes to recreate.
#[derive(Debug, Default)]
pub struct RawState {
    /// Live documents keyed by their first-seen position.
    pub docs: Vec<Document>,
    /// Options of every index recorded in the log, in creation order.
    pub indexes: Vec<IndexOptions>,
}

/// The persistence layer of one datastore.
pub struct Persistence {
    /// Path of the primary data file; `None` for in-memory datastores.
    filename: Option<PathBuf>,
    /// Fraction in `[0, 1]` of tolerated malformed lines.
    corrupt_alert_threshold: f64,
    /// Applied to each line after serialization.
    after_serialization: Option<SerializationHook>,
    /// Applied to each line before deserialization.
    before_deserialization: Option<SerializationHook>,
}

impl Persistence {
    /// Creates the persistence layer, verifying the serialization hook
    /// pair. Declaring only one hook of the two is refused outright, and a
    /// declared pair is checked for bijectivity on canary strings whenever
    /// a non-empty data file is already present (a mismatched pair would
    /// silently corrupt it).
    pub fn new(
        filename: Option<PathBuf>,
        corrupt_alert_threshold: f64,
        after_serialization: Option<SerializationHook>,
        before_deserialization: Option<SerializationHook>,
    ) -> Result<Self> {
        let persistence = match (after_serialization, before_deserialization) {
            (Some(after), Some(before)) => Persistence {
                filename,
                corrupt_alert_threshold: clamp_threshold(corrupt_alert_threshold),
                after_serialization: Some(after),
                before_deserialization: Some(before),
            },
            (None, None) => Persistence {
                filename,
                corrupt_alert_threshold: clamp_threshold(corrupt_alert_threshold),
                after_serialization: None,
                before_deserialization: None,
            },
            _ => return Err(Error::new(
                ErrorKind::HookMismatch,
                "afterSerialization and beforeDeserialization must be declared together"
            )),
        };

        persistence.verify_hooks()?;
        Ok(persistence)
    }

    /// Checks `before(after(x)) == x` on canary strings, but only when a
    /// non-empty data file is at stake.
    fn verify_hooks(&self) -> Result<()> {
        let (after, before) = match (
            self.after_serialization.as_ref(),
            self.before_deserialization.as_ref(),
        ) {
            (Some(after), Some(before)) => (after, before),
            _ => return Ok(()),
        };

        let at_stake = self.filename.as_ref().map_or(false, |path| {
            storage::exists(path)
                && storage::read(path).map_or(false, |raw| !raw.is_empty())
        });
        if !at_stake {
            return Ok(());
        }

        for length in 1..16 {
            let canary = uid::uid(length);
            if before(&after(&canary)) != canary {
                return Err(Error::new(
                    ErrorKind::HookMismatch,
                    "beforeDeserialization is not the reverse of afterSerialization, \
                     cautiously refusing to start to prevent data loss"
                ));
            }
        }

        Ok(())
    }

    /// The path of the primary data file, if any.
    pub fn filename(&self) -> Option<&Path> {
        self.filename.as_ref().map(PathBuf::as_path)
    }

    /// Whether this datastore skips persistence entirely.
    pub fn in_memory(&self) -> bool {
        self.filename.is_none()
    }

    /// Serializes one record and applies the after-serialization hook.
    fn encode_line(&self, doc: &Document) -> Result<String> {
        let line = bsn::serialize_line(doc)?;

        Ok(match self.after_serialization {
            Some(ref hook) => hook(&line),
            None => line,
        })
    }

    /// Applies the before-deserialization hook and parses one record.
    fn decode_line(&self, line: &str) -> Result<Document> {
        match self.before_deserialization {
            Some(ref hook) => bsn::deserialize_line(&hook(line)),
            None => bsn::deserialize_line(line),
        }
    }

    /// Appends records for freshly accepted state (new or updated
    /// documents, tombstones, index envelopes) to the data file, durably
    /// and in one write.
    pub fn persist_new_state<'a, I>(&self, docs: I) -> Result<()>
        where I: IntoIterator<Item = &'a Document>
    {
        let path = match self.filename {
            Some(ref path) => path,
            None => return Ok(()),
        };

        let lines = docs
            .into_iter()
            .map(|doc| self.encode_line(doc))
            .collect::<Result<Vec<_>>>()?;

        if lines.is_empty() {
            return Ok(());
        }

        storage::append(path, &lines.join("\n"))
    }

    /// Replays raw file contents into the state they describe.
    ///
    /// Every parsed document with an `_id` overwrites any earlier record
    /// with the same id; tombstones delete it; index envelopes accumulate.
    /// Lines that parse but carry no `_id` are dropped silently. Malformed
    /// lines are counted, and when their fraction of all non-empty lines
    /// exceeds the corruption alert threshold, the whole load is refused.
    pub fn treat_raw_data(&self, raw: &str) -> Result<RawState> {
        // Slot map: overwriting keeps a document's first-seen position,
        // deleting and re-adding moves it to the back.
        let mut slots: Vec<Option<Document>> = Vec::new();
        let mut slot_by_id: HashMap<String, usize> = HashMap::new();
        let mut indexes: Vec<(String, IndexOptions)> = Vec::new();
        let mut total = 0_usize;
        let mut corrupt = 0_usize;

        for line in raw.split('\n').filter(|line| !line.is_empty()) {
            total += 1;

            let doc = match self.decode_line(line) {
                Ok(doc) => doc,
                Err(_) => {
                    corrupt += 1;
                    continue;
                }
            };

            if let Some(&Bson::Document(ref options)) = doc.get("$$indexCreated") {
                if let Ok(options) = IndexOptions::from_document(options) {
                    indexes.retain(|&(ref name, _)| *name != options.field_name);
                    indexes.push((options.field_name.clone(), options));
                }
                continue;
            }

            if let Some(&Bson::String(ref field_name)) = doc.get("$$indexRemoved") {
                indexes.retain(|&(ref name, _)| name != field_name);
                continue;
            }

            let id = match doc.get_str("_id") {
                Ok(id) => id.to_owned(),
                Err(_) => continue,
            };

            if doc.get("$$deleted") == Some(&Bson::Boolean(true)) {
                if let Some(slot) = slot_by_id.remove(&id) {
                    slots[slot] = None;
                }
            } else if let Some(&slot) = slot_by_id.get(&id) {
                slots[slot] = Some(doc);
            } else {
                slot_by_id.insert(id, slots.len());
                slots.push(Some(doc));
            }
        }

        #[allow(clippy::cast_precision_loss)]
        let ratio = if total == 0 { 0.0 } else { corrupt as f64 / total as f64 };

        if ratio > self.corrupt_alert_threshold {
            warn!(
                "refusing load: {} of {} lines are corrupt (threshold {})",
                corrupt, total, self.corrupt_alert_threshold,
            );
            return Err(Error::corruption(corrupt, total, self.corrupt_alert_threshold));
        }

        Ok(RawState {
            docs: slots.into_iter().filter_map(|slot| slot).collect(),
            indexes: indexes.into_iter().map(|(_, options)| options).collect(),
        })
    }

    /// Loads the data file: reconcile with the side file, read, replay.
    pub fn load(&self) -> Result<RawState> {
        let path = match self.filename {
            Some(ref path) => path,
            None => return Ok(RawState::default()),
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                storage::ensure_directory_exists(parent)?;
            }
        }

        storage::ensure_datafile_integrity(path)?;
        let raw = storage::read(path)?;
        let state = self.treat_raw_data(&raw)?;

        debug!(
            "loaded {} documents and {} indexes from {}",
            state.docs.len(), state.indexes.len(), path.display(),
        );

        Ok(state)
    }

    /// Compaction: serializes the complete current state (every live
    /// document, then one `$$indexCreated` envelope per listed index) and
    /// atomically replaces the data file with it.
    pub fn persist_cached_database<'a, I>(
        &self,
        docs: I,
        indexes: &[IndexOptions],
    ) -> Result<()>
        where I: IntoIterator<Item = &'a Document>
    {
        let path = match self.filename {
            Some(ref path) => path,
            None => return Ok(()),
        };

        let mut buffer = String::new();

        for doc in docs {
            buffer.push_str(&self.encode_line(doc)?);
            buffer.push('\n');
        }

        for options in indexes {
            let envelope = doc!{ "$$indexCreated": options.to_document() };
            buffer.push_str(&self.encode_line(&envelope)?);
            buffer.push('\n');
        }

        storage::write_and_replace(path, &buffer)?;
        debug!("compacted data file {}", path.display());

        Ok(())
    }
}

impl fmt::Debug for Persistence {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Persistence")
            .field("filename", &self.filename)
            .field("corrupt_alert_threshold", &self.corrupt_alert_threshold)
            .field("hooks", &self.after_serialization.is_some())
            .finish()
    }
}

/// The threshold is a fraction; out-of-range configurations are clamped.
fn clamp_threshold(threshold: f64) -> f64 {
    threshold.max(0.0).min(1.0)
}

#[cfg(test)]
mod tests {
    use bson::Bson;
    use crate::error::ErrorKind;
    use crate::index::IndexOptions;
    use super::*;

    fn plain() -> Persistence {
        Persistence::new(None, DEFAULT_CORRUPT_ALERT_THRESHOLD, None, None).unwrap()
    }

    #[test]
    fn replay_overwrites_by_id() {
        let raw = concat!(
            r#"{"_id":"1","a":1}"#, "\n",
            r#"{"_id":"2","a":2}"#, "\n",
            r#"{"_id":"1","a":10}"#, "\n",
        );
        let state = plain().treat_raw_data(raw).unwrap();

        assert_eq!(state.docs, vec![
            doc!{ "_id": "1", "a": Bson::I64(10) },
            doc!{ "_id": "2", "a": Bson::I64(2) },
        ]);
    }

    #[test]
    fn replay_honors_tombstones() {
        let raw = concat!(
            r#"{"_id":"1","a":1}"#, "\n",
            r#"{"$$deleted":true,"_id":"1"}"#, "\n",
            r#"{"_id":"2","a":2}"#, "\n",
        );
        let state = plain().treat_raw_data(raw).unwrap();

        assert_eq!(state.docs, vec![doc!{ "_id": "2", "a": Bson::I64(2) }]);
    }

    #[test]
    fn replay_collects_and_removes_indexes() {
        let raw = concat!(
            r#"{"$$indexCreated":{"fieldName":"a","unique":true}}"#, "\n",
            r#"{"$$indexCreated":{"fieldName":"b"}}"#, "\n",
            r#"{"$$indexRemoved":"a"}"#, "\n",
        );
        let state = plain().treat_raw_data(raw).unwrap();

        assert_eq!(state.indexes, vec![IndexOptions::field("b")]);
    }

    #[test]
    fn replay_drops_lines_without_ids() {
        let raw = concat!(
            r#"{"a":1}"#, "\n",
            r#"{"_id":"1","a":1}"#, "\n",
        );
        let state = plain().treat_raw_data(raw).unwrap();

        assert_eq!(state.docs.len(), 1);
    }

    #[test]
    fn corruption_threshold_refuses_bad_files() {
        let mostly_bad = "garbage\n{\"_id\":\"1\"}\nmore garbage\n";
        let error = plain().treat_raw_data(mostly_bad).unwrap_err();

        assert_eq!(error.kind(), ErrorKind::Corruption);
        let ratio = error.corruption_ratio().unwrap();
        assert!((ratio - 2.0 / 3.0).abs() < 1e-9);

        // A tolerant threshold accepts the same file.
        let lax = Persistence::new(None, 1.0, None, None).unwrap();
        assert_eq!(lax.treat_raw_data(mostly_bad).unwrap().docs.len(), 1);
    }

    #[test]
    fn empty_lines_are_ignored() {
        let raw = "\n\n{\"_id\":\"1\"}\n\n\n";
        let state = plain().treat_raw_data(raw).unwrap();

        assert_eq!(state.docs.len(), 1);
    }

    #[test]
    fn a_lone_hook_is_refused() {
        let error = Persistence::new(
            None,
            DEFAULT_CORRUPT_ALERT_THRESHOLD,
            Some(Box::new(|line: &str| line.to_owned())),
            None,
        ).unwrap_err();

        assert_eq!(error.kind(), ErrorKind::HookMismatch);
    }

    #[test]
    fn hooks_wrap_every_line() {
        let persistence = Persistence::new(
            None,
            DEFAULT_CORRUPT_ALERT_THRESHOLD,
            Some(Box::new(|line: &str| format!("~{}", line))),
            Some(Box::new(|line: &str| line[1..].to_owned())),
        ).unwrap();

        let doc = doc!{ "_id": "1", "a": Bson::I64(1) };
        let line = persistence.encode_line(&doc).unwrap();

        assert!(line.starts_with('~'));
        assert_eq!(persistence.decode_line(&line).unwrap(), doc);
    }

    #[test]
    fn replay_deletion_then_reinsert_moves_to_the_back() {
        let raw = concat!(
            r#"{"_id":"1","a":1}"#, "\n",
            r#"{"_id":"2","a":2}"#, "\n",
            r#"{"$$deleted":true,"_id":"1"}"#, "\n",
            r#"{"_id":"1","a":3}"#, "\n",
        );
        let state = plain().treat_raw_data(raw).unwrap();

        assert_eq!(state.docs, vec![
            doc!{ "_id": "2", "a": Bson::I64(2) },
            doc!{ "_id": "1", "a": Bson::I64(3) },
        ]);
    }
}
