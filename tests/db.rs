//! Integration tests for checking high-level functionality of the most
//! important moving parts. Namely, these tests exercise the following
//! modules:
//! * [`coll`](coll/index.html)
//! * [`cursor`](cursor/index.html)
//! * [`persist`](persist/index.html)
//! * [`storage`](storage/index.html)
//! * [`index`](index/index.html)

#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate bson;
extern crate medlar;
extern crate chrono;
extern crate tempfile;

use std::cell::Cell;
use std::fs;
use std::panic::{ catch_unwind, AssertUnwindSafe };
use std::path::{ Path, PathBuf };
use std::rc::Rc;
use std::thread::sleep;
use std::time::Duration;
use chrono::{ TimeZone, Utc };
use tempfile::TempDir;
use medlar::prelude::*;

lazy_static! {
    /// A handful of documents shared by several scenarios.
    static ref PLANETS: Vec<Document> = vec![
        doc!{ "_id": "mercury", "order": 1, "moons": 0 },
        doc!{ "_id": "venus",   "order": 2, "moons": 0 },
        doc!{ "_id": "earth",   "order": 3, "moons": 1 },
        doc!{ "_id": "mars",    "order": 4, "moons": 2 },
    ];
}

/// A scratch directory and the data file path inside it.
fn scratch() -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("couldn't create temp dir");
    let path = dir.path().join("test.db");
    (dir, path)
}

/// Opens (and loads) a collection over the given data file.
fn open(path: &Path) -> Collection {
    Collection::new(CollectionOptions {
        filename: Some(path.to_owned()),
        autoload: true,
        ..Default::default()
    }).expect("couldn't open collection")
}

/// The non-empty lines of the raw data file.
fn raw_lines(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .expect("couldn't read data file")
        .lines()
        .filter(|line| !line.is_empty())
        .map(str::to_owned)
        .collect()
}

#[test]
fn newline_heavy_strings_round_trip_across_reopen() {
    let (_dir, path) = scratch();
    let tricky = "world\r\nearth\nother\rline";

    {
        let db = open(&path);
        db.insert_one(doc!{ "hello": tricky }).unwrap();
    }

    let db = open(&path);
    let docs = db.find(doc!{}).unwrap();

    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].get_str("hello").unwrap(), tricky);
}

#[test]
fn load_database_compacts_the_log() {
    let (_dir, path) = scratch();

    let db = open(&path);
    db.insert_one(doc!{ "_id": "1", "a": 2 }).unwrap();
    db.insert_one(doc!{ "_id": "2", "a": 4 }).unwrap();
    db.remove(doc!{ "a": 2 }, RemoveOptions::default()).unwrap();

    // Two inserts and a tombstone.
    assert_eq!(raw_lines(&path).len(), 3);

    db.load_database().unwrap();

    let lines = raw_lines(&path);
    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains(r#""a":4"#));
    assert_eq!(db.count(doc!{}).unwrap(), 1);
}

#[test]
fn bulk_insert_unique_violation_leaves_only_the_envelope() {
    let (_dir, path) = scratch();

    let db = open(&path);
    db.ensure_index(IndexOptions {
        unique: true,
        ..IndexOptions::field("a")
    }).unwrap();

    let error = db
        .insert_many(vec![
            doc!{ "a": 5, "b": "hello" },
            doc!{ "a": 42, "b": "world" },
            doc!{ "a": 5, "b": "bloup" },
            doc!{ "a": 7 },
        ])
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::UniqueViolated);

    assert!(db.find(doc!{}).unwrap().is_empty());

    let lines = raw_lines(&path);
    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains("$$indexCreated"));
}

#[test]
fn a_stale_side_file_loses_to_the_primary() {
    let (_dir, path) = scratch();
    let side = {
        let mut name = path.as_os_str().to_os_string();
        name.push("~");
        PathBuf::from(name)
    };

    fs::write(&path, "{\"_id\":\"0\",\"hello\":\"world\"}\n").unwrap();
    fs::write(&side, "{\"_id\":\"0\",\"hello\":\"other\"}\n").unwrap();

    let db = open(&path);
    let docs = db.find(doc!{}).unwrap();

    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].get_str("hello").unwrap(), "world");
    assert!(!side.exists());
}

#[test]
fn a_lone_side_file_is_recovered() {
    let (_dir, path) = scratch();
    let side = {
        let mut name = path.as_os_str().to_os_string();
        name.push("~");
        PathBuf::from(name)
    };

    // A crash hit between the side-file fsync and the rename.
    fs::write(&side, "{\"_id\":\"0\",\"hello\":\"rescued\"}\n").unwrap();

    let db = open(&path);
    let docs = db.find(doc!{}).unwrap();

    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].get_str("hello").unwrap(), "rescued");
    assert!(!side.exists());
}

#[test]
fn upsert_with_operators_synthesizes_the_document() {
    let (_dir, path) = scratch();

    let db = open(&path);
    let outcome = db
        .update(
            doc!{ "$or": [ { "a": 4 }, { "a": 5 } ] },
            doc!{ "$set": { "hello": "world" }, "$inc": { "bloup": 3 } },
            UpdateOptions { upsert: true, ..Default::default() },
        )
        .unwrap();

    assert!(outcome.upserted);
    assert_eq!(outcome.num_affected, 1);

    let doc = db.find_one(doc!{}).unwrap().unwrap();
    assert_eq!(doc.get_str("hello").unwrap(), "world");
    assert_eq!(doc.get("bloup").map(|b| b.clone()), Some(Bson::I32(3)));
    assert_eq!(doc.get_str("_id").unwrap().len(), 16);
}

#[test]
fn ttl_indexes_expire_documents() {
    let (_dir, path) = scratch();

    let db = open(&path);
    db.ensure_index(IndexOptions {
        expire_after_seconds: Some(0.2),
        ..IndexOptions::field("exp")
    }).unwrap();

    let now = Utc.timestamp_millis_opt(Utc::now().timestamp_millis()).unwrap();
    db.insert_one(doc!{ "hello": "world", "exp": Bson::UtcDatetime(now) })
        .unwrap();

    assert!(db.find_one(doc!{}).unwrap().is_some());

    sleep(Duration::from_millis(300));

    // The expired document is gone from reads, and the read scheduled its
    // physical removal right behind itself.
    assert!(db.find_one(doc!{}).unwrap().is_none());

    db.compact_datafile().unwrap();
    for line in raw_lines(&path) {
        assert!(!line.contains("world"), "stale line survived: {}", line);
    }
}

#[test]
fn a_panicking_user_predicate_does_not_wedge_the_store() {
    let (_dir, path) = scratch();

    let db = open(&path);
    db.insert_one(doc!{ "a": 1 }).unwrap();

    let outcome = catch_unwind(AssertUnwindSafe(|| {
        db.cursor(doc!{})
            .filter_where(|_| panic!("user predicate exploded"))
            .exec()
    }));
    assert!(outcome.is_err());

    // The next enqueued operation proceeds normally.
    db.insert_one(doc!{ "a": 2 }).unwrap();
    assert_eq!(db.count(doc!{}).unwrap(), 2);
}

#[test]
fn indexes_survive_a_reopen() {
    let (_dir, path) = scratch();

    {
        let db = open(&path);
        db.ensure_index(IndexOptions {
            unique: true,
            ..IndexOptions::field("email")
        }).unwrap();
        db.insert_one(doc!{ "email": "a@b.c" }).unwrap();
    }

    let db = open(&path);
    let error = db.insert_one(doc!{ "email": "a@b.c" }).unwrap_err();

    assert_eq!(error.kind(), ErrorKind::UniqueViolated);

    // And a removed index stays removed.
    db.remove_index("email").unwrap();
    drop(db);

    let db = open(&path);
    db.insert_one(doc!{ "email": "a@b.c" }).unwrap();
    assert_eq!(db.count(doc!{ "email": "a@b.c" }).unwrap(), 2);
}

#[test]
fn documents_survive_updates_across_reopen() {
    let (_dir, path) = scratch();

    {
        let db = open(&path);
        for planet in PLANETS.iter() {
            db.insert_one(planet.clone()).unwrap();
        }
        db.update(
            doc!{ "_id": "earth" },
            doc!{ "$inc": { "moons": 100 } },
            UpdateOptions::default(),
        ).unwrap();
    }

    let db = open(&path);

    assert_eq!(db.count(doc!{}).unwrap(), PLANETS.len());
    let earth = db.find_one(doc!{ "_id": "earth" }).unwrap().unwrap();
    assert_eq!(earth.get("moons").map(|b| b.clone()), Some(Bson::I64(101)));
}

#[test]
fn corrupted_files_are_refused() {
    let (_dir, path) = scratch();

    fs::write(
        &path,
        "total garbage\n{\"_id\":\"ok\"}\nmore garbage\neven more\n",
    ).unwrap();

    let error = Collection::new(CollectionOptions {
        filename: Some(path.clone()),
        autoload: true,
        ..Default::default()
    }).unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Corruption);

    // A forgiving threshold loads what it can.
    let db = Collection::new(CollectionOptions {
        filename: Some(path),
        autoload: true,
        corrupt_alert_threshold: 1.0,
        ..Default::default()
    }).unwrap();
    assert_eq!(db.count(doc!{}).unwrap(), 1);
}

#[test]
fn serialization_hooks_wrap_the_whole_file() {
    let (_dir, path) = scratch();

    let with_hooks = || CollectionOptions {
        filename: Some(path.clone()),
        autoload: true,
        after_serialization: Some(Box::new(|line: &str| {
            format!("?{}", line.chars().rev().collect::<String>())
        })),
        before_deserialization: Some(Box::new(|line: &str| {
            line[1..].chars().rev().collect::<String>()
        })),
        ..Default::default()
    };

    {
        let db = Collection::new(with_hooks()).unwrap();
        db.insert_one(doc!{ "hello": "world" }).unwrap();
    }

    // Every line on disk went through the hook.
    for line in raw_lines(&path) {
        assert!(line.starts_with('?'));
        assert!(!line.starts_with("{\""));
    }

    // The hooked datastore reads its own file back.
    let db = Collection::new(with_hooks()).unwrap();
    assert_eq!(db.count(doc!{ "hello": "world" }).unwrap(), 1);

    // Opening the same non-empty file with only half a hook pair, or a
    // pair that is not bijective, is refused.
    let error = Collection::new(CollectionOptions {
        filename: Some(path.clone()),
        after_serialization: Some(Box::new(|line: &str| line.to_owned())),
        ..Default::default()
    }).unwrap_err();
    assert_eq!(error.kind(), ErrorKind::HookMismatch);

    let error = Collection::new(CollectionOptions {
        filename: Some(path.clone()),
        after_serialization: Some(Box::new(|line: &str| format!("x{}", line))),
        before_deserialization: Some(Box::new(|line: &str| line.to_owned())),
        ..Default::default()
    }).unwrap_err();
    assert_eq!(error.kind(), ErrorKind::HookMismatch);
}

#[test]
fn compaction_done_observers_fire() {
    let (_dir, path) = scratch();

    let db = open(&path);
    let fired = Rc::new(Cell::new(0));

    {
        let fired = fired.clone();
        db.on_compaction(move || fired.set(fired.get() + 1));
    }

    db.insert_one(doc!{ "a": 1 }).unwrap();
    db.compact_datafile().unwrap();
    assert_eq!(fired.get(), 1);

    // Loading ends in a compaction as well.
    db.load_database().unwrap();
    assert_eq!(fired.get(), 2);
}

#[test]
fn get_all_data_returns_deep_copies() {
    let db = Collection::new(CollectionOptions::default()).unwrap();
    db.insert_one(doc!{ "_id": "1", "nested": { "n": 1 } }).unwrap();

    let mut snapshot = db.get_all_data();
    snapshot[0].insert("nested", doc!{ "n": 999 });

    let stored = db.find_one(doc!{ "_id": "1" }).unwrap().unwrap();
    assert_eq!(stored.get_document("nested").unwrap(), &doc!{ "n": 1 });
}

#[test]
fn sorting_skipping_and_limiting_across_reopen() {
    let (_dir, path) = scratch();

    {
        let db = open(&path);
        for planet in PLANETS.iter() {
            db.insert_one(planet.clone()).unwrap();
        }
    }

    let db = open(&path);
    let docs = db
        .cursor(doc!{})
        .sort(doc!{ "moons": Order::Descending, "order": Order::Ascending })
        .skip(1)
        .limit(2)
        .projection(doc!{ "moons": 1 })
        .exec()
        .unwrap();

    // mars (2 moons) first, then earth (1), then mercury/venus by order.
    assert_eq!(docs, vec![
        doc!{ "moons": Bson::I64(1), "_id": "earth" },
        doc!{ "moons": Bson::I64(0), "_id": "mercury" },
    ]);
}

#[test]
fn timestamped_stores_round_trip_their_dates() {
    let (_dir, path) = scratch();

    {
        let db = Collection::new(CollectionOptions {
            filename: Some(path.clone()),
            autoload: true,
            timestamp_data: true,
            ..Default::default()
        }).unwrap();
        db.insert_one(doc!{ "_id": "x", "a": 1 }).unwrap();
    }

    let db = open(&path);
    let doc = db.find_one(doc!{ "_id": "x" }).unwrap().unwrap();

    let created = doc.get_utc_datetime("createdAt").unwrap();
    let updated = doc.get_utc_datetime("updatedAt").unwrap();
    assert_eq!(created, updated);
}

#[test]
fn operations_complete_in_submission_order() {
    let db = Collection::new(CollectionOptions::default()).unwrap();

    // Each step observes the effects of all earlier ones; interleave
    // reads and writes and check the running count.
    for round in 0..32 {
        db.insert_one(doc!{ "n": round }).unwrap();
        assert_eq!(db.count(doc!{}).unwrap(), (round + 1) as usize);
    }

    db.remove(doc!{}, RemoveOptions { multi: true }).unwrap();
    assert_eq!(db.count(doc!{}).unwrap(), 0);
}
