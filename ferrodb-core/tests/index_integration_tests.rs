//! Integration tests for the index framework: regular index
//! invalidation, the deleted index and the changes index.

use std::sync::Arc;

use ferrodb_core::document::DesignDocFn;
use ferrodb_core::index::{DocumentIndex, RegularIndex};
use ferrodb_core::{Database, Document, Engine, Storage};
use serde_json::json;
use tempfile::TempDir;

fn test_engine() -> (TempDir, Engine) {
    let dir = TempDir::new().unwrap();
    let engine = Engine::open(&dir.path().join("idx")).unwrap();
    (dir, engine)
}

fn test_db(name: &str) -> (TempDir, Storage, Arc<Database>) {
    let dir = TempDir::new().unwrap();
    let storage = Storage::open(dir.path()).unwrap();
    let db = storage.create_database(name).unwrap();
    (dir, storage, db)
}

fn doc(body: serde_json::Value) -> Document {
    Document::from_json_value(body).unwrap()
}

// a regular index over every (field name, value) pair of the data
fn field_index() -> RegularIndex {
    RegularIndex::new(
        DesignDocFn::new_view("doc", "fn"),
        Box::new(|doc: &Document| {
            let mut pairs = Vec::new();
            for (k, v) in &doc.data {
                let row = Document {
                    id: doc.id.clone(),
                    value: Some(v.clone()),
                    ..Document::default()
                };
                pairs.push((k.clone().into_bytes(), serde_json::to_vec(&row).unwrap()));
            }
            pairs
        }),
    )
}

fn collect(engine: &Engine, ri: &RegularIndex) -> Vec<(String, serde_json::Value, String)> {
    engine
        .read(|tx| {
            let mut it = tx.iterator(ri.iterator_options()?)?;
            let mut rows = Vec::new();
            let mut doc = it.first();
            while it.continue_() {
                let d = match doc {
                    Some(d) => d,
                    None => break,
                };
                rows.push((
                    d.key.clone().and_then(|k| k.as_str().map(str::to_string)).unwrap(),
                    d.value.clone().unwrap_or(serde_json::Value::Null),
                    d.id.clone(),
                ));
                doc = it.next();
            }
            Ok(rows)
        })
        .unwrap()
}

#[test]
fn test_regular_index_basics() {
    let (_dir, engine) = test_engine();
    let ri = field_index();

    engine
        .write(|tx| {
            ri.ensure(tx)?;
            // delete on unknown document
            ri.document_deleted(tx, &Document::new("unknown"))?;
            Ok(())
        })
        .unwrap();

    // stats with no documents
    let stats = engine.read(|tx| ri.stats(tx)).unwrap();
    assert_eq!(stats.documents, 0);
    assert_eq!(stats.keys, 0);

    // iterator with no documents
    engine
        .read(|tx| {
            let it = tx.iterator(ri.iterator_options()?)?;
            assert_eq!(it.remaining(), 0);
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_regular_index_rows_and_removal() {
    let (_dir, engine) = test_engine();
    let ri = field_index();

    engine.write(|tx| ri.ensure(tx)).unwrap();
    engine
        .write(|tx| {
            ri.document_stored(tx, &doc(json!({"_id": "test", "name": "Foo", "test": 123})))
        })
        .unwrap();
    // same record twice, the old rows must be replaced
    engine
        .write(|tx| {
            ri.document_stored(tx, &doc(json!({"_id": "test", "name": "Foo", "test": 123})))
        })
        .unwrap();
    engine
        .write(|tx| {
            ri.document_stored(tx, &doc(json!({"_id": "test1", "name": "Foo", "test": 234})))
        })
        .unwrap();

    let rows = collect(&engine, &ri);
    assert_eq!(
        rows,
        vec![
            ("name".to_string(), json!("Foo"), "test".to_string()),
            ("name".to_string(), json!("Foo"), "test1".to_string()),
            ("test".to_string(), json!(123), "test".to_string()),
            ("test".to_string(), json!(234), "test1".to_string()),
        ]
    );

    let stats = engine.read(|tx| ri.stats(tx)).unwrap();
    assert_eq!(stats.keys, 4);
    assert_eq!(stats.documents, 4); // one invalidation row per pair

    // removing one document drops exactly its rows
    engine
        .write(|tx| ri.document_deleted(tx, &Document::new("test")))
        .unwrap();
    let rows = collect(&engine, &ri);
    assert_eq!(
        rows,
        vec![
            ("name".to_string(), json!("Foo"), "test1".to_string()),
            ("test".to_string(), json!(234), "test1".to_string()),
        ]
    );
}

#[test]
fn test_regular_index_invalidation_matches_primary() {
    let (_dir, engine) = test_engine();
    let ri = field_index();

    engine.write(|tx| ri.ensure(tx)).unwrap();
    for i in 0..5 {
        engine
            .write(|tx| {
                ri.document_stored(
                    tx,
                    &doc(json!({"_id": format!("d{}", i), "a": i, "b": i})),
                )
            })
            .unwrap();
    }
    // rewrite some, delete one
    engine
        .write(|tx| ri.document_stored(tx, &doc(json!({"_id": "d1", "a": 10}))))
        .unwrap();
    engine
        .write(|tx| ri.document_deleted(tx, &Document::new("d3")))
        .unwrap();

    // primary row count equals invalidation row count
    let stats = engine.read(|tx| ri.stats(tx)).unwrap();
    assert_eq!(stats.keys, stats.documents);
    assert_eq!(stats.keys, 4 * 2 - 2 - 1); // 4 docs with 2 rows, d1 has 1

    // id prefixes must not bleed into each other
    engine
        .write(|tx| ri.document_stored(tx, &doc(json!({"_id": "d", "x": 1}))))
        .unwrap();
    engine
        .write(|tx| ri.document_deleted(tx, &Document::new("d")))
        .unwrap();
    let stats2 = engine.read(|tx| ri.stats(tx)).unwrap();
    assert_eq!(stats2.keys, stats.keys);
}

#[test]
fn test_regular_index_remove_drops_buckets() {
    let (_dir, engine) = test_engine();
    let ri = field_index();

    engine.write(|tx| ri.ensure(tx)).unwrap();
    engine
        .write(|tx| ri.document_stored(tx, &doc(json!({"_id": "x", "a": 1}))))
        .unwrap();
    engine.write(|tx| ri.remove(tx)).unwrap();

    let stats = engine.read(|tx| ri.stats(tx)).unwrap();
    assert_eq!(stats.keys, 0);
    assert_eq!(stats.documents, 0);
}

#[test]
fn test_deleted_index_tracks_tombstones() {
    let (_dir, _storage, db) = test_db("deleted-idx");

    let rev_a = db.put_document(doc(json!({"_id": "a"}))).unwrap();
    db.put_document(doc(json!({"_id": "b"}))).unwrap();
    db.delete_document("a", &rev_a).unwrap();

    let stats = db.index_stats("_deleted").unwrap();
    assert_eq!(stats.keys, 1);

    // restoring the document clears its tombstone entry
    let rev = db.get_document("a").unwrap().rev;
    db.put_document(doc(json!({"_id": "a", "_rev": rev, "back": true})))
        .unwrap();
    assert_eq!(db.index_stats("_deleted").unwrap().keys, 0);
}

#[test]
fn test_changes_index_replaces_rows_on_update() {
    let (_dir, _storage, db) = test_db("changes-idx");

    let rev1 = db.put_document(doc(json!({"_id": "x", "n": 1}))).unwrap();
    db.put_document(doc(json!({"_id": "x", "_rev": rev1, "n": 2})))
        .unwrap();
    db.put_document(doc(json!({"_id": "y"}))).unwrap();

    let response = db
        .changes(&ferrodb_core::ChangesOptions {
            since: "0".to_string(),
            limit: 0,
            timeout: None,
        })
        .unwrap();

    // x appears once, under its latest sequence
    let ids: Vec<&str> = response.results.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["x", "y"]);
    assert_eq!(response.results[0].seq, "2");
    assert_eq!(response.results[1].seq, "3");

    // sequences are strictly increasing
    let seqs: Vec<u64> = response
        .results
        .iter()
        .map(|r| r.seq.parse().unwrap())
        .collect();
    assert!(seqs.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn test_changes_index_drops_rows_after_delete() {
    let (_dir, _storage, db) = test_db("changes-del");

    let rev = db.put_document(doc(json!({"_id": "x"}))).unwrap();
    db.delete_document("x", &rev).unwrap();

    let response = db
        .changes(&ferrodb_core::ChangesOptions {
            since: "0".to_string(),
            limit: 0,
            timeout: None,
        })
        .unwrap();

    // only the tombstone row remains
    assert_eq!(response.results.len(), 1);
    assert_eq!(response.results[0].id, "x");
    assert_eq!(response.results[0].deleted, Some(true));
}

#[test]
fn test_iterator_skip_and_limit() {
    let (_dir, _storage, db) = test_db("iter");

    for i in 0..10 {
        db.put_document(doc(json!({"_id": format!("doc-{:02}", i)})))
            .unwrap();
    }

    let (docs, _) = db
        .all_docs(&ferrodb_core::AllDocsQuery {
            skip: 2,
            limit: 3,
            ..Default::default()
        })
        .unwrap();
    let ids: Vec<&str> = docs.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(ids, vec!["doc-02", "doc-03", "doc-04"]);
}

#[test]
fn test_iterator_key_range() {
    let (_dir, _storage, db) = test_db("range");

    for id in ["alpha", "beta", "gamma", "delta"] {
        db.put_document(doc(json!({"_id": id}))).unwrap();
    }

    let (docs, _) = db
        .all_docs(&ferrodb_core::AllDocsQuery {
            start_key: Some("b".to_string()),
            end_key: Some("delta".to_string()),
            ..Default::default()
        })
        .unwrap();
    let ids: Vec<&str> = docs.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(ids, vec!["beta", "delta"]);
}
