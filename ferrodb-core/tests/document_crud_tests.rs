//! Integration tests for document CRUD: revisions, conflicts,
//! tombstones and local sequences.

use std::sync::Arc;

use ferrodb_core::document::parse_rev;
use ferrodb_core::{Database, DbError, Document, Storage};
use serde_json::json;
use tempfile::TempDir;

fn test_db(name: &str) -> (TempDir, Storage, Arc<Database>) {
    let dir = TempDir::new().unwrap();
    let storage = Storage::open(dir.path()).unwrap();
    let db = storage.create_database(name).unwrap();
    (dir, storage, db)
}

fn doc(body: serde_json::Value) -> Document {
    Document::from_json_value(body).unwrap()
}

#[test]
fn test_put_get_roundtrip() {
    let (_dir, _storage, db) = test_db("crud");

    let rev = db.put_document(doc(json!({"_id": "x", "n": 1}))).unwrap();
    let (n, hash) = parse_rev(&rev).unwrap();
    assert_eq!(n, 1);
    assert_eq!(hash.len(), 32); // md5 hex

    let fetched = db.get_document("x").unwrap();
    assert_eq!(fetched.id, "x");
    assert_eq!(fetched.rev, rev);
    assert_eq!(fetched.data.get("n"), Some(&json!(1)));

    let rendered = fetched.to_json_value();
    assert_eq!(rendered["_id"], json!("x"));
    assert_eq!(rendered["_rev"], json!(rev));
    assert_eq!(rendered["n"], json!(1));
}

#[test]
fn test_update_without_rev_is_conflict() {
    let (_dir, _storage, db) = test_db("crud");

    db.put_document(doc(json!({"_id": "x", "n": 1}))).unwrap();
    let result = db.put_document(doc(json!({"_id": "x", "n": 2})));
    assert!(matches!(result, Err(DbError::Conflict)));
}

#[test]
fn test_update_with_wrong_rev_is_conflict() {
    let (_dir, _storage, db) = test_db("crud");

    db.put_document(doc(json!({"_id": "x", "n": 1}))).unwrap();
    let result = db.put_document(doc(json!({
        "_id": "x",
        "_rev": "1-00000000000000000000000000000000",
        "n": 2
    })));
    assert!(matches!(result, Err(DbError::Conflict)));
}

#[test]
fn test_update_with_correct_rev_bumps_revision() {
    let (_dir, _storage, db) = test_db("crud");

    let rev1 = db.put_document(doc(json!({"_id": "x", "n": 1}))).unwrap();
    let rev2 = db
        .put_document(doc(json!({"_id": "x", "_rev": rev1, "n": 2})))
        .unwrap();

    assert_eq!(parse_rev(&rev2).unwrap().0, 2);
    assert_ne!(rev1, rev2);

    // the old revision can't be used twice
    let stale = db.put_document(doc(json!({"_id": "x", "_rev": rev1, "n": 3})));
    assert!(matches!(stale, Err(DbError::Conflict)));

    let fetched = db.get_document("x").unwrap();
    assert_eq!(fetched.data.get("n"), Some(&json!(2)));
}

#[test]
fn test_delete_leaves_tombstone() {
    let (_dir, _storage, db) = test_db("crud");

    let rev1 = db.put_document(doc(json!({"_id": "x", "n": 1}))).unwrap();
    let rev2 = db.delete_document("x", &rev1).unwrap();
    assert_eq!(parse_rev(&rev2).unwrap().0, 2);

    // the tombstone is still readable with deleted set
    let fetched = db.get_document("x").unwrap();
    assert!(fetched.deleted);
    assert_eq!(fetched.rev, rev2);
}

#[test]
fn test_delete_with_wrong_rev_is_conflict() {
    let (_dir, _storage, db) = test_db("crud");

    db.put_document(doc(json!({"_id": "x"}))).unwrap();
    let result = db.delete_document("x", "1-00000000000000000000000000000000");
    assert!(matches!(result, Err(DbError::Conflict)));
}

#[test]
fn test_get_missing_document_is_not_found() {
    let (_dir, _storage, db) = test_db("crud");
    assert!(matches!(db.get_document("nope"), Err(DbError::NotFound)));
}

#[test]
fn test_put_without_id_is_bad_request() {
    let (_dir, _storage, db) = test_db("crud");
    let result = db.put_document(doc(json!({"n": 1})));
    assert!(matches!(result, Err(DbError::BadRequest(_))));
}

#[test]
fn test_local_seq_strictly_increases() {
    let (_dir, _storage, db) = test_db("crud");

    let mut last = 0;
    for i in 0..5 {
        db.put_document(doc(json!({"_id": format!("doc-{}", i)})))
            .unwrap();
        let seq = db.get_document(&format!("doc-{}", i)).unwrap().local_seq;
        assert!(seq > last, "seq {} not greater than {}", seq, last);
        last = seq;
    }

    // updating the same document also advances the sequence
    let rev = db.get_document("doc-0").unwrap().rev;
    db.put_document(doc(json!({"_id": "doc-0", "_rev": rev, "n": 2})))
        .unwrap();
    assert!(db.get_document("doc-0").unwrap().local_seq > last);
}

#[test]
fn test_rev_hash_reflects_content() {
    let (_dir, _storage, db) = test_db("crud");

    let rev_a = db.put_document(doc(json!({"_id": "a", "n": 1}))).unwrap();
    let rev_b = db.put_document(doc(json!({"_id": "b", "n": 1}))).unwrap();
    // same body, but ids and local sequences differ
    assert_ne!(rev_a, rev_b);
}

#[test]
fn test_local_documents_are_stored() {
    let (_dir, _storage, db) = test_db("crud");

    let rev = db
        .put_document(doc(json!({"_id": "_local/settings", "theme": "dark"})))
        .unwrap();
    assert_eq!(parse_rev(&rev).unwrap().0, 1);
    let fetched = db.get_document("_local/settings").unwrap();
    assert_eq!(fetched.data.get("theme"), Some(&json!("dark")));
}

#[test]
fn test_all_docs_listing() {
    let (_dir, _storage, db) = test_db("crud");

    for id in ["a", "b", "c"] {
        db.put_document(doc(json!({"_id": id, "v": id}))).unwrap();
    }
    let rev = db.get_document("b").unwrap().rev;
    db.delete_document("b", &rev).unwrap();

    let (docs, total) = db
        .all_docs(&ferrodb_core::AllDocsQuery {
            include_docs: true,
            ..Default::default()
        })
        .unwrap();

    // deleted docs are skipped, the total reflects the bucket
    let ids: Vec<&str> = docs.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "c"]);
    assert_eq!(total, 3);
    assert_eq!(docs[0].data.get("v"), Some(&json!("a")));
}

#[test]
fn test_bulk_docs_mixed_outcomes() {
    let (_dir, _storage, db) = test_db("crud");

    db.put_document(doc(json!({"_id": "existing"}))).unwrap();

    let results = db.bulk_docs(vec![
        doc(json!({"_id": "fresh", "n": 1})),
        // conflicts: no rev for an existing document
        doc(json!({"_id": "existing", "n": 2})),
    ]);

    assert_eq!(results.len(), 2);
    assert!(results[0].rev.is_some());
    assert!(results[0].error.is_none());
    assert!(results[1].rev.is_none());
    assert!(results[1].error.is_some());

    // the failed write didn't touch the stored document
    assert!(db.get_document("existing").unwrap().data.get("n").is_none());
    assert!(db.get_document("fresh").is_ok());
}

#[test]
fn test_security_document_roundtrip() {
    let (_dir, _storage, db) = test_db("crud");

    // default security until something is stored
    let sec = db.get_security().unwrap();
    assert_eq!(sec.admins.roles, vec!["_admin"]);

    let mut sec = ferrodb_core::Security::default_security();
    sec.members.names.push("reader".to_string());
    db.put_security(&sec).unwrap();

    let fetched = db.get_security().unwrap();
    assert_eq!(fetched.members.names, vec!["reader"]);
}

#[test]
fn test_database_stats_count_docs_and_deletes() {
    let (_dir, _storage, db) = test_db("crud");

    for id in ["a", "b", "c"] {
        db.put_document(doc(json!({"_id": id}))).unwrap();
    }
    let rev = db.get_document("c").unwrap().rev;
    db.delete_document("c", &rev).unwrap();

    let stats = db.stats().unwrap();
    assert_eq!(stats.doc_count, 2);
    assert_eq!(stats.doc_del_count, 1);
}
