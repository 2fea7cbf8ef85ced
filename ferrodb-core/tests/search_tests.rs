//! Integration tests for full-text search indices.

use std::sync::Arc;

use ferrodb_core::{Database, Document, SearchQuery, Storage};
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

fn search_design_doc() -> Document {
    doc(json!({
        "_id": "_design/s",
        "language": "rhai",
        "indexes": {
            "byName": {
                "index": r#"index("name", doc.name, #{ store: true })"#
            }
        }
    }))
}

fn query(q: &str) -> SearchQuery {
    SearchQuery {
        query: q.to_string(),
        limit: 0,
        skip: 0,
    }
}

#[test]
fn test_search_finds_stored_fields() {
    let (_dir, _storage, db) = test_db("search");

    db.put_document(search_design_doc()).unwrap();
    db.put_document(doc(json!({"_id": "a", "name": "Foo"})))
        .unwrap();
    db.put_document(doc(json!({"_id": "b", "name": "Bar"})))
        .unwrap();

    let result = db.search("_design/s", "byName", &query("name:Foo")).unwrap();
    assert_eq!(result.total, 1);
    assert_eq!(result.records.len(), 1);

    let record = &result.records[0];
    assert_eq!(record.id, "a");
    assert_eq!(record.fields.get("name"), Some(&json!("Foo")));
    // order is [score, hit number]
    assert_eq!(record.order.len(), 2);
    assert!(record.order[0] > 0.0);
    assert_eq!(record.order[1], 0.0);
}

#[test]
fn test_search_updates_replace_documents() {
    let (_dir, _storage, db) = test_db("search");

    db.put_document(search_design_doc()).unwrap();
    let rev = db
        .put_document(doc(json!({"_id": "a", "name": "Foo"})))
        .unwrap();

    db.put_document(doc(json!({"_id": "a", "_rev": rev, "name": "Renamed"})))
        .unwrap();

    let result = db.search("_design/s", "byName", &query("name:Foo")).unwrap();
    assert_eq!(result.total, 0);

    let result = db
        .search("_design/s", "byName", &query("name:Renamed"))
        .unwrap();
    assert_eq!(result.total, 1);
    assert_eq!(result.records[0].id, "a");
}

#[test]
fn test_search_deleted_documents_are_removed() {
    let (_dir, _storage, db) = test_db("search");

    db.put_document(search_design_doc()).unwrap();
    let rev = db
        .put_document(doc(json!({"_id": "a", "name": "Foo"})))
        .unwrap();
    db.delete_document("a", &rev).unwrap();

    let result = db.search("_design/s", "byName", &query("name:Foo")).unwrap();
    assert_eq!(result.total, 0);
}

#[test]
fn test_search_limit_and_skip() {
    let (_dir, _storage, db) = test_db("search");

    db.put_document(search_design_doc()).unwrap();
    for i in 0..5 {
        db.put_document(doc(json!({
            "_id": format!("doc-{}", i),
            "name": "common"
        })))
        .unwrap();
    }

    let result = db
        .search(
            "_design/s",
            "byName",
            &SearchQuery {
                query: "name:common".to_string(),
                limit: 2,
                skip: 1,
            },
        )
        .unwrap();
    assert_eq!(result.total, 5);
    assert_eq!(result.records.len(), 2);
}

#[test]
fn test_search_unstored_fields_are_not_returned() {
    let (_dir, _storage, db) = test_db("search");

    db.put_document(doc(json!({
        "_id": "_design/s",
        "language": "rhai",
        "indexes": {
            "byName": {
                // no store option: findable, not returned
                "index": r#"index("name", doc.name)"#
            }
        }
    })))
    .unwrap();
    db.put_document(doc(json!({"_id": "a", "name": "Foo"})))
        .unwrap();

    let result = db.search("_design/s", "byName", &query("name:Foo")).unwrap();
    assert_eq!(result.total, 1);
    assert_eq!(result.records[0].fields.get("name"), None);
}

#[test]
fn test_search_rebuild_covers_preexisting_documents() {
    let (_dir, _storage, db) = test_db("search");

    db.put_document(doc(json!({"_id": "a", "name": "Foo"})))
        .unwrap();
    db.put_document(search_design_doc()).unwrap();

    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    loop {
        let result = db.search("_design/s", "byName", &query("name:Foo")).unwrap();
        if result.total == 1 {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "rebuild did not populate the search index in time"
        );
        std::thread::sleep(std::time::Duration::from_millis(100));
    }
}

#[test]
fn test_search_unknown_index_is_not_found() {
    let (_dir, _storage, db) = test_db("search");
    db.put_document(search_design_doc()).unwrap();
    assert!(db.search("_design/s", "nope", &query("name:Foo")).is_err());
}

#[test]
fn test_search_index_files_live_under_database_dir() {
    let (_dir, _storage, db) = test_db("search");

    db.put_document(search_design_doc()).unwrap();
    db.put_document(doc(json!({"_id": "a", "name": "Foo"})))
        .unwrap();

    let search_dir = db.database_dir().join("search_indices");
    assert!(search_dir.exists());
    let entries: Vec<_> = std::fs::read_dir(&search_dir).unwrap().collect();
    assert_eq!(entries.len(), 1);
}
