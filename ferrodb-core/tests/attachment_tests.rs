//! Integration tests for binary attachments.

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

const BYTES: &[u8] = &[0xDE, 0xAD];

#[test]
fn test_attachment_roundtrip() {
    let (_dir, _storage, db) = test_db("att");

    let rev1 = db.put_document(doc(json!({"_id": "x"}))).unwrap();
    let rev2 = db
        .put_attachment("x", &rev1, "a.bin", "application/octet-stream", BYTES)
        .unwrap();
    assert_eq!(parse_rev(&rev2).unwrap().0, 2);

    let (attachment, path) = db.get_attachment("x", "a.bin").unwrap();
    assert_eq!(attachment.length, 2);
    assert_eq!(attachment.content_type, "application/octet-stream");
    assert_eq!(attachment.digest, format!("{:x}", md5_of(BYTES)));
    assert!(attachment.stub);

    let bytes = std::fs::read(path).unwrap();
    assert_eq!(bytes, BYTES);

    // metadata travels with the document
    let fetched = db.get_document("x").unwrap();
    assert!(fetched.attachments.contains_key("a.bin"));
    assert_eq!(fetched.attachments["a.bin"].revpos, 2);
}

#[test]
fn test_attachment_put_with_stale_rev_is_conflict() {
    let (_dir, _storage, db) = test_db("att");

    let rev1 = db.put_document(doc(json!({"_id": "x"}))).unwrap();
    db.put_attachment("x", &rev1, "a.bin", "application/octet-stream", BYTES)
        .unwrap();

    // the first put bumped the revision, rev1 is stale now
    let result = db.put_attachment("x", &rev1, "a.bin", "application/octet-stream", BYTES);
    assert!(matches!(result, Err(DbError::Conflict)));
}

#[test]
fn test_attachment_to_missing_document_is_not_found() {
    let (_dir, _storage, db) = test_db("att");
    let result = db.put_attachment("ghost", "1-x", "a.bin", "text/plain", BYTES);
    assert!(matches!(result, Err(DbError::NotFound)));
}

#[test]
fn test_attachment_delete() {
    let (_dir, _storage, db) = test_db("att");

    let rev1 = db.put_document(doc(json!({"_id": "x"}))).unwrap();
    let rev2 = db
        .put_attachment("x", &rev1, "a.bin", "application/octet-stream", BYTES)
        .unwrap();

    let rev3 = db.delete_attachment("x", &rev2, "a.bin").unwrap();
    assert_eq!(parse_rev(&rev3).unwrap().0, 3);

    assert!(matches!(
        db.get_attachment("x", "a.bin"),
        Err(DbError::NotFound)
    ));
    let fetched = db.get_document("x").unwrap();
    assert!(fetched.attachments.is_empty());
}

#[test]
fn test_attachment_delete_unknown_is_not_found() {
    let (_dir, _storage, db) = test_db("att");

    let rev = db.put_document(doc(json!({"_id": "x"}))).unwrap();
    let result = db.delete_attachment("x", &rev, "nope.bin");
    assert!(matches!(result, Err(DbError::NotFound)));
}

#[test]
fn test_attachment_bytes_live_under_database_dir() {
    let (_dir, _storage, db) = test_db("att");

    let rev = db.put_document(doc(json!({"_id": "x"}))).unwrap();
    db.put_attachment("x", &rev, "a.bin", "application/octet-stream", BYTES)
        .unwrap();

    let expected = db.database_dir().join("attachments").join("x").join("a.bin");
    assert!(expected.exists());
}

fn md5_of(data: &[u8]) -> md5::Digest {
    md5::compute(data)
}
