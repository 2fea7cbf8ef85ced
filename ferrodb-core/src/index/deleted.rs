// src/index/deleted.rs
// Index of tombstone ids, used for deleted-document statistics.

use crate::document::Document;
use crate::index::UniqueIndex;

pub const DELETED_INDEX_NAME: &str = "_deleted";

pub fn new_deleted_index() -> UniqueIndex {
    UniqueIndex::new(
        DELETED_INDEX_NAME,
        // key is the id of a deleted document, nothing for live ones
        Box::new(|doc: &Document| {
            if !doc.deleted {
                return None;
            }
            Some(doc.id.clone().into_bytes())
        }),
        // no payload, the key is the information
        Box::new(|_doc: &Document| Vec::new()),
    )
}
