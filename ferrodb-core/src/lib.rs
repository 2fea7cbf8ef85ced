// ferrodb-core/src/lib.rs
// CouchDB-compatible embedded document database core.
//
// The crate covers the storage and indexing core: the bucket engine,
// revision-controlled documents, the document-index framework (changes,
// deleted, views, full-text search), Mango selector queries, the change
// feed and the background task processor. HTTP serving, sessions and
// password hashing live in outer crates.

#![allow(clippy::too_many_arguments)]
#![allow(clippy::result_large_err)]
#![cfg_attr(test, allow(dead_code))]

pub mod changes;
pub mod collate;
pub mod config;
pub mod database;
pub mod document;
pub mod engine;
pub mod error;
pub mod index;
pub mod iter;
pub mod logging;
pub mod query;
pub mod reducer;
pub mod storage;
pub mod tasks;
pub mod viewserver;

// Public exports
pub use changes::{ChangeRow, ChangesOptions, ChangesResponse, DocObserver};
pub use config::{Admin, Config};
pub use database::{
    AllDocsQuery, BulkDocResult, Database, DatabaseStats, FindResult, ViewQuery, ViewResult,
};
pub use document::{
    Attachment, DesignDocFn, DocFunction, Document, FnType, Security, SecurityGroup,
};
pub use engine::{BucketStats, Engine, ReadTransaction, WriteTransaction};
pub use error::{DbError, Result};
pub use index::{
    DocumentIndex, IndexStats, RegisteredIndex, SearchQuery, SearchRecord, SearchResult,
};
pub use iter::{DocIterator, IteratorOptions};
pub use logging::{get_log_level, set_log_level, LogLevel};
pub use query::{ExecutionStats, FindQuery, SelectorNode};
pub use reducer::Reducer;
pub use storage::Storage;
pub use tasks::{Task, TaskAction};
pub use viewserver::{SearchIndexDoc, ViewRow, ViewServer, ViewServerBuilder};
