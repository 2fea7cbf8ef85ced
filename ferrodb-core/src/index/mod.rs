// src/index/mod.rs
// The document-index framework.
//
// Every document that is stored or deleted is pushed through the set of
// registered indices inside the same write batch; the index contents are
// read back through the shared DocIterator.

use crate::document::{DocFunction, Document, FnType};
use crate::engine::{ReadTransaction, WriteTransaction};
use crate::error::{DbError, Result};
use crate::iter::IteratorOptions;
use crate::viewserver::ViewEngines;

mod changes;
mod deleted;
mod regular;
mod search;
mod unique;
mod unique_u64;
mod view;

pub use changes::{ChangesIndex, CHANGES_INDEX_NAME};
pub use deleted::{new_deleted_index, DELETED_INDEX_NAME};
pub use regular::RegularIndex;
pub use search::{
    ExternalSearchIndex, SearchQuery, SearchRecord, SearchResult, SEARCH_INDEX_EXT,
};
pub use unique::UniqueIndex;
pub use unique_u64::UniqueIndexU64;
pub use view::ViewIndex;

/// Index statistics.
///
/// Since an index may have multiple records pointing to the same document
/// or may ignore documents, the number of keys may be higher than the
/// number of documents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexStats {
    /// Number of documents in the index
    pub documents: u64,
    /// Number of keys in the index
    pub keys: u64,
    /// Number of bytes used by the index
    pub used: u64,
    /// Number of bytes allocated by the index
    pub allocated: u64,
}

/// Capabilities common to every index kind.
pub trait DocumentIndex: Send + Sync {
    /// Initialize the index (create buckets, open files).
    fn ensure(&self, tx: &mut WriteTransaction<'_>) -> Result<()>;

    /// Remove the index and all related data (never the documents).
    fn remove(&self, tx: &mut WriteTransaction<'_>) -> Result<()>;

    /// Statistics about documents, keys and space.
    fn stats(&self, tx: &ReadTransaction<'_>) -> Result<IndexStats>;

    /// Options to construct an iterator over the index contents.
    fn iterator_options(&self) -> Result<IteratorOptions>;

    /// Called in the transaction that stores `doc`.
    fn document_stored(&self, tx: &mut WriteTransaction<'_>, doc: &Document) -> Result<()>;

    /// Called in the transaction that deletes (or replaces) `doc`.
    fn document_deleted(&self, tx: &mut WriteTransaction<'_>, doc: &Document) -> Result<()>;

    /// Batched variant of `document_stored`, used by the rebuild task.
    fn update_stored(&self, tx: &mut WriteTransaction<'_>, docs: &[Document]) -> Result<()>;
}

/// A registered index.
///
/// The registry stores one of a closed set of kinds; the source-update
/// capability only exists on the view and search variants, which avoids
/// any runtime downcasting.
pub enum RegisteredIndex {
    Unique(UniqueIndex),
    UniqueU64(UniqueIndexU64),
    Changes(ChangesIndex),
    View(ViewIndex),
    Search(ExternalSearchIndex),
}

impl RegisteredIndex {
    pub fn as_document_index(&self) -> &dyn DocumentIndex {
        match self {
            RegisteredIndex::Unique(i) => i,
            RegisteredIndex::UniqueU64(i) => i,
            RegisteredIndex::Changes(i) => i,
            RegisteredIndex::View(i) => i,
            RegisteredIndex::Search(i) => i,
        }
    }

    /// The function type backing this index, if it is design-doc based.
    pub fn source_type(&self) -> Option<FnType> {
        match self {
            RegisteredIndex::View(_) => Some(FnType::Views),
            RegisteredIndex::Search(_) => Some(FnType::Indexes),
            _ => None,
        }
    }

    /// Update the compiled source of a design-doc based index.
    pub fn update_source(
        &self,
        doc: &Document,
        f: &DocFunction,
        engines: &ViewEngines,
    ) -> Result<()> {
        match self {
            RegisteredIndex::View(i) => i.update_source(doc, f, engines),
            RegisteredIndex::Search(i) => i.update_source(doc, f, engines),
            _ => Err(DbError::Unsupported(
                "index has no updatable source".to_string(),
            )),
        }
    }

    pub fn as_search(&self) -> Option<&ExternalSearchIndex> {
        match self {
            RegisteredIndex::Search(i) => Some(i),
            _ => None,
        }
    }
}

impl DocumentIndex for RegisteredIndex {
    fn ensure(&self, tx: &mut WriteTransaction<'_>) -> Result<()> {
        self.as_document_index().ensure(tx)
    }

    fn remove(&self, tx: &mut WriteTransaction<'_>) -> Result<()> {
        self.as_document_index().remove(tx)
    }

    fn stats(&self, tx: &ReadTransaction<'_>) -> Result<IndexStats> {
        self.as_document_index().stats(tx)
    }

    fn iterator_options(&self) -> Result<IteratorOptions> {
        self.as_document_index().iterator_options()
    }

    fn document_stored(&self, tx: &mut WriteTransaction<'_>, doc: &Document) -> Result<()> {
        self.as_document_index().document_stored(tx, doc)
    }

    fn document_deleted(&self, tx: &mut WriteTransaction<'_>, doc: &Document) -> Result<()> {
        self.as_document_index().document_deleted(tx, doc)
    }

    fn update_stored(&self, tx: &mut WriteTransaction<'_>, docs: &[Document]) -> Result<()> {
        self.as_document_index().update_stored(tx, docs)
    }
}
