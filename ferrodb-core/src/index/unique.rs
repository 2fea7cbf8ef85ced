// src/index/unique.rs
// Base index for all synchronous single-bucket indices.

use crate::document::Document;
use crate::engine::{ReadTransaction, WriteTransaction};
use crate::error::Result;
use crate::index::{DocumentIndex, IndexStats};
use crate::iter::{CleanKeyFn, IterKeyFn, IteratorOptions};

/// Derives the index key from a document; `None` skips the document.
pub type IndexKeyFn = Box<dyn Fn(&Document) -> Option<Vec<u8>> + Send + Sync>;

/// Derives the stored value from a document.
pub type IndexValueFn = Box<dyn Fn(&Document) -> Vec<u8> + Send + Sync>;

/// An index holding at most one row per key; a second document emitting
/// the same key overwrites the first (last write wins).
pub struct UniqueIndex {
    bucket_name: String,
    key_fn: IndexKeyFn,
    value_fn: IndexValueFn,
    iter_key_fn: Option<IterKeyFn>,
    clean_key: Option<CleanKeyFn>,
}

impl UniqueIndex {
    pub fn new(bucket_name: &str, key_fn: IndexKeyFn, value_fn: IndexValueFn) -> Self {
        UniqueIndex {
            bucket_name: bucket_name.to_string(),
            key_fn,
            value_fn,
            iter_key_fn: None,
            clean_key: None,
        }
    }

    pub(crate) fn with_key_codec(
        mut self,
        iter_key_fn: IterKeyFn,
        clean_key: CleanKeyFn,
    ) -> Self {
        self.iter_key_fn = Some(iter_key_fn);
        self.clean_key = Some(clean_key);
        self
    }

    pub fn bucket_name(&self) -> &str {
        &self.bucket_name
    }

    pub(crate) fn key_for(&self, doc: &Document) -> Option<Vec<u8>> {
        (self.key_fn)(doc)
    }
}

impl DocumentIndex for UniqueIndex {
    fn ensure(&self, tx: &mut WriteTransaction<'_>) -> Result<()> {
        tx.ensure_bucket(&self.bucket_name);
        Ok(())
    }

    fn remove(&self, tx: &mut WriteTransaction<'_>) -> Result<()> {
        tx.delete_bucket(&self.bucket_name);
        Ok(())
    }

    fn stats(&self, tx: &ReadTransaction<'_>) -> Result<IndexStats> {
        let stats = tx.bucket_stats(&self.bucket_name)?;
        Ok(IndexStats {
            documents: stats.keys,
            keys: stats.keys,
            used: stats.used_bytes,
            allocated: stats.allocated_bytes,
        })
    }

    fn iterator_options(&self) -> Result<IteratorOptions> {
        let mut opts = IteratorOptions::for_bucket(&self.bucket_name);
        opts.clean_key = self.clean_key.clone();
        opts.key_fn = self.iter_key_fn.clone();
        Ok(opts)
    }

    fn document_stored(&self, tx: &mut WriteTransaction<'_>, doc: &Document) -> Result<()> {
        self.update_stored(tx, std::slice::from_ref(doc))
    }

    fn document_deleted(&self, tx: &mut WriteTransaction<'_>, doc: &Document) -> Result<()> {
        if let Some(key) = (self.key_fn)(doc) {
            tx.delete(&self.bucket_name, key);
        }
        Ok(())
    }

    fn update_stored(&self, tx: &mut WriteTransaction<'_>, docs: &[Document]) -> Result<()> {
        for doc in docs {
            let key = match (self.key_fn)(doc) {
                Some(key) => key,
                None => continue,
            };
            let value = (self.value_fn)(doc);
            tx.put(&self.bucket_name, key, value);
        }
        Ok(())
    }
}
