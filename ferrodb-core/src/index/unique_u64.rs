// src/index/unique_u64.rs
// UniqueIndex specialization with big-endian u64 keys, so the iterator
// scans the bucket in numeric order.

use std::sync::Arc;

use serde_json::Value;

use crate::document::Document;
use crate::engine::{ReadTransaction, WriteTransaction};
use crate::error::Result;
use crate::index::unique::{IndexValueFn, UniqueIndex};
use crate::index::{DocumentIndex, IndexStats};
use crate::iter::IteratorOptions;

pub type U64KeyFn = Box<dyn Fn(&Document) -> u64 + Send + Sync>;

pub struct UniqueIndexU64 {
    inner: UniqueIndex,
}

impl UniqueIndexU64 {
    pub fn new(bucket_name: &str, key_fn: U64KeyFn, value_fn: IndexValueFn) -> Self {
        let byte_key_fn =
            Box::new(move |doc: &Document| Some(key_fn(doc).to_be_bytes().to_vec()));

        let inner = UniqueIndex::new(bucket_name, byte_key_fn, value_fn).with_key_codec(
            Arc::new(text_to_u64_key),
            Arc::new(u64_key_to_text),
        );
        UniqueIndexU64 { inner }
    }
}

/// Parses a base-10 text key and re-encodes it big-endian.
pub fn text_to_u64_key(v: &[u8]) -> Option<Vec<u8>> {
    let text = std::str::from_utf8(v).ok()?;
    let n = text.parse::<u64>().ok()?;
    Some(n.to_be_bytes().to_vec())
}

/// Renders a big-endian u64 key back as a base-10 string.
pub fn u64_key_to_text(k: &[u8]) -> Value {
    match <[u8; 8]>::try_from(k) {
        Ok(raw) => Value::String(u64::from_be_bytes(raw).to_string()),
        Err(_) => Value::String(String::from_utf8_lossy(k).into_owned()),
    }
}

impl DocumentIndex for UniqueIndexU64 {
    fn ensure(&self, tx: &mut WriteTransaction<'_>) -> Result<()> {
        self.inner.ensure(tx)
    }

    fn remove(&self, tx: &mut WriteTransaction<'_>) -> Result<()> {
        self.inner.remove(tx)
    }

    fn stats(&self, tx: &ReadTransaction<'_>) -> Result<IndexStats> {
        self.inner.stats(tx)
    }

    fn iterator_options(&self) -> Result<IteratorOptions> {
        self.inner.iterator_options()
    }

    fn document_stored(&self, tx: &mut WriteTransaction<'_>, doc: &Document) -> Result<()> {
        self.inner.document_stored(tx, doc)
    }

    fn document_deleted(&self, tx: &mut WriteTransaction<'_>, doc: &Document) -> Result<()> {
        self.inner.document_deleted(tx, doc)
    }

    fn update_stored(&self, tx: &mut WriteTransaction<'_>, docs: &[Document]) -> Result<()> {
        self.inner.update_stored(tx, docs)
    }
}
