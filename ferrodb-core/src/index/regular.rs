// src/index/regular.rs
// Multi-key index. The same key may be emitted by many documents and one
// document may emit many keys, so primary keys are disambiguated with
// the bucket sequence and the original key length:
//
//   stored_key = key || BE64(seq) || BE16(len(key))
//
// The invalidation bucket holds one row per emitted (doc id, stored key)
// pair, keyed the same way by the document id and valued with the
// primary stored key. Removing every contribution of a document is a
// cursor walk over its id prefix, no primary scan needed.

use std::sync::Arc;

use serde_json::Value;

use crate::document::{DesignDocFn, Document};
use crate::engine::{ReadTransaction, WriteTransaction};
use crate::error::{DbError, Result};
use crate::index::{DocumentIndex, IndexStats};
use crate::iter::{CleanKeyFn, IteratorOptions};

const INVALIDATION_SUFFIX: &str = ":invalidation";

/// Emits the (key, value) pairs a document contributes to the index.
pub type RegularIndexFn = Box<dyn Fn(&Document) -> Vec<(Vec<u8>, Vec<u8>)> + Send + Sync>;

pub struct RegularIndex {
    ddfn: DesignDocFn,
    bucket_name: String,
    invalidation_bucket: String,
    idx_fn: Option<RegularIndexFn>,
    clean_key: Option<CleanKeyFn>,
}

impl RegularIndex {
    pub fn new(ddfn: DesignDocFn, idx_fn: RegularIndexFn) -> Self {
        let bucket_name = ddfn.bucket();
        RegularIndex {
            ddfn,
            invalidation_bucket: format!("{}{}", bucket_name, INVALIDATION_SUFFIX),
            bucket_name,
            idx_fn: Some(idx_fn),
            clean_key: None,
        }
    }

    /// A regular index whose rows are maintained by an outer index kind
    /// (the view index) rather than a per-document closure.
    pub(crate) fn new_managed(ddfn: DesignDocFn, clean_key: CleanKeyFn) -> Self {
        let bucket_name = ddfn.bucket();
        RegularIndex {
            ddfn,
            invalidation_bucket: format!("{}{}", bucket_name, INVALIDATION_SUFFIX),
            bucket_name,
            idx_fn: None,
            clean_key: Some(clean_key),
        }
    }

    pub fn ddfn(&self) -> &DesignDocFn {
        &self.ddfn
    }

    pub fn bucket_name(&self) -> &str {
        &self.bucket_name
    }

    /// Delete every primary and invalidation row the document produced.
    pub(crate) fn remove_old_keys(
        &self,
        tx: &mut WriteTransaction<'_>,
        doc_id: &str,
    ) -> Result<()> {
        let mut deletions = Vec::new();
        {
            let mut cursor = tx.cursor(&self.invalidation_bucket)?;
            let mut entry = cursor.seek(doc_id.as_bytes())?;
            while let Some((key, stored_key)) = entry {
                if key_prefix(&key) != doc_id.as_bytes() {
                    break; // not the same document
                }
                deletions.push((key, stored_key));
                entry = cursor.next()?;
            }
        }
        for (inv_key, stored_key) in deletions {
            tx.delete(&self.bucket_name, stored_key);
            tx.delete(&self.invalidation_bucket, inv_key);
        }
        Ok(())
    }

    /// Insert one emitted pair plus its invalidation row.
    pub(crate) fn insert_pair(
        &self,
        tx: &mut WriteTransaction<'_>,
        doc_id: &str,
        key: Vec<u8>,
        value: Vec<u8>,
    ) -> Result<()> {
        let seq = tx.next_sequence(&self.bucket_name)?;
        let stored_key = key_with_seq(&key, seq)?;
        tx.put(&self.bucket_name, stored_key.clone(), value);

        let inv_seq = tx.next_sequence(&self.invalidation_bucket)?;
        let inv_key = key_with_seq(doc_id.as_bytes(), inv_seq)?;
        tx.put(&self.invalidation_bucket, inv_key, stored_key);
        Ok(())
    }
}

impl DocumentIndex for RegularIndex {
    fn ensure(&self, tx: &mut WriteTransaction<'_>) -> Result<()> {
        // regular bucket (keys >= documents)
        tx.ensure_bucket(&self.bucket_name);
        // invalidation bucket
        tx.ensure_bucket(&self.invalidation_bucket);
        Ok(())
    }

    fn remove(&self, tx: &mut WriteTransaction<'_>) -> Result<()> {
        tx.delete_bucket(&self.bucket_name);
        tx.delete_bucket(&self.invalidation_bucket);
        Ok(())
    }

    fn stats(&self, tx: &ReadTransaction<'_>) -> Result<IndexStats> {
        let primary = tx.bucket_stats(&self.bucket_name)?;
        let invalidation = tx.bucket_stats(&self.invalidation_bucket)?;

        Ok(IndexStats {
            // the invalidation bucket holds one row per contribution
            documents: invalidation.keys,
            keys: primary.keys,
            used: primary.used_bytes + invalidation.used_bytes,
            allocated: primary.allocated_bytes + invalidation.allocated_bytes,
        })
    }

    fn iterator_options(&self) -> Result<IteratorOptions> {
        let mut opts = IteratorOptions::for_bucket(&self.bucket_name);
        // present the emitted key, not the sequence-suffixed storage key
        opts.clean_key = Some(match &self.clean_key {
            Some(custom) => {
                let custom = custom.clone();
                Arc::new(move |k: &[u8]| custom(key_prefix(k)))
            }
            None => Arc::new(|k: &[u8]| {
                Value::String(String::from_utf8_lossy(key_prefix(k)).into_owned())
            }),
        });
        Ok(opts)
    }

    fn document_stored(&self, tx: &mut WriteTransaction<'_>, doc: &Document) -> Result<()> {
        self.update_stored(tx, std::slice::from_ref(doc))
    }

    fn document_deleted(&self, tx: &mut WriteTransaction<'_>, doc: &Document) -> Result<()> {
        self.remove_old_keys(tx, &doc.id)
    }

    fn update_stored(&self, tx: &mut WriteTransaction<'_>, docs: &[Document]) -> Result<()> {
        let idx_fn = match &self.idx_fn {
            Some(f) => f,
            None => {
                return Err(DbError::Internal(format!(
                    "regular index {} has no index function",
                    self.ddfn
                )))
            }
        };

        for doc in docs {
            // 1. remove all old keys from the index
            self.remove_old_keys(tx, &doc.id)?;

            if doc.deleted {
                continue;
            }

            // 2. add new keys and invalidation records
            for (key, value) in idx_fn(doc) {
                self.insert_pair(tx, &doc.id, key, value)?;
            }
        }
        Ok(())
    }
}

/// Append the sequence and the key length to a key.
pub(crate) fn key_with_seq(key: &[u8], seq: u64) -> Result<Vec<u8>> {
    if key.len() > u16::MAX as usize {
        return Err(DbError::BadRequest("index key too long".to_string()));
    }
    let mut out = Vec::with_capacity(key.len() + 10);
    out.extend_from_slice(key);
    out.extend_from_slice(&seq.to_be_bytes());
    out.extend_from_slice(&(key.len() as u16).to_be_bytes());
    Ok(out)
}

/// The emitted key without the sequence suffix.
pub(crate) fn key_prefix(stored: &[u8]) -> &[u8] {
    if stored.len() < 10 {
        return stored;
    }
    let len_bytes: [u8; 2] = stored[stored.len() - 2..].try_into().unwrap();
    let len = u16::from_be_bytes(len_bytes) as usize;
    if len + 10 != stored.len() {
        return stored;
    }
    &stored[..len]
}
