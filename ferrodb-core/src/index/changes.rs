// src/index/changes.rs
// The change feed index: a sequence-ordered bucket of change rows plus
// an invalidation bucket so a re-written document replaces its previous
// row instead of appearing twice.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::document::Document;
use crate::engine::{ReadTransaction, WriteTransaction};
use crate::error::Result;
use crate::index::unique_u64::{text_to_u64_key, u64_key_to_text};
use crate::index::{DocumentIndex, IndexStats};
use crate::iter::IteratorOptions;

pub const CHANGES_INDEX_NAME: &str = "_changes";

const INVALIDATION_SUFFIX: &str = ":invalidation";

pub struct ChangesIndex {
    bucket_name: String,
    invalidation_bucket: String,
}

impl ChangesIndex {
    pub fn new(name: &str) -> Self {
        ChangesIndex {
            bucket_name: name.to_string(),
            invalidation_bucket: format!("{}{}", name, INVALIDATION_SUFFIX),
        }
    }

    // the change row carries just enough to follow the feed
    fn change_row(doc: &Document) -> Document {
        Document {
            id: doc.id.clone(),
            rev: doc.rev.clone(),
            local_seq: doc.local_seq,
            deleted: doc.deleted,
            ..Document::default()
        }
    }
}

impl DocumentIndex for ChangesIndex {
    fn ensure(&self, tx: &mut WriteTransaction<'_>) -> Result<()> {
        tx.ensure_bucket(&self.bucket_name);
        tx.ensure_bucket(&self.invalidation_bucket);
        Ok(())
    }

    fn remove(&self, tx: &mut WriteTransaction<'_>) -> Result<()> {
        tx.delete_bucket(&self.bucket_name);
        tx.delete_bucket(&self.invalidation_bucket);
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
        // tombstones are part of the feed
        opts.skip_deleted = false;
        opts.key_fn = Some(Arc::new(text_to_u64_key));
        opts.clean_key = Some(Arc::new(u64_key_to_text));
        Ok(opts)
    }

    fn document_stored(&self, tx: &mut WriteTransaction<'_>, doc: &Document) -> Result<()> {
        let value = serde_json::to_vec(&Self::change_row(doc))?;

        // The change sequence is allocated when the batch commits, so
        // feed order equals commit order. The invalidation row remembers
        // seq-1: the "since" value from which this change is visible.
        let seq_cell = Arc::new(AtomicU64::new(0));

        let stash = seq_cell.clone();
        tx.put_with_sequence(
            &self.bucket_name,
            Vec::new(),
            value,
            Box::new(move |_k, seq| {
                stash.store(seq, Ordering::SeqCst);
                (Some(seq.to_be_bytes().to_vec()), None)
            }),
        );

        let stash = seq_cell;
        tx.put_with_sequence(
            &self.invalidation_bucket,
            doc.id.clone().into_bytes(),
            Vec::new(),
            Box::new(move |_k, _seq| {
                let assigned = stash.load(Ordering::SeqCst);
                (None, Some(assigned.saturating_sub(1).to_be_bytes().to_vec()))
            }),
        );

        Ok(())
    }

    fn document_deleted(&self, tx: &mut WriteTransaction<'_>, doc: &Document) -> Result<()> {
        // the invalidation row points at the current change row
        let stored = match tx.get(&self.invalidation_bucket, doc.id.as_bytes())? {
            Some(stored) => stored,
            None => return Ok(()),
        };
        let since: [u8; 8] = match stored.as_slice().try_into() {
            Ok(raw) => raw,
            Err(_) => return Ok(()),
        };
        let seq = u64::from_be_bytes(since) + 1;

        tx.delete(&self.bucket_name, seq.to_be_bytes().to_vec());
        tx.delete(&self.invalidation_bucket, doc.id.clone().into_bytes());
        Ok(())
    }

    fn update_stored(&self, tx: &mut WriteTransaction<'_>, docs: &[Document]) -> Result<()> {
        for doc in docs {
            self.document_deleted(tx, doc)?;
            self.document_stored(tx, doc)?;
        }
        Ok(())
    }
}
