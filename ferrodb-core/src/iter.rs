// src/iter.rs
// The shared index iterator. Every index exposes its rows through this
// iterator; construction is driven by the IteratorOptions the index
// hands out.

use std::sync::Arc;

use heed::types::Bytes;
use heed::{Database, RoTxn, WithoutTls};
use serde_json::Value;

use crate::document::Document;
use crate::log_error;

/// Re-encodes caller-supplied start/end keys (text form) into the
/// bucket's native key encoding. Returning `None` drops the bound.
pub type IterKeyFn = Arc<dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync>;

/// Derives the presented `key` field from a raw bucket key.
pub type CleanKeyFn = Arc<dyn Fn(&[u8]) -> Value + Send + Sync>;

/// Options controlling iteration over an index bucket.
#[derive(Clone)]
pub struct IteratorOptions {
    pub skip: usize,
    /// -1 means unlimited
    pub limit: i64,
    pub start_key: Option<Vec<u8>>,
    /// Inclusive upper bound
    pub end_key: Option<Vec<u8>>,

    pub skip_deleted: bool,
    pub skip_design_doc: bool,
    pub skip_local_doc: bool,

    pub bucket_name: String,
    pub clean_key: Option<CleanKeyFn>,
    pub key_fn: Option<IterKeyFn>,
}

impl IteratorOptions {
    pub fn for_bucket(bucket_name: &str) -> Self {
        IteratorOptions {
            skip: 0,
            limit: -1,
            start_key: None,
            end_key: None,
            skip_deleted: true,
            skip_design_doc: false,
            skip_local_doc: false,
            bucket_name: bucket_name.to_string(),
            clean_key: None,
            key_fn: None,
        }
    }
}

/// Iterator over the documents of one bucket.
///
/// The canonical consumption loop mirrors the contract of `continue_()`:
///
/// ```ignore
/// let mut doc = it.first();
/// while it.continue_() {
///     let d = match doc { Some(d) => d, None => break };
///     // use d
///     doc = it.next();
/// }
/// ```
pub struct DocIterator<'t, 'e> {
    rtxn: &'t RoTxn<'e, WithoutTls>,
    db: Option<Database<Bytes, Bytes>>,

    skip: usize,
    limit: i64,
    start_key: Option<Vec<u8>>,
    end_key: Option<Vec<u8>>,
    skip_deleted: bool,
    skip_design_doc: bool,
    skip_local_doc: bool,
    clean_key: Option<CleanKeyFn>,
    key_fn: Option<IterKeyFn>,

    key: Option<Vec<u8>>,
    /// true once the underlying bucket ran out of keys
    done: bool,
}

impl<'t, 'e> DocIterator<'t, 'e> {
    pub(crate) fn new(
        rtxn: &'t RoTxn<'e, WithoutTls>,
        db: Option<Database<Bytes, Bytes>>,
        opts: IteratorOptions,
    ) -> Self {
        DocIterator {
            rtxn,
            db,
            skip: opts.skip,
            limit: opts.limit,
            start_key: opts.start_key,
            end_key: opts.end_key,
            skip_deleted: opts.skip_deleted,
            skip_design_doc: opts.skip_design_doc,
            skip_local_doc: opts.skip_local_doc,
            clean_key: opts.clean_key,
            key_fn: opts.key_fn,
            key: None,
            done: false,
        }
    }

    /// Number of keys in the underlying bucket (unfiltered).
    pub fn total(&self) -> usize {
        let db = match self.db {
            Some(db) => db,
            None => return 0,
        };
        match db.len(self.rtxn) {
            Ok(n) => n as usize,
            Err(err) => {
                log_error!("iterator total failed: {}", err);
                0
            }
        }
    }

    /// Position at the first matching document.
    pub fn first(&mut self) -> Option<Document> {
        let db = self.db?;
        let mut entry = match self.anchor(db) {
            Some(entry) => entry,
            None => return self.exhausted(),
        };

        // raw skip, applied before any filtering
        for _ in 0..self.skip {
            entry = match self.step(db, &entry.0) {
                Some(entry) => entry,
                None => return self.exhausted(),
            };
        }

        self.accept(db, entry, false)
    }

    /// Advance to the next matching document.
    pub fn next(&mut self) -> Option<Document> {
        let db = self.db?;
        let current = self.key.clone()?;
        let entry = match self.step(db, &current) {
            Some(entry) => entry,
            None => return self.exhausted(),
        };
        self.accept(db, entry, true)
    }

    fn exhausted(&mut self) -> Option<Document> {
        self.key = None;
        self.done = true;
        None
    }

    /// True while the iterator is positioned on a key within range and
    /// the limit is not exhausted.
    pub fn continue_(&self) -> bool {
        let key = match &self.key {
            Some(key) => key,
            None => return false, // past the last pair
        };
        if self.limit == 0 {
            return false; // no more limit
        }
        match &self.end_key {
            Some(end) => key.as_slice() <= end.as_slice(),
            None => true,
        }
    }

    /// Number of additional keys with key <= end_key, not counting the
    /// current position.
    pub fn remaining(&self) -> usize {
        if self.done {
            return 0;
        }
        let db = match self.db {
            Some(db) => db,
            None => return 0,
        };

        let mut remaining = 0;
        let mut pos = self.key.clone();
        loop {
            let entry = match &pos {
                Some(p) => db.get_greater_than(self.rtxn, p),
                None => match &self.start_key {
                    Some(sk) => db.get_greater_than_or_equal_to(self.rtxn, sk),
                    None => db.first(self.rtxn),
                },
            };
            let (k, _) = match entry {
                Ok(Some(kv)) => kv,
                Ok(None) => break,
                Err(err) => {
                    log_error!("iterator remaining failed: {}", err);
                    break;
                }
            };
            if let Some(end) = &self.end_key {
                if k > end.as_slice() {
                    break;
                }
            }
            remaining += 1;
            pos = Some(k.to_vec());
        }
        remaining
    }

    /// Compensate the limit for a row rejected by a caller-side filter.
    pub fn inc_limit(&mut self) {
        if self.limit != -1 {
            self.limit += 1;
        }
    }

    pub fn set_skip(&mut self, v: usize) {
        self.skip = v;
    }

    pub fn set_limit(&mut self, v: i64) {
        self.limit = v;
    }

    pub fn set_skip_deleted(&mut self, v: bool) {
        self.skip_deleted = v;
    }

    pub fn set_skip_design_doc(&mut self, v: bool) {
        self.skip_design_doc = v;
    }

    pub fn set_skip_local_doc(&mut self, v: bool) {
        self.skip_local_doc = v;
    }

    pub fn set_start_key(&mut self, v: &[u8]) {
        self.start_key = match &self.key_fn {
            Some(f) => f(v),
            None => Some(v.to_vec()),
        };
    }

    pub fn set_end_key(&mut self, v: &[u8]) {
        self.end_key = match &self.key_fn {
            Some(f) => f(v),
            None => Some(v.to_vec()),
        };
    }

    // position at start_key (or the beginning)
    fn anchor(&self, db: Database<Bytes, Bytes>) -> Option<(Vec<u8>, Vec<u8>)> {
        let entry = match &self.start_key {
            Some(sk) => db.get_greater_than_or_equal_to(self.rtxn, sk),
            None => db.first(self.rtxn),
        };
        self.entry_or_log(entry)
    }

    fn step(&self, db: Database<Bytes, Bytes>, after: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
        self.entry_or_log(db.get_greater_than(self.rtxn, after))
    }

    fn entry_or_log(
        &self,
        entry: heed::Result<Option<(&[u8], &[u8])>>,
    ) -> Option<(Vec<u8>, Vec<u8>)> {
        match entry {
            Ok(Some((k, v))) => Some((k.to_vec(), v.to_vec())),
            Ok(None) => None,
            Err(err) => {
                log_error!("iterator step failed: {}", err);
                None
            }
        }
    }

    // walk forward from `entry` until a document passes the filters
    fn accept(
        &mut self,
        db: Database<Bytes, Bytes>,
        mut entry: (Vec<u8>, Vec<u8>),
        count_limit: bool,
    ) -> Option<Document> {
        loop {
            self.key = Some(entry.0.clone());
            if !self.continue_() {
                return None;
            }

            let doc = self.decode(&entry.0, &entry.1);

            let filtered = (self.skip_deleted && doc.deleted)
                || (self.skip_design_doc && doc.is_design_doc())
                || (self.skip_local_doc && doc.is_local_doc());
            if filtered {
                entry = match self.step(db, &entry.0) {
                    Some(e) => e,
                    None => return self.exhausted(),
                };
                continue;
            }

            if count_limit && self.limit != -1 {
                self.limit -= 1;
            }
            return Some(doc);
        }
    }

    fn decode(&self, key: &[u8], value: &[u8]) -> Document {
        let mut doc: Document = serde_json::from_slice(value).unwrap_or_default();
        doc.key = Some(match &self.clean_key {
            Some(f) => f(key),
            None => Value::String(String::from_utf8_lossy(key).into_owned()),
        });
        doc
    }
}
