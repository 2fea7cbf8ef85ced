// src/engine/batch.rs
// Write batching: a logical write transaction runs against a read
// snapshot and records its mutations in an op log. The log is replayed
// in one short engine write transaction so the single writer lock is
// only held for the replay, not for the whole logical operation.

use heed::RwTxn;

use super::{Engine, ReadTransaction};
use crate::error::{DbError, Result};
use crate::log_trace;

/// Computes the final key/value for a `PutWithSequence` op once the
/// bucket sequence is known at replay time. Returning `None` keeps the
/// originally recorded key or value.
pub type KeyWithSeq = Box<dyn FnMut(&[u8], u64) -> (Option<Vec<u8>>, Option<Vec<u8>>) + Send>;

enum Op {
    EnsureBucket(String),
    DeleteBucket(String),
    Put {
        bucket: String,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    PutWithSequence {
        bucket: String,
        key: Vec<u8>,
        value: Vec<u8>,
        keyer: KeyWithSeq,
    },
    Delete {
        bucket: String,
        key: Vec<u8>,
    },
}

#[derive(Default)]
pub(crate) struct WriteBatch {
    ops: Vec<Op>,
    /// Buckets whose sequence high-water mark must be persisted with
    /// the commit (reservations made during the logical phase).
    seq_buckets: Vec<String>,
}

impl WriteBatch {
    pub(crate) fn is_empty(&self) -> bool {
        self.ops.is_empty() && self.seq_buckets.is_empty()
    }
}

/// A logical write transaction: snapshot reads plus an op log.
pub struct WriteTransaction<'e> {
    read: ReadTransaction<'e>,
    batch: WriteBatch,
}

impl<'e> WriteTransaction<'e> {
    pub(crate) fn new(read: ReadTransaction<'e>) -> Self {
        WriteTransaction {
            read,
            batch: WriteBatch::default(),
        }
    }

    pub(crate) fn into_batch(self) -> WriteBatch {
        self.batch
    }

    /// Record creation of a bucket.
    pub fn ensure_bucket(&mut self, bucket: &str) {
        self.batch.ops.push(Op::EnsureBucket(bucket.to_string()));
    }

    /// Record removal of a bucket with all its contents and sequence.
    pub fn delete_bucket(&mut self, bucket: &str) {
        self.batch.ops.push(Op::DeleteBucket(bucket.to_string()));
    }

    /// Record a put.
    pub fn put(&mut self, bucket: &str, key: Vec<u8>, value: Vec<u8>) {
        self.batch.ops.push(Op::Put {
            bucket: bucket.to_string(),
            key,
            value,
        });
    }

    /// Record a put whose final key/value depend on the bucket sequence
    /// allocated at replay time.
    pub fn put_with_sequence(&mut self, bucket: &str, key: Vec<u8>, value: Vec<u8>, keyer: KeyWithSeq) {
        self.batch.ops.push(Op::PutWithSequence {
            bucket: bucket.to_string(),
            key,
            value,
            keyer,
        });
    }

    /// Record a delete.
    pub fn delete(&mut self, bucket: &str, key: Vec<u8>) {
        self.batch.ops.push(Op::Delete {
            bucket: bucket.to_string(),
            key,
        });
    }

    /// Reserve the next sequence value of a bucket. Usable during the
    /// logical phase; the reservation is persisted with the commit.
    pub fn next_sequence(&mut self, bucket: &str) -> Result<u64> {
        let seq = self.read.engine().allocate_sequence(bucket)?;
        self.batch.seq_buckets.push(bucket.to_string());
        Ok(seq)
    }
}

// Snapshot reads are available on the write transaction as well.
impl<'e> std::ops::Deref for WriteTransaction<'e> {
    type Target = ReadTransaction<'e>;

    fn deref(&self) -> &Self::Target {
        &self.read
    }
}

impl Engine {
    /// Replay a batch inside one engine write transaction. Any failing
    /// op aborts the whole batch; nothing becomes visible.
    pub(crate) fn apply(&self, wtxn: &mut RwTxn<'_>, batch: WriteBatch) -> Result<()> {
        let mut touched = batch.seq_buckets;

        for op in batch.ops {
            match op {
                Op::EnsureBucket(bucket) => {
                    self.create_bucket(wtxn, &bucket)?;
                }
                Op::DeleteBucket(bucket) => {
                    log_trace!("op delete bucket {:?}", bucket);
                    if let Some(db) = self.bucket(wtxn, &bucket)? {
                        db.clear(wtxn)?;
                    }
                    self.sequences().delete(wtxn, bucket.as_bytes())?;
                    self.drop_sequence(&bucket);
                    touched.retain(|b| b != &bucket);
                }
                Op::Put { bucket, key, value } => {
                    log_trace!("op put {:?} ({}) to {:?}", key, value.len(), bucket);
                    let db = self.bucket(wtxn, &bucket)?.ok_or_else(|| {
                        DbError::Internal(format!(
                            "failed to put {:?} to bucket {:?}: no bucket",
                            key, bucket
                        ))
                    })?;
                    db.put(wtxn, &key, &value)?;
                }
                Op::PutWithSequence {
                    bucket,
                    key,
                    value,
                    mut keyer,
                } => {
                    let db = self.bucket(wtxn, &bucket)?.ok_or_else(|| {
                        DbError::Internal(format!(
                            "failed to put {:?} to bucket {:?}: no bucket",
                            key, bucket
                        ))
                    })?;
                    let seq = self.allocate_sequence(&bucket)?;
                    touched.push(bucket.clone());
                    let (new_key, new_value) = keyer(&key, seq);
                    let key = new_key.unwrap_or(key);
                    let value = new_value.unwrap_or(value);
                    log_trace!("op put with seq {:?} ({}) to {:?}", key, value.len(), bucket);
                    db.put(wtxn, &key, &value)?;
                }
                Op::Delete { bucket, key } => {
                    log_trace!("op delete {:?} from {:?}", key, bucket);
                    if let Some(db) = self.bucket(wtxn, &bucket)? {
                        db.delete(wtxn, &key)?;
                    }
                }
            }
        }

        // persist the sequence high-water marks of every touched bucket
        touched.sort();
        touched.dedup();
        for bucket in touched {
            if let Some(high) = self.sequence_high_water(&bucket) {
                self.sequences()
                    .put(wtxn, bucket.as_bytes(), &high.to_be_bytes())?;
            }
        }

        Ok(())
    }
}
