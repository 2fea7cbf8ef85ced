// src/engine/mod.rs
// Bucket-scoped transactional key-value engine on top of LMDB (heed).
//
// The engine exposes named buckets (LMDB databases) with byte keys in
// lexicographic order, per-bucket monotonic sequences that survive
// restarts, snapshot reads and batched writes (see batch.rs).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions, RoTxn, WithoutTls};
use parking_lot::{Mutex, RwLock};

use crate::error::Result;
use crate::iter::{DocIterator, IteratorOptions};
use crate::log_trace;

mod batch;

pub use batch::{KeyWithSeq, WriteTransaction};

/// Engine-internal bucket holding the per-bucket sequence counters.
pub const SEQUENCES_BUCKET: &str = "__sequences";

const MAP_SIZE: usize = 1024 * 1024 * 1024; // 1 GiB
const MAX_BUCKETS: u32 = 512;

/// Statistics of a single bucket
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BucketStats {
    pub keys: u64,
    pub used_bytes: u64,
    pub allocated_bytes: u64,
}

/// The embedded key-value engine backing one database.
pub struct Engine {
    env: Env<WithoutTls>,
    path: PathBuf,
    /// Opened bucket handles; handles are cheap copies and stay valid
    /// for the lifetime of the environment.
    buckets: RwLock<HashMap<String, Database<Bytes, Bytes>>>,
    sequences: Database<Bytes, Bytes>,
    /// In-memory sequence high-water marks. Reservations made during the
    /// logical phase of a write transaction come from here, so two
    /// concurrent logical writes never share a value; the marks are
    /// persisted with the batch commit. Aborted batches leave gaps,
    /// which keeps the never-reused guarantee.
    seq_high: Mutex<HashMap<String, u64>>,
}

impl Engine {
    /// Open (or create) the engine at the given directory.
    pub fn open(path: &Path) -> Result<Engine> {
        std::fs::create_dir_all(path)?;

        let options = EnvOpenOptions::new();
        let mut options = options.read_txn_without_tls();
        options.map_size(MAP_SIZE);
        options.max_dbs(MAX_BUCKETS);
        let env = unsafe { options.open(path)? };

        let mut wtxn = env.write_txn()?;
        let sequences = env.create_database(&mut wtxn, Some(SEQUENCES_BUCKET))?;
        wtxn.commit()?;

        Ok(Engine {
            env,
            path: path.to_path_buf(),
            buckets: RwLock::new(HashMap::new()),
            sequences,
            seq_high: Mutex::new(HashMap::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Total bytes used by the engine file.
    pub fn file_size(&self) -> u64 {
        self.env.real_disk_size().unwrap_or(0)
    }

    /// Run `f` with a consistent read snapshot. Multiple readers run
    /// concurrently.
    pub fn read<T>(&self, f: impl FnOnce(&ReadTransaction<'_>) -> Result<T>) -> Result<T> {
        let rtxn = self.env.read_txn()?;
        let tx = ReadTransaction { engine: self, rtxn };
        f(&tx)
    }

    /// Run `f` against a read snapshot collecting writes into an op log,
    /// then replay the log in one short engine write transaction.
    /// See batch.rs for the op-log semantics.
    pub fn write<T>(&self, f: impl FnOnce(&mut WriteTransaction<'_>) -> Result<T>) -> Result<T> {
        let rtxn = self.env.read_txn()?;
        let mut tx = WriteTransaction::new(ReadTransaction { engine: self, rtxn });
        let out = f(&mut tx)?;
        let batch = tx.into_batch();

        // only attempt the write transaction if there is something to do
        if batch.is_empty() {
            return Ok(out);
        }

        let mut wtxn = self.env.write_txn()?;
        self.apply(&mut wtxn, batch)?;
        wtxn.commit()?;
        Ok(out)
    }

    /// Look up a bucket handle, caching it for later transactions.
    pub(crate) fn bucket(
        &self,
        rtxn: &RoTxn<'_, WithoutTls>,
        name: &str,
    ) -> Result<Option<Database<Bytes, Bytes>>> {
        if let Some(db) = self.buckets.read().get(name) {
            return Ok(Some(*db));
        }
        match self.env.open_database::<Bytes, Bytes>(rtxn, Some(name))? {
            Some(db) => {
                self.buckets.write().insert(name.to_string(), db);
                Ok(Some(db))
            }
            None => Ok(None),
        }
    }

    pub(crate) fn create_bucket(
        &self,
        wtxn: &mut heed::RwTxn<'_>,
        name: &str,
    ) -> Result<Database<Bytes, Bytes>> {
        let db = self.env.create_database::<Bytes, Bytes>(wtxn, Some(name))?;
        self.buckets.write().insert(name.to_string(), db);
        log_trace!("ensure bucket {:?}", name);
        Ok(db)
    }

    pub(crate) fn sequences(&self) -> Database<Bytes, Bytes> {
        self.sequences
    }

    /// Allocate the next sequence value for a bucket. The value is
    /// reserved immediately in memory; it becomes durable when the
    /// surrounding batch commits.
    pub(crate) fn allocate_sequence(&self, bucket: &str) -> Result<u64> {
        let mut high = self.seq_high.lock();
        let next = match high.get(bucket) {
            Some(cur) => cur + 1,
            None => self.persisted_sequence(bucket)? + 1,
        };
        high.insert(bucket.to_string(), next);
        Ok(next)
    }

    /// The highest sequence value handed out for a bucket so far.
    pub(crate) fn current_sequence(&self, bucket: &str) -> Result<u64> {
        if let Some(cur) = self.seq_high.lock().get(bucket) {
            return Ok(*cur);
        }
        self.persisted_sequence(bucket)
    }

    fn persisted_sequence(&self, bucket: &str) -> Result<u64> {
        let rtxn = self.env.read_txn()?;
        let stored = self.sequences.get(&rtxn, bucket.as_bytes())?;
        Ok(stored
            .and_then(|v| v.try_into().ok())
            .map(u64::from_be_bytes)
            .unwrap_or(0))
    }

    pub(crate) fn drop_sequence(&self, bucket: &str) {
        self.seq_high.lock().remove(bucket);
    }

    pub(crate) fn sequence_high_water(&self, bucket: &str) -> Option<u64> {
        self.seq_high.lock().get(bucket).copied()
    }
}

/// A consistent read snapshot of the engine.
pub struct ReadTransaction<'e> {
    engine: &'e Engine,
    rtxn: RoTxn<'e, WithoutTls>,
}

impl<'e> ReadTransaction<'e> {
    pub(crate) fn engine(&self) -> &'e Engine {
        self.engine
    }

    /// Get a value; `None` for a missing bucket or key.
    pub fn get(&self, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let db = match self.engine.bucket(&self.rtxn, bucket)? {
            Some(db) => db,
            None => return Ok(None),
        };
        Ok(db.get(&self.rtxn, key)?.map(|v| v.to_vec()))
    }

    /// Statistics for a bucket; all zero when the bucket doesn't exist.
    pub fn bucket_stats(&self, bucket: &str) -> Result<BucketStats> {
        let db = match self.engine.bucket(&self.rtxn, bucket)? {
            Some(db) => db,
            None => return Ok(BucketStats::default()),
        };
        let stat = db.stat(&self.rtxn)?;
        let pages = (stat.branch_pages + stat.leaf_pages + stat.overflow_pages) as u64;
        let allocated = pages * stat.page_size as u64;
        Ok(BucketStats {
            keys: stat.entries as u64,
            used_bytes: allocated,
            allocated_bytes: allocated,
        })
    }

    /// The current sequence of a bucket (0 if none allocated yet).
    pub fn sequence(&self, bucket: &str) -> Result<u64> {
        self.engine.current_sequence(bucket)
    }

    /// A cursor over a bucket; iterating a missing bucket yields nothing.
    pub fn cursor(&self, bucket: &str) -> Result<Cursor<'_, 'e>> {
        let db = self.engine.bucket(&self.rtxn, bucket)?;
        Ok(Cursor {
            rtxn: &self.rtxn,
            db,
            pos: None,
        })
    }

    /// A document iterator honoring the passed options.
    pub fn iterator(&self, opts: IteratorOptions) -> Result<DocIterator<'_, 'e>> {
        let db = self.engine.bucket(&self.rtxn, &opts.bucket_name)?;
        Ok(DocIterator::new(&self.rtxn, db, opts))
    }
}

/// Stateful cursor over one bucket. The position is re-anchored on every
/// step, so mutations between steps (in other transactions) never
/// invalidate it.
pub struct Cursor<'t, 'e> {
    rtxn: &'t RoTxn<'e, WithoutTls>,
    db: Option<Database<Bytes, Bytes>>,
    pos: Option<Vec<u8>>,
}

type Entry = Option<(Vec<u8>, Vec<u8>)>;

impl<'t, 'e> Cursor<'t, 'e> {
    fn remember(&mut self, entry: Option<(&[u8], &[u8])>) -> Entry {
        match entry {
            Some((k, v)) => {
                self.pos = Some(k.to_vec());
                Some((k.to_vec(), v.to_vec()))
            }
            None => {
                self.pos = None;
                None
            }
        }
    }

    pub fn first(&mut self) -> Result<Entry> {
        let db = match self.db {
            Some(db) => db,
            None => return Ok(None),
        };
        let entry = db.first(self.rtxn)?;
        Ok(self.remember(entry))
    }

    pub fn last(&mut self) -> Result<Entry> {
        let db = match self.db {
            Some(db) => db,
            None => return Ok(None),
        };
        let entry = db.last(self.rtxn)?;
        Ok(self.remember(entry))
    }

    pub fn next(&mut self) -> Result<Entry> {
        let db = match self.db {
            Some(db) => db,
            None => return Ok(None),
        };
        let entry = match &self.pos {
            Some(pos) => db.get_greater_than(self.rtxn, pos)?,
            None => db.first(self.rtxn)?,
        };
        Ok(self.remember(entry))
    }

    pub fn prev(&mut self) -> Result<Entry> {
        let db = match self.db {
            Some(db) => db,
            None => return Ok(None),
        };
        let entry = match &self.pos {
            Some(pos) => db.get_lower_than(self.rtxn, pos)?,
            None => db.last(self.rtxn)?,
        };
        Ok(self.remember(entry))
    }

    /// Position at the first key >= `key`.
    pub fn seek(&mut self, key: &[u8]) -> Result<Entry> {
        let db = match self.db {
            Some(db) => db,
            None => return Ok(None),
        };
        let entry = db.get_greater_than_or_equal_to(self.rtxn, key)?;
        Ok(self.remember(entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_engine() -> (TempDir, Engine) {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(dir.path()).unwrap();
        (dir, engine)
    }

    #[test]
    fn test_put_get_roundtrip() {
        let (_dir, engine) = test_engine();
        engine
            .write(|tx| {
                tx.ensure_bucket("b");
                tx.put("b", b"k".to_vec(), b"v".to_vec());
                Ok(())
            })
            .unwrap();

        let value = engine.read(|tx| tx.get("b", b"k")).unwrap();
        assert_eq!(value, Some(b"v".to_vec()));
        let missing = engine.read(|tx| tx.get("b", b"nope")).unwrap();
        assert_eq!(missing, None);
        let no_bucket = engine.read(|tx| tx.get("nope", b"k")).unwrap();
        assert_eq!(no_bucket, None);
    }

    #[test]
    fn test_cursor_order_and_seek() {
        let (_dir, engine) = test_engine();
        engine
            .write(|tx| {
                tx.ensure_bucket("b");
                for k in ["a", "c", "e"] {
                    tx.put("b", k.as_bytes().to_vec(), b"v".to_vec());
                }
                Ok(())
            })
            .unwrap();

        engine
            .read(|tx| {
                let mut c = tx.cursor("b")?;
                assert_eq!(c.first()?.unwrap().0, b"a".to_vec());
                assert_eq!(c.next()?.unwrap().0, b"c".to_vec());
                assert_eq!(c.next()?.unwrap().0, b"e".to_vec());
                assert_eq!(c.next()?, None);

                assert_eq!(c.seek(b"b")?.unwrap().0, b"c".to_vec());
                assert_eq!(c.prev()?.unwrap().0, b"a".to_vec());
                assert_eq!(c.last()?.unwrap().0, b"e".to_vec());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_sequences_are_monotonic_and_persisted() {
        let dir = TempDir::new().unwrap();
        {
            let engine = Engine::open(dir.path()).unwrap();
            engine
                .write(|tx| {
                    tx.ensure_bucket("b");
                    assert_eq!(tx.next_sequence("b")?, 1);
                    assert_eq!(tx.next_sequence("b")?, 2);
                    // another bucket has its own counter
                    tx.ensure_bucket("other");
                    assert_eq!(tx.next_sequence("other")?, 1);
                    Ok(())
                })
                .unwrap();
        }

        // reopen: counters continue, values are never reused
        let engine = Engine::open(dir.path()).unwrap();
        engine
            .write(|tx| {
                assert_eq!(tx.next_sequence("b")?, 3);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_bucket_stats() {
        let (_dir, engine) = test_engine();
        engine
            .write(|tx| {
                tx.ensure_bucket("b");
                tx.put("b", b"k1".to_vec(), b"v".to_vec());
                tx.put("b", b"k2".to_vec(), b"v".to_vec());
                Ok(())
            })
            .unwrap();

        let stats = engine.read(|tx| tx.bucket_stats("b")).unwrap();
        assert_eq!(stats.keys, 2);
        assert!(stats.allocated_bytes > 0);

        let stats = engine.read(|tx| tx.bucket_stats("missing")).unwrap();
        assert_eq!(stats, BucketStats::default());
    }

    #[test]
    fn test_delete_bucket_clears_data_and_sequence() {
        let (_dir, engine) = test_engine();
        engine
            .write(|tx| {
                tx.ensure_bucket("b");
                tx.put("b", b"k".to_vec(), b"v".to_vec());
                tx.next_sequence("b")?;
                Ok(())
            })
            .unwrap();

        engine
            .write(|tx| {
                tx.delete_bucket("b");
                Ok(())
            })
            .unwrap();

        assert_eq!(engine.read(|tx| tx.get("b", b"k")).unwrap(), None);
        assert_eq!(engine.read(|tx| tx.bucket_stats("b")).unwrap().keys, 0);
    }
}
