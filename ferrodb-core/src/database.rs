// src/database.rs
// One database: the engine, the index registry, documents with revision
// control, attachments on the filesystem and the facade operations the
// HTTP collaborator consumes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde_json::Value;

use crate::changes::{
    notify_listeners, ChangeRow, ChangesOptions, ChangesResponse, DocObserver, ListenerMap,
};
use crate::collate;
use crate::document::{
    DesignDocFn, Document, FnType, Security, DESIGN_DOC_PREFIX,
};
use crate::engine::{Engine, ReadTransaction, WriteTransaction};
use crate::error::{DbError, Result};
use crate::index::{
    new_deleted_index, ChangesIndex, DocumentIndex, ExternalSearchIndex, IndexStats,
    RegisteredIndex, SearchQuery, SearchResult, ViewIndex, CHANGES_INDEX_NAME,
    DELETED_INDEX_NAME, SEARCH_INDEX_EXT,
};
use crate::iter::IteratorOptions;
use crate::query::{ExecutionStats, FindQuery};
use crate::reducer::{build_reducer, ReducerEngines};
use crate::tasks::Task;
use crate::viewserver::ViewEngines;
use crate::{log_debug, log_info};

/// Bucket holding the documents
pub const DOCS_BUCKET: &str = "docs";
/// Bucket holding internal documents (security)
pub const INTERNAL_BUCKET: &str = "_internal";
/// Attachment directory below the database directory
pub const ATTACHMENT_DIR: &str = "attachments";
/// Search index directory below the database directory
pub const SEARCH_DIR: &str = "search_indices";

const SECURITY_KEY: &[u8] = b"_security";

/// Rebuild batch size (documents per window)
const REBUILD_BATCH_SIZE: usize = 1000;

/// Database-wide statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DatabaseStats {
    pub file_size: u64,
    pub doc_count: u64,
    pub doc_del_count: u64,
    pub alloc: u64,
    pub in_use: u64,
}

/// All-docs / view query options
#[derive(Debug, Clone, Default)]
pub struct AllDocsQuery {
    /// Query an index instead of the documents bucket
    pub ddfn: Option<DesignDocFn>,
    pub skip: usize,
    /// 0 means no limit
    pub limit: i64,
    pub start_key: Option<String>,
    pub end_key: Option<String>,
    pub include_docs: bool,
    pub skip_local: bool,
}

/// View query options
#[derive(Debug, Clone)]
pub struct ViewQuery {
    pub group: bool,
    pub reduce: bool,
    pub skip: usize,
    /// 0 means no limit
    pub limit: i64,
    pub start_key: Option<Value>,
    pub end_key: Option<Value>,
    pub include_docs: bool,
}

impl Default for ViewQuery {
    fn default() -> Self {
        ViewQuery {
            group: false,
            reduce: true,
            skip: 0,
            limit: 0,
            start_key: None,
            end_key: None,
            include_docs: false,
        }
    }
}

/// Result of a view query
#[derive(Debug, Clone, Default)]
pub struct ViewResult {
    pub total_rows: usize,
    pub rows: Vec<Document>,
}

/// Per-document outcome of a bulk write
#[derive(Debug, Clone, Default)]
pub struct BulkDocResult {
    pub id: String,
    pub rev: Option<String>,
    pub error: Option<String>,
}

/// Result of a find query
#[derive(Debug, Clone, Default)]
pub struct FindResult {
    pub docs: Vec<Document>,
    pub bookmark: String,
    pub execution_stats: ExecutionStats,
}

pub struct Database {
    name: String,
    /// `<database_dir>/<name>.d`, holds attachments and search indices
    database_dir: PathBuf,
    engine: Arc<Engine>,
    indices: RwLock<HashMap<String, Arc<RegisteredIndex>>>,
    view_engines: ViewEngines,
    reducer_engines: ReducerEngines,
    listeners: ListenerMap,
}

impl Database {
    /// Open (or create) a database below `path`. Registers the built-in
    /// indices and materializes the design-document indices without
    /// triggering rebuilds.
    pub fn open(
        name: &str,
        path: &Path,
        view_engines: ViewEngines,
        reducer_engines: ReducerEngines,
    ) -> Result<Arc<Database>> {
        let engine = Arc::new(Engine::open(&path.join(name))?);
        let database_dir = path.join(format!("{}.d", name));

        let mut indices: HashMap<String, Arc<RegisteredIndex>> = HashMap::new();
        indices.insert(
            CHANGES_INDEX_NAME.to_string(),
            Arc::new(RegisteredIndex::Changes(ChangesIndex::new(
                CHANGES_INDEX_NAME,
            ))),
        );
        indices.insert(
            DELETED_INDEX_NAME.to_string(),
            Arc::new(RegisteredIndex::Unique(new_deleted_index())),
        );

        let db = Arc::new(Database {
            name: name.to_string(),
            database_dir,
            engine,
            indices: RwLock::new(indices),
            view_engines,
            reducer_engines,
            listeners: Arc::new(dashmap::DashMap::new()),
        });

        // create all required database buckets and indices
        let design_docs = db.all_design_docs()?;
        db.engine.write(|tx| {
            tx.ensure_bucket(DOCS_BUCKET);
            tx.ensure_bucket(crate::tasks::TASKS_BUCKET);
            tx.ensure_bucket(INTERNAL_BUCKET);

            for doc in &design_docs {
                db.build_design_doc_indices_tx(tx, doc, false)?;
            }
            for idx in db.indices_snapshot() {
                log_debug!("ensure index {}", db.index_name(&idx));
                idx.ensure(tx)?;
            }
            Ok(())
        })?;

        log_info!("opened database {:?}", name);
        Ok(db)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn database_dir(&self) -> &Path {
        &self.database_dir
    }

    pub(crate) fn engine(&self) -> &Engine {
        &self.engine
    }

    fn index_name(&self, idx: &RegisteredIndex) -> String {
        match idx {
            RegisteredIndex::View(i) => i.ddfn().to_string(),
            RegisteredIndex::Search(i) => i.ddfn().to_string(),
            RegisteredIndex::Changes(_) => CHANGES_INDEX_NAME.to_string(),
            _ => DELETED_INDEX_NAME.to_string(),
        }
    }

    /// Look up a registered index by its DDFN string (or builtin name).
    pub fn index(&self, name: &str) -> Option<Arc<RegisteredIndex>> {
        self.indices.read().get(name).cloned()
    }

    pub fn changes_index(&self) -> Arc<RegisteredIndex> {
        self.index(CHANGES_INDEX_NAME)
            .expect("changes index is always registered")
    }

    pub(crate) fn indices_snapshot(&self) -> Vec<Arc<RegisteredIndex>> {
        self.indices.read().values().cloned().collect()
    }

    // ========================================================================
    // DOCUMENTS
    // ========================================================================

    /// Store a document, returning its new revision.
    pub fn put_document(&self, doc: Document) -> Result<String> {
        let stored = self.engine.write(|tx| self.put_document_tx(tx, doc))?;
        let rev = stored.rev.clone();
        self.notify_document_update(stored);
        Ok(rev)
    }

    pub(crate) fn put_document_tx(
        &self,
        tx: &mut WriteTransaction<'_>,
        mut doc: Document,
    ) -> Result<Document> {
        if doc.id.is_empty() {
            return Err(DbError::BadRequest("document id is required".to_string()));
        }

        // verify that the update is valid
        let old_doc = self.get_document_raw(tx, &doc.id)?;
        if let Some(old_doc) = &old_doc {
            if !old_doc.valid_update_revision(&doc) {
                return Err(DbError::Conflict);
            }
        }

        // next revision and local sequence
        let rev_seq = doc.next_revision_seq();
        doc.local_seq = tx.next_sequence(DOCS_BUCKET)?;

        // the revision hash covers the canonical encoding with the new
        // local_seq assigned but the rev still unset
        doc.rev.clear();
        for meta in ["_id", "_rev", "_deleted", "_attachments", "_local_seq"] {
            doc.data.remove(meta);
        }
        let digest = doc.rev_digest()?;
        doc.rev = format!("{}-{}", rev_seq, digest);

        // maintain indices - remove old contributions
        if let Some(old_doc) = &old_doc {
            for idx in self.indices_snapshot() {
                idx.document_deleted(tx, old_doc)?;
            }
        }

        tx.put(DOCS_BUCKET, doc.id.clone().into_bytes(), serde_json::to_vec(&doc)?);

        if doc.is_design_doc() {
            self.build_design_doc_indices_tx(tx, &doc, true)?;
        }

        // maintain indices - add new contributions
        for idx in self.indices_snapshot() {
            idx.document_stored(tx, &doc)?;
        }

        Ok(doc)
    }

    fn get_document_raw(
        &self,
        tx: &ReadTransaction<'_>,
        doc_id: &str,
    ) -> Result<Option<Document>> {
        let raw = match tx.get(DOCS_BUCKET, doc_id.as_bytes())? {
            Some(raw) => raw,
            None => return Ok(None),
        };
        let doc: Document = serde_json::from_slice(&raw)?;
        Ok(Some(doc))
    }

    /// Fetch a document; tombstones are returned with `deleted` set.
    pub fn get_document(&self, doc_id: &str) -> Result<Document> {
        let doc = self
            .engine
            .read(|tx| self.get_document_raw(tx, doc_id))?
            .ok_or(DbError::NotFound)?;
        Ok(doc)
    }

    /// Delete a document: writes a tombstone revision.
    pub fn delete_document(&self, doc_id: &str, rev: &str) -> Result<String> {
        let doc = Document {
            id: doc_id.to_string(),
            rev: rev.to_string(),
            deleted: true,
            ..Document::default()
        };
        self.put_document(doc)
    }

    /// Store a batch of documents, one transaction per document like
    /// CouchDB's non-atomic `_bulk_docs`: a conflict on one document
    /// doesn't fail the others.
    pub fn bulk_docs(&self, docs: Vec<Document>) -> Vec<BulkDocResult> {
        docs.into_iter()
            .map(|doc| {
                let id = doc.id.clone();
                match self.put_document(doc) {
                    Ok(rev) => BulkDocResult {
                        id,
                        rev: Some(rev),
                        error: None,
                    },
                    Err(err) => BulkDocResult {
                        id,
                        rev: None,
                        error: Some(err.to_string()),
                    },
                }
            })
            .collect()
    }

    fn notify_document_update(&self, doc: Document) {
        notify_listeners(&self.listeners, doc);
    }

    /// Register a live observer for document changes.
    pub fn new_doc_observer(&self) -> DocObserver {
        DocObserver::register(&self.listeners)
    }

    // ========================================================================
    // ALL DOCS
    // ========================================================================

    pub fn all_docs(&self, query: &AllDocsQuery) -> Result<(Vec<Document>, usize)> {
        let opts = match &query.ddfn {
            Some(ddfn) => {
                let idx = self
                    .index(&ddfn.to_string())
                    .ok_or(DbError::NotFound)?;
                idx.iterator_options()?
            }
            None => IteratorOptions::for_bucket(DOCS_BUCKET),
        };

        let mut docs = Vec::new();
        let mut total = 0;
        self.engine.read(|tx| {
            let mut it = tx.iterator(opts)?;
            total = it.total();
            if total == 0 {
                return Ok(());
            }

            it.set_skip(query.skip);
            it.set_skip_local_doc(query.skip_local);
            if query.limit != 0 {
                it.set_limit(query.limit);
            }
            if let Some(start) = &query.start_key {
                it.set_start_key(start.as_bytes());
            }
            if let Some(end) = &query.end_key {
                it.set_end_key(end.as_bytes());
            }

            let mut doc = it.first();
            while it.continue_() {
                match doc {
                    Some(d) => docs.push(d),
                    None => break,
                }
                doc = it.next();
            }
            Ok(())
        })?;

        if query.ddfn.is_some() && query.include_docs {
            self.enrich_documents(&mut docs)?;
        }
        if !query.include_docs {
            for doc in &mut docs {
                doc.data = serde_json::Map::new();
            }
        }

        Ok((docs, total))
    }

    /// All design documents with their bodies.
    pub fn all_design_docs(&self) -> Result<Vec<Document>> {
        let (docs, _) = self.all_docs(&AllDocsQuery {
            start_key: Some(DESIGN_DOC_PREFIX.to_string()),
            // '0' is the first byte after '/', so this bound covers
            // every "_design/" prefixed id
            end_key: Some("_design0".to_string()),
            include_docs: true,
            ..AllDocsQuery::default()
        })?;
        // rows from the docs bucket already carry their data
        Ok(docs)
    }

    /// Load the document bodies for index rows (include_docs).
    pub fn enrich_documents(&self, docs: &mut [Document]) -> Result<()> {
        self.engine.read(|tx| {
            for doc in docs.iter_mut() {
                if let Some(stored) = self.get_document_raw(tx, &doc.id)? {
                    doc.data = stored.data;
                    doc.rev = stored.rev;
                    doc.deleted = stored.deleted;
                    doc.attachments = stored.attachments;
                }
            }
            Ok(())
        })
    }

    // ========================================================================
    // DESIGN DOC INDICES
    // ========================================================================

    /// Materialize the indices declared by a design document: update
    /// sources in place, replace indices whose kind changed, create
    /// missing ones and drop the ones whose function is gone. With
    /// `update` set, rebuild tasks are enqueued in the same batch.
    pub(crate) fn build_design_doc_indices_tx(
        &self,
        tx: &mut WriteTransaction<'_>,
        doc: &Document,
        update: bool,
    ) -> Result<()> {
        let functions = doc.functions();
        let mut tasks = Vec::new();

        // drop indices whose function disappeared from the document
        let mut gone = Vec::new();
        {
            let indices = self.indices.read();
            for (name, idx) in indices.iter() {
                if idx.source_type().is_none() {
                    continue; // builtin
                }
                let ddfn = match DesignDocFn::parse(name) {
                    Some(ddfn) => ddfn,
                    None => continue,
                };
                if ddfn.design_doc_id != doc.id {
                    continue;
                }
                let still_declared = functions
                    .iter()
                    .any(|f| f.design_doc_fn(&doc.id).to_string() == *name);
                if !still_declared {
                    gone.push(name.clone());
                }
            }
        }
        for name in gone {
            if let Some(idx) = self.index(&name) {
                log_debug!("removing index {}", name);
                idx.remove(tx)?;
            }
            self.indices.write().remove(&name);
        }

        for f in &functions {
            let ddfn = f.design_doc_fn(&doc.id);
            let name = ddfn.to_string();

            if let Some(idx) = self.index(&name) {
                if idx.source_type() == Some(f.fn_type) {
                    // same kind: swap the compiled source
                    idx.update_source(doc, f, &self.view_engines)?;
                    if update {
                        tasks.push(Task::update_view(&self.name, &name));
                    }
                    continue;
                }
                // the function changed kind, replace the index
                idx.remove(tx)?;
                self.indices.write().remove(&name);
            }

            let idx = match f.fn_type {
                FnType::Views => RegisteredIndex::View(ViewIndex::new(ddfn.clone())),
                FnType::Indexes => RegisteredIndex::Search(ExternalSearchIndex::new(
                    ddfn.clone(),
                    self.search_index_path(&ddfn),
                )),
            };
            idx.ensure(tx)?;
            idx.update_source(doc, f, &self.view_engines)?;
            if update {
                tasks.push(Task::update_view(&self.name, &name));
            }
            self.indices.write().insert(name, Arc::new(idx));
        }

        if !tasks.is_empty() {
            self.add_tasks_tx(tx, &tasks)?;
        }
        Ok(())
    }

    fn search_index_path(&self, ddfn: &DesignDocFn) -> PathBuf {
        // DDFN strings contain '/', keep the directory name flat
        let safe = ddfn.to_string().replace('/', "%2F");
        self.database_dir
            .join(SEARCH_DIR)
            .join(format!("{}.{}", safe, SEARCH_INDEX_EXT))
    }

    // ========================================================================
    // REBUILD
    // ========================================================================

    /// Rebuild one index over all documents in bounded windows,
    /// reporting progress through the task.
    pub fn rebuild(&self, task: &mut Task, idx: &Arc<RegisteredIndex>) -> Result<()> {
        let mut window = 0;
        loop {
            let mut docs = Vec::new();
            self.engine.read(|tx| {
                let mut it = tx.iterator(IteratorOptions::for_bucket(DOCS_BUCKET))?;
                let total = it.total();
                if total == 0 {
                    return Ok(());
                }
                task.processing_total = total;

                it.set_skip(window * REBUILD_BATCH_SIZE);
                it.set_limit(REBUILD_BATCH_SIZE as i64);
                it.set_skip_design_doc(true);
                it.set_skip_local_doc(true);

                let mut doc = it.first();
                while it.continue_() {
                    match doc {
                        Some(d) => docs.push(d),
                        None => break,
                    }
                    doc = it.next();
                }
                Ok(())
            })?;

            if docs.is_empty() {
                break;
            }

            self.engine.write(|tx| idx.update_stored(tx, &docs))?;

            task.processed += docs.len();
            if task.id != 0 {
                self.update_task(task)?;
            }

            let fetched = docs.len();
            window += 1;
            if fetched < REBUILD_BATCH_SIZE {
                break;
            }
        }
        Ok(())
    }

    // ========================================================================
    // FIND
    // ========================================================================

    /// Scan the documents bucket evaluating the Mango selector.
    pub fn find_docs(&self, query: &FindQuery) -> Result<FindResult> {
        let started = Instant::now();
        let mut result = FindResult::default();

        self.engine.read(|tx| {
            let mut it = tx.iterator(IteratorOptions::for_bucket(DOCS_BUCKET))?;
            if it.total() == 0 {
                return Ok(());
            }

            it.set_skip(query.skip);
            if query.limit != 0 {
                it.set_limit(query.limit as i64);
            }
            if !query.bookmark.is_empty() {
                it.set_start_key(query.bookmark.as_bytes());
            }

            let mut doc = it.first();
            while it.continue_() {
                let d = match doc {
                    Some(d) => d,
                    None => break,
                };
                result.execution_stats.total_docs_examined += 1;

                if query
                    .match_doc(&d)
                    .map_err(|e| DbError::BadRequest(format!("find failed: {}", e)))?
                {
                    result.execution_stats.results_returned += 1;
                    result.bookmark = d.id.clone();
                    result.docs.push(query.project(&d));
                } else {
                    // rejected rows don't count against the limit
                    it.inc_limit();
                }
                doc = it.next();
            }
            Ok(())
        })?;

        result.execution_stats.execution_time_ms =
            started.elapsed().as_secs_f64() * 1000.0;
        Ok(result)
    }

    // ========================================================================
    // VIEWS
    // ========================================================================

    /// Query a view, optionally running its reduce function.
    pub fn query_view(
        &self,
        design_doc_id: &str,
        view_name: &str,
        query: &ViewQuery,
    ) -> Result<ViewResult> {
        let design_doc = self.get_document(design_doc_id)?;
        let view = design_doc.view(view_name).ok_or(DbError::NotFound)?;

        let ddfn = DesignDocFn::new_view(design_doc_id, view_name);
        let idx = self.index(&ddfn.to_string()).ok_or(DbError::NotFound)?;
        let opts = idx.iterator_options()?;

        let mut rows = Vec::new();
        let mut total_rows = 0;
        self.engine.read(|tx| {
            let mut it = tx.iterator(opts)?;
            total_rows = it.total();
            if total_rows == 0 {
                return Ok(());
            }

            it.set_skip(query.skip);
            if query.limit != 0 {
                it.set_limit(query.limit);
            }
            if let Some(start) = &query.start_key {
                // sorts before any stored key with this prefix
                it.set_start_key(&collate::encode(start));
            }
            if let Some(end) = &query.end_key {
                // stored keys carry a sequence suffix; pad the bound so
                // every row of the end key is included
                let mut key = collate::encode(end);
                key.extend_from_slice(&[0xFF; 10]);
                it.set_end_key(&key);
            }

            let mut doc = it.first();
            while it.continue_() {
                match doc {
                    Some(d) => rows.push(d),
                    None => break,
                }
                doc = it.next();
            }
            Ok(())
        })?;

        if view.reduce_fn.is_empty() || !query.reduce {
            if query.include_docs {
                self.enrich_documents(&mut rows)?;
            }
            return Ok(ViewResult { total_rows, rows });
        }

        // reduce in key order; without grouping every row lands in the
        // null-key group
        let mut reducer =
            build_reducer(&view.reduce_fn, &view.language, &self.reducer_engines)?;
        for mut row in rows {
            if !query.group {
                row.key = Some(Value::Null);
            }
            reducer.reduce(&row, query.group);
        }

        Ok(ViewResult {
            total_rows,
            rows: reducer.result()?,
        })
    }

    // ========================================================================
    // SEARCH
    // ========================================================================

    /// Query a full-text index.
    pub fn search(
        &self,
        design_doc_id: &str,
        index_name: &str,
        query: &SearchQuery,
    ) -> Result<SearchResult> {
        let ddfn = DesignDocFn::new_search(design_doc_id, index_name);
        let idx = self.index(&ddfn.to_string()).ok_or(DbError::NotFound)?;
        let search = idx.as_search().ok_or(DbError::NotFound)?;
        search.search_documents(query)
    }

    // ========================================================================
    // SECURITY
    // ========================================================================

    pub fn put_security(&self, security: &Security) -> Result<()> {
        let data = serde_json::to_vec(security)?;
        self.engine.write(|tx| {
            tx.put(INTERNAL_BUCKET, SECURITY_KEY.to_vec(), data.clone());
            Ok(())
        })
    }

    pub fn get_security(&self) -> Result<Security> {
        let stored = self
            .engine
            .read(|tx| tx.get(INTERNAL_BUCKET, SECURITY_KEY))?;
        match stored {
            Some(raw) => Ok(serde_json::from_slice(&raw)?),
            None => Ok(Security::default_security()),
        }
    }

    // ========================================================================
    // STATS
    // ========================================================================

    pub fn stats(&self) -> Result<DatabaseStats> {
        self.engine.read(|tx| {
            let docs = tx.bucket_stats(DOCS_BUCKET)?;
            let deleted = tx.bucket_stats(DELETED_INDEX_NAME)?;
            Ok(DatabaseStats {
                file_size: self.engine.file_size(),
                doc_count: docs.keys.saturating_sub(deleted.keys),
                doc_del_count: deleted.keys,
                alloc: docs.allocated_bytes,
                in_use: docs.used_bytes,
            })
        })
    }

    /// Statistics of one index.
    pub fn view_stats(&self, ddfn: &DesignDocFn) -> Result<IndexStats> {
        self.index_stats(&ddfn.to_string())
    }

    /// Statistics of one registered index by name.
    pub fn index_stats(&self, name: &str) -> Result<IndexStats> {
        let idx = self.index(name).ok_or(DbError::NotFound)?;
        self.engine.read(|tx| idx.stats(tx))
    }

    // ========================================================================
    // CHANGES
    // ========================================================================

    /// The change feed. With `since == "now"` (or when a pass comes up
    /// empty) the call blocks on a live observer until the timeout
    /// expires or a change arrives.
    pub fn changes(&self, options: &ChangesOptions) -> Result<ChangesResponse> {
        let deadline = options.timeout.map(|t| Instant::now() + t);
        let mut since = options.since.clone();
        let mut wait = options.since_now();

        loop {
            if wait {
                let observer = self.new_doc_observer();
                let remaining = match deadline {
                    Some(deadline) => {
                        let now = Instant::now();
                        if now >= deadline {
                            return Ok(self.empty_changes_response(&since));
                        }
                        Some(deadline - now)
                    }
                    None => None,
                };
                match observer.wait_for_doc(remaining) {
                    Some(doc) => {
                        since = doc.local_seq.saturating_sub(1).to_string();
                    }
                    None => return Ok(self.empty_changes_response(&since)),
                }
            }

            let mut rows = Vec::new();
            let mut pending = 0;
            self.engine.read(|tx| {
                let idx = self.changes_index();
                let mut it = tx.iterator(idx.iterator_options()?)?;
                if options.limit > 0 {
                    it.set_limit(options.limit);
                }
                if since != "now" {
                    it.set_start_key(since.as_bytes());
                }

                let mut doc = it.first();
                while it.continue_() {
                    match doc {
                        Some(d) => rows.push(d),
                        None => break,
                    }
                    doc = it.next();
                }

                // number of remaining changes after this page
                pending = it.remaining();
                Ok(())
            })?;

            if rows.is_empty() && options.limit != 0 {
                // nothing to report yet: wait (again) for a change
                // until the timeout is used up
                let expired = matches!(deadline, Some(d) if Instant::now() >= d);
                if !expired {
                    wait = true;
                    continue;
                }
            }

            let results: Vec<ChangeRow> = rows.iter().map(ChangeRow::from_document).collect();
            let last_seq = results
                .last()
                .map(|r| r.seq.clone())
                .unwrap_or_else(|| self.current_changes_seq());
            return Ok(ChangesResponse {
                results,
                last_seq,
                pending,
            });
        }
    }

    /// The continuous feed: deliver every existing change after
    /// `since`, then keep following live updates until `emit` returns
    /// false or the timeout elapses without a change. The HTTP
    /// collaborator streams each row as it is handed out.
    pub fn follow_changes(
        &self,
        options: &ChangesOptions,
        mut emit: impl FnMut(ChangeRow) -> bool,
    ) -> Result<()> {
        let mut last_seq: u64 = if options.since_now() {
            self.engine.read(|tx| tx.sequence(CHANGES_INDEX_NAME))?
        } else {
            options.since.parse().unwrap_or(0)
        };

        loop {
            // register before draining so no update can slip between
            // the catch-up pass and the wait
            let observer = self.new_doc_observer();

            let response = self.changes(&ChangesOptions {
                since: last_seq.to_string(),
                limit: 0,
                timeout: None,
            })?;
            for row in response.results {
                let seq: u64 = row.seq.parse().unwrap_or(0);
                if seq <= last_seq {
                    continue; // the start of the page is inclusive
                }
                if !emit(row) {
                    return Ok(());
                }
                last_seq = seq;
            }

            match observer.wait_for_doc(options.timeout) {
                Some(_) => continue,
                None => return Ok(()), // timeout, feed ends
            }
        }
    }

    fn current_changes_seq(&self) -> String {
        self.engine
            .read(|tx| tx.sequence(CHANGES_INDEX_NAME))
            .unwrap_or(0)
            .to_string()
    }

    fn empty_changes_response(&self, _since: &str) -> ChangesResponse {
        ChangesResponse {
            results: Vec::new(),
            last_seq: self.current_changes_seq(),
            pending: 0,
        }
    }

    // ========================================================================
    // ATTACHMENTS
    // ========================================================================

    /// Directory holding the attachments of one document
    pub fn doc_dir(&self, doc_id: &str) -> PathBuf {
        self.database_dir.join(ATTACHMENT_DIR).join(doc_id)
    }

    /// Path of one attachment
    pub fn attachment_path(&self, doc_id: &str, filename: &str) -> PathBuf {
        self.doc_dir(doc_id).join(filename)
    }

    /// Store an attachment and bump the document revision.
    pub fn put_attachment(
        &self,
        doc_id: &str,
        rev: &str,
        filename: &str,
        content_type: &str,
        data: &[u8],
    ) -> Result<String> {
        use crate::document::Attachment;

        let stored = self.engine.write(|tx| {
            let mut doc = self
                .get_document_raw(tx, doc_id)?
                .ok_or(DbError::NotFound)?;
            if doc.rev != rev {
                return Err(DbError::Conflict);
            }

            let doc_dir = self.doc_dir(doc_id);
            std::fs::create_dir_all(&doc_dir)?;
            let file_path = doc_dir.join(filename);
            if let Err(err) = std::fs::write(&file_path, data) {
                let _ = std::fs::remove_file(&file_path); // don't leave broken files
                return Err(err.into());
            }

            let attachment = Attachment {
                filename: filename.to_string(),
                content_type: content_type.to_string(),
                revpos: doc.next_revision_seq() as i64,
                digest: format!("{:x}", md5::compute(data)),
                length: data.len() as i64,
                stub: true,
            };
            doc.attachments.insert(filename.to_string(), attachment);

            self.put_document_tx(tx, doc)
        })?;

        let rev = stored.rev.clone();
        self.notify_document_update(stored);
        Ok(rev)
    }

    /// Attachment metadata plus the path of its bytes.
    pub fn get_attachment(&self, doc_id: &str, filename: &str) -> Result<(crate::document::Attachment, PathBuf)> {
        let doc = self.get_document(doc_id)?;
        let mut attachment = doc
            .attachments
            .get(filename)
            .cloned()
            .ok_or(DbError::NotFound)?;
        attachment.filename = filename.to_string();

        let path = self.attachment_path(doc_id, filename);
        if !path.exists() {
            return Err(DbError::NotFound);
        }
        Ok((attachment, path))
    }

    /// Remove an attachment and bump the document revision.
    pub fn delete_attachment(&self, doc_id: &str, rev: &str, filename: &str) -> Result<String> {
        let stored = self.engine.write(|tx| {
            let mut doc = self
                .get_document_raw(tx, doc_id)?
                .ok_or(DbError::NotFound)?;
            if doc.rev != rev {
                return Err(DbError::Conflict);
            }
            if doc.attachments.remove(filename).is_none() {
                return Err(DbError::NotFound);
            }

            let path = self.attachment_path(doc_id, filename);
            if path.exists() {
                std::fs::remove_file(&path)?;
            }

            self.put_document_tx(tx, doc)
        })?;

        let rev = stored.rev.clone();
        self.notify_document_update(stored);
        Ok(rev)
    }
}
