// src/index/search.rs
// Full-text index backed by an embedded tantivy index on disk.
//
// The tantivy schema is fixed: a raw stored `id` field, an indexed
// `fields` JSON field and a stored `stored` JSON field. Which emitted
// fields end up indexed/stored is decided by the inferred field mapping:
// the first observed options and value kind of a field win and stay
// immutable for the life of the index; new fields may be added later.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tantivy::collector::{Count, TopDocs};
use tantivy::query::QueryParser;
use tantivy::schema::{
    Field, IndexRecordOption, JsonObjectOptions, Schema, TextFieldIndexing, STORED, STRING,
};
use tantivy::{Document as TantivyDocumentTrait, Index, IndexReader, IndexWriter, TantivyDocument, Term};

use crate::document::{DesignDocFn, DocFunction, Document, FnType};
use crate::engine::{ReadTransaction, WriteTransaction};
use crate::error::{DbError, Result};
use crate::index::{DocumentIndex, IndexStats};
use crate::iter::IteratorOptions;
use crate::log_warn;
use crate::viewserver::{SearchIndexDoc, ViewEngines, ViewServer};

/// File extension of on-disk search indices
pub const SEARCH_INDEX_EXT: &str = "tantivy";

const MAPPING_FILE: &str = "mapping.json";
const WRITER_HEAP_BYTES: usize = 50_000_000;

/// A full-text query against one search index
#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    pub query: String,
    pub limit: usize,
    pub skip: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchRecord {
    pub id: String,
    /// `[score, hit number]`
    pub order: Vec<f64>,
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchResult {
    pub total: usize,
    pub records: Vec<SearchRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum FieldKind {
    Boolean,
    Numeric,
    Text,
}

impl FieldKind {
    fn of(value: &Value) -> Option<FieldKind> {
        match value {
            Value::Bool(_) => Some(FieldKind::Boolean),
            Value::Number(_) => Some(FieldKind::Numeric),
            Value::String(_) => Some(FieldKind::Text),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FieldConfig {
    kind: FieldKind,
    store: bool,
    facet: bool,
    index: bool,
    boost: f64,
}

/// First-wins field mapping, persisted next to the tantivy files.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct FieldMapping {
    fields: HashMap<String, FieldConfig>,
}

struct SearchHandle {
    index: Index,
    writer: Mutex<IndexWriter>,
    reader: IndexReader,
    id_field: Field,
    fields_field: Field,
    stored_field: Field,
    schema: Schema,
    mapping: FieldMapping,
}

struct SearchState {
    search_fn: String,
    analyzer: String,
    server: Option<Box<dyn ViewServer>>,
}

pub struct ExternalSearchIndex {
    path: PathBuf,
    ddfn: DesignDocFn,
    handle: RwLock<Option<SearchHandle>>,
    state: RwLock<SearchState>,
}

fn build_schema() -> (Schema, Field, Field, Field) {
    let mut builder = Schema::builder();
    let id_field = builder.add_text_field("id", STRING | STORED);
    let json_indexing = TextFieldIndexing::default()
        .set_tokenizer("default")
        .set_index_option(IndexRecordOption::WithFreqsAndPositions);
    let fields_field = builder.add_json_field(
        "fields",
        JsonObjectOptions::default().set_indexing_options(json_indexing),
    );
    let stored_field = builder.add_json_field("stored", STORED);
    let schema = builder.build();
    (schema, id_field, fields_field, stored_field)
}

impl ExternalSearchIndex {
    pub fn new(ddfn: DesignDocFn, path: PathBuf) -> Self {
        ExternalSearchIndex {
            path,
            ddfn,
            handle: RwLock::new(None),
            state: RwLock::new(SearchState {
                search_fn: String::new(),
                analyzer: String::new(),
                server: None,
            }),
        }
    }

    pub fn ddfn(&self) -> &DesignDocFn {
        &self.ddfn
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn source_type(&self) -> FnType {
        FnType::Indexes
    }

    /// Swap in a newly compiled search function. A no-op when the
    /// source text is unchanged.
    pub fn update_source(
        &self,
        doc: &Document,
        f: &DocFunction,
        engines: &ViewEngines,
    ) -> Result<()> {
        if f.search_fn.is_empty() {
            return Err(DbError::BadRequest(format!(
                "empty search function for {}",
                self.ddfn
            )));
        }

        {
            let state = self.state.read();
            if state.search_fn == f.search_fn {
                return Ok(());
            }
        }

        let language = doc.language();
        let builder = engines.get(language).ok_or_else(|| {
            DbError::Unsupported(format!(
                "search engine for language {:?} is not registered",
                language
            ))
        })?;
        let server = builder(&f.search_fn)?;

        let mut state = self.state.write();
        state.search_fn = f.search_fn.clone();
        state.analyzer = f.analyzer.clone();
        state.server = Some(server);
        Ok(())
    }

    fn open_handle(&self) -> Result<SearchHandle> {
        std::fs::create_dir_all(&self.path)?;

        let (schema, id_field, fields_field, stored_field) = build_schema();
        let index = match Index::open_in_dir(&self.path) {
            Ok(index) => index,
            Err(_) => Index::create_in_dir(&self.path, schema.clone())?,
        };

        let writer = index.writer(WRITER_HEAP_BYTES)?;
        let reader = index.reader()?;

        let mapping_path = self.path.join(MAPPING_FILE);
        let mapping = match std::fs::read(&mapping_path) {
            Ok(raw) => serde_json::from_slice(&raw).unwrap_or_default(),
            Err(_) => FieldMapping::default(),
        };

        Ok(SearchHandle {
            index,
            writer: Mutex::new(writer),
            reader,
            id_field,
            fields_field,
            stored_field,
            schema,
            mapping,
        })
    }

    /// Extend the field mapping with newly observed fields.
    ///
    /// CouchDB inherited behavior: the mapping can only be extended,
    /// fields can't be removed and the configuration of a field can't
    /// change once given.
    fn update_mapping(&self, handle: &mut SearchHandle, docs: &[SearchIndexDoc]) -> Result<()> {
        let mut changed = false;

        for doc in docs {
            for (field, opt) in &doc.options {
                if handle.mapping.fields.contains_key(field) {
                    continue;
                }
                let kind = match doc.fields.get(field).and_then(FieldKind::of) {
                    Some(kind) => kind,
                    None => {
                        // no dedicated mapping possible, fall back to the
                        // default treatment of the field
                        log_warn!(
                            "fallback to default mapping for {:?} in index {}",
                            field,
                            self.ddfn
                        );
                        continue;
                    }
                };
                handle.mapping.fields.insert(
                    field.clone(),
                    FieldConfig {
                        kind,
                        store: opt.store,
                        facet: opt.facet,
                        index: opt.should_index(),
                        boost: opt.boost.unwrap_or(1.0),
                    },
                );
                changed = true;
            }
        }

        if changed {
            let raw = serde_json::to_vec_pretty(&handle.mapping)?;
            std::fs::write(self.path.join(MAPPING_FILE), raw)?;
        }
        Ok(())
    }

    fn with_handle<T>(&self, f: impl FnOnce(&SearchHandle) -> Result<T>) -> Result<T> {
        let handle = self.handle.read();
        match handle.as_ref() {
            Some(handle) => f(handle),
            None => Err(DbError::Internal(format!(
                "search index {} is not open",
                self.ddfn
            ))),
        }
    }

    fn index_batch(&self, search_docs: &[SearchIndexDoc]) -> Result<()> {
        let mut guard = self.handle.write();
        let handle = guard.as_mut().ok_or_else(|| {
            DbError::Internal(format!("search index {} is not open", self.ddfn))
        })?;

        self.update_mapping(handle, search_docs)?;

        {
            let writer = handle.writer.lock();
            for doc in search_docs {
                let mut indexed = Map::new();
                let mut stored = Map::new();
                for (field, value) in &doc.fields {
                    match handle.mapping.fields.get(field) {
                        Some(cfg) => {
                            if cfg.index {
                                indexed.insert(field.clone(), value.clone());
                            }
                            if cfg.store {
                                stored.insert(field.clone(), value.clone());
                            }
                        }
                        // unmapped fields are indexed with the defaults
                        None => {
                            indexed.insert(field.clone(), value.clone());
                        }
                    }
                }

                let tantivy_doc = serde_json::json!({
                    "id": doc.id,
                    "fields": indexed,
                    "stored": stored,
                });
                let parsed =
                    TantivyDocument::parse_json(&handle.schema, &tantivy_doc.to_string())
                        .map_err(|err| DbError::Search(err.to_string()))?;

                writer.delete_term(Term::from_field_text(handle.id_field, &doc.id));
                writer.add_document(parsed)?;
            }
        }

        let mut writer = handle.writer.lock();
        writer.commit()?;
        handle.reader.reload()?;
        Ok(())
    }

    /// Execute a query string against the index.
    pub fn search_documents(&self, query: &SearchQuery) -> Result<SearchResult> {
        self.with_handle(|handle| {
            let limit = if query.limit == 0 { 25 } else { query.limit };

            let searcher = handle.reader.searcher();
            let parser = QueryParser::for_index(&handle.index, vec![handle.fields_field]);
            let parsed = parser.parse_query(&query.query)?;

            let (hits, total) = searcher.search(
                &parsed,
                &(TopDocs::with_limit(limit).and_offset(query.skip), Count),
            )?;

            let mut result = SearchResult {
                total,
                records: Vec::new(),
            };
            for (hit_number, (score, address)) in hits.into_iter().enumerate() {
                let retrieved: TantivyDocument = searcher.doc(address)?;
                let named = serde_json::to_value(retrieved.to_named_doc(&handle.schema))?;

                let id = named["id"][0].as_str().unwrap_or_default().to_string();
                let fields = match named["stored"].get(0) {
                    Some(Value::Object(fields)) => fields.clone(),
                    _ => Map::new(),
                };

                result.records.push(SearchRecord {
                    id,
                    order: vec![score as f64, hit_number as f64],
                    fields,
                });
            }
            Ok(result)
        })
    }
}

impl DocumentIndex for ExternalSearchIndex {
    fn ensure(&self, _tx: &mut WriteTransaction<'_>) -> Result<()> {
        // make sure the index is only initialized once
        if self.handle.read().is_some() {
            return Ok(());
        }
        let opened = self.open_handle()?;
        let mut handle = self.handle.write();
        if handle.is_none() {
            *handle = Some(opened);
        }
        Ok(())
    }

    fn remove(&self, _tx: &mut WriteTransaction<'_>) -> Result<()> {
        *self.handle.write() = None;
        if self.path.exists() {
            std::fs::remove_dir_all(&self.path)?;
        }
        Ok(())
    }

    fn stats(&self, _tx: &ReadTransaction<'_>) -> Result<IndexStats> {
        self.with_handle(|handle| {
            let docs = handle.reader.searcher().num_docs();

            let mut used = 0;
            if let Ok(entries) = std::fs::read_dir(&self.path) {
                for entry in entries.flatten() {
                    if let Ok(meta) = entry.metadata() {
                        used += meta.len();
                    }
                }
            }

            Ok(IndexStats {
                documents: docs,
                keys: docs,
                used,
                allocated: used,
            })
        })
    }

    fn iterator_options(&self) -> Result<IteratorOptions> {
        // search indices are queried through search_documents
        Err(DbError::Unsupported(
            "search indices have no iterator".to_string(),
        ))
    }

    fn document_stored(&self, tx: &mut WriteTransaction<'_>, doc: &Document) -> Result<()> {
        // ignore deleted docs, don't re-index them again
        if doc.deleted {
            return Ok(());
        }
        self.update_stored(tx, std::slice::from_ref(doc))
    }

    fn document_deleted(&self, _tx: &mut WriteTransaction<'_>, doc: &Document) -> Result<()> {
        self.with_handle(|handle| {
            let writer = handle.writer.lock();
            writer.delete_term(Term::from_field_text(handle.id_field, &doc.id));
            drop(writer);

            let mut writer = handle.writer.lock();
            writer.commit()?;
            handle.reader.reload()?;
            Ok(())
        })
    }

    fn update_stored(&self, tx: &mut WriteTransaction<'_>, docs: &[Document]) -> Result<()> {
        let docs: Vec<Document> = docs
            .iter()
            .filter(|d| !d.deleted && !d.is_design_doc() && !d.is_local_doc())
            .cloned()
            .collect();
        if docs.is_empty() {
            return Ok(());
        }

        // make sure the on-disk index is available even if the registry
        // was populated without an explicit ensure
        self.ensure(tx)?;

        let search_docs = {
            let state = self.state.write();
            let server = state.server.as_ref().ok_or_else(|| {
                DbError::Unsupported(format!("search {} has no compiled source", self.ddfn))
            })?;
            server.execute_search(&docs)?
        };
        if search_docs.is_empty() {
            return Ok(());
        }

        self.index_batch(&search_docs)
    }
}
