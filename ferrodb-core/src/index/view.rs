// src/index/view.rs
// Map/reduce view index: a regular index whose rows come from executing
// the compiled map function against documents. Emitted keys are stored
// in the order-preserving collation encoding, values as minimal
// document rows ({_id, value}).

use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use crate::collate;
use crate::document::{DesignDocFn, DocFunction, Document, FnType};
use crate::engine::{ReadTransaction, WriteTransaction};
use crate::error::{DbError, Result};
use crate::index::regular::RegularIndex;
use crate::index::{DocumentIndex, IndexStats};
use crate::iter::IteratorOptions;
use crate::viewserver::{ViewEngines, ViewServer};

struct ViewState {
    map_fn: String,
    reduce_fn: String,
    server: Option<Box<dyn ViewServer>>,
}

pub struct ViewIndex {
    regular: RegularIndex,
    ddfn: DesignDocFn,
    state: RwLock<ViewState>,
}

impl ViewIndex {
    pub fn new(ddfn: DesignDocFn) -> Self {
        let regular = RegularIndex::new_managed(
            ddfn.clone(),
            // stored keys are collation-encoded JSON values
            Arc::new(|raw: &[u8]| collate::decode(raw).unwrap_or(Value::Null)),
        );
        ViewIndex {
            regular,
            ddfn,
            state: RwLock::new(ViewState {
                map_fn: String::new(),
                reduce_fn: String::new(),
                server: None,
            }),
        }
    }

    pub fn ddfn(&self) -> &DesignDocFn {
        &self.ddfn
    }

    pub fn source_type(&self) -> FnType {
        FnType::Views
    }

    /// Swap in a newly compiled map function. A no-op when the source
    /// text is unchanged.
    pub fn update_source(
        &self,
        doc: &Document,
        f: &DocFunction,
        engines: &ViewEngines,
    ) -> Result<()> {
        if f.map_fn.is_empty() {
            return Err(DbError::BadRequest(format!(
                "empty map function for {}",
                self.ddfn
            )));
        }

        {
            let state = self.state.read();
            if state.map_fn == f.map_fn {
                return Ok(());
            }
        }

        let language = doc.language();
        let builder = engines.get(language).ok_or_else(|| {
            DbError::Unsupported(format!(
                "view engine for language {:?} is not registered",
                language
            ))
        })?;
        let server = builder(&f.map_fn)?;

        // the view compiled, swap map source and server atomically
        let mut state = self.state.write();
        state.map_fn = f.map_fn.clone();
        state.reduce_fn = f.reduce_fn.clone();
        state.server = Some(server);
        Ok(())
    }
}

impl DocumentIndex for ViewIndex {
    fn ensure(&self, tx: &mut WriteTransaction<'_>) -> Result<()> {
        self.regular.ensure(tx)
    }

    fn remove(&self, tx: &mut WriteTransaction<'_>) -> Result<()> {
        self.regular.remove(tx)
    }

    fn stats(&self, tx: &ReadTransaction<'_>) -> Result<IndexStats> {
        self.regular.stats(tx)
    }

    fn iterator_options(&self) -> Result<IteratorOptions> {
        self.regular.iterator_options()
    }

    fn document_stored(&self, tx: &mut WriteTransaction<'_>, doc: &Document) -> Result<()> {
        self.update_stored(tx, std::slice::from_ref(doc))
    }

    fn document_deleted(&self, tx: &mut WriteTransaction<'_>, doc: &Document) -> Result<()> {
        self.regular.remove_old_keys(tx, &doc.id)
    }

    fn update_stored(&self, tx: &mut WriteTransaction<'_>, docs: &[Document]) -> Result<()> {
        // design and local documents never contribute view rows
        let docs: Vec<&Document> = docs
            .iter()
            .filter(|d| !d.is_design_doc() && !d.is_local_doc())
            .collect();
        if docs.is_empty() {
            return Ok(());
        }

        // the writer lock serializes index maintenance for the batch
        let state = self.state.write();
        let server = state.server.as_ref().ok_or_else(|| {
            DbError::Unsupported(format!("view {} has no compiled source", self.ddfn))
        })?;

        for doc in &docs {
            self.regular.remove_old_keys(tx, &doc.id)?;
        }

        let live: Vec<Document> = docs
            .iter()
            .filter(|d| !d.deleted)
            .map(|d| (*d).clone())
            .collect();
        if live.is_empty() {
            return Ok(());
        }

        let rows = server.execute_view(&live)?;
        for row in rows {
            let key = collate::encode(&row.key);
            let value = serde_json::to_vec(&Document {
                id: row.id.clone(),
                value: Some(row.value),
                ..Document::default()
            })?;
            self.regular.insert_pair(tx, &row.id, key, value)?;
        }
        Ok(())
    }
}
