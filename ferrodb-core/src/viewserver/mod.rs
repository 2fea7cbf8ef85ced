// src/viewserver/mod.rs
// The narrow interface the core uses to run user map/search functions.
// Language engines are registered at open time as builders; the design
// document's `language` field picks one.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::document::{Document, SearchIndexOption};
use crate::error::Result;

mod rhai_server;

pub use rhai_server::{new_rhai_view_server, RhaiViewServer, RHAI_LANGUAGE};

/// One emitted view row, attributed to the document that emitted it.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewRow {
    pub id: String,
    pub key: Value,
    pub value: Value,
}

/// One typed-field document produced by a search function.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SearchIndexDoc {
    pub id: String,
    pub fields: Map<String, Value>,
    pub options: HashMap<String, SearchIndexOption>,
}

/// A compiled user function executed against batches of documents.
///
/// Implementations must never panic on malformed scripts; script
/// failures surface as `DbError::Script`.
pub trait ViewServer: Send + Sync {
    /// Run the compiled map function; documents are visible to the
    /// script with `_id` and `_rev` synthesized.
    fn execute_view(&self, docs: &[Document]) -> Result<Vec<ViewRow>>;

    /// Run the compiled search function, producing one field document
    /// per input document that called `index(...)`.
    fn execute_search(&self, docs: &[Document]) -> Result<Vec<SearchIndexDoc>>;
}

/// Builds a view server from function source text.
pub type ViewServerBuilder = Arc<dyn Fn(&str) -> Result<Box<dyn ViewServer>> + Send + Sync>;

/// Language name -> view server builder.
pub type ViewEngines = HashMap<String, ViewServerBuilder>;

/// The engine registry the crate ships with: rhai only. Additional
/// languages (e.g. "javascript") are registered by the embedder.
pub fn default_view_engines() -> ViewEngines {
    let mut engines = ViewEngines::new();
    engines.insert(
        RHAI_LANGUAGE.to_string(),
        Arc::new(|source: &str| new_rhai_view_server(source)) as ViewServerBuilder,
    );
    engines
}
