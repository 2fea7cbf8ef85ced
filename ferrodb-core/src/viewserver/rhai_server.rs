// src/viewserver/rhai_server.rs
// Built-in rhai view server.
//
// A map function is a rhai script evaluated once per document with `doc`
// in scope, e.g.
//
//   emit(doc.k, doc.n)
//
// A search function calls `index(name, value)` or
// `index(name, value, #{ store: true })` instead.

use std::sync::Arc;

use parking_lot::Mutex;
use rhai::{Dynamic, Engine, ImmutableString, OptimizationLevel, Scope, AST};
use serde_json::Value;

use crate::document::Document;
use crate::error::{DbError, Result};
use crate::viewserver::{SearchIndexDoc, ViewRow, ViewServer};

pub const RHAI_LANGUAGE: &str = "rhai";

type EmitBuffer = Arc<Mutex<Vec<(Dynamic, Dynamic)>>>;
type IndexBuffer = Arc<Mutex<Vec<(String, Dynamic, Option<rhai::Map>)>>>;

pub struct RhaiViewServer {
    engine: Engine,
    ast: AST,
    emitted: EmitBuffer,
    indexed: IndexBuffer,
}

pub fn new_rhai_view_server(source: &str) -> Result<Box<dyn ViewServer>> {
    RhaiViewServer::new(source).map(|s| Box::new(s) as Box<dyn ViewServer>)
}

impl RhaiViewServer {
    pub fn new(source: &str) -> Result<RhaiViewServer> {
        // Limits keep runaway user scripts from taking the process down.
        let mut engine = Engine::new();
        engine.set_optimization_level(OptimizationLevel::Simple);
        engine.set_max_call_levels(64);
        engine.set_max_operations(1_000_000);
        engine.set_max_expr_depths(64, 64);
        engine.set_max_array_size(100_000);
        engine.set_max_map_size(100_000);

        let emitted: EmitBuffer = Arc::new(Mutex::new(Vec::new()));
        let indexed: IndexBuffer = Arc::new(Mutex::new(Vec::new()));

        let buffer = emitted.clone();
        engine.register_fn("emit", move |key: Dynamic, value: Dynamic| {
            buffer.lock().push((key, value));
        });

        let buffer = indexed.clone();
        engine.register_fn(
            "index",
            move |name: ImmutableString, value: Dynamic| {
                buffer.lock().push((name.to_string(), value, None));
            },
        );
        let buffer = indexed.clone();
        engine.register_fn(
            "index",
            move |name: ImmutableString, value: Dynamic, options: rhai::Map| {
                buffer.lock().push((name.to_string(), value, Some(options)));
            },
        );

        let ast = engine
            .compile(source)
            .map_err(|err| DbError::Script(format!("compile failed: {}", err)))?;

        Ok(RhaiViewServer {
            engine,
            ast,
            emitted,
            indexed,
        })
    }

    fn run_for_doc(&self, doc: &Document) -> Result<()> {
        let json_doc = doc.to_json_value();
        let dynamic = rhai::serde::to_dynamic(&json_doc)
            .map_err(|err| DbError::Script(format!("document conversion failed: {}", err)))?;

        let mut scope = Scope::new();
        scope.push_dynamic("doc", dynamic);

        self.engine
            .eval_ast_with_scope::<Dynamic>(&mut scope, &self.ast)
            .map(|_| ())
            .map_err(|err| DbError::Script(err.to_string()))
    }
}

fn dynamic_to_value(d: &Dynamic) -> Result<Value> {
    rhai::serde::from_dynamic::<Value>(d)
        .map_err(|err| DbError::Script(format!("result conversion failed: {}", err)))
}

impl ViewServer for RhaiViewServer {
    fn execute_view(&self, docs: &[Document]) -> Result<Vec<ViewRow>> {
        let mut rows = Vec::new();

        for doc in docs {
            self.emitted.lock().clear();
            self.run_for_doc(doc)?;

            let emitted: Vec<_> = self.emitted.lock().drain(..).collect();
            for (key, value) in emitted {
                rows.push(ViewRow {
                    id: doc.id.clone(),
                    key: dynamic_to_value(&key)?,
                    value: dynamic_to_value(&value)?,
                });
            }
        }

        Ok(rows)
    }

    fn execute_search(&self, docs: &[Document]) -> Result<Vec<SearchIndexDoc>> {
        let mut out = Vec::new();

        for doc in docs {
            self.indexed.lock().clear();
            self.run_for_doc(doc)?;

            let indexed: Vec<_> = self.indexed.lock().drain(..).collect();
            if indexed.is_empty() {
                continue;
            }

            let mut search_doc = SearchIndexDoc {
                id: doc.id.clone(),
                ..SearchIndexDoc::default()
            };
            for (name, value, options) in indexed {
                search_doc
                    .fields
                    .insert(name.clone(), dynamic_to_value(&value)?);
                if let Some(options) = options {
                    let options_value = dynamic_to_value(&Dynamic::from_map(options))?;
                    let parsed = serde_json::from_value(options_value).map_err(|err| {
                        DbError::Script(format!("invalid index options for {:?}: {}", name, err))
                    })?;
                    search_doc.options.insert(name, parsed);
                }
            }
            out.push(search_doc);
        }

        Ok(out)
    }
}
