// src/reducer.rs
// Reducers consume view rows in key order and emit one row per group.
// The group flag decides whether a key change starts a new output row.

use std::collections::HashMap;
use std::sync::Arc;

use rhai::{Dynamic, Engine, OptimizationLevel, Scope, AST};
use serde_json::{Number, Value};

use crate::document::Document;
use crate::error::{DbError, Result};
use crate::viewserver::RHAI_LANGUAGE;

pub trait Reducer: Send {
    fn reduce(&mut self, doc: &Document, group: bool);
    fn result(&mut self) -> Result<Vec<Document>>;
}

/// Builds a user reducer from function source text.
pub type ReducerBuilder = Arc<dyn Fn(&str) -> Result<Box<dyn Reducer>> + Send + Sync>;

/// Language name -> reducer builder.
pub type ReducerEngines = HashMap<String, ReducerBuilder>;

pub fn default_reducer_engines() -> ReducerEngines {
    let mut engines = ReducerEngines::new();
    engines.insert(
        RHAI_LANGUAGE.to_string(),
        Arc::new(|source: &str| {
            RhaiReducer::new(source).map(|r| Box::new(r) as Box<dyn Reducer>)
        }) as ReducerBuilder,
    );
    engines
}

/// Select a reducer implementation for a view's reduce source.
pub fn build_reducer(
    reduce_fn: &str,
    language: &str,
    engines: &ReducerEngines,
) -> Result<Box<dyn Reducer>> {
    match reduce_fn {
        "" => Ok(Box::new(NoneReducer::default())),
        "_sum" => Ok(Box::new(SumReducer::default())),
        "_count" => Ok(Box::new(CountReducer::default())),
        "_stats" => Ok(Box::new(StatsReducer::default())),
        // same correctness as _count, without the cardinality estimate
        // speedup the name promises
        "_approx_count_distinct" => Ok(Box::new(CountReducer::default())),
        custom => {
            let builder = engines.get(language).ok_or_else(|| {
                DbError::Unsupported(format!(
                    "reducer engine for language {:?} is not registered",
                    language
                ))
            })?;
            builder(custom)
        }
    }
}

fn row(key: Option<Value>, value: Value) -> Document {
    Document {
        key,
        value: Some(value),
        ..Document::default()
    }
}

fn same_key(a: &Option<Value>, b: &Option<Value>) -> bool {
    a == b
}

// Numbers keep integer representation when they are integral.
fn num(v: f64) -> Value {
    if v.fract() == 0.0 && v.abs() < 9_007_199_254_740_992.0 {
        Value::Number(Number::from(v as i64))
    } else {
        Number::from_f64(v).map(Value::Number).unwrap_or(Value::Null)
    }
}

/// No reduce function: rows pass through unchanged.
#[derive(Default)]
pub struct NoneReducer {
    docs: Vec<Document>,
}

impl Reducer for NoneReducer {
    fn reduce(&mut self, doc: &Document, _group: bool) {
        self.docs.push(doc.clone());
    }

    fn result(&mut self) -> Result<Vec<Document>> {
        Ok(std::mem::take(&mut self.docs))
    }
}

enum SumValue {
    Int(i64),
    Float(f64),
}

impl SumValue {
    fn add(&mut self, v: &Value) {
        match v {
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    match self {
                        SumValue::Int(acc) => *acc += i,
                        SumValue::Float(acc) => *acc += i as f64,
                    }
                } else if let Some(f) = n.as_f64() {
                    // a float value upgrades the whole group to float
                    let current = match self {
                        SumValue::Int(acc) => *acc as f64,
                        SumValue::Float(acc) => *acc,
                    };
                    *self = SumValue::Float(current + f);
                }
            }
            _ => {} // non-numbers don't contribute
        }
    }

    fn value(&self) -> Value {
        match self {
            SumValue::Int(v) => Value::Number(Number::from(*v)),
            SumValue::Float(v) => num(*v),
        }
    }
}

/// `_sum`
#[derive(Default)]
pub struct SumReducer {
    groups: Vec<(Option<Value>, SumValue)>,
}

impl Reducer for SumReducer {
    fn reduce(&mut self, doc: &Document, group: bool) {
        let value = match &doc.value {
            Some(v @ Value::Number(_)) => v,
            _ => return,
        };

        let new_group = match self.groups.last() {
            None => true,
            Some((key, _)) => group && !same_key(key, &doc.key),
        };
        if new_group {
            self.groups.push((doc.key.clone(), SumValue::Int(0)));
        }
        self.groups.last_mut().unwrap().1.add(value);
    }

    fn result(&mut self) -> Result<Vec<Document>> {
        Ok(self
            .groups
            .drain(..)
            .map(|(key, sum)| row(key, sum.value()))
            .collect())
    }
}

/// `_count`
#[derive(Default)]
pub struct CountReducer {
    groups: Vec<(Option<Value>, i64)>,
}

impl Reducer for CountReducer {
    fn reduce(&mut self, doc: &Document, group: bool) {
        let new_group = match self.groups.last() {
            None => true,
            Some((key, _)) => group && !same_key(key, &doc.key),
        };
        if new_group {
            self.groups.push((doc.key.clone(), 0));
        }
        self.groups.last_mut().unwrap().1 += 1;
    }

    fn result(&mut self) -> Result<Vec<Document>> {
        Ok(self
            .groups
            .drain(..)
            .map(|(key, count)| row(key, Value::Number(Number::from(count))))
            .collect())
    }
}

#[derive(Debug, Clone, Copy)]
struct Stats {
    sum: f64,
    min: f64,
    max: f64,
    count: u64,
    sumsqr: f64,
}

impl Stats {
    fn new(v: f64) -> Self {
        Stats {
            sum: v,
            min: v,
            max: v,
            count: 1,
            sumsqr: v * v,
        }
    }

    fn add(&mut self, v: f64) {
        self.sum += v;
        self.min = self.min.min(v);
        self.max = self.max.max(v);
        self.count += 1;
        self.sumsqr += v * v;
    }

    fn value(&self) -> Value {
        serde_json::json!({
            "sum": num(self.sum),
            "min": num(self.min),
            "max": num(self.max),
            "count": self.count,
            "sumsqr": num(self.sumsqr),
        })
    }
}

/// `_stats`: `{sum, min, max, count, sumsqr}` per group, matching the
/// CouchDB built-in reduce function.
#[derive(Default)]
pub struct StatsReducer {
    groups: Vec<(Option<Value>, Option<Stats>)>,
}

impl Reducer for StatsReducer {
    fn reduce(&mut self, doc: &Document, group: bool) {
        let v = match doc.value.as_ref().and_then(Value::as_f64) {
            Some(v) => v,
            None => return,
        };

        let new_group = match self.groups.last() {
            None => true,
            Some((key, _)) => group && !same_key(key, &doc.key),
        };
        if new_group {
            self.groups.push((doc.key.clone(), None));
        }
        let slot = &mut self.groups.last_mut().unwrap().1;
        match slot {
            Some(stats) => stats.add(v),
            None => *slot = Some(Stats::new(v)),
        }
    }

    fn result(&mut self) -> Result<Vec<Document>> {
        Ok(self
            .groups
            .drain(..)
            .filter_map(|(key, stats)| stats.map(|s| row(key, s.value())))
            .collect())
    }
}

/// User reducer: a rhai script evaluated once per group with `keys`,
/// `values` and `rereduce` in scope; the script result is the group
/// value.
pub struct RhaiReducer {
    engine: Engine,
    ast: AST,
    groups: Vec<(Option<Value>, Vec<Value>)>,
}

impl RhaiReducer {
    pub fn new(source: &str) -> Result<RhaiReducer> {
        let mut engine = Engine::new();
        engine.set_optimization_level(OptimizationLevel::Simple);
        engine.set_max_call_levels(64);
        engine.set_max_operations(1_000_000);
        engine.set_max_expr_depths(64, 64);

        let ast = engine
            .compile(source)
            .map_err(|err| DbError::Script(format!("compile failed: {}", err)))?;

        Ok(RhaiReducer {
            engine,
            ast,
            groups: Vec::new(),
        })
    }
}

impl Reducer for RhaiReducer {
    fn reduce(&mut self, doc: &Document, group: bool) {
        let value = doc.value.clone().unwrap_or(Value::Null);

        let new_group = match self.groups.last() {
            None => true,
            Some((key, _)) => group && !same_key(key, &doc.key),
        };
        if new_group {
            self.groups.push((doc.key.clone(), Vec::new()));
        }
        self.groups.last_mut().unwrap().1.push(value);
    }

    fn result(&mut self) -> Result<Vec<Document>> {
        let mut rows = Vec::new();
        for (key, values) in self.groups.drain(..) {
            let keys: Vec<Value> = values
                .iter()
                .map(|_| key.clone().unwrap_or(Value::Null))
                .collect();

            let mut scope = Scope::new();
            scope.push_dynamic(
                "keys",
                rhai::serde::to_dynamic(&keys)
                    .map_err(|err| DbError::Script(err.to_string()))?,
            );
            scope.push_dynamic(
                "values",
                rhai::serde::to_dynamic(&values)
                    .map_err(|err| DbError::Script(err.to_string()))?,
            );
            scope.push("rereduce", false);

            let result = self
                .engine
                .eval_ast_with_scope::<Dynamic>(&mut scope, &self.ast)
                .map_err(|err| DbError::Script(err.to_string()))?;
            let value = rhai::serde::from_dynamic::<Value>(&result)
                .map_err(|err| DbError::Script(err.to_string()))?;

            rows.push(row(key, value));
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn view_row(key: Value, value: Value) -> Document {
        Document {
            key: Some(key),
            value: Some(value),
            ..Document::default()
        }
    }

    fn run(reducer: &mut dyn Reducer, rows: Vec<Document>, group: bool) -> Vec<Document> {
        for r in &rows {
            reducer.reduce(r, group);
        }
        reducer.result().unwrap()
    }

    #[test]
    fn test_sum_grouped() {
        let mut r = SumReducer::default();
        let out = run(
            &mut r,
            vec![
                view_row(json!("x"), json!(1)),
                view_row(json!("x"), json!(2)),
                view_row(json!("y"), json!(5)),
            ],
            true,
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].key, Some(json!("x")));
        assert_eq!(out[0].value, Some(json!(3)));
        assert_eq!(out[1].key, Some(json!("y")));
        assert_eq!(out[1].value, Some(json!(5)));
    }

    #[test]
    fn test_sum_ungrouped_single_row() {
        let mut r = SumReducer::default();
        let out = run(
            &mut r,
            vec![
                view_row(json!("x"), json!(1)),
                view_row(json!("x"), json!(2)),
                view_row(json!("y"), json!(5)),
            ],
            false,
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].value, Some(json!(8)));
    }

    #[test]
    fn test_sum_float_supersedes_int() {
        let mut r = SumReducer::default();
        let out = run(
            &mut r,
            vec![
                view_row(json!("x"), json!(1)),
                view_row(json!("x"), json!(0.5)),
            ],
            true,
        );
        assert_eq!(out[0].value, Some(json!(1.5)));
    }

    #[test]
    fn test_sum_ignores_non_numbers() {
        let mut r = SumReducer::default();
        let out = run(
            &mut r,
            vec![
                view_row(json!("x"), json!("nope")),
                view_row(json!("x"), json!(2)),
            ],
            true,
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].value, Some(json!(2)));
    }

    #[test]
    fn test_count() {
        let mut r = CountReducer::default();
        let out = run(
            &mut r,
            vec![
                view_row(json!("x"), json!("a")),
                view_row(json!("x"), json!("b")),
                view_row(json!("y"), json!("c")),
            ],
            true,
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].value, Some(json!(2)));
        assert_eq!(out[1].value, Some(json!(1)));
    }

    #[test]
    fn test_stats() {
        let mut r = StatsReducer::default();
        let out = run(
            &mut r,
            vec![
                view_row(json!("x"), json!(1)),
                view_row(json!("x"), json!(3)),
            ],
            true,
        );
        assert_eq!(out.len(), 1);
        assert_eq!(
            out[0].value,
            Some(json!({"sum": 4, "min": 1, "max": 3, "count": 2, "sumsqr": 10}))
        );
    }

    #[test]
    fn test_rhai_user_reducer() {
        let mut r = RhaiReducer::new(
            "let total = 0; for v in values { total += v; } total",
        )
        .unwrap();
        let out = run(
            &mut r,
            vec![
                view_row(json!("x"), json!(2)),
                view_row(json!("x"), json!(3)),
                view_row(json!("y"), json!(10)),
            ],
            true,
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].value, Some(json!(5)));
        assert_eq!(out[1].value, Some(json!(10)));
    }

    #[test]
    fn test_build_reducer_selection() {
        let engines = default_reducer_engines();
        assert!(build_reducer("", "rhai", &engines).is_ok());
        assert!(build_reducer("_sum", "rhai", &engines).is_ok());
        assert!(build_reducer("_approx_count_distinct", "rhai", &engines).is_ok());
        assert!(build_reducer("let x = 1; x", "rhai", &engines).is_ok());
        assert!(build_reducer("custom", "javascript", &engines).is_err());
    }
}
