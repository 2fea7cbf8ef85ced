// src/query/operators.rs
//! Field operator implementations for the Mango evaluator.
//!
//! Comparison semantics: integers and floats compare numerically across
//! the int/float divide; any other mix of type families is simply false,
//! never an error. Errors are reserved for malformed operator arguments.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lazy_static::lazy_static;
use lru::LruCache;
use regex::Regex;
use serde_json::Value;

use crate::error::{DbError, Result};

lazy_static! {
    /// Global cache for compiled regex patterns.
    /// LRU with 100 entry limit to prevent memory bloat.
    static ref REGEX_CACHE: Mutex<LruCache<String, Regex>> =
        Mutex::new(LruCache::new(NonZeroUsize::new(100).unwrap()));
}

/// Get or compile a regex pattern with caching.
///
/// Regex::new() is expensive, so repeated selectors with the same
/// pattern reuse the compiled form.
fn get_or_compile_regex(pattern: &str) -> Result<Regex> {
    {
        let mut cache = REGEX_CACHE.lock().unwrap();
        if let Some(regex) = cache.get(pattern) {
            return Ok(regex.clone());
        }
    }

    let regex = Regex::new(pattern).map_err(|e| {
        DbError::BadRequest(format!("invalid regex pattern {:?}: {}", pattern, e))
    })?;

    let mut cache = REGEX_CACHE.lock().unwrap();
    cache.put(pattern.to_string(), regex.clone());
    Ok(regex)
}

/// The Mango field operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldOp {
    Lt,
    Lte,
    Eq,
    Ne,
    Gte,
    Gt,
    Exists,
    Type,
    In,
    Nin,
    Size,
    Mod,
    Regex,
    All,
}

impl FieldOp {
    pub fn parse(s: &str) -> Option<FieldOp> {
        match s {
            "$lt" => Some(FieldOp::Lt),
            "$lte" => Some(FieldOp::Lte),
            "$eq" => Some(FieldOp::Eq),
            "$ne" => Some(FieldOp::Ne),
            "$gte" => Some(FieldOp::Gte),
            "$gt" => Some(FieldOp::Gt),
            "$exists" => Some(FieldOp::Exists),
            "$type" => Some(FieldOp::Type),
            "$in" => Some(FieldOp::In),
            "$nin" => Some(FieldOp::Nin),
            "$size" => Some(FieldOp::Size),
            "$mod" => Some(FieldOp::Mod),
            "$regex" => Some(FieldOp::Regex),
            "$all" => Some(FieldOp::All),
            _ => None,
        }
    }
}

/// The `$type` name of a value.
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Equality with numeric coercion across int/float.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            x.as_f64().unwrap_or(f64::NAN) == y.as_f64().unwrap_or(f64::NAN)
        }
        _ => a == b,
    }
}

/// Strict less-than; only numbers and strings order, everything else is
/// false.
pub fn values_less(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            x.as_f64().unwrap_or(f64::NAN) < y.as_f64().unwrap_or(f64::NAN)
        }
        (Value::String(x), Value::String(y)) => x < y,
        _ => false,
    }
}

pub fn values_greater(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            x.as_f64().unwrap_or(f64::NAN) > y.as_f64().unwrap_or(f64::NAN)
        }
        (Value::String(x), Value::String(y)) => x > y,
        _ => false,
    }
}

/// Evaluate one field operator. `field` is the resolved document value
/// (missing paths resolve to null), `exists` the raw presence check.
pub fn match_field_op(
    op: FieldOp,
    field: Option<Value>,
    arg: &Value,
    exists: bool,
) -> Result<bool> {
    let field = field.unwrap_or(Value::Null);

    match op {
        FieldOp::Lt => Ok(values_less(&field, arg)),
        FieldOp::Lte => Ok(values_equal(&field, arg) || values_less(&field, arg)),
        FieldOp::Eq => Ok(values_equal(&field, arg)),
        FieldOp::Ne => Ok(!values_equal(&field, arg)),
        FieldOp::Gte => Ok(values_equal(&field, arg) || values_greater(&field, arg)),
        FieldOp::Gt => Ok(values_greater(&field, arg)),

        FieldOp::Exists => match arg {
            Value::Bool(expected) => Ok(exists == *expected),
            _ => Err(DbError::BadRequest(
                "$exists argument has to be a boolean".to_string(),
            )),
        },

        FieldOp::Type => match arg {
            Value::String(expected) => Ok(type_name(&field) == expected),
            _ => Err(DbError::BadRequest(
                "$type argument has to be a string".to_string(),
            )),
        },

        FieldOp::In => match arg {
            Value::Array(items) => Ok(items.iter().any(|item| values_equal(&field, item))),
            _ => Err(DbError::BadRequest(
                "$in argument has to be an array".to_string(),
            )),
        },

        FieldOp::Nin => match arg {
            Value::Array(items) => Ok(!items.iter().any(|item| values_equal(&field, item))),
            _ => Err(DbError::BadRequest(
                "$nin argument has to be an array".to_string(),
            )),
        },

        FieldOp::Size => {
            let expected = arg.as_u64().ok_or_else(|| {
                DbError::BadRequest("$size argument has to be a number".to_string())
            })?;
            match field {
                Value::Array(items) => Ok(items.len() as u64 == expected),
                _ => Ok(false), // non-array fields cannot match
            }
        }

        FieldOp::Mod => {
            let parts = match arg {
                Value::Array(parts) if parts.len() == 2 => parts,
                _ => {
                    return Err(DbError::BadRequest(
                        "$mod argument has to be an array of two numbers".to_string(),
                    ))
                }
            };
            let divisor = parts[0].as_i64().ok_or_else(|| {
                DbError::BadRequest("$mod divisor has to be an integer".to_string())
            })?;
            let remainder = parts[1].as_i64().ok_or_else(|| {
                DbError::BadRequest("$mod remainder has to be an integer".to_string())
            })?;
            if divisor == 0 {
                return Err(DbError::BadRequest("integer divide by zero".to_string()));
            }
            // only integer fields can match
            match field.as_i64() {
                Some(v) => Ok(v % divisor == remainder),
                None => Ok(false),
            }
        }

        FieldOp::Regex => {
            let pattern = match arg {
                Value::String(pattern) => pattern,
                _ => {
                    return Err(DbError::BadRequest(
                        "$regex argument has to be a string".to_string(),
                    ))
                }
            };
            let text = match &field {
                Value::String(text) => text,
                _ => return Ok(false), // only string fields can match
            };
            let regex = get_or_compile_regex(pattern)?;
            Ok(regex.is_match(text))
        }

        FieldOp::All => {
            let wanted = match arg {
                Value::Array(wanted) => wanted,
                _ => {
                    return Err(DbError::BadRequest(
                        "$all argument has to be an array".to_string(),
                    ))
                }
            };
            let have = match &field {
                Value::Array(have) => have,
                _ => return Ok(false),
            };
            Ok(wanted
                .iter()
                .all(|w| have.iter().any(|h| values_equal(h, w))))
        }
    }
}
