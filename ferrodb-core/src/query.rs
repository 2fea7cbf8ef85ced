// src/query.rs
// Mango selector queries: a JSON selector is parsed into a tree of
// group nodes ($and, $or, $not, $nor) and field nodes; matching walks
// the tree against a document.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::document::Document;
use crate::error::{DbError, Result};
use crate::query::operators::{match_field_op, FieldOp};

pub mod operators;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupOp {
    And,
    Or,
    Not,
    Nor,
}

impl GroupOp {
    fn parse(s: &str) -> Option<GroupOp> {
        match s {
            "$and" => Some(GroupOp::And),
            "$or" => Some(GroupOp::Or),
            "$not" => Some(GroupOp::Not),
            "$nor" => Some(GroupOp::Nor),
            _ => None,
        }
    }
}

/// One node of a parsed selector.
#[derive(Debug, Clone)]
pub enum SelectorNode {
    Group {
        op: GroupOp,
        members: Vec<SelectorNode>,
    },
    Field {
        field: String,
        op: FieldOp,
        value: Value,
    },
}

impl SelectorNode {
    /// Parse a JSON selector. The top level is an implicit `$and` over
    /// all its entries.
    pub fn parse(selector: &Value) -> Result<SelectorNode> {
        let obj = match selector {
            Value::Object(obj) => obj,
            _ => {
                return Err(DbError::BadRequest(
                    "selector must be a JSON object".to_string(),
                ))
            }
        };

        let mut members = Vec::new();
        for (key, value) in obj {
            members.extend(Self::parse_entry(key, value)?);
        }

        Ok(SelectorNode::Group {
            op: GroupOp::And,
            members,
        })
    }

    fn parse_entry(key: &str, value: &Value) -> Result<Vec<SelectorNode>> {
        if let Some(op) = GroupOp::parse(key) {
            return Ok(vec![Self::parse_group(op, value)?]);
        }
        if key.starts_with('$') {
            return Err(DbError::BadRequest(format!("unknown operator {:?}", key)));
        }
        Self::parse_field(key.to_string(), value)
    }

    fn parse_group(op: GroupOp, value: &Value) -> Result<SelectorNode> {
        let mut members = Vec::new();
        match value {
            Value::Array(items) => {
                for item in items {
                    members.push(Self::parse(item)?);
                }
            }
            // $not takes a single selector object
            Value::Object(_) if op == GroupOp::Not => {
                members.push(Self::parse(value)?);
            }
            _ => {
                return Err(DbError::BadRequest(format!(
                    "group selector {:?} expects an array",
                    op
                )))
            }
        }
        Ok(SelectorNode::Group { op, members })
    }

    fn parse_field(mut field: String, value: &Value) -> Result<Vec<SelectorNode>> {
        let mut value = value;

        // nested single-key objects extend the field path:
        // {"a": {"b": 5}} selects on "a.b"
        loop {
            let obj = match value {
                Value::Object(obj) if obj.len() == 1 => obj,
                _ => break,
            };
            let (key, inner) = obj.iter().next().unwrap();
            if key.starts_with('$') {
                break;
            }
            field.push('.');
            field.push_str(key);
            value = inner;
        }

        // an object of operators; anything else is an equality match
        match value {
            Value::Object(obj) if obj.keys().any(|k| k.starts_with('$')) => {
                let mut nodes = Vec::new();
                for (key, arg) in obj {
                    let op = FieldOp::parse(key).ok_or_else(|| {
                        DbError::BadRequest(format!("unknown operator {:?}", key))
                    })?;
                    nodes.push(SelectorNode::Field {
                        field: field.clone(),
                        op,
                        value: arg.clone(),
                    });
                }
                Ok(nodes)
            }
            _ => Ok(vec![SelectorNode::Field {
                field,
                op: FieldOp::Eq,
                value: value.clone(),
            }]),
        }
    }

    /// Match the selector against a document.
    pub fn match_doc(&self, doc: &Document) -> Result<bool> {
        match self {
            SelectorNode::Group { op, members } => {
                // an empty group is always false
                if members.is_empty() {
                    return Ok(false);
                }
                match op {
                    GroupOp::And => {
                        for m in members {
                            if !m.match_doc(doc)? {
                                return Ok(false);
                            }
                        }
                        Ok(true) // all match
                    }
                    GroupOp::Or => {
                        for m in members {
                            if m.match_doc(doc)? {
                                return Ok(true); // one match
                            }
                        }
                        Ok(false)
                    }
                    GroupOp::Not => Ok(!members[0].match_doc(doc)?),
                    GroupOp::Nor => {
                        for m in members {
                            if m.match_doc(doc)? {
                                return Ok(false);
                            }
                        }
                        Ok(true) // no match
                    }
                }
            }
            SelectorNode::Field { field, op, value } => {
                match_field_op(*op, doc.field(field), value, doc.exists(field))
            }
        }
    }
}

/// A `_find` request.
#[derive(Debug, Clone)]
pub struct FindQuery {
    pub selector: SelectorNode,
    /// Maximum number of results returned. Default is 25.
    pub limit: usize,
    /// Skip the first n results.
    pub skip: usize,
    /// Opaque paging cursor: the id of the last returned document.
    pub bookmark: String,
    /// Restrict returned documents to these fields (empty = all).
    pub fields: Vec<String>,
    /// Include execution statistics in the response.
    pub execution_stats: bool,
}

impl FindQuery {
    pub fn from_json(query: &Value) -> Result<FindQuery> {
        let obj = match query {
            Value::Object(obj) => obj,
            _ => {
                return Err(DbError::BadRequest(
                    "query must be a JSON object".to_string(),
                ))
            }
        };

        let selector = match obj.get("selector") {
            Some(selector) => SelectorNode::parse(selector)?,
            None => SelectorNode::Group {
                op: GroupOp::And,
                members: Vec::new(),
            },
        };

        Ok(FindQuery {
            selector,
            limit: obj
                .get("limit")
                .and_then(Value::as_u64)
                .map(|v| v as usize)
                .unwrap_or(25),
            skip: obj
                .get("skip")
                .and_then(Value::as_u64)
                .map(|v| v as usize)
                .unwrap_or(0),
            bookmark: obj
                .get("bookmark")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            fields: obj
                .get("fields")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            execution_stats: obj
                .get("execution_stats")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })
    }

    pub fn match_doc(&self, doc: &Document) -> Result<bool> {
        self.selector.match_doc(doc)
    }

    /// Apply the `fields` projection to a result document.
    pub fn project(&self, doc: &Document) -> Document {
        if self.fields.is_empty() {
            return doc.clone();
        }
        let mut projected = doc.clone();
        projected.data = Map::new();
        for field in &self.fields {
            if let Some(v) = doc.data.get(field) {
                projected.data.insert(field.clone(), v.clone());
            }
        }
        projected
    }
}

/// Statistics collected while executing a `_find` query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStats {
    /// Number of index keys examined. Currently always 0.
    pub total_keys_examined: usize,
    /// Number of documents fetched from the database.
    pub total_docs_examined: usize,
    /// Only non-zero with read quorum > 1, which we don't have.
    pub total_quorum_docs_examined: usize,
    /// Number of results returned from the query.
    pub results_returned: usize,
    /// Total execution time in milliseconds.
    pub execution_time_ms: f64,
}
