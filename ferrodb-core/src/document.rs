// src/document.rs
// Document model: revisions, attachments, design documents, security

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{DbError, Result};

/// Prefix marking design documents
pub const DESIGN_DOC_PREFIX: &str = "_design/";
/// Prefix marking local (non-replicated) documents
pub const LOCAL_DOC_PREFIX: &str = "_local/";

fn is_false(v: &bool) -> bool {
    !*v
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

/// A single document revision of the form `"<N>-<hex>"`.
/// Returns the sequence number and the hash part.
pub fn parse_rev(rev: &str) -> Option<(u64, &str)> {
    let (n, hash) = rev.split_once('-')?;
    let n = n.parse::<u64>().ok()?;
    if n == 0 || hash.is_empty() {
        return None;
    }
    Some((n, hash))
}

/// Attachment metadata. The bytes live on the filesystem under the
/// database directory; only this metadata travels with the document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(skip)]
    pub filename: String,
    pub content_type: String,
    pub revpos: i64,
    pub digest: String,
    pub length: i64,
    pub stub: bool,
}

/// Per-field option block passed to `index(name, value, options)`
/// in search functions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchIndexOption {
    /// Relevance boost, > 1 is more relevant. Default is 1 (no boosting).
    #[serde(default)]
    pub boost: Option<f64>,
    /// Create a faceted index. Default is false.
    #[serde(default)]
    pub facet: bool,
    /// Whether the data is indexed. Default is true.
    #[serde(default)]
    pub index: Option<bool>,
    /// If true, the value is returned in the search result. Default false.
    #[serde(default)]
    pub store: bool,
}

impl SearchIndexOption {
    /// Returns true when the data should be indexed
    pub fn should_index(&self) -> bool {
        self.index.unwrap_or(true)
    }
}

/// A schema-free document.
///
/// `key`/`value` are only populated when the document is a row coming out
/// of an index iterator; `fields`/`options` only when it was produced by a
/// search function.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    // Meta
    #[serde(rename = "_id", default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(rename = "_rev", default, skip_serializing_if = "String::is_empty")]
    pub rev: String,
    #[serde(rename = "_deleted", default, skip_serializing_if = "is_false")]
    pub deleted: bool,
    #[serde(rename = "_local_seq", default, skip_serializing_if = "is_zero")]
    pub local_seq: u64,

    // Data
    #[serde(
        rename = "_attachments",
        default,
        skip_serializing_if = "HashMap::is_empty"
    )]
    pub attachments: HashMap<String, Attachment>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub data: Map<String, Value>,

    // View
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,

    // Search
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<HashMap<String, SearchIndexOption>>,
}

impl Document {
    /// New empty document with the given id
    pub fn new(id: &str) -> Self {
        Document {
            id: id.to_string(),
            ..Document::default()
        }
    }

    /// Build a document from a plain JSON object, splitting the CouchDB
    /// meta fields (`_id`, `_rev`, `_deleted`, `_attachments`) out of the
    /// user data.
    pub fn from_json_value(value: Value) -> Result<Self> {
        let obj = match value {
            Value::Object(obj) => obj,
            _ => {
                return Err(DbError::BadRequest(
                    "document body must be a JSON object".to_string(),
                ))
            }
        };

        let mut doc = Document::default();
        for (k, v) in obj {
            match k.as_str() {
                "_id" => {
                    if let Value::String(s) = v {
                        doc.id = s;
                    }
                }
                "_rev" => {
                    if let Value::String(s) = v {
                        doc.rev = s;
                    }
                }
                "_deleted" => doc.deleted = v.as_bool().unwrap_or(false),
                "_attachments" => {
                    let atts: HashMap<String, Attachment> = serde_json::from_value(v)?;
                    doc.attachments = atts;
                }
                "_local_seq" | "_revisions" => {} // never taken from the caller
                _ => {
                    doc.data.insert(k, v);
                }
            }
        }
        Ok(doc)
    }

    /// Render the document as a single JSON object the way the HTTP
    /// surface returns it: data with `_id`, `_rev`, `_deleted` and
    /// `_attachments` merged in.
    pub fn to_json_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("_id".to_string(), Value::String(self.id.clone()));
        if !self.rev.is_empty() {
            obj.insert("_rev".to_string(), Value::String(self.rev.clone()));
        }
        if self.deleted {
            obj.insert("_deleted".to_string(), Value::Bool(true));
        }
        if !self.attachments.is_empty() {
            if let Ok(atts) = serde_json::to_value(&self.attachments) {
                obj.insert("_attachments".to_string(), atts);
            }
        }
        for (k, v) in &self.data {
            obj.insert(k.clone(), v.clone());
        }
        Value::Object(obj)
    }

    /// The current revision, taken from the meta field or `data._rev`.
    pub fn revision(&self) -> Option<String> {
        if !self.rev.is_empty() {
            return Some(self.rev.clone());
        }
        match self.data.get("_rev") {
            Some(Value::String(s)) => Some(s.clone()),
            _ => None,
        }
    }

    /// An update is only valid if the stored document has no revision yet
    /// or the incoming document carries exactly the stored revision.
    pub fn valid_update_revision(&self, new_doc: &Document) -> bool {
        match self.revision() {
            Some(old_rev) => new_doc.revision().map(|r| r == old_rev).unwrap_or(false),
            None => true,
        }
    }

    /// Sequence number for the next revision of this (incoming) document.
    pub fn next_revision_seq(&self) -> u64 {
        match self.revision().as_deref().and_then(parse_rev) {
            Some((n, _)) => n + 1,
            None => 1,
        }
    }

    /// The md5 digest of the canonical document encoding.
    ///
    /// The digest is computed after `local_seq` has been assigned and
    /// before `rev` is set; callers must clear `rev` first.
    pub fn rev_digest(&self) -> Result<String> {
        let encoded = serde_json::to_vec(self)?;
        Ok(format!("{:x}", md5::compute(&encoded)))
    }

    pub fn is_design_doc(&self) -> bool {
        self.id.starts_with(DESIGN_DOC_PREFIX)
    }

    pub fn is_local_doc(&self) -> bool {
        self.id.starts_with(LOCAL_DOC_PREFIX)
    }

    /// The scripting language of a design document (`language` field),
    /// `"javascript"` when unset.
    pub fn language(&self) -> &str {
        match self.data.get("language") {
            Some(Value::String(s)) if !s.is_empty() => s,
            _ => "javascript",
        }
    }

    /// Look up a field by dotted path in the document data.
    /// `_id` and `_rev` resolve to the document meta fields; missing
    /// segments yield `None`.
    pub fn field(&self, path: &str) -> Option<Value> {
        if path == "_id" {
            return Some(Value::String(self.id.clone()));
        }
        if path == "_rev" && !self.rev.is_empty() {
            return Some(Value::String(self.rev.clone()));
        }
        let mut parts = path.split('.');
        let mut current = self.data.get(parts.next()?)?;
        for part in parts {
            match current {
                Value::Object(map) => current = map.get(part)?,
                _ => return None,
            }
        }
        Some(current.clone())
    }

    pub fn exists(&self, path: &str) -> bool {
        self.field(path).map(|v| !v.is_null()).unwrap_or(false)
    }

    /// All view and search functions declared by a design document.
    pub fn functions(&self) -> Vec<DocFunction> {
        let mut functions = Vec::new();

        if let Some(Value::Object(views)) = self.data.get("views") {
            for (name, def) in views {
                let def = match def {
                    Value::Object(def) => def,
                    _ => continue,
                };
                functions.push(DocFunction {
                    name: name.clone(),
                    fn_type: FnType::Views,
                    map_fn: string_field(def, "map"),
                    reduce_fn: string_field(def, "reduce"),
                    search_fn: String::new(),
                    analyzer: String::new(),
                });
            }
        }

        if let Some(Value::Object(indexes)) = self.data.get("indexes") {
            for (name, def) in indexes {
                let def = match def {
                    Value::Object(def) => def,
                    _ => continue,
                };
                functions.push(DocFunction {
                    name: name.clone(),
                    fn_type: FnType::Indexes,
                    map_fn: String::new(),
                    reduce_fn: String::new(),
                    search_fn: string_field(def, "index"),
                    analyzer: string_field(def, "analyzer"),
                });
            }
        }

        functions
    }

    /// Look up a named view declared by this design document.
    pub fn view(&self, name: &str) -> Option<View> {
        let views = match self.data.get("views") {
            Some(Value::Object(views)) => views,
            _ => return None,
        };
        let def = match views.get(name) {
            Some(Value::Object(def)) => def,
            _ => return None,
        };
        Some(View {
            language: self.language().to_string(),
            map_fn: string_field(def, "map"),
            reduce_fn: string_field(def, "reduce"),
        })
    }
}

fn string_field(map: &Map<String, Value>, key: &str) -> String {
    match map.get(key) {
        Some(Value::String(s)) => s.clone(),
        _ => String::new(),
    }
}

/// The `_revisions` wire structure: revision hash ids, newest first,
/// and the sequence number of the first entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revisions {
    pub ids: Vec<String>,
    pub start: u64,
}

impl Document {
    /// The `_revisions` representation of the current revision. Only
    /// the latest revision is retained, so the list has one entry.
    pub fn revisions(&self) -> Option<Revisions> {
        let rev = self.revision()?;
        let (start, hash) = parse_rev(&rev)?;
        Some(Revisions {
            ids: vec![hash.to_string()],
            start,
        })
    }
}

/// A view declared in a design document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct View {
    pub language: String,
    pub map_fn: String,
    pub reduce_fn: String,
}

/// The two kinds of design-document functions that back indices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FnType {
    #[serde(rename = "views")]
    Views,
    #[serde(rename = "indexes")]
    Indexes,
}

impl FnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FnType::Views => "views",
            FnType::Indexes => "indexes",
        }
    }
}

impl std::fmt::Display for FnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a design-document function: `(type, design doc id, name)`.
/// The canonical string form doubles as the backing bucket name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DesignDocFn {
    pub fn_type: FnType,
    pub design_doc_id: String,
    pub fn_name: String,
}

impl DesignDocFn {
    pub fn new_view(design_doc_id: &str, fn_name: &str) -> Self {
        DesignDocFn {
            fn_type: FnType::Views,
            design_doc_id: design_doc_id.to_string(),
            fn_name: fn_name.to_string(),
        }
    }

    pub fn new_search(design_doc_id: &str, fn_name: &str) -> Self {
        DesignDocFn {
            fn_type: FnType::Indexes,
            design_doc_id: design_doc_id.to_string(),
            fn_name: fn_name.to_string(),
        }
    }

    /// Bucket name backing this function's index
    pub fn bucket(&self) -> String {
        self.to_string()
    }

    pub fn parse(s: &str) -> Option<DesignDocFn> {
        let (fn_type, rest) = s.split_once(':')?;
        let (design_doc_id, fn_name) = rest.rsplit_once(':')?;
        let fn_type = match fn_type {
            "views" => FnType::Views,
            "indexes" => FnType::Indexes,
            _ => return None,
        };
        Some(DesignDocFn {
            fn_type,
            design_doc_id: design_doc_id.to_string(),
            fn_name: fn_name.to_string(),
        })
    }
}

impl std::fmt::Display for DesignDocFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.fn_type, self.design_doc_id, self.fn_name)
    }
}

/// One function extracted from a design document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocFunction {
    pub name: String,
    pub fn_type: FnType,
    pub map_fn: String,
    pub reduce_fn: String,
    pub search_fn: String,
    pub analyzer: String,
}

impl DocFunction {
    pub fn design_doc_fn(&self, design_doc_id: &str) -> DesignDocFn {
        DesignDocFn {
            fn_type: self.fn_type,
            design_doc_id: design_doc_id.to_string(),
            fn_name: self.name.clone(),
        }
    }

    /// Source text of the function, whichever kind it is
    pub fn source(&self) -> &str {
        match self.fn_type {
            FnType::Views => &self.map_fn,
            FnType::Indexes => &self.search_fn,
        }
    }
}

/// Database security document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Security {
    pub members: SecurityGroup,
    pub admins: SecurityGroup,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecurityGroup {
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub names: Vec<String>,
}

impl Security {
    /// Security returned when none has been stored: only `_admin` may act.
    pub fn default_security() -> Self {
        Security {
            members: SecurityGroup {
                roles: vec!["_admin".to_string()],
                names: vec![],
            },
            admins: SecurityGroup {
                roles: vec!["_admin".to_string()],
                names: vec![],
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_rev() {
        assert_eq!(parse_rev("1-abc"), Some((1, "abc")));
        assert_eq!(parse_rev("42-deadbeef"), Some((42, "deadbeef")));
        assert_eq!(parse_rev("0-abc"), None);
        assert_eq!(parse_rev("abc"), None);
        assert_eq!(parse_rev("1-"), None);
        assert_eq!(parse_rev("x-abc"), None);
    }

    #[test]
    fn test_next_revision_seq() {
        let mut doc = Document::new("a");
        assert_eq!(doc.next_revision_seq(), 1);
        doc.rev = "3-abc".to_string();
        assert_eq!(doc.next_revision_seq(), 4);
    }

    #[test]
    fn test_valid_update_revision() {
        let mut stored = Document::new("a");
        stored.rev = "1-abc".to_string();

        let mut incoming = Document::new("a");
        assert!(!stored.valid_update_revision(&incoming));

        incoming.rev = "1-abc".to_string();
        assert!(stored.valid_update_revision(&incoming));

        incoming.rev = "1-xyz".to_string();
        assert!(!stored.valid_update_revision(&incoming));

        // no stored revision, everything goes
        let fresh = Document::new("b");
        assert!(fresh.valid_update_revision(&incoming));
    }

    #[test]
    fn test_revision_from_data() {
        let mut doc = Document::new("a");
        doc.data
            .insert("_rev".to_string(), json!("7-cafe"));
        assert_eq!(doc.revision(), Some("7-cafe".to_string()));
        assert_eq!(doc.next_revision_seq(), 8);
    }

    #[test]
    fn test_from_json_value_splits_meta() {
        let doc = Document::from_json_value(json!({
            "_id": "x",
            "_rev": "1-abc",
            "n": 1,
            "nested": {"a": true}
        }))
        .unwrap();
        assert_eq!(doc.id, "x");
        assert_eq!(doc.rev, "1-abc");
        assert_eq!(doc.data.get("n"), Some(&json!(1)));
        assert!(!doc.data.contains_key("_id"));
        assert!(!doc.data.contains_key("_rev"));
    }

    #[test]
    fn test_from_json_value_rejects_non_object() {
        assert!(Document::from_json_value(json!([1, 2, 3])).is_err());
    }

    #[test]
    fn test_to_json_value_roundtrip() {
        let mut doc = Document::from_json_value(json!({
            "_id": "x",
            "n": 1
        }))
        .unwrap();
        doc.rev = "1-abc".to_string();

        let out = doc.to_json_value();
        assert_eq!(out["_id"], json!("x"));
        assert_eq!(out["_rev"], json!("1-abc"));
        assert_eq!(out["n"], json!(1));

        let back = Document::from_json_value(out).unwrap();
        assert_eq!(back.id, doc.id);
        assert_eq!(back.rev, doc.rev);
        assert_eq!(back.data, doc.data);
    }

    #[test]
    fn test_field_path() {
        let doc = Document::from_json_value(json!({
            "_id": "x",
            "address": {"city": "Vienna", "zip": 1010},
            "year": 1984
        }))
        .unwrap();
        assert_eq!(doc.field("year"), Some(json!(1984)));
        assert_eq!(doc.field("address.city"), Some(json!("Vienna")));
        assert_eq!(doc.field("address.missing"), None);
        assert_eq!(doc.field("year.not_an_object"), None);
        assert_eq!(doc.field("_id"), Some(json!("x")));
    }

    #[test]
    fn test_rev_digest_is_stable_and_rev_sensitive() {
        let mut doc = Document::from_json_value(json!({"_id": "x", "n": 1})).unwrap();
        doc.local_seq = 1;
        let d1 = doc.rev_digest().unwrap();
        let d2 = doc.rev_digest().unwrap();
        assert_eq!(d1, d2);

        doc.local_seq = 2;
        let d3 = doc.rev_digest().unwrap();
        assert_ne!(d1, d3);
    }

    #[test]
    fn test_revisions() {
        let mut doc = Document::new("a");
        assert_eq!(doc.revisions(), None);
        doc.rev = "3-cafe".to_string();
        let revs = doc.revisions().unwrap();
        assert_eq!(revs.start, 3);
        assert_eq!(revs.ids, vec!["cafe"]);
    }

    #[test]
    fn test_functions_extraction() {
        let doc = Document::from_json_value(json!({
            "_id": "_design/d",
            "views": {
                "sum": {"map": "emit(doc.k, doc.n)", "reduce": "_sum"}
            },
            "indexes": {
                "byName": {"index": "index(\"name\", doc.name)"}
            }
        }))
        .unwrap();

        let mut fns = doc.functions();
        fns.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(fns.len(), 2);

        assert_eq!(fns[0].name, "byName");
        assert_eq!(fns[0].fn_type, FnType::Indexes);
        assert!(fns[0].search_fn.contains("index("));

        assert_eq!(fns[1].name, "sum");
        assert_eq!(fns[1].fn_type, FnType::Views);
        assert_eq!(fns[1].reduce_fn, "_sum");

        let ddfn = fns[1].design_doc_fn("_design/d");
        assert_eq!(ddfn.to_string(), "views:_design/d:sum");
        assert_eq!(DesignDocFn::parse("views:_design/d:sum"), Some(ddfn));
    }

    #[test]
    fn test_language_default() {
        let doc = Document::from_json_value(json!({"_id": "_design/d"})).unwrap();
        assert_eq!(doc.language(), "javascript");

        let doc = Document::from_json_value(json!({"_id": "_design/d", "language": "rhai"}))
            .unwrap();
        assert_eq!(doc.language(), "rhai");
    }

    #[test]
    fn test_design_local_prefixes() {
        assert!(Document::new("_design/d").is_design_doc());
        assert!(Document::new("_local/x").is_local_doc());
        assert!(!Document::new("plain").is_design_doc());
    }
}
