// src/error.rs
// Error taxonomy for FerroDB

use thiserror::Error;

/// All errors produced by the FerroDB core.
///
/// The first group maps one-to-one to the status codes the HTTP
/// collaborator reports (404, 409, 400, 401, 501); everything below
/// is an internal failure (500).
#[derive(Debug, Error)]
pub enum DbError {
    /// Missing bucket, key, document, attachment, index or database
    #[error("resource not found")]
    NotFound,

    /// Put with a revision that doesn't match the stored document
    #[error("rev doesn't match for update")]
    Conflict,

    /// Malformed JSON, selector, or operation arguments
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Session invalid or insufficient privilege
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Requested feature is out of scope (e.g. unregistered language)
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Key-value engine failure
    #[error("engine error: {0}")]
    Engine(#[from] heed::Error),

    /// Filesystem failure (attachments, search index directory)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Document or metadata (de)serialization failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// View/search/reduce script compile or runtime failure
    #[error("script error: {0}")]
    Script(String),

    /// Full-text index failure
    #[error("search index error: {0}")]
    Search(String),

    /// Anything else that went wrong internally
    #[error("internal error: {0}")]
    Internal(String),
}

impl DbError {
    /// True for errors caused by the caller rather than the database.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            DbError::NotFound
                | DbError::Conflict
                | DbError::BadRequest(_)
                | DbError::Unauthorized(_)
                | DbError::Unsupported(_)
        )
    }
}

impl From<tantivy::TantivyError> for DbError {
    fn from(err: tantivy::TantivyError) -> Self {
        DbError::Search(err.to_string())
    }
}

impl From<tantivy::query::QueryParserError> for DbError {
    fn from(err: tantivy::query::QueryParserError) -> Self {
        DbError::BadRequest(format!("invalid search query: {}", err))
    }
}

/// Result type alias used across the crate
pub type Result<T> = std::result::Result<T, DbError>;
