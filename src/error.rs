//! Error taxonomy for the import and chat pipelines.
//!
//! Each variant tells the caller what to do next: re-authenticate
//! ([`Error::Auth`]), retry later ([`Error::TransientNetwork`]), skip one
//! document ([`Error::NotFound`], [`Error::Forbidden`],
//! [`Error::SizeLimit`], [`Error::UnsupportedFormat`]), skip one chunk ([`Error::Encoding`]),
//! import something first ([`Error::EmptyStore`]), or offer a retry to
//! the user ([`Error::LlmUnavailable`]).

use thiserror::Error;

/// Result type alias using the crate's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Credentials are missing, expired beyond refresh, or rejected.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Connectivity failure, timeout, rate limit or server error.
    #[error("Network error (retryable): {0}")]
    TransientNetwork(String),

    /// The remote file no longer exists.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The account may not download this particular file.
    #[error("Access denied: {0}")]
    Forbidden(String),

    /// The file exceeds the configured download cap.
    #[error("File '{name}' is {size} bytes, above the {limit} byte limit")]
    SizeLimit { name: String, size: u64, limit: u64 },

    /// No text could be extracted from the document.
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// The embedding model could not encode the input.
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Retrieval was asked to search a store with no chunks.
    #[error("No documents imported yet; import documents before asking questions")]
    EmptyStore,

    /// The hosted LLM failed or timed out.
    #[error("LLM unavailable: {0}")]
    LlmUnavailable(String),

    /// An external response did not match the expected shape.
    #[error("Unexpected {service} response: {detail}")]
    Schema { service: &'static str, detail: String },

    /// Persistent store failure.
    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    /// A chunk vector does not match the dimensionality already stored.
    #[error("Vector dimension mismatch: store holds {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// The session cannot perform this action from its current state.
    #[error("Cannot {action} while {state}")]
    InvalidState { action: &'static str, state: String },

    /// Invalid configuration or arguments.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Local file I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the caller may retry the same operation with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::TransientNetwork(_))
    }

    /// Errors confined to a single document during a batch import.
    ///
    /// The import reports them and moves on to the next document.
    pub fn is_document_local(&self) -> bool {
        matches!(
            self,
            Error::NotFound(_)
                | Error::Forbidden(_)
                | Error::SizeLimit { .. }
                | Error::UnsupportedFormat(_)
                | Error::Encoding(_)
                | Error::TransientNetwork(_)
                | Error::Schema { .. }
        )
    }

    /// Unrecoverable credential or store failures that end the session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Auth(_) | Error::Store(_) | Error::DimensionMismatch { .. } | Error::Io(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Schema {
            service: "JSON",
            detail: e.to_string(),
        }
    }
}
