use thiserror::Error;

pub type BlobResult<T, E = BlobError> = std::result::Result<T, E>;

/// Errors surfaced by blob stores, providers and the manager.
///
/// Absence of a blob is deliberately not represented here: store-level
/// lookups answer with [`crate::OptionalOrUnknown`] or a `bool`.
#[derive(Debug, Error)]
pub enum BlobError {
    /// Missing, contradictory or unrecognized configuration. Never retried.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Another active transaction already owns this key.
    #[error("concurrent update on blob key {key}")]
    ConcurrentUpdate { key: String },

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// API misuse, such as stopping a garbage collector that was never started.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// Only raised by façade calls that must produce bytes for a key.
    #[error("blob not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BlobError {
    pub fn config(msg: impl Into<String>) -> Self {
        BlobError::Config(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        BlobError::Unsupported(msg.into())
    }

    pub fn illegal_state(msg: impl Into<String>) -> Self {
        BlobError::IllegalState(msg.into())
    }

    pub fn is_concurrent_update(&self) -> bool {
        matches!(self, BlobError::ConcurrentUpdate { .. })
    }
}
