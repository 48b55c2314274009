use crate::capability::CapabilityError;
use crate::types::PatternId;

/// Result type alias for reasoning bank operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the reasoning bank core and storage layers
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An embedding's length disagrees with the store-wide dimension.
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Dimension the store was created with
        expected: usize,
        /// Dimension of the offending embedding
        actual: usize,
    },

    /// A caller-supplied parameter was out of range or malformed.
    #[error("bad parameters: {0}")]
    BadParameters(String),

    /// No pattern with this id exists.
    #[error("pattern not found: {0}")]
    NotFound(PatternId),

    /// A different pattern already exists under this id.
    #[error("pattern already exists: {0}")]
    Duplicate(PatternId),

    /// The pattern already carries an outcome; outcomes attach exactly once.
    #[error("outcome already set for pattern: {0}")]
    AlreadySet(PatternId),

    /// A capability check failed.
    #[error(transparent)]
    Capability(#[from] CapabilityError),

    /// Transient storage I/O failure; the operation may be retried.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Detected on-disk inconsistency; the store is now read-only.
    #[error("storage corrupt: {0}")]
    Corrupt(String),

    /// The operation was cancelled before committing.
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Check if this error is recoverable (can retry with backoff)
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::StorageUnavailable(_) => true,
            Error::DimensionMismatch { .. }
            | Error::BadParameters(_)
            | Error::NotFound(_)
            | Error::Duplicate(_)
            | Error::AlreadySet(_)
            | Error::Capability(_)
            | Error::Corrupt(_)
            | Error::Cancelled => false,
        }
    }

    /// Short stable code suitable for exposing to remote peers.
    ///
    /// Remote peers never see contextual detail, only the kind.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Error::DimensionMismatch { .. } => "dimension_mismatch",
            Error::BadParameters(_) => "bad_parameters",
            Error::NotFound(_) => "not_found",
            Error::Duplicate(_) => "duplicate",
            Error::AlreadySet(_) => "already_set",
            Error::Capability(e) => e.reason_code(),
            Error::StorageUnavailable(_) => "storage_unavailable",
            Error::Corrupt(_) => "corrupt",
            Error::Cancelled => "cancelled",
        }
    }
}
