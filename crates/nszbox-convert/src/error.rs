//! Error types for the nszbox conversion pipeline

use serde::{Deserialize, Serialize};

/// Result type alias for conversion operations.
pub type Result<T> = std::result::Result<T, ConvertError>;

/// Fieldless discriminant of a [`ConvertError`], used in results, notices and log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Reference cannot produce a name or stream
    Resolve,
    /// Output child could not be created
    CreateFailed,
    /// Malformed or incompatible compressed input
    Codec,
    /// Transport failure unrelated to codec correctness
    Io,
    /// User declined or revoked the output authorization
    AuthorizationDenied,
    /// Best-effort cleanup of the source or a partial output failed
    DeletionFailed,
    /// Configuration could not be loaded
    Config,
    /// Persisted authorization or settings state could not be read or written
    Store,
}

impl ErrorKind {
    /// Short lowercase label used in audit log records.
    pub fn label(self) -> &'static str {
        match self {
            ErrorKind::Resolve => "resolve",
            ErrorKind::CreateFailed => "create",
            ErrorKind::Codec => "codec",
            ErrorKind::Io => "io",
            ErrorKind::AuthorizationDenied => "authorization",
            ErrorKind::DeletionFailed => "deletion",
            ErrorKind::Config => "config",
            ErrorKind::Store => "store",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// All errors that can occur while converting a container.
#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    /// Reference cannot produce a name or stream
    #[error("Resolve failed: {0}")]
    Resolve(String),
    /// Output child could not be created (name collision, stale folder)
    #[error("Create failed: {0}")]
    CreateFailed(String),
    /// The decompression filter rejected the input
    #[error("Codec error: {0}")]
    Codec(String),
    /// Underlying stream failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// User declined or revoked the output authorization
    #[error("Authorization denied")]
    AuthorizationDenied,
    /// Source or partial output could not be deleted
    #[error("Deletion failed: {0}")]
    DeletionFailed(String),
    /// Invalid or unreadable configuration
    #[error("Configuration error: {0}")]
    Config(String),
    /// Persisted state store failure
    #[error("Store error: {0}")]
    Store(String),
}

impl ConvertError {
    /// Discriminant of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConvertError::Resolve(_) => ErrorKind::Resolve,
            ConvertError::CreateFailed(_) => ErrorKind::CreateFailed,
            ConvertError::Codec(_) => ErrorKind::Codec,
            ConvertError::Io(_) => ErrorKind::Io,
            ConvertError::AuthorizationDenied => ErrorKind::AuthorizationDenied,
            ConvertError::DeletionFailed(_) => ErrorKind::DeletionFailed,
            ConvertError::Config(_) => ErrorKind::Config,
            ConvertError::Store(_) => ErrorKind::Store,
        }
    }
}

/// Errors raised by a [`crate::reference::ReferenceResolver`].
#[derive(Debug, thiserror::Error)]
pub enum ResolverError {
    /// The resource cannot be opened (revoked permission, deleted file, invalid reference)
    #[error("Reference unavailable: {0}")]
    ReferenceUnavailable(String),
    /// A child could not be created in the destination folder
    #[error("Create failed: {0}")]
    CreateFailed(String),
    /// The resource could not be deleted
    #[error("Deletion failed: {0}")]
    DeletionFailed(String),
    /// Other I/O failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ResolverError> for ConvertError {
    fn from(e: ResolverError) -> Self {
        match e {
            ResolverError::ReferenceUnavailable(msg) => ConvertError::Resolve(msg),
            ResolverError::CreateFailed(msg) => ConvertError::CreateFailed(msg),
            ResolverError::DeletionFailed(msg) => ConvertError::DeletionFailed(msg),
            ResolverError::Io(e) => ConvertError::Io(e),
        }
    }
}
