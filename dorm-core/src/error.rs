//! Error types for the change-tracking engine

/// Result type for tracking operations
pub type Result<T> = std::result::Result<T, TrackError>;

/// Boxed error raised by a [`Backend`](crate::backend::Backend)
pub type BackendError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur while tracking, diffing or persisting entities
#[derive(Debug, thiserror::Error)]
pub enum TrackError {
    #[error("Invalid usage: {0}")]
    InvalidUsage(String),

    #[error("Entity {0} is read-only and cannot be tracked")]
    ReadOnly(&'static str),

    #[error("Type mismatch: scope tracks {found}, requested {expected}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("Scope is already {0}")]
    ScopeClosed(&'static str),

    #[error("Snapshot codec error: {0}")]
    Codec(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Backend error: {0}")]
    Backend(#[source] BackendError),
}

impl From<bincode::Error> for TrackError {
    fn from(e: bincode::Error) -> Self {
        TrackError::Codec(e.to_string())
    }
}

impl TrackError {
    /// Wrap any backend error
    pub fn backend<E>(e: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        TrackError::Backend(Box::new(e))
    }
}
