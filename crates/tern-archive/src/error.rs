//! Archive error types.

use crate::store::StoreError;

/// Errors produced by bundle indexing, overlay lookup, and extraction.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// The bundle container could not be parsed. Fatal for that bundle.
    #[error("corrupt bundle '{name}': {message}")]
    Corrupt {
        /// Bundle name, as supplied at open time
        name: String,
        /// Underlying parser error
        message: String,
    },

    /// The path is absent from every bundle. An expected negative result,
    /// not a fault.
    #[error("not found in bundle: {0}")]
    NotFound(String),

    /// A directory listing was requested for a file entry.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// Extraction-root I/O failure (disk full, permissions). Fatal and never
    /// retried at this layer.
    #[error("{0}")]
    Io(#[from] std::io::Error),

    /// Version-store read or write failure.
    #[error("version store: {0}")]
    Store(#[from] StoreError),
}

impl ArchiveError {
    /// True for the "path absent" negative result.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ArchiveError::NotFound(_))
    }
}
