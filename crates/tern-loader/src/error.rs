//! Loader error types.

use tern_archive::ArchiveError;

/// Errors that can occur resolving components or loading native binaries.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// Overlay lookup or extraction failure.
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    /// The platform refused to load a binary. Carries the platform's own
    /// error text; dependency pre-loading has already run by this point.
    #[error("failed to load {path}: {message}")]
    LoadFailure {
        /// The path handed to the platform loader
        path: String,
        /// The platform's error text
        message: String,
    },

    /// A local path outside the overlay's extraction root was handed to the
    /// native loader.
    #[error("path is not under the extraction root: {0}")]
    ForeignPath(String),

    /// Filesystem failure while aliasing or preparing a binary.
    #[error("{0}")]
    Io(#[from] std::io::Error),
}
