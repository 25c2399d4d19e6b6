//! Error types for dirgit

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for dirgit operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for dirgit operations
#[derive(Error, Debug)]
pub enum Error {
    /// Copying the source into the staging area (or clearing it) failed
    #[error("Snapshot IO error at {path}: {source}")]
    SnapshotIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Initializing the staged repository or staging its files failed
    #[error("Repository init error at {path}: {source}")]
    RepositoryInit {
        path: PathBuf,
        #[source]
        source: git2::Error,
    },

    /// Creating the snapshot commit failed (including unresolved identity)
    #[error("Commit error at {path}: {source}")]
    Commit {
        path: PathBuf,
        #[source]
        source: git2::Error,
    },

    /// No free TCP port could be obtained from the OS
    #[error("Port allocation error: {0}")]
    PortAllocation(#[source] std::io::Error),

    /// Binding the HTTP listener failed
    #[error("Failed to listen on {addr}: {source}")]
    Listen {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The service was shut down and accepts no new repositories
    #[error("Git service has been shut down")]
    ShutDown,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn snapshot_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::SnapshotIo {
            path: path.into(),
            source,
        }
    }
}
