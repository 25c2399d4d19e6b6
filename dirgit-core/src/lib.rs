//! dirgit core - serve local directories as git repositories
//!
//! A directory is snapshotted into a fresh single-commit repository and
//! served over the git smart HTTP protocol on an ephemeral port until the
//! service shuts down.

pub mod config;
pub mod error;
pub mod port;
pub mod protocol;
pub mod registry;
pub mod service;
pub mod snapshot;

pub use config::{Config, ServerConfig, SnapshotConfig, StagingMode};
pub use error::{Error, Result};
pub use port::{EphemeralPortAllocator, PortAllocator};
pub use registry::{ServerHealth, ServerRegistry};
pub use service::{GitService, ServiceState};
pub use snapshot::{Snapshot, SnapshotId, Snapshotter};
