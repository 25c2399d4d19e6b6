//! Service facade: serve local directories as git repositories
//!
//! [`GitService::add_git`] snapshots a directory and returns the port of the
//! git server for that snapshot; [`GitService::shutdown`] stops every server.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};
use url::Url;

use crate::config::Config;
use crate::port::{EphemeralPortAllocator, PortAllocator};
use crate::protocol::GitHttpConfig;
use crate::registry::{ServerHealth, ServerRegistry};
use crate::snapshot::Snapshotter;
use crate::{Error, Result};

/// Lifecycle state of a [`GitService`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// No repository served yet
    Idle,
    /// Serving this many repositories
    Serving(usize),
    /// Shut down; no further repositories can be added
    Stopped,
}

/// Serves snapshots of local directories over git smart HTTP
#[derive(Debug)]
pub struct GitService {
    config: Config,
    snapshotter: Arc<Snapshotter>,
    registry: ServerRegistry,
}

impl GitService {
    /// Create a service allocating ephemeral ports on the configured host
    pub fn new(config: Config) -> Result<Self> {
        let allocator = Arc::new(EphemeralPortAllocator::new(config.server.bind_host.clone()));
        Self::with_allocator(config, allocator)
    }

    /// Create a service with a custom port allocator
    pub fn with_allocator(config: Config, allocator: Arc<dyn PortAllocator>) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            snapshotter: Arc::new(Snapshotter::new(config.snapshot.clone())),
            registry: ServerRegistry::new(config.server.clone(), allocator),
            config,
        })
    }

    /// Configuration in use
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Snapshot `path` and return the port of the git server serving it
    ///
    /// Every call takes a fresh snapshot. Repeated calls for the same path
    /// return the same port without starting another server.
    pub async fn add_git(&self, path: impl AsRef<Path>) -> Result<u16> {
        if self.registry.is_closed().await {
            return Err(Error::ShutDown);
        }

        let source: PathBuf = path.as_ref().to_path_buf();
        let snapshotter = Arc::clone(&self.snapshotter);
        let snapshot = tokio::task::spawn_blocking(move || snapshotter.snapshot(&source))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))??;

        let http = GitHttpConfig::new(
            snapshot.path(),
            self.config.snapshot.default_branch.clone(),
            self.config.server.git_path.clone(),
        );
        let port = self.registry.get_or_create(&snapshot.id, http).await?;

        info!(
            path = %snapshot.source.display(),
            identity = %snapshot.id,
            port,
            "Serving directory as git repository"
        );
        Ok(port)
    }

    /// Health of the server last returned for `path`
    pub async fn health(&self, path: impl AsRef<Path>) -> Option<ServerHealth> {
        let id = self.snapshotter.identity(path.as_ref());
        self.registry.health(&id).await
    }

    /// Clone URL for `repo_name` on a port returned by [`add_git`](Self::add_git)
    ///
    /// Uses the bind host, or `localhost` when bound to every interface.
    pub fn clone_url(&self, port: u16, repo_name: &str) -> Result<Url> {
        let host = match self.config.server.bind_host.as_str() {
            "0.0.0.0" | "::" | "[::]" => "localhost",
            host => host,
        };

        let base = Url::parse(&format!("http://{}:{}/", host, port))
            .map_err(|e| Error::Config(format!("Invalid server address: {}", e)))?;
        base.join(repo_name.trim_start_matches('/'))
            .map_err(|e| Error::Config(format!("Invalid repository name {}: {}", repo_name, e)))
    }

    /// Current lifecycle state
    pub async fn state(&self) -> ServiceState {
        if self.registry.is_closed().await {
            return ServiceState::Stopped;
        }
        match self.registry.len().await {
            0 => ServiceState::Idle,
            n => ServiceState::Serving(n),
        }
    }

    /// Stop all servers, waiting until every one has exited
    ///
    /// Staged repositories are removed once the servers are gone.
    pub async fn shutdown(&self) {
        self.registry.shutdown_all().await;

        let snapshotter = Arc::clone(&self.snapshotter);
        if let Err(e) = tokio::task::spawn_blocking(move || snapshotter.remove_staged()).await {
            warn!(error = %e, "Staging cleanup task failed");
        }
        info!("Git service stopped");
    }
}
