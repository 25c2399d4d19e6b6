//! Registry of running git servers
//!
//! Maps each snapshot identity to at most one HTTP server and owns the
//! lifetime of every server it starts.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::port::PortAllocator;
use crate::protocol::{self, GitHttpConfig};
use crate::snapshot::SnapshotId;
use crate::{Error, Result};

/// Observed state of a started server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerHealth {
    /// Accept loop is running
    Serving,
    /// Accept loop ended after a stop request
    Stopped,
    /// Accept loop ended on its own
    Failed(String),
}

/// Control side of one server task
struct ServerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    health: watch::Receiver<ServerHealth>,
}

impl ServerHandle {
    fn health(&self) -> ServerHealth {
        let current = self.health.borrow().clone();
        if current == ServerHealth::Serving && self.task.is_finished() {
            ServerHealth::Failed("server task ended unexpectedly".to_string())
        } else {
            current
        }
    }
}

/// A running server bound to a port
struct ServerMapping {
    port: u16,
    handle: ServerHandle,
}

impl ServerMapping {
    fn port(&self) -> u16 {
        self.port
    }
}

#[derive(Default)]
struct RegistryState {
    servers: HashMap<SnapshotId, ServerMapping>,
    closed: bool,
}

/// Owns every git server started for a snapshot
///
/// All lookups and insertions happen under one lock, so concurrent requests
/// for the same identity always end up with the same server. Starting a
/// server is rare, so requests for different identities wait on each other
/// only briefly. Draining at shutdown happens outside that lock.
pub struct ServerRegistry {
    config: ServerConfig,
    allocator: Arc<dyn PortAllocator>,
    state: Mutex<RegistryState>,
    /// Held for the whole drain so concurrent shutdowns all wait for it
    drain: Mutex<()>,
}

impl fmt::Debug for ServerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerRegistry")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ServerRegistry {
    /// Create an empty registry
    pub fn new(config: ServerConfig, allocator: Arc<dyn PortAllocator>) -> Self {
        Self {
            config,
            allocator,
            state: Mutex::new(RegistryState::default()),
            drain: Mutex::new(()),
        }
    }

    /// Return the port serving `id`, starting a server on a fresh port if none exists
    ///
    /// Must be called within a tokio runtime; the server runs as a task on it.
    pub async fn get_or_create(&self, id: &SnapshotId, http: GitHttpConfig) -> Result<u16> {
        let mut state = self.state.lock().await;

        if state.closed {
            return Err(Error::ShutDown);
        }

        if let Some(mapping) = state.servers.get(id) {
            debug!(identity = %id, port = mapping.port, "Reusing running git server");
            return Ok(mapping.port);
        }

        let port = self.allocator.allocate()?;
        let addr = format!("{}:{}", self.config.bind_host, port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| Error::Listen {
                addr: addr.clone(),
                source,
            })?;

        debug!(identity = %id, root = %http.root.display(), port, "Starting git server");
        let handle = spawn_server(listener, protocol::router(http), port);
        state.servers.insert(id.clone(), ServerMapping { port, handle });

        info!(identity = %id, %addr, "Git server listening");
        Ok(port)
    }

    /// Port currently serving `id`, if any
    pub async fn port(&self, id: &SnapshotId) -> Option<u16> {
        self.state.lock().await.servers.get(id).map(ServerMapping::port)
    }

    /// Health of the server for `id`, if one is tracked
    pub async fn health(&self, id: &SnapshotId) -> Option<ServerHealth> {
        self.state.lock().await.servers.get(id).map(|m| m.handle.health())
    }

    /// Subscribe to health changes of the server for `id`
    pub async fn watch_health(&self, id: &SnapshotId) -> Option<watch::Receiver<ServerHealth>> {
        self.state
            .lock()
            .await
            .servers
            .get(id)
            .map(|m| m.handle.health.clone())
    }

    /// All tracked identities with their ports, ordered by identity
    pub async fn ports(&self) -> Vec<(SnapshotId, u16)> {
        let state = self.state.lock().await;
        let mut ports: Vec<_> = state
            .servers
            .iter()
            .map(|(id, mapping)| (id.clone(), mapping.port))
            .collect();
        ports.sort();
        ports
    }

    /// Number of tracked servers
    pub async fn len(&self) -> usize {
        self.state.lock().await.servers.len()
    }

    /// Whether no server is tracked
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Whether [`shutdown_all`](Self::shutdown_all) has been called
    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// Stop every server and wait for all of them to exit
    ///
    /// Servers drain in-flight requests in parallel, all bounded by the
    /// configured shutdown timeout. Failures are logged and dropped. Later
    /// calls to [`get_or_create`](Self::get_or_create) fail with
    /// [`Error::ShutDown`]; queries see an empty, closed registry while the
    /// drain runs.
    pub async fn shutdown_all(&self) {
        let _drain = self.drain.lock().await;
        let servers = {
            let mut state = self.state.lock().await;
            state.closed = true;
            std::mem::take(&mut state.servers)
        };
        if servers.is_empty() {
            return;
        }

        info!(count = servers.len(), "Shutting down git servers");
        for mapping in servers.values() {
            mapping.handle.cancel.cancel();
        }

        let deadline = Instant::now() + self.config.shutdown_timeout;
        for (id, mapping) in servers {
            let port = mapping.port;
            let mut task = mapping.handle.task;

            match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(Ok(())) => debug!(identity = %id, port, "Git server stopped"),
                Ok(Err(e)) => warn!(identity = %id, port, error = %e, "Git server task failed"),
                Err(_) => {
                    warn!(identity = %id, port, "Git server did not drain in time, aborting");
                    task.abort();
                    let _ = task.await;
                }
            }
        }
    }
}

/// Run the accept loop for `router` on `listener` until cancelled
fn spawn_server(listener: TcpListener, router: axum::Router, port: u16) -> ServerHandle {
    let cancel = CancellationToken::new();
    let (health_tx, health_rx) = watch::channel(ServerHealth::Serving);

    let signal = cancel.clone().cancelled_owned();
    let task = tokio::spawn(async move {
        match axum::serve(listener, router)
            .with_graceful_shutdown(signal)
            .await
        {
            Ok(()) => {
                let _ = health_tx.send(ServerHealth::Stopped);
            }
            Err(e) => {
                warn!(port, error = %e, "Git server stopped serving");
                let _ = health_tx.send(ServerHealth::Failed(e.to_string()));
            }
        }
    });

    ServerHandle {
        cancel,
        task,
        health: health_rx,
    }
}
