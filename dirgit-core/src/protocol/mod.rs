//! Git smart HTTP protocol layer
//!
//! Routes:
//! - `GET  /<repo>/info/refs?service=<svc>` - Ref advertisement
//! - `POST /<repo>/git-upload-pack`         - Fetch / clone negotiation and pack data
//! - `POST /<repo>/git-receive-pack`        - Push, subject to the [`PushPolicy`]
//!
//! Protocol work is delegated to `git upload-pack` and `git receive-pack`
//! running in stateless RPC mode against the repository root.

mod pktline;
mod policy;

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::io::ReaderStream;
use tower_http::{decompression::RequestDecompressionLayer, trace::TraceLayer};
use tracing::{debug, error, warn};

pub use pktline::{parse_ref_updates, PktLineError, RefUpdate};
pub use policy::{PushPolicy, RepoNamePolicy};

/// Settings for serving one repository root
#[derive(Debug, Clone)]
pub struct GitHttpConfig {
    /// Repository served for every accepted name
    pub root: PathBuf,
    /// Names the repository answers to
    pub repo_names: RepoNamePolicy,
    /// Which pushes are accepted
    pub push: PushPolicy,
    /// git executable
    pub git_path: String,
}

impl GitHttpConfig {
    /// GitHub-style names, pushes restricted to `default_branch`
    pub fn new(
        root: impl Into<PathBuf>,
        default_branch: impl Into<String>,
        git_path: impl Into<String>,
    ) -> Self {
        Self {
            root: root.into(),
            repo_names: RepoNamePolicy::GithubStyle,
            push: PushPolicy::DefaultBranchOnly(default_branch.into()),
            git_path: git_path.into(),
        }
    }
}

/// The two services of the smart protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Service {
    UploadPack,
    ReceivePack,
}

impl Service {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "git-upload-pack" => Some(Self::UploadPack),
            "git-receive-pack" => Some(Self::ReceivePack),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::UploadPack => "git-upload-pack",
            Self::ReceivePack => "git-receive-pack",
        }
    }

    /// git subcommand implementing the service
    fn subcommand(self) -> &'static str {
        match self {
            Self::UploadPack => "upload-pack",
            Self::ReceivePack => "receive-pack",
        }
    }
}

/// Endpoint addressed below a repository name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endpoint {
    InfoRefs,
    Rpc(Service),
}

/// Split a request path into repository name and endpoint
fn parse_route(path: &str) -> Option<(&str, Endpoint)> {
    let path = path.trim_start_matches('/');

    let (repo, endpoint) = if let Some(repo) = path.strip_suffix("/info/refs") {
        (repo, Endpoint::InfoRefs)
    } else if let Some(repo) = path.strip_suffix("/git-upload-pack") {
        (repo, Endpoint::Rpc(Service::UploadPack))
    } else if let Some(repo) = path.strip_suffix("/git-receive-pack") {
        (repo, Endpoint::Rpc(Service::ReceivePack))
    } else {
        return None;
    };

    Some((repo, endpoint))
}

/// Build the axum [`Router`] serving `config.root`
pub fn router(config: GitHttpConfig) -> Router {
    Router::new()
        .route("/{*path}", get(handle_get).post(handle_post))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestDecompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(config))
}

#[derive(Debug, Deserialize)]
struct InfoRefsQuery {
    service: Option<String>,
}

/// `GET /<repo>/info/refs?service=<svc>`
async fn handle_get(
    State(config): State<Arc<GitHttpConfig>>,
    Path(path): Path<String>,
    Query(query): Query<InfoRefsQuery>,
) -> Result<Response, ProtocolError> {
    let endpoint = resolve(&config, &path)?;
    if endpoint != Endpoint::InfoRefs {
        return Err(ProtocolError::MethodNotAllowed);
    }

    let requested = query.service.unwrap_or_default();
    let service = Service::from_name(&requested).ok_or_else(|| {
        ProtocolError::BadRequest(format!("Unsupported service: {:?}", requested))
    })?;

    if service == Service::ReceivePack && !config.push.allows_push() {
        return Err(ProtocolError::Forbidden(
            "Push is not supported by this server".to_string(),
        ));
    }

    let output = git_command(&config, service)
        .arg("--advertise-refs")
        .arg(&config.root)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| spawn_error(&config, e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ProtocolError::Internal(format!(
            "git {} --advertise-refs failed (status {}): {}",
            service.subcommand(),
            output.status,
            stderr.trim()
        )));
    }

    let mut body = pktline::service_advertisement(service.name());
    body.extend_from_slice(&output.stdout);

    Ok((
        StatusCode::OK,
        [
            (
                header::CONTENT_TYPE,
                format!("application/x-{}-advertisement", service.name()),
            ),
            (header::CACHE_CONTROL, "no-cache".to_string()),
        ],
        body,
    )
        .into_response())
}

/// `POST /<repo>/git-upload-pack` and `POST /<repo>/git-receive-pack`
async fn handle_post(
    State(config): State<Arc<GitHttpConfig>>,
    Path(path): Path<String>,
    body: Bytes,
) -> Result<Response, ProtocolError> {
    let service = match resolve(&config, &path)? {
        Endpoint::Rpc(service) => service,
        Endpoint::InfoRefs => return Err(ProtocolError::MethodNotAllowed),
    };

    if service == Service::ReceivePack {
        let updates = pktline::parse_ref_updates(&body)
            .map_err(|e| ProtocolError::BadRequest(e.to_string()))?;
        if let Err(refname) = config.push.check(&updates) {
            warn!(%refname, "rejected push to protected ref");
            return Err(ProtocolError::Forbidden(format!(
                "Push to {} is not allowed",
                refname
            )));
        }
    }

    run_rpc(&config, service, body).await
}

/// Validate the repository name in `path` and return the endpoint
fn resolve(config: &GitHttpConfig, path: &str) -> Result<Endpoint, ProtocolError> {
    match parse_route(path) {
        Some((repo, endpoint)) if config.repo_names.accepts(repo) => Ok(endpoint),
        _ => Err(ProtocolError::NotFound),
    }
}

fn git_command(config: &GitHttpConfig, service: Service) -> Command {
    let mut cmd = Command::new(&config.git_path);
    // Protocol v0 only; v2 clients fall back when the server ignores Git-Protocol.
    cmd.arg(service.subcommand())
        .arg("--stateless-rpc")
        .env_remove("GIT_DIR")
        .env_remove("GIT_PROTOCOL")
        .kill_on_drop(true);
    cmd
}

fn spawn_error(config: &GitHttpConfig, e: std::io::Error) -> ProtocolError {
    if e.kind() == std::io::ErrorKind::NotFound {
        ProtocolError::Internal(format!("git executable not found at '{}'", config.git_path))
    } else {
        ProtocolError::Internal(format!("failed to spawn git: {}", e))
    }
}

/// Run a stateless RPC service, streaming its stdout as the response body
async fn run_rpc(
    config: &GitHttpConfig,
    service: Service,
    input: Bytes,
) -> Result<Response, ProtocolError> {
    let mut child = git_command(config, service)
        .arg(&config.root)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| spawn_error(config, e))?;

    debug!(service = service.name(), bytes = input.len(), "spawned git rpc");

    if let Some(mut stdin) = child.stdin.take() {
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(&input).await {
                debug!(error = %e, "git rpc closed stdin early");
            }
        });
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ProtocolError::Internal("failed to capture git stdout".to_string()))?;
    let mut stderr = child.stderr.take();

    // Reap the child in the background so we don't leak processes.
    tokio::spawn(async move {
        let mut message = String::new();
        if let Some(stderr) = stderr.as_mut() {
            let _ = stderr.read_to_string(&mut message).await;
        }
        match child.wait().await {
            Ok(status) if !status.success() => {
                warn!(
                    service = service.name(),
                    %status,
                    stderr = %message.trim(),
                    "git rpc exited with non-zero status"
                );
            }
            Err(e) => error!(error = %e, "failed to wait on git rpc"),
            _ => {}
        }
    });

    Ok((
        StatusCode::OK,
        [
            (
                header::CONTENT_TYPE,
                format!("application/x-{}-result", service.name()),
            ),
            (header::CACHE_CONTROL, "no-cache".to_string()),
        ],
        Body::from_stream(ReaderStream::new(stdout)),
    )
        .into_response())
}

/// Protocol-level errors mapped to HTTP responses
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Repository not found")]
    NotFound,

    #[error("Method not allowed")]
    MethodNotAllowed,

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl IntoResponse for ProtocolError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Internal(msg) => {
                error!(error = %msg, "git protocol error");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, format!("{}\n", self)).into_response()
    }
}
