//! Serve command - expose directories as git repositories until interrupted

use std::path::{Path, PathBuf};

use clap::Args;
use dirgit_core::protocol::RepoNamePolicy;
use dirgit_core::{Config, GitService};
use serde::Serialize;
use tokio::signal;

/// Arguments for the serve command
#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Directories to serve
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    /// Repository name used in the printed clone URLs (owner/repo)
    #[arg(long)]
    pub repo_name: Option<String>,

    /// Print one JSON object per served directory
    #[arg(long)]
    pub json: bool,
}

/// One served directory as printed by `--json`
#[derive(Debug, Serialize)]
struct ServedRepo {
    path: PathBuf,
    port: u16,
    url: String,
}

impl ServeArgs {
    /// Execute the serve command
    pub async fn execute(&self, config: Config) -> anyhow::Result<()> {
        if let Some(name) = &self.repo_name {
            if !RepoNamePolicy::GithubStyle.accepts(name) {
                anyhow::bail!("Invalid repository name: {} (expected owner/repo)", name);
            }
        }

        let service = GitService::new(config)?;

        let mut served = Vec::with_capacity(self.paths.len());
        for path in &self.paths {
            let port = match service.add_git(path).await {
                Ok(port) => port,
                Err(e) => {
                    service.shutdown().await;
                    return Err(anyhow::anyhow!("Failed to serve {}: {}", path.display(), e));
                }
            };

            let repo_name = self
                .repo_name
                .clone()
                .unwrap_or_else(|| default_repo_name(path));
            let url = service.clone_url(port, &repo_name)?;
            served.push(ServedRepo {
                path: path.clone(),
                port,
                url: url.to_string(),
            });
        }

        for repo in &served {
            if self.json {
                println!("{}", serde_json::to_string(repo)?);
            } else {
                println!("{} -> {}", repo.path.display(), repo.url);
            }
        }

        tracing::info!(count = served.len(), "Serving until interrupted");
        shutdown_signal().await;

        service.shutdown().await;
        Ok(())
    }
}

/// `local/<directory name>.git`, falling back to `local/repo.git`
fn default_repo_name(path: &Path) -> String {
    let name = path
        .canonicalize()
        .ok()
        .and_then(|p| p.file_name().and_then(|n| n.to_str()).map(str::to_string))
        .unwrap_or_default();
    let candidate = format!("local/{}.git", name);

    if RepoNamePolicy::GithubStyle.accepts(&candidate) {
        candidate
    } else {
        "local/repo.git".to_string()
    }
}

/// Resolve on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}
