//! Configuration management for dirgit
//!
//! Configuration is loaded with the following priority (highest to lowest):
//! 1. CLI flags
//! 2. Environment variables (DIRGIT_*)
//! 3. Config file (~/.config/dirgit/config.toml)
//! 4. Default values

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// How snapshots share the staging area
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StagingMode {
    /// Every snapshot reuses the staging directory itself. A snapshot of a
    /// different source replaces the files served for any earlier one.
    Shared,
    /// Each source path gets its own directory below the staging directory
    #[default]
    PerSource,
}

/// Snapshot-related configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Root of the staging area
    pub staging_dir: PathBuf,

    /// Whether sources share one staging slot
    pub staging_mode: StagingMode,

    /// Initial branch of every snapshot, also the only branch accepting pushes
    pub default_branch: String,

    /// Author name used when git config provides none
    pub author_name: String,

    /// Author email used when git config provides none
    pub author_email: String,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            staging_dir: std::env::temp_dir().join("dirgit-staging"),
            staging_mode: StagingMode::default(),
            default_branch: "master".to_string(),
            author_name: "dirgit".to_string(),
            author_email: "dirgit@localhost".to_string(),
        }
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host every git server binds to
    pub bind_host: String,

    /// Upper bound on the graceful drain of a single server
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    /// Path to the git executable serving the protocol
    pub git_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            shutdown_timeout: Duration::from_secs(30),
            git_path: "git".to_string(),
        }
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Snapshot configuration
    pub snapshot: SnapshotConfig,

    /// Server configuration
    pub server: ServerConfig,
}

impl Config {
    /// Load configuration from the default config file location
    ///
    /// Returns default config if file doesn't exist
    pub fn load() -> Result<Self> {
        if let Some(path) = Self::default_config_path() {
            if path.exists() {
                return Self::load_from_file(&path);
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(Error::Io)?;
        toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Get the default config file path
    ///
    /// Returns `~/.config/dirgit/config.toml` on Unix
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("dirgit").join("config.toml"))
    }

    /// Apply environment variable overrides
    ///
    /// Supported variables:
    /// - DIRGIT_STAGING_DIR: Root of the staging area
    /// - DIRGIT_BIND_HOST: Host the git servers bind to
    /// - DIRGIT_GIT_PATH: Path to the git executable
    pub fn with_env_overrides(self) -> Self {
        self.with_cli_overrides(
            std::env::var_os("DIRGIT_STAGING_DIR").map(PathBuf::from),
            std::env::var("DIRGIT_BIND_HOST").ok(),
            std::env::var("DIRGIT_GIT_PATH").ok(),
        )
    }

    /// Apply CLI flag overrides
    pub fn with_cli_overrides(
        mut self,
        staging_dir: Option<PathBuf>,
        bind_host: Option<String>,
        git_path: Option<String>,
    ) -> Self {
        if let Some(dir) = staging_dir {
            self.snapshot.staging_dir = dir;
        }

        if let Some(host) = bind_host {
            self.server.bind_host = host;
        }

        if let Some(git) = git_path {
            self.server.git_path = git;
        }

        self
    }

    /// Load configuration with all overrides applied
    ///
    /// Priority: CLI > env > config file > defaults
    pub fn load_with_overrides(
        staging_dir: Option<PathBuf>,
        bind_host: Option<String>,
        git_path: Option<String>,
    ) -> Result<Self> {
        Ok(Self::load()?
            .with_env_overrides()
            .with_cli_overrides(staging_dir, bind_host, git_path))
    }

    /// Reject values the service cannot run with
    pub fn validate(&self) -> Result<()> {
        if git2::Reference::is_valid_name(&format!("refs/heads/{}", self.snapshot.default_branch))
        {
            Ok(())
        } else {
            Err(Error::Config(format!(
                "Invalid default branch name: {}",
                self.snapshot.default_branch
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.bind_host, "0.0.0.0");
        assert_eq!(config.server.git_path, "git");
        assert_eq!(config.server.shutdown_timeout, Duration::from_secs(30));
        assert_eq!(config.snapshot.default_branch, "master");
        assert_eq!(config.snapshot.staging_mode, StagingMode::PerSource);
        assert!(config.snapshot.staging_dir.ends_with("dirgit-staging"));
    }

    #[test]
    fn test_cli_overrides() {
        let config = Config::default().with_cli_overrides(
            Some(PathBuf::from("/srv/staging")),
            Some("127.0.0.1".to_string()),
            None,
        );

        assert_eq!(config.snapshot.staging_dir, PathBuf::from("/srv/staging"));
        assert_eq!(config.server.bind_host, "127.0.0.1");
        assert_eq!(config.server.git_path, "git");
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
[snapshot]
staging_dir = "/var/tmp/dirgit"
staging_mode = "shared"
default_branch = "main"

[server]
bind_host = "127.0.0.1"
shutdown_timeout = "5s"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.snapshot.staging_dir, PathBuf::from("/var/tmp/dirgit"));
        assert_eq!(config.snapshot.staging_mode, StagingMode::Shared);
        assert_eq!(config.snapshot.default_branch, "main");
        assert_eq!(config.server.bind_host, "127.0.0.1");
        assert_eq!(config.server.shutdown_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_partial_toml() {
        let toml = r#"
[server]
git_path = "/usr/local/bin/git"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.git_path, "/usr/local/bin/git");
        // everything else keeps its default
        assert_eq!(config.server.bind_host, "0.0.0.0");
        assert_eq!(config.snapshot.author_name, "dirgit");
    }

    #[test]
    fn test_validate_branch_name() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.snapshot.default_branch = "bad..name".to_string();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
