//! Directory snapshots as standalone single-commit repositories
//!
//! A snapshot copies a source directory into the staging area, drops any
//! existing git metadata and commits the copy as the only commit of a fresh
//! repository.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use git2::{IndexAddOption, Oid, Repository, RepositoryInitOptions, Signature};
use tracing::{debug, info, warn};

use crate::config::{SnapshotConfig, StagingMode};
use crate::{Error, Result};

/// Identity of a staged snapshot: the directory it is staged in
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SnapshotId(PathBuf);

impl SnapshotId {
    /// Derive the identity for a source path, taken as given
    pub fn for_source(config: &SnapshotConfig, source: &Path) -> Self {
        match config.staging_mode {
            StagingMode::Shared => Self(config.staging_dir.clone()),
            StagingMode::PerSource => {
                let mut hasher = DefaultHasher::new();
                source.hash(&mut hasher);

                let name = source
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("root");
                let safe_name: String = name
                    .chars()
                    .map(|c| {
                        if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                            c
                        } else {
                            '-'
                        }
                    })
                    .collect();

                Self(
                    config
                        .staging_dir
                        .join(format!("{}-{:016x}", safe_name, hasher.finish())),
                )
            }
        }
    }

    /// Directory holding the staged repository
    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// A committed snapshot ready to be served
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Identity used to deduplicate servers
    pub id: SnapshotId,
    /// Source directory as given by the caller
    pub source: PathBuf,
    /// The single commit of the staged repository
    pub commit: Oid,
}

impl Snapshot {
    /// Root of the staged repository
    pub fn path(&self) -> &Path {
        self.id.path()
    }
}

/// Staging slots by identity
///
/// Each lock serializes writers to its slot and guards whether the slot has
/// been written by this snapshotter.
#[derive(Debug, Default)]
struct Slots {
    locks: HashMap<SnapshotId, Arc<Mutex<bool>>>,
    closed: bool,
}

/// Produces snapshots in the configured staging area
#[derive(Debug)]
pub struct Snapshotter {
    config: SnapshotConfig,
    slots: Mutex<Slots>,
}

impl Snapshotter {
    /// Create a snapshotter for the given configuration
    pub fn new(config: SnapshotConfig) -> Self {
        Self {
            config,
            slots: Mutex::new(Slots::default()),
        }
    }

    /// Configuration in use
    pub fn config(&self) -> &SnapshotConfig {
        &self.config
    }

    /// Identity a snapshot of `source` would be staged under
    pub fn identity(&self, source: &Path) -> SnapshotId {
        SnapshotId::for_source(&self.config, source)
    }

    /// Lock for the staging slot of `id`, or `None` once staging is removed
    fn slot_lock(&self, id: &SnapshotId) -> Option<Arc<Mutex<bool>>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if slots.closed {
            return None;
        }
        Some(Arc::clone(slots.locks.entry(id.clone()).or_default()))
    }

    fn is_closed(&self) -> bool {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed
    }

    /// Stage `source` and commit it as a new single-commit repository
    ///
    /// Anything previously staged under the same identity is discarded first.
    /// Snapshots for different identities run concurrently. This blocks on
    /// filesystem and repository IO.
    pub fn snapshot(&self, source: &Path) -> Result<Snapshot> {
        if !source.is_dir() {
            return Err(Error::snapshot_io(
                source,
                std::io::Error::new(std::io::ErrorKind::NotFound, "source is not a directory"),
            ));
        }

        let id = self.identity(source);
        let slot = self.slot_lock(&id).ok_or(Error::ShutDown)?;
        let mut written = slot.lock().unwrap_or_else(PoisonError::into_inner);
        // staging may have been removed while waiting for the slot
        if self.is_closed() {
            return Err(Error::ShutDown);
        }

        let staged = id.path();
        let staged_real = self.resolve_staged(staged)?;
        ensure_not_nested(source, &staged_real)?;

        *written = true;
        clear_dir(staged)?;
        fs::create_dir_all(staged).map_err(|e| Error::snapshot_io(staged, e))?;

        copy_tree(source, staged, true)?;
        debug!(source = %source.display(), staged = %staged.display(), "Copied source into staging area");

        let commit = self.commit_all(staged)?;
        info!(
            source = %source.display(),
            identity = %id,
            commit = %commit,
            "Snapshot committed"
        );

        Ok(Snapshot {
            id,
            source: source.to_path_buf(),
            commit,
        })
    }

    /// Remove every staged repository and refuse further snapshots
    ///
    /// Waits for in-progress snapshots of each slot to finish first. Failures
    /// are logged and skipped.
    pub fn remove_staged(&self) {
        let locks = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.closed = true;
            std::mem::take(&mut slots.locks)
        };

        for (id, slot) in locks {
            let written = slot.lock().unwrap_or_else(PoisonError::into_inner);
            if !*written {
                continue;
            }
            match clear_dir(id.path()) {
                Ok(()) => debug!(identity = %id, "Removed staged snapshot"),
                Err(e) => warn!(identity = %id, error = %e, "Failed to remove staged snapshot"),
            }
        }
    }

    /// Canonical location of `staged`, creating the staging root if needed
    fn resolve_staged(&self, staged: &Path) -> Result<PathBuf> {
        let root = &self.config.staging_dir;
        fs::create_dir_all(root).map_err(|e| Error::snapshot_io(root, e))?;
        let root_real = fs::canonicalize(root).map_err(|e| Error::snapshot_io(root, e))?;

        Ok(match staged.strip_prefix(root) {
            Ok(rest) => root_real.join(rest),
            Err(_) => root_real,
        })
    }

    /// Initialize a repository at `staged` and commit everything in it
    fn commit_all(&self, staged: &Path) -> Result<Oid> {
        let init_err = |source: git2::Error| Error::RepositoryInit {
            path: staged.to_path_buf(),
            source,
        };
        let commit_err = |source: git2::Error| Error::Commit {
            path: staged.to_path_buf(),
            source,
        };

        let mut opts = RepositoryInitOptions::new();
        opts.initial_head(&self.config.default_branch);
        let repo = Repository::init_opts(staged, &opts).map_err(init_err)?;

        // Lets an accepted push to the checked out branch refresh the worktree.
        repo.config()
            .and_then(|mut config| config.set_str("receive.denyCurrentBranch", "updateInstead"))
            .map_err(init_err)?;

        let mut index = repo.index().map_err(init_err)?;
        index
            .add_all(["*"].iter(), IndexAddOption::DEFAULT, None)
            .map_err(init_err)?;
        index.write().map_err(init_err)?;
        let tree_id = index.write_tree().map_err(init_err)?;

        let tree = repo.find_tree(tree_id).map_err(commit_err)?;
        let signature = self.signature(&repo).map_err(commit_err)?;

        repo.commit(Some("HEAD"), &signature, &signature, "", &tree, &[])
            .map_err(commit_err)
    }

    /// Identity from the environment's git config, else the configured fallback
    fn signature(&self, repo: &Repository) -> std::result::Result<Signature<'static>, git2::Error> {
        match repo.signature() {
            Ok(signature) => Ok(signature),
            Err(e) => {
                debug!(error = %e, "No git identity configured, using fallback author");
                Signature::now(&self.config.author_name, &self.config.author_email)
            }
        }
    }
}

/// Remove `dir` and everything below it; a missing directory is fine
fn clear_dir(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::snapshot_io(dir, e)),
    }
}

/// Refuse to stage a directory into itself or to clear a slot holding the source
fn ensure_not_nested(source: &Path, staged_real: &Path) -> Result<()> {
    let source_real = fs::canonicalize(source).map_err(|e| Error::snapshot_io(source, e))?;

    let reason = if staged_real.starts_with(&source_real) {
        "staging directory lies inside the source directory"
    } else if source_real.starts_with(staged_real) {
        "source directory lies inside the staging directory"
    } else {
        return Ok(());
    };

    Err(Error::snapshot_io(
        staged_real,
        std::io::Error::new(std::io::ErrorKind::InvalidInput, reason),
    ))
}

/// Recursively copy `src` into `dst`, skipping `.git` at the root
fn copy_tree(src: &Path, dst: &Path, root: bool) -> Result<()> {
    fs::create_dir_all(dst).map_err(|e| Error::snapshot_io(dst, e))?;

    for entry in fs::read_dir(src).map_err(|e| Error::snapshot_io(src, e))? {
        let entry = entry.map_err(|e| Error::snapshot_io(src, e))?;
        if root && entry.file_name() == ".git" {
            continue;
        }

        let from = entry.path();
        let to = dst.join(entry.file_name());
        let file_type = entry
            .file_type()
            .map_err(|e| Error::snapshot_io(&from, e))?;

        if file_type.is_dir() {
            copy_tree(&from, &to, false)?;
        } else if file_type.is_symlink() {
            copy_symlink(&from, &to).map_err(|e| Error::snapshot_io(&from, e))?;
        } else {
            fs::copy(&from, &to).map_err(|e| Error::snapshot_io(&from, e))?;
        }
    }

    Ok(())
}

#[cfg(unix)]
fn copy_symlink(from: &Path, to: &Path) -> std::io::Result<()> {
    let target = fs::read_link(from)?;
    std::os::unix::fs::symlink(target, to)
}

#[cfg(not(unix))]
fn copy_symlink(from: &Path, to: &Path) -> std::io::Result<()> {
    fs::copy(from, to).map(|_| ())
}
