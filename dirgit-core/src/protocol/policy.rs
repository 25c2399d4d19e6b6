//! Repository naming and push policies

use super::pktline::RefUpdate;

/// Which repository names a server answers to
///
/// Every accepted name maps to the same repository root.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RepoNamePolicy {
    /// `owner/repo`, optionally suffixed with `.git`
    #[default]
    GithubStyle,
    /// Any non-empty relative path without `.` or `..` segments
    Any,
}

impl RepoNamePolicy {
    /// Whether `name` (without leading slash) is a valid repository name
    pub fn accepts(&self, name: &str) -> bool {
        match self {
            Self::GithubStyle => {
                let name = name.strip_suffix(".git").unwrap_or(name);
                let segments: Vec<&str> = name.split('/').collect();
                segments.len() == 2 && segments.iter().all(|s| is_github_segment(s))
            }
            Self::Any => {
                !name.is_empty()
                    && name
                        .split('/')
                        .all(|s| !s.is_empty() && s != "." && s != "..")
            }
        }
    }
}

fn is_github_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && segment != ".."
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Which ref updates a push may carry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushPolicy {
    /// Only `refs/heads/<branch>` may be updated
    DefaultBranchOnly(String),
    /// Every push is rejected
    Deny,
}

impl PushPolicy {
    /// Whether the receive-pack service is advertised at all
    pub fn allows_push(&self) -> bool {
        !matches!(self, Self::Deny)
    }

    /// Check a push, returning the first rejected ref name
    pub fn check<'a>(&self, updates: &'a [RefUpdate]) -> Result<(), &'a str> {
        match self {
            Self::Deny => match updates.first() {
                Some(update) => Err(update.refname.as_str()),
                None => Ok(()),
            },
            Self::DefaultBranchOnly(branch) => {
                let allowed = format!("refs/heads/{}", branch);
                match updates.iter().find(|u| u.refname != allowed) {
                    Some(update) => Err(update.refname.as_str()),
                    None => Ok(()),
                }
            }
        }
    }
}
