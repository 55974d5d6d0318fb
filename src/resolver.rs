//! Repository identifiers and remote host assembly

use std::fmt;
use std::path::PathBuf;

use crate::config::Config;
use crate::error::{GinError, Result};

/// Check that a repository path has the form `owner/repository`
pub fn validate_repo_path(path: &str) -> bool {
    RepoPath::parse(path).is_ok()
}

/// A validated `owner/repository` identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoPath {
    owner: String,
    name: String,
}

impl RepoPath {
    /// Parse `owner/repository`.
    ///
    /// Exactly one separator is accepted, neither side may be empty, and both
    /// sides are restricted to the characters the server allows in user and
    /// repository names.
    pub fn parse(input: &str) -> Result<Self> {
        let invalid = || GinError::InvalidRepoPath(input.to_string());

        let (owner, name) = input.split_once('/').ok_or_else(invalid)?;
        if name.contains('/') || !valid_component(owner) || !valid_component(name) {
            return Err(invalid());
        }

        Ok(Self {
            owner: owner.to_string(),
            name: name.to_string(),
        })
    }

    /// Local directory a clone of this repository is placed in
    pub fn clone_dir(&self) -> PathBuf {
        PathBuf::from(&self.name)
    }
}

impl fmt::Display for RepoPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

fn valid_component(part: &str) -> bool {
    !part.is_empty()
        && part != "."
        && part != ".."
        && part
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Host settings assembled from merged configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSettings {
    /// Account service base URL, e.g. `https://web.gin.g-node.org:443`
    pub gin_host: String,
    /// Git server `address:port`, e.g. `gin.g-node.org:22`
    pub git_host: String,
    /// User name on the git server
    pub git_user: String,
}

impl HostSettings {
    /// `ssh://` URL of a repository on the git server
    pub fn remote_url(&self, repo: &RepoPath) -> String {
        format!("ssh://{}@{}/{}", self.git_user, self.git_host, repo)
    }
}

/// Assemble host settings; no I/O
pub fn resolve_hosts(config: &Config) -> HostSettings {
    HostSettings {
        gin_host: format!("{}:{}", config.gin.address.trim_end_matches('/'), config.gin.port),
        git_host: format!("{}:{}", config.git.address, config.git.port),
        git_user: config.git.user.clone(),
    }
}
