//! Session token persistence
//!
//! A single token file lives under the configuration root. Writes go to a
//! sibling temporary file that is renamed over the target, so readers never
//! observe a partially written token.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{GinError, Result};

const TOKEN_FILE_NAME: &str = "token";

/// An authenticated session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserToken {
    pub username: String,
    pub token: String,
}

/// On-disk store for the session token
#[derive(Debug, Clone)]
pub struct TokenStore {
    root: Option<PathBuf>,
}

impl TokenStore {
    /// Store rooted at an explicit directory
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    /// Store without a resolvable root; every read reports `NotLoggedIn`
    pub fn unresolved() -> Self {
        Self { root: None }
    }

    fn token_path(&self) -> Option<PathBuf> {
        self.root.as_ref().map(|root| root.join(TOKEN_FILE_NAME))
    }

    /// Persist the token, replacing any previous session
    pub fn store_token(&self, token: &UserToken) -> Result<()> {
        let root = self.root.as_ref().ok_or_else(|| {
            GinError::io(
                "Cannot store token",
                std::io::Error::new(ErrorKind::NotFound, "configuration directory is not set"),
            )
        })?;

        fs::create_dir_all(root).map_err(|e| {
            GinError::io(format!("Failed to create config directory {:?}", root), e)
        })?;

        let content = serde_json::to_vec(token)
            .map_err(|e| GinError::CorruptState(format!("Failed to serialize token: {}", e)))?;

        let target = root.join(TOKEN_FILE_NAME);
        let staging = root.join(format!(".{}.tmp", TOKEN_FILE_NAME));

        write_private(&staging, &content)
            .map_err(|e| GinError::io(format!("Failed to write token file {:?}", staging), e))?;
        fs::rename(&staging, &target)
            .map_err(|e| GinError::io(format!("Failed to replace token file {:?}", target), e))?;

        debug!("Stored session token for {} at {:?}", token.username, target);
        Ok(())
    }

    /// Load the stored session, whoever it belongs to
    pub fn load_token(&self) -> Result<UserToken> {
        let path = self.token_path().ok_or(GinError::NotLoggedIn)?;

        let content = match fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(GinError::NotLoggedIn),
            Err(e) => {
                return Err(GinError::io(
                    format!("Failed to read token file {:?}", path),
                    e,
                ))
            }
        };

        let token: UserToken = serde_json::from_slice(&content)
            .map_err(|e| GinError::CorruptState(format!("{:?}: {}", path, e)))?;

        if token.username.is_empty() {
            return Err(GinError::CorruptState(format!(
                "{:?}: token has no username",
                path
            )));
        }

        Ok(token)
    }

    /// Load the stored session only if it belongs to `username`
    pub fn load_token_for(&self, username: &str) -> Result<UserToken> {
        let token = self.load_token()?;
        if token.username != username {
            debug!(
                "Stored session belongs to {}, not {}",
                token.username, username
            );
            return Err(GinError::NotLoggedIn);
        }
        Ok(token)
    }

    /// Remove the stored session; succeeds when nothing is stored
    pub fn delete_token(&self) -> Result<()> {
        let Some(path) = self.token_path() else {
            return Ok(());
        };

        match fs::remove_file(&path) {
            Ok(()) => {
                debug!("Deleted session token {:?}", path);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(GinError::io(
                format!("Failed to delete token file {:?}", path),
                e,
            )),
        }
    }
}

#[cfg(unix)]
fn write_private(path: &Path, content: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(content)?;
    file.sync_all()
}

#[cfg(not(unix))]
fn write_private(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(content)?;
    file.sync_all()
}
