//! Error types shared by the session, account and synchronization layers

use thiserror::Error;

/// Errors produced by the GIN client library
#[derive(Debug, Error)]
pub enum GinError {
    /// No readable session token is stored
    #[error("not logged in")]
    NotLoggedIn,

    /// The server could not be reached (unreachable host, empty or invalid address)
    #[error("could not connect to server: {0}")]
    Connection(String),

    /// The server answered with a non-success status
    #[error("request failed with status {status}: {message}")]
    RequestFailed { status: u16, message: String },

    /// The server answered with success but the body could not be parsed
    #[error("invalid response from server: {0}")]
    InvalidResponse(String),

    /// The requested resource does not exist on the server
    #[error("not found: {0}")]
    NotFound(String),

    /// Local filesystem failure
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Persisted session state exists but cannot be parsed
    #[error("stored session is corrupt: {0}")]
    CorruptState(String),

    /// An external version-control command failed
    #[error("{0}")]
    Vcs(String),

    /// A repository identifier is not of the form `owner/repository`
    #[error("invalid repository path '{0}': full repository name should be the owner's username followed by the repository name, separated by a '/'")]
    InvalidRepoPath(String),

    /// A configuration value could not be interpreted
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Fieldless discriminant of [`GinError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotLoggedIn,
    Connection,
    RequestFailed,
    InvalidResponse,
    NotFound,
    Io,
    CorruptState,
    Vcs,
    InvalidRepoPath,
    Config,
}

impl GinError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GinError::NotLoggedIn => ErrorKind::NotLoggedIn,
            GinError::Connection(_) => ErrorKind::Connection,
            GinError::RequestFailed { .. } => ErrorKind::RequestFailed,
            GinError::InvalidResponse(_) => ErrorKind::InvalidResponse,
            GinError::NotFound(_) => ErrorKind::NotFound,
            GinError::Io { .. } => ErrorKind::Io,
            GinError::CorruptState(_) => ErrorKind::CorruptState,
            GinError::Vcs(_) => ErrorKind::Vcs,
            GinError::InvalidRepoPath(_) => ErrorKind::InvalidRepoPath,
            GinError::Config(_) => ErrorKind::Config,
        }
    }

    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        GinError::Io {
            context: context.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, GinError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_matches_variant() {
        assert_eq!(GinError::NotLoggedIn.kind(), ErrorKind::NotLoggedIn);
        assert_eq!(
            GinError::RequestFailed {
                status: 500,
                message: String::new()
            }
            .kind(),
            ErrorKind::RequestFailed
        );
        let io = GinError::io("reading token", std::io::Error::other("boom"));
        assert_eq!(io.kind(), ErrorKind::Io);
        assert!(io.to_string().starts_with("reading token"));
    }

    #[test]
    fn test_invalid_repo_path_message() {
        let err = GinError::InvalidRepoPath("alice".to_string());
        assert!(err.to_string().contains("'alice'"));
        assert!(err.to_string().contains("separated by a '/'"));
    }
}
