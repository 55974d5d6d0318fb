//! gincli - Client library for GIN data repositories
//!
//! GIN repositories combine git history with git-annex content. This crate
//! keeps the session token, talks to the account service, decides per file
//! whether content is committed directly or annexed, and drives clone and
//! upload runs that report per-file progress over a channel.
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and the repository-local overlay
//! - [`token`]: Session token persistence
//! - [`account`]: Account and SSH key REST client
//! - [`resolver`]: Repository identifiers and host settings
//! - [`annex`]: Direct vs annexed classification
//! - [`vcs`]: git / git-annex command seam
//! - [`engine`]: Clone and upload orchestration
//! - [`reporter`]: Human and JSON progress output

pub mod account;
pub mod annex;
pub mod config;
pub mod engine;
pub mod error;
pub mod reporter;
pub mod resolver;
pub mod token;
pub mod vcs;

pub use account::{Account, AccountClient, Affiliation, SshKey};
pub use annex::{classify_file, AnnexRule, TrackingMode};
pub use config::Config;
pub use engine::{FileState, RepoFileStatus, RunSummary, SyncEngine};
pub use error::{ErrorKind, GinError, Result};
pub use reporter::{OutputFormat, ProgressReporter};
pub use resolver::{resolve_hosts, validate_repo_path, HostSettings, RepoPath};
pub use token::{TokenStore, UserToken};
pub use vcs::{GitAnnexCli, Vcs};
