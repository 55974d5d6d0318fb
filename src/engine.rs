//! Sync Engine - Orchestrates clone and upload runs
//!
//! Each run drives the [`Vcs`] capability file by file and reports progress
//! as [`RepoFileStatus`] events on an unbounded channel. The channel closes
//! when the run ends, either normally or on a fatal error. A failure confined
//! to one file is reported in that file's event and the run continues.

use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::annex::{classify_file, AnnexRule, TrackingMode};
use crate::error::{GinError, Result};
use crate::resolver::{HostSettings, RepoPath};
use crate::vcs::{ChangeKind, FileChange, Vcs};

/// Remote name used for clones and uploads
pub const DEFAULT_REMOTE: &str = "origin";

/// Progress state of a single file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileState {
    Checking,
    Annexed,
    Tracked,
    Downloading,
    Uploading,
    Removed,
    Unmodified,
    Done,
    Failed,
    /// Final event of a run; not tied to a file
    Summary,
}

impl FileState {
    /// Whether this is the last event for its file
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FileState::Removed
                | FileState::Unmodified
                | FileState::Done
                | FileState::Failed
                | FileState::Summary
        )
    }
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FileState::Checking => "checking",
            FileState::Annexed => "annexed",
            FileState::Tracked => "tracked",
            FileState::Downloading => "downloading",
            FileState::Uploading => "uploading",
            FileState::Removed => "removed",
            FileState::Unmodified => "unmodified",
            FileState::Done => "done",
            FileState::Failed => "failed",
            FileState::Summary => "summary",
        };
        f.pad(label)
    }
}

/// One progress or outcome event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepoFileStatus {
    #[serde(rename = "filename")]
    pub file_name: String,
    pub state: FileState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub err: Option<String>,
}

/// Lifecycle of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Resolving,
    Transferring,
    Finalizing,
    Done,
    Failed,
}

/// Outcome counts of a finished run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub duration: Duration,
}

impl RunSummary {
    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}

/// Event sink for one run. Tracks run state and terminal outcomes.
struct Run {
    label: String,
    out: UnboundedSender<RepoFileStatus>,
    state: RunState,
    started: Instant,
    succeeded: usize,
    failed: usize,
}

impl Run {
    fn new(label: impl Into<String>, out: UnboundedSender<RepoFileStatus>) -> Self {
        let run = Self {
            label: label.into(),
            out,
            state: RunState::Resolving,
            started: Instant::now(),
            succeeded: 0,
            failed: 0,
        };
        debug!("{}: {:?}", run.label, run.state);
        run
    }

    fn transition(&mut self, next: RunState) {
        debug!("{}: {:?} -> {:?}", self.label, self.state, next);
        self.state = next;
    }

    fn emit(&mut self, file: &Path, state: FileState, detail: Option<&str>, err: Option<&GinError>) {
        match state {
            FileState::Failed => self.failed += 1,
            s if s.is_terminal() => self.succeeded += 1,
            _ => {}
        }

        let event = RepoFileStatus {
            file_name: file.to_string_lossy().into_owned(),
            state,
            detail: detail.map(str::to_string),
            err: err.map(|e| e.to_string()),
        };
        // Unbounded; only fails once the consumer is gone
        if self.out.send(event).is_err() {
            debug!("{}: progress receiver dropped", self.label);
        }
    }

    fn fail(&mut self, file: &Path, err: &GinError) {
        warn!("{}: {} failed: {}", self.label, file.display(), err);
        self.emit(file, FileState::Failed, None, Some(err));
    }

    /// Emit the summary event and close out the run
    fn finish(mut self) -> RunSummary {
        self.transition(RunState::Done);
        let summary = RunSummary {
            total: self.succeeded + self.failed,
            succeeded: self.succeeded,
            failed: self.failed,
            duration: self.started.elapsed(),
        };

        let detail = format!("{} files, {} failed", summary.total, summary.failed);
        let event = RepoFileStatus {
            file_name: self.label.clone(),
            state: FileState::Summary,
            detail: Some(detail),
            err: None,
        };
        let _ = self.out.send(event);

        info!(
            "{} completed in {:.2}s: {} succeeded, {} failed",
            self.label,
            summary.duration.as_secs_f64(),
            summary.succeeded,
            summary.failed
        );
        summary
    }

    fn abort(mut self, err: GinError) -> GinError {
        self.transition(RunState::Failed);
        warn!("{}: run aborted: {}", self.label, err);
        err
    }
}

/// A change staged during upload, waiting for the push. Removals carry no
/// tracking mode.
struct Pending {
    path: PathBuf,
    mode: Option<TrackingMode>,
}

/// Orchestrates clone and upload runs against one remote
pub struct SyncEngine {
    vcs: Arc<dyn Vcs>,
    hosts: HostSettings,
    rules: AnnexRule,
}

impl SyncEngine {
    pub fn new(vcs: Arc<dyn Vcs>, hosts: HostSettings, rules: AnnexRule) -> Self {
        Self { vcs, hosts, rules }
    }

    /// Run a clone in the background; events arrive on the returned receiver
    pub fn spawn_clone(
        self: Arc<Self>,
        repo: RepoPath,
        parent: PathBuf,
    ) -> (UnboundedReceiver<RepoFileStatus>, JoinHandle<Result<RunSummary>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(async move { self.clone_validated(&repo, &parent, tx).await });
        (rx, handle)
    }

    /// Run an upload in the background; events arrive on the returned receiver
    pub fn spawn_upload(
        self: Arc<Self>,
        workdir: PathBuf,
        paths: Vec<PathBuf>,
    ) -> (UnboundedReceiver<RepoFileStatus>, JoinHandle<Result<RunSummary>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(async move { self.upload(&workdir, &paths, tx).await });
        (rx, handle)
    }

    /// Clone `owner/repository` into a new directory below `parent` and fetch
    /// annexed content.
    ///
    /// The identifier is validated before anything else happens.
    pub async fn clone_repo(
        &self,
        repo_path: &str,
        parent: &Path,
        out: UnboundedSender<RepoFileStatus>,
    ) -> Result<RunSummary> {
        let repo = RepoPath::parse(repo_path)?;
        self.clone_validated(&repo, parent, out).await
    }

    async fn clone_validated(
        &self,
        repo: &RepoPath,
        parent: &Path,
        out: UnboundedSender<RepoFileStatus>,
    ) -> Result<RunSummary> {
        let mut run = Run::new(repo.to_string(), out);

        let url = self.hosts.remote_url(repo);
        let dest = parent.join(repo.clone_dir());
        if dest.exists() {
            let err = GinError::io(
                format!("Cannot clone {}", repo),
                std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!("{} already exists", dest.display()),
                ),
            );
            return Err(run.abort(err));
        }

        run.transition(RunState::Transferring);
        info!("Cloning repository: {} -> {}", url, dest.display());

        if let Err(e) = self.vcs.clone_repo(&url, &dest).await {
            return Err(run.abort(e));
        }
        let description = format!("gin clone of {}", repo);
        if let Err(e) = self.vcs.annex_init(&dest, &description).await {
            return Err(run.abort(e));
        }
        if let Err(e) = self
            .vcs
            .set_largefiles(&dest, &self.rules.largefiles_expression())
            .await
        {
            warn!("Could not store annex rules in {}: {}", dest.display(), e);
        }

        let files = match self.vcs.list_files(&dest).await {
            Ok(files) => files,
            Err(e) => return Err(run.abort(e)),
        };
        debug!("{} files in {}", files.len(), dest.display());

        for file in files {
            run.emit(&file.path, FileState::Checking, None, None);

            // The policy may disagree with how the file was committed; it is
            // applied on the next upload that touches the file
            let desired = file
                .size
                .map(|size| classify_file(&file.path, size, &self.rules));
            let note = match desired {
                Some(mode) if mode != file.mode => Some(format!("policy: {}", mode)),
                _ => None,
            };

            match file.mode {
                TrackingMode::Direct => {
                    run.emit(&file.path, FileState::Tracked, note.as_deref(), None);
                    run.emit(&file.path, FileState::Done, None, None);
                }
                TrackingMode::Annexed => {
                    run.emit(&file.path, FileState::Annexed, note.as_deref(), None);
                    run.emit(&file.path, FileState::Downloading, None, None);
                    match self.vcs.annex_get(&dest, &file.path).await {
                        Ok(()) => run.emit(&file.path, FileState::Done, None, None),
                        Err(e) => run.fail(&file.path, &e),
                    }
                }
            }
        }

        run.transition(RunState::Finalizing);
        if let Err(e) = self.commit_if_new(&dest, DEFAULT_REMOTE).await {
            return Err(run.abort(e));
        }

        Ok(run.finish())
    }

    /// Stage, commit and push local changes.
    ///
    /// With no `paths`, only tracked files with modifications are considered.
    /// Files whose classification changed since they were committed are
    /// migrated between direct and annexed tracking before transfer. Files
    /// named in `paths` without changes are reported as unmodified.
    pub async fn upload(
        &self,
        workdir: &Path,
        paths: &[PathBuf],
        out: UnboundedSender<RepoFileStatus>,
    ) -> Result<RunSummary> {
        let mut run = Run::new(workdir.display().to_string(), out);

        let changes = match self.vcs.changed_files(workdir, paths).await {
            Ok(changes) => changes,
            Err(e) => return Err(run.abort(e)),
        };
        debug!("{} changed files in {}", changes.len(), workdir.display());

        // An empty remote needs a root commit before anything is staged
        if let Err(e) = self.commit_if_new(workdir, DEFAULT_REMOTE).await {
            return Err(run.abort(e));
        }

        run.transition(RunState::Transferring);
        for path in paths {
            let named_file = workdir.join(path).is_file();
            if named_file && !changes.iter().any(|change| change.path == *path) {
                run.emit(path, FileState::Checking, None, None);
                run.emit(path, FileState::Unmodified, None, None);
            }
        }

        let mut pending = Vec::new();
        for change in changes {
            run.emit(&change.path, FileState::Checking, None, None);
            match self.stage(workdir, &change).await {
                Ok(Staged::Removed) => pending.push(Pending {
                    path: change.path,
                    mode: None,
                }),
                Ok(Staged::Added { mode, migrated }) => {
                    let state = match mode {
                        TrackingMode::Annexed => FileState::Annexed,
                        TrackingMode::Direct => FileState::Tracked,
                    };
                    let detail = migrated.then_some("migrated");
                    run.emit(&change.path, state, detail, None);
                    pending.push(Pending {
                        path: change.path,
                        mode: Some(mode),
                    });
                }
                Err(e) => run.fail(&change.path, &e),
            }
        }

        run.transition(RunState::Finalizing);
        let committed = self
            .vcs
            .commit(workdir, &format!("gin upload from {}", self.hosts.git_host))
            .await;
        if let Err(e) = committed {
            for file in &pending {
                run.fail(&file.path, &e);
            }
            return Ok(run.finish());
        }

        for file in pending.iter().filter(|f| f.mode == Some(TrackingMode::Direct)) {
            run.emit(&file.path, FileState::Uploading, None, None);
        }
        let pushed = self.vcs.push(workdir, DEFAULT_REMOTE).await;
        if let Err(e) = &pushed {
            warn!("Push to {} failed: {}", DEFAULT_REMOTE, e);
            if pending.is_empty() {
                // Nothing staged to carry the failure; earlier commits were not pushed
                let label = PathBuf::from(run.label.clone());
                run.fail(&label, e);
                return Ok(run.finish());
            }
        }

        for file in &pending {
            let outcome = match (&pushed, file.mode) {
                (Err(e), _) => Err(GinError::Vcs(e.to_string())),
                (Ok(()), Some(TrackingMode::Annexed)) => {
                    run.emit(&file.path, FileState::Uploading, None, None);
                    self.vcs
                        .annex_copy(workdir, &file.path, DEFAULT_REMOTE)
                        .await
                        .map(|()| FileState::Done)
                }
                (Ok(()), Some(TrackingMode::Direct)) => Ok(FileState::Done),
                (Ok(()), None) => Ok(FileState::Removed),
            };
            match outcome {
                Ok(state) => run.emit(&file.path, state, None, None),
                Err(e) => run.fail(&file.path, &e),
            }
        }

        Ok(run.finish())
    }

    async fn stage(&self, workdir: &Path, change: &FileChange) -> Result<Staged> {
        if change.kind == ChangeKind::Deleted {
            self.vcs.remove(workdir, &change.path).await?;
            return Ok(Staged::Removed);
        }

        let full = workdir.join(&change.path);
        let size = tokio::fs::metadata(&full)
            .await
            .map_err(|e| GinError::io(format!("Failed to read {}", full.display()), e))?
            .len();
        let desired = classify_file(&change.path, size, &self.rules);

        if change.kind == ChangeKind::Added {
            self.vcs.add(workdir, &change.path, desired).await?;
            return Ok(Staged::Added {
                mode: desired,
                migrated: false,
            });
        }

        let current = if self.vcs.is_annexed(workdir, &change.path).await? {
            TrackingMode::Annexed
        } else {
            TrackingMode::Direct
        };

        if current == desired {
            self.vcs.add(workdir, &change.path, desired).await?;
            Ok(Staged::Added {
                mode: desired,
                migrated: false,
            })
        } else {
            debug!(
                "Migrating {} from {} to {}",
                change.path.display(),
                current,
                desired
            );
            self.vcs.migrate(workdir, &change.path, desired).await?;
            Ok(Staged::Added {
                mode: desired,
                migrated: true,
            })
        }
    }

    /// Create an initial empty commit if the working copy has no history yet,
    /// and make the current branch track `remote`.
    ///
    /// Returns whether a commit was created. A no-op for repositories that
    /// already have history.
    pub async fn commit_if_new(&self, workdir: &Path, remote: &str) -> Result<bool> {
        if self.vcs.has_history(workdir).await? {
            return Ok(false);
        }

        let message = format!("Initial commit: Repository initialised on {}", self.hosts.gin_host);
        self.vcs.commit_empty(workdir, &message).await?;
        self.vcs.set_upstream(workdir, remote).await?;
        info!("Created initial commit in {}", workdir.display());
        Ok(true)
    }
}

enum Staged {
    Removed,
    Added { mode: TrackingMode, migrated: bool },
}
