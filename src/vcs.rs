use async_trait::async_trait;
use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::Output;
use tokio::process::Command as AsyncCommand;
use tracing::debug;

use crate::annex::TrackingMode;
use crate::config::Config;
use crate::error::{GinError, Result};

/// A file present in a working copy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoFile {
    /// Path relative to the repository root
    pub path: PathBuf,
    pub mode: TrackingMode,
    /// Content size in bytes, if known
    pub size: Option<u64>,
}

/// Kind of local change reported for a path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Not tracked yet (new file or staged addition)
    Added,
    /// Tracked and changed
    Modified,
    /// Tracked and removed from the working tree
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

/// Version-control capabilities the synchronization engine relies on.
///
/// All paths passed alongside a `workdir` are relative to that working copy.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Vcs: Send + Sync {
    /// Clone `url` into `dest`
    async fn clone_repo(&self, url: &str, dest: &Path) -> Result<()>;

    /// Initialise the annex in a working copy
    async fn annex_init(&self, workdir: &Path, description: &str) -> Result<()>;

    /// Store the annex size/pattern policy in the repository configuration
    async fn set_largefiles(&self, workdir: &Path, expression: &str) -> Result<()>;

    /// All tracked files with their current tracking mode
    async fn list_files(&self, workdir: &Path) -> Result<Vec<RepoFile>>;

    /// Fetch annexed content for one file
    async fn annex_get(&self, workdir: &Path, path: &Path) -> Result<()>;

    /// Local changes. An empty filter means tracked files only; with filters,
    /// untracked files below them are included.
    async fn changed_files(&self, workdir: &Path, filters: &[PathBuf]) -> Result<Vec<FileChange>>;

    /// Whether a tracked file is currently annexed
    async fn is_annexed(&self, workdir: &Path, path: &Path) -> Result<bool>;

    /// Stage a file in the given mode
    async fn add(&self, workdir: &Path, path: &Path, mode: TrackingMode) -> Result<()>;

    /// Re-stage a tracked file in the other mode
    async fn migrate(&self, workdir: &Path, path: &Path, to: TrackingMode) -> Result<()>;

    /// Stage the removal of a file
    async fn remove(&self, workdir: &Path, path: &Path) -> Result<()>;

    /// Commit staged changes; `false` when nothing was staged
    async fn commit(&self, workdir: &Path, message: &str) -> Result<bool>;

    /// Whether the working copy has at least one commit
    async fn has_history(&self, workdir: &Path) -> Result<bool>;

    async fn commit_empty(&self, workdir: &Path, message: &str) -> Result<()>;

    /// Make the current branch track `remote`
    async fn set_upstream(&self, workdir: &Path, remote: &str) -> Result<()>;

    /// Push branches (including annex metadata) to `remote`
    async fn push(&self, workdir: &Path, remote: &str) -> Result<()>;

    /// Copy annexed content for one file to `remote`
    async fn annex_copy(&self, workdir: &Path, path: &Path, remote: &str) -> Result<()>;
}

/// [`Vcs`] implementation driving the `git` and `git-annex` binaries
#[derive(Debug, Clone)]
pub struct GitAnnexCli {
    git: String,
    annex: String,
    ssh_command: Option<String>,
}

impl GitAnnexCli {
    /// Use the binaries from `config`. When `known_hosts` is given, ssh
    /// connections are verified against that file only.
    pub fn new(config: &Config, known_hosts: Option<&Path>) -> Self {
        Self {
            git: config.bin.git.clone(),
            annex: config.bin.gitannex.clone(),
            ssh_command: known_hosts.map(|file| ssh_command(&config.bin.ssh, file)),
        }
    }

    fn command(&self, program: &str, workdir: Option<&Path>) -> AsyncCommand {
        let mut cmd = AsyncCommand::new(program);
        if let Some(dir) = workdir {
            cmd.current_dir(dir);
        }
        if let Some(ssh) = &self.ssh_command {
            cmd.env("GIT_SSH_COMMAND", ssh);
        }
        cmd.kill_on_drop(true);
        cmd
    }

    async fn git<I, S>(&self, workdir: Option<&Path>, args: I) -> Result<Output>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = self.command(&self.git, workdir);
        cmd.args(args);
        run_checked(&self.git, cmd).await
    }

    async fn annex<I, S>(&self, workdir: &Path, args: I) -> Result<Output>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = self.command(&self.annex, Some(workdir));
        cmd.args(args);
        run_checked(&self.annex, cmd).await
    }

    /// Run git and report only whether it exited successfully
    async fn git_succeeds<I, S>(&self, workdir: &Path, args: I) -> Result<bool>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = self.command(&self.git, Some(workdir));
        cmd.args(args);
        Ok(run(&self.git, cmd).await?.status.success())
    }
}

#[async_trait]
impl Vcs for GitAnnexCli {
    async fn clone_repo(&self, url: &str, dest: &Path) -> Result<()> {
        self.git(None, [OsStr::new("clone"), OsStr::new(url), dest.as_os_str()])
            .await?;
        Ok(())
    }

    async fn annex_init(&self, workdir: &Path, description: &str) -> Result<()> {
        self.annex(workdir, ["init", description]).await?;
        Ok(())
    }

    async fn set_largefiles(&self, workdir: &Path, expression: &str) -> Result<()> {
        self.git(Some(workdir), ["config", "annex.largefiles", expression])
            .await?;
        Ok(())
    }

    async fn list_files(&self, workdir: &Path) -> Result<Vec<RepoFile>> {
        let tracked = self.git(Some(workdir), ["ls-files", "-z"]).await?;
        let annexed = self
            .annex(
                workdir,
                ["find", "--include=*", "--format=${file}\t${bytesize}\n"],
            )
            .await?;

        Ok(join_listing(
            workdir,
            &tracked.stdout,
            &String::from_utf8_lossy(&annexed.stdout),
        ))
    }

    async fn annex_get(&self, workdir: &Path, path: &Path) -> Result<()> {
        self.annex(workdir, [OsStr::new("get"), OsStr::new("--"), path.as_os_str()])
            .await?;
        Ok(())
    }

    async fn changed_files(&self, workdir: &Path, filters: &[PathBuf]) -> Result<Vec<FileChange>> {
        let untracked = if filters.is_empty() {
            "--untracked-files=no"
        } else {
            "--untracked-files=all"
        };

        let mut args: Vec<OsString> = ["status", "--porcelain=v1", "-z", untracked, "--"]
            .iter()
            .map(OsString::from)
            .collect();
        args.extend(filters.iter().map(|p| p.as_os_str().to_owned()));

        let output = self.git(Some(workdir), &args).await?;
        Ok(parse_status_z(&output.stdout))
    }

    async fn is_annexed(&self, workdir: &Path, path: &Path) -> Result<bool> {
        let mut cmd = self.command(&self.annex, Some(workdir));
        cmd.args([OsStr::new("lookupkey"), OsStr::new("--"), path.as_os_str()]);
        Ok(run(&self.annex, cmd).await?.status.success())
    }

    async fn add(&self, workdir: &Path, path: &Path, mode: TrackingMode) -> Result<()> {
        match mode {
            TrackingMode::Direct => {
                self.git(
                    Some(workdir),
                    [
                        OsStr::new("-c"),
                        OsStr::new("annex.largefiles=nothing"),
                        OsStr::new("add"),
                        OsStr::new("--"),
                        path.as_os_str(),
                    ],
                )
                .await?;
            }
            TrackingMode::Annexed => {
                self.annex(
                    workdir,
                    [
                        OsStr::new("add"),
                        OsStr::new("--force-large"),
                        OsStr::new("--"),
                        path.as_os_str(),
                    ],
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn migrate(&self, workdir: &Path, path: &Path, to: TrackingMode) -> Result<()> {
        if to == TrackingMode::Direct {
            // Locked annexed files are symlinks; materialise the content first
            self.annex(workdir, [OsStr::new("unlock"), OsStr::new("--"), path.as_os_str()])
                .await?;
        }
        self.git(
            Some(workdir),
            [
                OsStr::new("rm"),
                OsStr::new("--cached"),
                OsStr::new("-q"),
                OsStr::new("--"),
                path.as_os_str(),
            ],
        )
        .await?;
        self.add(workdir, path, to).await
    }

    async fn remove(&self, workdir: &Path, path: &Path) -> Result<()> {
        self.git(
            Some(workdir),
            [
                OsStr::new("rm"),
                OsStr::new("-q"),
                OsStr::new("--ignore-unmatch"),
                OsStr::new("--"),
                path.as_os_str(),
            ],
        )
        .await?;
        Ok(())
    }

    async fn commit(&self, workdir: &Path, message: &str) -> Result<bool> {
        if self
            .git_succeeds(workdir, ["diff", "--cached", "--quiet"])
            .await?
        {
            debug!("Nothing staged in {}", workdir.display());
            return Ok(false);
        }
        self.git(Some(workdir), ["commit", "-q", "-m", message]).await?;
        Ok(true)
    }

    async fn has_history(&self, workdir: &Path) -> Result<bool> {
        self.git_succeeds(workdir, ["rev-parse", "--verify", "-q", "HEAD"])
            .await
    }

    async fn commit_empty(&self, workdir: &Path, message: &str) -> Result<()> {
        self.git(Some(workdir), ["commit", "-q", "--allow-empty", "-m", message])
            .await?;
        Ok(())
    }

    async fn set_upstream(&self, workdir: &Path, remote: &str) -> Result<()> {
        let output = self
            .git(Some(workdir), ["symbolic-ref", "--short", "HEAD"])
            .await?;
        let branch = String::from_utf8_lossy(&output.stdout).trim().to_string();

        let remote_key = format!("branch.{}.remote", branch);
        let merge_key = format!("branch.{}.merge", branch);
        let merge_ref = format!("refs/heads/{}", branch);

        self.git(Some(workdir), ["config", remote_key.as_str(), remote])
            .await?;
        self.git(
            Some(workdir),
            ["config", merge_key.as_str(), merge_ref.as_str()],
        )
        .await?;
        Ok(())
    }

    async fn push(&self, workdir: &Path, remote: &str) -> Result<()> {
        self.annex(
            workdir,
            ["sync", "--no-pull", "--no-commit", "--no-content", remote],
        )
        .await?;
        Ok(())
    }

    async fn annex_copy(&self, workdir: &Path, path: &Path, remote: &str) -> Result<()> {
        let to = format!("--to={}", remote);
        self.annex(
            workdir,
            [
                OsStr::new("copy"),
                OsStr::new(&to),
                OsStr::new("--"),
                path.as_os_str(),
            ],
        )
        .await?;
        Ok(())
    }
}

/// Write the configured host key to `<root>/known_hosts` and return its path
pub fn write_known_hosts(root: &Path, hostkey: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(root)
        .map_err(|e| GinError::io(format!("Failed to create config directory {:?}", root), e))?;
    let path = root.join("known_hosts");
    std::fs::write(&path, format!("{}\n", hostkey.trim()))
        .map_err(|e| GinError::io(format!("Failed to write {:?}", path), e))?;
    Ok(path)
}

fn ssh_command(ssh: &str, known_hosts: &Path) -> String {
    format!(
        "{} -o StrictHostKeyChecking=yes -o UserKnownHostsFile=\"{}\"",
        ssh,
        known_hosts.display()
    )
}

async fn run(program: &str, mut cmd: AsyncCommand) -> Result<Output> {
    debug!("Running {:?}", cmd.as_std());
    cmd.output()
        .await
        .map_err(|e| GinError::Vcs(format!("Failed to execute {}: {}", program, e)))
}

async fn run_checked(program: &str, cmd: AsyncCommand) -> Result<Output> {
    let output = run(program, cmd).await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GinError::Vcs(format!("{} failed: {}", program, stderr.trim())));
    }
    Ok(output)
}

fn split_nul(bytes: &[u8]) -> impl Iterator<Item = String> + '_ {
    bytes
        .split(|b| *b == 0)
        .filter(|entry| !entry.is_empty())
        .map(|entry| String::from_utf8_lossy(entry).into_owned())
}

/// Parse `git status --porcelain=v1 -z` output
fn parse_status_z(bytes: &[u8]) -> Vec<FileChange> {
    let mut changes = Vec::new();
    let mut entries = split_nul(bytes);

    while let Some(entry) = entries.next() {
        if entry.len() < 4 {
            continue;
        }
        let (code, path) = entry.split_at(3);
        let mut code = code.chars();
        let x = code.next().unwrap_or(' ');
        let y = code.next().unwrap_or(' ');

        // Renames and copies carry the source path as the next entry
        if matches!(x, 'R' | 'C') {
            entries.next();
        }

        let kind = if x == 'D' || y == 'D' {
            ChangeKind::Deleted
        } else if x == '?' || x == 'A' {
            ChangeKind::Added
        } else if matches!(x, 'R' | 'C') {
            ChangeKind::Added
        } else {
            ChangeKind::Modified
        };

        changes.push(FileChange {
            path: PathBuf::from(path),
            kind,
        });
    }

    changes
}

/// Parse `git-annex find --format='${file}\t${bytesize}\n'` output
/// Pair `git ls-files -z` output with `git annex find` output
fn join_listing(workdir: &Path, tracked: &[u8], annex_find: &str) -> Vec<RepoFile> {
    let annexed: HashMap<PathBuf, Option<u64>> =
        parse_annex_find(annex_find).into_iter().collect();
    let mut files = Vec::new();

    for path in split_nul(tracked) {
        let path = PathBuf::from(path);
        match annexed.get(&path) {
            Some(size) => files.push(RepoFile {
                path,
                mode: TrackingMode::Annexed,
                size: *size,
            }),
            None => {
                let size = std::fs::symlink_metadata(workdir.join(&path))
                    .ok()
                    .map(|m| m.len());
                files.push(RepoFile {
                    path,
                    mode: TrackingMode::Direct,
                    size,
                });
            }
        }
    }

    files
}

fn parse_annex_find(output: &str) -> Vec<(PathBuf, Option<u64>)> {
    output
        .lines()
        .filter(|line| !line.is_empty())
        .map(|line| match line.rsplit_once('\t') {
            Some((file, size)) => (PathBuf::from(file), size.trim().parse().ok()),
            None => (PathBuf::from(line), None),
        })
        .collect()
}
