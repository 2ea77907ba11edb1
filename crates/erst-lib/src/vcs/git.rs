//! GitStore - [`RevisionStore`] over a git working copy
//!
//! The repository root is both the git working tree and the directory the
//! filesystem exposes. "Viewing revision X" means the working tree
//! currently contains X's files: historical views detach HEAD at the
//! matching commit, the live view re-attaches HEAD to the live branch.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info, warn};

use super::{immediate_children, RevisionStore, VcsCommand, VcsError, VcsOutput, METADATA_DIR};
use crate::config::VcsConfig;
use crate::selector::RevisionSelector;

/// Repository config key holding the live branch across sessions
pub const BRANCH_KEY: &str = "erst.branch";

pub struct GitStore {
    /// Repository root and working tree
    root: PathBuf,
    /// The git executable
    binary: PathBuf,
    /// Per-invocation timeout
    timeout: Option<Duration>,
    /// `user.name` / `user.email` overrides for commits
    identity: Option<(String, String)>,
    /// Branch that represents the live view; learned at initialization
    branch: Option<String>,
}

impl GitStore {
    pub fn new(root: impl AsRef<Path>, config: &VcsConfig) -> Self {
        let identity = match (&config.author_name, &config.author_email) {
            (Some(name), Some(email)) => Some((name.clone(), email.clone())),
            _ => None,
        };

        Self {
            root: root.as_ref().to_path_buf(),
            binary: config.binary.clone(),
            timeout: config.timeout(),
            identity,
            branch: config.branch.clone(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The live branch, once known
    pub fn branch(&self) -> Option<&str> {
        self.branch.as_deref()
    }

    fn git(&self) -> VcsCommand {
        let mut cmd = VcsCommand::new(&self.binary, &self.root).timeout(self.timeout);
        if let Some((name, email)) = &self.identity {
            cmd = cmd
                .arg("-c")
                .arg(format!("user.name={name}"))
                .arg("-c")
                .arg(format!("user.email={email}"));
        }
        // Keep paths in porcelain output byte-exact
        cmd.args(["-c", "core.quotepath=off"])
    }

    fn live_branch(&self) -> Result<&str, VcsError> {
        self.branch
            .as_deref()
            .ok_or_else(|| VcsError::DetachedHead(self.root.clone()))
    }

    /// The branch HEAD is attached to, or `None` when detached.
    fn attached_branch(&self) -> Result<Option<String>, VcsError> {
        let output = self
            .git()
            .args(["symbolic-ref", "--short", "-q", "HEAD"])
            .run()?;
        if output.success() {
            Ok(Some(output.stdout.trim().to_string()))
        } else {
            Ok(None)
        }
    }

    /// The live branch saved by an earlier session.
    fn remembered_branch(&self) -> Result<Option<String>, VcsError> {
        let output = self.git().args(["config", "--get", BRANCH_KEY]).run()?;
        let branch = output.stdout.trim();
        if output.success() && !branch.is_empty() {
            Ok(Some(branch.to_string()))
        } else {
            Ok(None)
        }
    }

    /// Save the live branch so a session that dies while HEAD is detached
    /// can still find its way back.
    fn remember_branch(&self, branch: &str) -> Result<(), VcsError> {
        if self.remembered_branch()?.as_deref() == Some(branch) {
            return Ok(());
        }
        let output = self.git().args(["config", BRANCH_KEY, branch]).run()?;
        if !output.success() {
            warn!("git: could not save live branch: {}", output.stderr.trim());
        }
        Ok(())
    }

    /// The most recent commit on the live branch at or before the selector's cutoff.
    fn resolve_commit(&self, revision: &RevisionSelector) -> Result<String, VcsError> {
        let query = revision.to_query();
        let cmd = self
            .git()
            .args(["rev-list", "-1"])
            .arg(format!("--before={query}"))
            .arg(self.live_branch()?)
            .arg("--");
        let output = cmd.run()?.into_result(cmd.describe())?;

        match output.stdout.split_whitespace().next() {
            Some(commit) => {
                debug!("git: {} resolves to {}", revision, commit);
                Ok(commit.to_string())
            }
            None => Err(VcsError::NoRevision(query)),
        }
    }

    fn run_checked(&self, cmd: VcsCommand) -> Result<VcsOutput, VcsError> {
        let description = cmd.describe();
        cmd.run()?.into_result(description)
    }
}

impl RevisionStore for GitStore {
    fn ensure_initialized(&mut self) -> Result<VcsOutput, VcsError> {
        let mut output = VcsOutput::default();

        if !self.root.join(METADATA_DIR).exists() {
            info!("Initializing git repository in {:?}", self.root);
            output = self.git().args(["init", "-q"]).run()?;
            if !output.success() {
                return Ok(output);
            }
        }

        match self.attached_branch()? {
            Some(branch) => {
                if self.branch.as_deref() != Some(branch.as_str()) {
                    info!("Live branch is '{}'", branch);
                }
                self.remember_branch(&branch)?;
                self.branch = Some(branch);
            }
            None if self.branch.is_some() => {
                info!(
                    "HEAD is detached, will return to '{}' for the live view",
                    self.branch.as_deref().unwrap_or_default()
                );
            }
            None => match self.remembered_branch()? {
                Some(branch) => {
                    info!("HEAD is detached, returning to remembered branch '{}'", branch);
                    self.branch = Some(branch);
                }
                None => return Err(VcsError::DetachedHead(self.root.clone())),
            },
        }

        Ok(output)
    }

    fn list_files(
        &self,
        revision: Option<&RevisionSelector>,
        subtree: Option<&str>,
    ) -> Result<BTreeSet<String>, VcsError> {
        let cmd = match revision {
            None => self.git().args(["ls-files", "-z"]),
            Some(revision) => {
                let commit = self.resolve_commit(revision)?;
                self.git()
                    .args(["ls-tree", "-r", "--name-only", "-z"])
                    .arg(commit)
            }
        };
        let output = self.run_checked(cmd)?;

        let tracked = output.stdout.split('\0').filter(|p| !p.is_empty());
        Ok(match subtree {
            Some(prefix) => immediate_children(tracked, prefix),
            None => tracked.map(str::to_string).collect(),
        })
    }

    fn checkout(&mut self, revision: Option<&RevisionSelector>) -> Result<VcsOutput, VcsError> {
        match revision {
            Some(revision) => {
                let commit = self.resolve_commit(revision)?;
                info!("Checking out {} ({})", revision, commit);
                self.git()
                    .args(["checkout", "-q", "--detach"])
                    .arg(commit)
                    .run()
            }
            None => {
                let branch = self.live_branch()?.to_string();
                if self.attached_branch()?.as_deref() == Some(branch.as_str()) {
                    // Already live; an unborn branch can't be checked out anyway.
                    return Ok(VcsOutput::default());
                }
                info!("Checking out live branch '{}'", branch);
                self.git().args(["checkout", "-q"]).arg(branch).run()
            }
        }
    }

    fn stage_add(&mut self, path: &str) -> Result<VcsOutput, VcsError> {
        self.git().args(["add", "-A", "--"]).arg(path).run()
    }

    fn stage_remove(&mut self, path: &str) -> Result<VcsOutput, VcsError> {
        self.git().args(["rm", "-q", "-f", "--"]).arg(path).run()
    }

    fn commit(&mut self, paths: &[&str], message: &str) -> Result<VcsOutput, VcsError> {
        self.git()
            .args(["commit", "-q", "--no-verify", "-m"])
            .arg(message)
            .arg("--")
            .args(paths)
            .run()
    }

    fn has_changes(&self, paths: &[&str]) -> Result<bool, VcsError> {
        let cmd = self
            .git()
            .args(["status", "--porcelain", "-z", "--"])
            .args(paths);
        let output = self.run_checked(cmd)?;
        Ok(!output.stdout.is_empty())
    }
}

impl std::fmt::Debug for GitStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitStore")
            .field("root", &self.root)
            .field("binary", &self.binary)
            .field("branch", &self.branch)
            .finish()
    }
}
