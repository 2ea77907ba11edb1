//! Version-control backend for erst
//!
//! The [`RevisionStore`] trait is the only seam through which the rest of
//! the crate touches history. [`GitStore`] implements it by shelling out to
//! the `git` binary through [`VcsCommand`].
//!
//! ## Modules
//!
//! - [`command`]: argument-vector subprocess runner with timeouts
//! - [`git`]: the git-backed store

pub mod command;
pub mod git;

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::selector::RevisionSelector;

pub use command::VcsCommand;
pub use git::GitStore;

/// Name of the VCS metadata directory inside the repository root
pub const METADATA_DIR: &str = ".git";

#[derive(Error, Debug)]
pub enum VcsError {
    #[error("Failed to run {program:?}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` did not finish within {after:?}")]
    Timeout { command: String, after: Duration },

    #[error("`{command}` exited with status {}: {}", .output.status, .output.stderr.trim())]
    Failed { command: String, output: VcsOutput },

    #[error("No revision at or before {0}")]
    NoRevision(String),

    #[error("HEAD is detached in {0} and no live branch is configured")]
    DetachedHead(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Exit status and captured streams of one VCS invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VcsOutput {
    /// Exit code, `-1` when the process was killed by a signal
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl VcsOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Promote a non-zero exit into [`VcsError::Failed`].
    pub fn into_result(self, command: impl Into<String>) -> Result<Self, VcsError> {
        if self.success() {
            Ok(self)
        } else {
            Err(VcsError::Failed {
                command: command.into(),
                output: self,
            })
        }
    }
}

/// A version-controlled working copy that can be viewed at past revisions.
///
/// Paths are relative to the repository root and use forward slashes.
/// A `revision` of `None` means the live working tree.
pub trait RevisionStore {
    /// Create the VCS metadata if the root has none yet.
    fn ensure_initialized(&mut self) -> Result<VcsOutput, VcsError>;

    /// Tracked paths at `revision`.
    ///
    /// With a `subtree` filter only the first path segment below that prefix
    /// is returned for each tracked file underneath it, i.e. the immediate
    /// children of that directory. The live manifest reflects the index, not
    /// whatever revision was last checked out.
    fn list_files(
        &self,
        revision: Option<&RevisionSelector>,
        subtree: Option<&str>,
    ) -> Result<BTreeSet<String>, VcsError>;

    /// Materialize `revision` in the working directory.
    fn checkout(&mut self, revision: Option<&RevisionSelector>) -> Result<VcsOutput, VcsError>;

    fn stage_add(&mut self, path: &str) -> Result<VcsOutput, VcsError>;

    /// Remove `path` from the index and the working tree. A non-zero exit
    /// means there is nothing to commit.
    fn stage_remove(&mut self, path: &str) -> Result<VcsOutput, VcsError>;

    fn commit(&mut self, paths: &[&str], message: &str) -> Result<VcsOutput, VcsError>;

    /// Whether the working tree or index differs from the last commit for any of `paths`.
    fn has_changes(&self, paths: &[&str]) -> Result<bool, VcsError>;
}

/// Narrow a manifest to the immediate children of `prefix`.
///
/// ```
/// use erst_lib::vcs::immediate_children;
///
/// let tracked = ["a/b/c.txt", "a/b/d.txt", "a/e.txt", "f.txt"];
/// let children = immediate_children(tracked, "a");
/// assert_eq!(children.into_iter().collect::<Vec<_>>(), ["b", "e.txt"]);
/// ```
pub fn immediate_children<'a, I>(paths: I, prefix: &str) -> BTreeSet<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let prefix = prefix.trim_matches('/');
    paths
        .into_iter()
        .filter_map(|path| {
            let rest = if prefix.is_empty() {
                path
            } else {
                path.strip_prefix(prefix)?.strip_prefix('/')?
            };
            rest.split('/')
                .next()
                .filter(|segment| !segment.is_empty())
                .map(str::to_string)
        })
        .collect()
}
