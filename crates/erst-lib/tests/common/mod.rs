//! Common test utilities for erst
//!
//! Builds throwaway git repositories with commits at fixed dates so the
//! history tests do not depend on when they run.

#![allow(dead_code)]

use std::cell::Cell;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;

use erst_lib::config::VcsConfig;
use erst_lib::filesystems::FilesystemGateway;
use erst_lib::selector::RevisionSelector;
use erst_lib::vcs::{GitStore, RevisionStore, VcsError, VcsOutput};

pub const AUTHOR_NAME: &str = "Erst Test";
pub const AUTHOR_EMAIL: &str = "erst@example.com";

/// Whether a usable `git` is on PATH. History tests skip themselves without it.
pub fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

/// A temporary git repository on branch `main`
pub struct GitRepo {
    dir: TempDir,
}

impl GitRepo {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let repo = Self { dir };
        repo.git(&["init", "-q"]);
        repo.git(&["symbolic-ref", "HEAD", "refs/heads/main"]);
        repo
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn file(&self, relative: &str) -> PathBuf {
        self.dir.path().join(relative)
    }

    /// Run git in the repository, panicking on failure.
    pub fn git(&self, args: &[&str]) -> String {
        self.git_at(args, None)
    }

    /// Write `content` to `relative` and commit it with author and committer
    /// dates set to `date`, a local time such as `2014-01-05 10:00:00`.
    pub fn commit_file(&self, relative: &str, content: &str, date: &str) {
        let path = self.file(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, content).unwrap();
        self.git(&["add", "--", relative]);
        self.git_at(
            &["commit", "-q", "--no-verify", "-m", &format!("Write {relative}")],
            Some(date),
        );
    }

    /// Number of commits reachable from `main`
    pub fn commit_count(&self) -> usize {
        let out = Command::new("git")
            .args(["rev-list", "--count", "main"])
            .current_dir(self.path())
            .output()
            .unwrap();
        String::from_utf8_lossy(&out.stdout).trim().parse().unwrap_or(0)
    }

    /// Commit subjects on `main`, newest first
    pub fn subjects(&self) -> Vec<String> {
        self.git(&["log", "--format=%s", "main"])
            .lines()
            .map(str::to_string)
            .collect()
    }

    /// Paths committed at the tip of `main`
    pub fn tracked_at_head(&self) -> BTreeSet<String> {
        self.git(&["ls-tree", "-r", "--name-only", "main"])
            .lines()
            .map(str::to_string)
            .collect()
    }

    pub fn vcs_config() -> VcsConfig {
        VcsConfig {
            author_name: Some(AUTHOR_NAME.to_string()),
            author_email: Some(AUTHOR_EMAIL.to_string()),
            ..VcsConfig::default()
        }
    }

    pub fn store(&self) -> GitStore {
        GitStore::new(self.path(), &Self::vcs_config())
    }

    pub fn gateway(&self) -> FilesystemGateway<CountingStore<GitStore>> {
        FilesystemGateway::new(CountingStore::new(self.store()), self.path()).unwrap()
    }

    fn git_at(&self, args: &[&str], date: Option<&str>) -> String {
        let mut cmd = Command::new("git");
        cmd.args(["-c", &format!("user.name={AUTHOR_NAME}")])
            .args(["-c", &format!("user.email={AUTHOR_EMAIL}")])
            .args(["-c", "commit.gpgsign=false"])
            .args(args)
            .current_dir(self.path());
        if let Some(date) = date {
            cmd.env("GIT_AUTHOR_DATE", date)
                .env("GIT_COMMITTER_DATE", date);
        }
        let out = cmd.output().unwrap();
        assert!(
            out.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&out.stderr)
        );
        String::from_utf8_lossy(&out.stdout).into_owned()
    }
}

/// Wraps a store and counts the VCS work done through it.
pub struct CountingStore<S> {
    inner: S,
    pub checkouts: usize,
    pub listings: Cell<usize>,
    pub commits: usize,
}

impl<S> CountingStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            checkouts: 0,
            listings: Cell::new(0),
            commits: 0,
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: RevisionStore> RevisionStore for CountingStore<S> {
    fn ensure_initialized(&mut self) -> Result<VcsOutput, VcsError> {
        self.inner.ensure_initialized()
    }

    fn list_files(
        &self,
        revision: Option<&RevisionSelector>,
        subtree: Option<&str>,
    ) -> Result<BTreeSet<String>, VcsError> {
        self.listings.set(self.listings.get() + 1);
        self.inner.list_files(revision, subtree)
    }

    fn checkout(&mut self, revision: Option<&RevisionSelector>) -> Result<VcsOutput, VcsError> {
        self.checkouts += 1;
        self.inner.checkout(revision)
    }

    fn stage_add(&mut self, path: &str) -> Result<VcsOutput, VcsError> {
        self.inner.stage_add(path)
    }

    fn stage_remove(&mut self, path: &str) -> Result<VcsOutput, VcsError> {
        self.inner.stage_remove(path)
    }

    fn commit(&mut self, paths: &[&str], message: &str) -> Result<VcsOutput, VcsError> {
        self.commits += 1;
        self.inner.commit(paths, message)
    }

    fn has_changes(&self, paths: &[&str]) -> Result<bool, VcsError> {
        self.inner.has_changes(paths)
    }
}
