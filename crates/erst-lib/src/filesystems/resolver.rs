//! PathResolver - virtual path to working-copy path translation
//!
//! Owns the two caches that make repeated access cheap:
//!
//! - the *checkout slot*: which selector is currently materialized in the
//!   working directory (at most one at a time),
//! - the *manifest*: tracked paths as of that selector.
//!
//! Both are replaced together whenever a path names a different selector
//! than the one checked out. Resolutions at the current selector do no VCS
//! work at all.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use super::error::{FsError, FsResult};
use crate::selector::{split_virtual_path, RevisionSelector};
use crate::vcs::{RevisionStore, VcsError, METADATA_DIR};

/// Editor and build housekeeping suffixes that bypass version control
pub const IGNORED_SUFFIXES: &[&str] = &[".swp", ".swpx", ".swo", ".swn", ".o", "~", METADATA_DIR];

/// Whether `path` is housekeeping that never goes through the VCS
pub fn is_ignored(path: &str) -> bool {
    IGNORED_SUFFIXES.iter().any(|suffix| path.ends_with(suffix))
}

/// Whether mutations through `path` are refused, without resolving it.
pub fn is_read_only_path(path: &str) -> bool {
    !is_ignored(path) && split_virtual_path(path).0.is_some()
}

/// What the working directory currently holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckoutState {
    /// Nothing checked out by us yet, or the last switch did not complete
    Unknown,
    /// This selector (`None` = live) is materialized
    Materialized(Option<RevisionSelector>),
}

/// The outcome of resolving one virtual path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Where the bytes live on the host
    pub real_path: PathBuf,
    /// `None` for the live view
    pub selector: Option<RevisionSelector>,
    /// Path inside the selected revision, always starting with `/`
    pub residual: String,
    /// Housekeeping path exempt from revision logic
    pub ignored: bool,
}

impl Resolution {
    pub fn is_historical(&self) -> bool {
        self.selector.is_some()
    }

    /// Mutations through a historical view are refused unless the path is ignored.
    pub fn is_read_only(&self) -> bool {
        self.is_historical() && !self.ignored
    }

    /// The residual as a repository-relative path (`""` for the root)
    pub fn relative(&self) -> &str {
        self.residual.trim_start_matches('/')
    }
}

pub struct PathResolver<S> {
    store: S,
    root: PathBuf,
    checkout: CheckoutState,
    manifest: HashSet<String>,
    /// Bumped every time the working copy is switched
    generation: u64,
}

impl<S: RevisionStore> PathResolver<S> {
    pub fn new(store: S, root: impl AsRef<Path>) -> Self {
        Self {
            store,
            root: root.as_ref().to_path_buf(),
            checkout: CheckoutState::Unknown,
            manifest: HashSet::new(),
            generation: 0,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn checkout_state(&self) -> &CheckoutState {
        &self.checkout
    }

    /// Changes whenever a checkout may have replaced files in the working copy.
    ///
    /// A file opened under one generation may be an unlinked inode under the
    /// next.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn manifest(&self) -> &HashSet<String> {
        &self.manifest
    }

    pub fn is_tracked(&self, relative: &str) -> bool {
        self.manifest.contains(relative)
    }

    /// Record a path that became tracked without a full manifest refresh.
    pub fn track(&mut self, relative: &str) {
        self.manifest.insert(relative.to_string());
    }

    pub fn untrack(&mut self, relative: &str) {
        self.manifest.remove(relative);
    }

    /// Whether `relative` or anything below it is tracked.
    pub fn tracks_any_under(&self, relative: &str) -> bool {
        if self.manifest.contains(relative) {
            return true;
        }
        let prefix = format!("{relative}/");
        self.manifest.iter().any(|path| path.starts_with(&prefix))
    }

    /// Re-read the manifest for the materialized selector.
    pub fn reload_manifest(&mut self) -> FsResult<()> {
        let CheckoutState::Materialized(selector) = &self.checkout else {
            return Ok(());
        };
        let files = self.store.list_files(selector.as_ref(), None)?;
        self.manifest = files.into_iter().collect();
        Ok(())
    }

    /// Resolve `path`, checking out a different revision first if needed.
    ///
    /// With `check_exists`, a non-root residual that is neither tracked nor a
    /// directory on disk is reported as [`FsError::NotFound`]. Ignored paths
    /// are never checked here; the host filesystem reports on them.
    pub fn resolve(&mut self, path: &str, check_exists: bool) -> FsResult<Resolution> {
        let ignored = is_ignored(path);
        let (selector, residual) = split_virtual_path(path);

        self.materialize(selector)?;

        let relative = residual.trim_start_matches('/');
        let real_path = self.root.join(relative);

        if check_exists
            && !ignored
            && !relative.is_empty()
            && !self.manifest.contains(relative)
            && !real_path.is_dir()
        {
            debug!("resolve: {:?} is not tracked at {:?}", path, selector);
            return Err(FsError::NotFound(PathBuf::from(path)));
        }

        Ok(Resolution {
            real_path,
            selector,
            residual,
            ignored,
        })
    }

    /// Make `selector` the materialized revision and reload the manifest.
    fn materialize(&mut self, selector: Option<RevisionSelector>) -> FsResult<()> {
        if self.checkout == CheckoutState::Materialized(selector) {
            return Ok(());
        }

        let description = describe(selector.as_ref());
        debug!("materialize: switching working copy to {}", description);

        let output = self.store.checkout(selector.as_ref())?;
        if !output.success() {
            warn!(
                "materialize: checkout of {} failed: {}",
                description,
                output.stderr.trim()
            );
            return Err(VcsError::Failed {
                command: format!("checkout {description}"),
                output,
            }
            .into());
        }
        self.checkout = CheckoutState::Materialized(selector);
        self.generation += 1;

        match self.store.list_files(selector.as_ref(), None) {
            Ok(files) => {
                debug!("materialize: {} tracked paths at {}", files.len(), description);
                self.manifest = files.into_iter().collect();
                Ok(())
            }
            Err(e) => {
                // The working copy moved but the manifest did not; force a retry.
                self.checkout = CheckoutState::Unknown;
                self.manifest.clear();
                Err(e.into())
            }
        }
    }
}

fn describe(selector: Option<&RevisionSelector>) -> String {
    match selector {
        Some(selector) => selector.to_string(),
        None => "live".to_string(),
    }
}
