//! FilesystemGateway - path-level filesystem verbs over a revision store
//!
//! Every call first resolves its virtual path, which may switch the
//! working copy to another revision. What happens next depends on the
//! resolution:
//!
//! - **Live** (no selector): ordinary host I/O, with creates, removals and
//!   closed writes recorded as commits.
//! - **Historical** (selector present): read-only. Mutations are refused with
//!   [`FsError::PermissionDenied`] before any I/O happens.
//! - **Ignored** (housekeeping suffix): plain host I/O regardless of selector,
//!   never recorded.
//!
//! Writes are not committed one buffer at a time: a handle that was written
//! to is committed once, when it is released.

use std::collections::HashMap;
use std::fs::{self, File, Metadata, OpenOptions};
use std::os::unix::fs::{FileExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use log::{debug, error, info, warn};
use nix::fcntl::AT_FDCWD;
use nix::sys::stat::{utimensat, UtimensatFlags};
use nix::sys::statvfs::{statvfs, Statvfs};
use nix::sys::time::TimeSpec;
use nix::unistd::{access, chown, AccessFlags, Gid, Uid};

use super::error::{FsError, FsResult, IoErrorExt};
use super::resolver::{PathResolver, Resolution};
use crate::config::CommitFailurePolicy;
use crate::vcs::{RevisionStore, VcsError, VcsOutput};

/// An open file and what its path resolved to at open time
struct OpenFile {
    file: File,
    /// Virtual path, re-resolved before anything touches the working copy
    path: String,
    resolution: Resolution,
    readable: bool,
    writable: bool,
    append: bool,
    /// Checkout generation the file was opened under
    generation: u64,
    /// Written or truncated since open; committed on release
    dirty: bool,
}

pub struct FilesystemGateway<S> {
    resolver: PathResolver<S>,
    /// Stat of the repository root taken at startup
    root_attr: Metadata,
    handles: HashMap<u64, OpenFile>,
    next_fh: u64,
    on_commit_failure: CommitFailurePolicy,
}

impl<S: RevisionStore> FilesystemGateway<S> {
    /// Open the repository at `root`, initializing version control if needed.
    pub fn new(mut store: S, root: impl AsRef<Path>) -> FsResult<Self> {
        let root = root.as_ref().to_path_buf();

        if !root.is_dir() {
            return Err(FsError::InvalidPath(root));
        }

        let output = store.ensure_initialized()?;
        if !output.success() {
            error!("Failed to initialize version control in {:?}", root);
            return Err(VcsError::Failed {
                command: "init".to_string(),
                output,
            }
            .into());
        }

        let root_attr = fs::metadata(&root)?;
        info!("Serving history of {:?}", root);

        Ok(Self {
            resolver: PathResolver::new(store, &root),
            root_attr,
            handles: HashMap::new(),
            next_fh: 1,
            on_commit_failure: CommitFailurePolicy::default(),
        })
    }

    pub fn with_commit_failure_policy(mut self, policy: CommitFailurePolicy) -> Self {
        self.on_commit_failure = policy;
        self
    }

    pub fn root(&self) -> &Path {
        self.resolver.root()
    }

    pub fn resolver(&self) -> &PathResolver<S> {
        &self.resolver
    }

    pub fn resolver_mut(&mut self) -> &mut PathResolver<S> {
        &mut self.resolver
    }

    /// Number of open file handles
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    /// Put the live branch back into the working copy.
    pub fn checkout_live(&mut self) -> FsResult<()> {
        self.resolver.resolve("/", false).map(|_| ())
    }

    // =========================================================================
    // Attributes and listing
    // =========================================================================

    pub fn getattr(&mut self, path: &str) -> FsResult<Metadata> {
        debug!("getattr({:?})", path);
        if path == "/" {
            return Ok(self.root_attr.clone());
        }
        let res = self.resolver.resolve(path, true)?;
        fs::symlink_metadata(&res.real_path).map_err(|e| e.into_fs_error(path))
    }

    /// Entry names of a directory at the path's revision, `.` and `..` first.
    pub fn readdir(&mut self, path: &str) -> FsResult<impl Iterator<Item = String>> {
        debug!("readdir({:?})", path);
        let res = self.resolver.resolve(path, true)?;
        let children = self
            .resolver
            .store()
            .list_files(res.selector.as_ref(), Some(res.relative()))?;

        Ok([".".to_string(), "..".to_string()]
            .into_iter()
            .chain(children))
    }

    pub fn readlink(&mut self, path: &str) -> FsResult<PathBuf> {
        debug!("readlink({:?})", path);
        let res = self.resolver.resolve(path, true)?;
        fs::read_link(&res.real_path).map_err(|e| e.into_fs_error(path))
    }

    pub fn access(&mut self, path: &str, mask: i32) -> FsResult<()> {
        debug!("access({:?}, mask=0x{:x})", path, mask);
        let res = self.resolver.resolve(path, true)?;
        let flags = AccessFlags::from_bits_truncate(mask);
        if res.is_read_only() && flags.contains(AccessFlags::W_OK) {
            return Err(FsError::PermissionDenied(PathBuf::from(path)));
        }
        Ok(access(&res.real_path, flags)?)
    }

    pub fn statfs(&self) -> FsResult<Statvfs> {
        Ok(statvfs(self.resolver.root())?)
    }

    // =========================================================================
    // File handles
    // =========================================================================

    pub fn open(&mut self, path: &str, flags: i32) -> FsResult<u64> {
        debug!("open({:?}, flags=0x{:x})", path, flags);
        let res = self.resolver.resolve(path, true)?;
        let writable = flags & libc::O_ACCMODE != libc::O_RDONLY
            || flags & (libc::O_TRUNC | libc::O_APPEND) != 0;
        if writable {
            self.deny_if_read_only(path, &res)?;
        }

        let mut options = OpenOptions::new();
        match flags & libc::O_ACCMODE {
            libc::O_WRONLY => {
                options.write(true);
            }
            libc::O_RDWR => {
                options.read(true).write(true);
            }
            _ => {
                options.read(true);
            }
        }
        if flags & libc::O_APPEND != 0 {
            options.append(true);
        }
        if flags & libc::O_TRUNC != 0 {
            options.truncate(true);
        }
        options.custom_flags(
            flags & !(libc::O_ACCMODE | libc::O_APPEND | libc::O_TRUNC | libc::O_CREAT),
        );

        let file = options
            .open(&res.real_path)
            .map_err(|e| e.into_fs_error(path))?;
        Ok(self.insert_handle(OpenFile {
            file,
            path: path.to_string(),
            dirty: flags & libc::O_TRUNC != 0,
            readable: flags & libc::O_ACCMODE != libc::O_WRONLY,
            writable,
            append: flags & libc::O_APPEND != 0,
            generation: self.resolver.generation(),
            resolution: res,
        }))
    }

    /// Create and open a new file.
    ///
    /// Outside ignored paths the new file is added and committed at once, so
    /// it shows up in listings before anything is written to it.
    pub fn create(&mut self, path: &str, mode: u32, flags: i32) -> FsResult<(u64, Metadata)> {
        debug!("create({:?}, mode=0o{:o}, flags=0x{:x})", path, mode, flags);
        let res = self.resolver.resolve(path, false)?;
        self.deny_if_read_only(path, &res)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(flags & libc::O_TRUNC != 0)
            .mode(mode)
            .open(&res.real_path)
            .map_err(|e| e.into_fs_error(path))?;
        let attr = file.metadata()?;

        if !res.ignored {
            let relative = res.relative().to_string();
            let added = self.resolver.store_mut().stage_add(&relative)?;
            self.check_vcs("add", &relative, added)?;
            self.record(&[&relative], &format!("Create {relative}"))?;
            self.resolver.track(&relative);
        }

        let fh = self.insert_handle(OpenFile {
            file,
            path: path.to_string(),
            dirty: false,
            readable: true,
            writable: true,
            append: false,
            generation: self.resolver.generation(),
            resolution: res,
        });
        Ok((fh, attr))
    }

    pub fn read(&mut self, fh: u64, offset: u64, size: u32) -> FsResult<Vec<u8>> {
        debug!("read(fh={}, offset={}, size={})", fh, offset, size);
        let handle = self.handles.get(&fh).ok_or(FsError::BadHandle(fh))?;
        let mut buf = vec![0u8; size as usize];
        let n = handle.file.read_at(&mut buf, offset)?;
        buf.truncate(n);
        Ok(buf)
    }

    pub fn write(&mut self, fh: u64, data: &[u8], offset: u64) -> FsResult<usize> {
        debug!("write(fh={}, offset={}, len={})", fh, offset, data.len());
        let path = self.handle_path(fh)?;
        let res = self.resolver.resolve(&path, false)?;
        self.deny_if_read_only(&path, &res)?;
        self.refresh_handle(fh, &res)?;

        let handle = self.handles.get_mut(&fh).ok_or(FsError::BadHandle(fh))?;
        if !handle.writable {
            return Err(FsError::Io(std::io::Error::from_raw_os_error(libc::EBADF)));
        }
        let n = handle.file.write_at(data, offset)?;
        handle.dirty = true;
        Ok(n)
    }

    pub fn flush(&mut self, fh: u64) -> FsResult<()> {
        debug!("flush(fh={})", fh);
        match self.handles.get(&fh) {
            Some(handle) if handle.writable => match handle.file.sync_all() {
                Err(e) if e.raw_os_error() == Some(libc::EBADF) => Ok(()),
                other => Ok(other?),
            },
            // Read-only or already closed
            _ => Ok(()),
        }
    }

    pub fn fsync(&mut self, fh: u64, datasync: bool) -> FsResult<()> {
        debug!("fsync(fh={}, datasync={})", fh, datasync);
        let handle = self.handles.get(&fh).ok_or(FsError::BadHandle(fh))?;
        if datasync {
            handle.file.sync_data()?;
        } else {
            handle.file.sync_all()?;
        }
        Ok(())
    }

    /// Close a handle, committing everything written through it.
    pub fn release(&mut self, fh: u64) -> FsResult<()> {
        debug!("release(fh={})", fh);
        let handle = self.handles.remove(&fh).ok_or(FsError::BadHandle(fh))?;
        let OpenFile {
            file,
            path,
            resolution,
            dirty,
            ..
        } = handle;
        drop(file);

        if !dirty || resolution.is_historical() || resolution.ignored {
            return Ok(());
        }

        // Another path may have switched the working copy since open.
        let res = self.resolver.resolve(&path, false)?;
        let relative = res.relative().to_string();
        self.record(&[&relative], &format!("Update {relative}"))
    }

    // =========================================================================
    // Mutations by path
    // =========================================================================

    pub fn unlink(&mut self, path: &str) -> FsResult<()> {
        debug!("unlink({:?})", path);
        let res = self.resolver.resolve(path, true)?;

        if res.ignored {
            return fs::remove_file(&res.real_path).map_err(|e| e.into_fs_error(path));
        }
        self.deny_if_read_only(path, &res)?;

        let relative = res.relative().to_string();
        let removed = self.resolver.store_mut().stage_remove(&relative)?;
        if removed.success() {
            self.record(&[&relative], &format!("Remove {relative}"))?;
        } else {
            warn!(
                "unlink: {} is not tracked ({}), removing without a commit",
                relative,
                removed.stderr.trim()
            );
            if let Err(e) = fs::remove_file(&res.real_path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(e.into());
                }
            }
        }
        self.resolver.untrack(&relative);
        Ok(())
    }

    /// Truncate through an open handle when given, else by path.
    pub fn truncate(&mut self, path: &str, size: u64, fh: Option<u64>) -> FsResult<()> {
        debug!("truncate({:?}, size={}, fh={:?})", path, size, fh);
        let res = self.resolver.resolve(path, true)?;
        self.deny_if_read_only(path, &res)?;

        let writable_fh = fh.filter(|fh| self.handles.get(fh).is_some_and(|h| h.writable));
        if let Some(fh) = writable_fh {
            self.refresh_handle(fh, &res)?;
            let handle = self.handles.get_mut(&fh).ok_or(FsError::BadHandle(fh))?;
            handle.file.set_len(size)?;
            handle.dirty = true;
            return Ok(());
        }

        OpenOptions::new()
            .write(true)
            .open(&res.real_path)
            .and_then(|file| file.set_len(size))
            .map_err(|e| e.into_fs_error(path))?;

        if !res.ignored {
            let relative = res.relative().to_string();
            self.record(&[&relative], &format!("Truncate {relative}"))?;
        }
        Ok(())
    }

    pub fn chmod(&mut self, path: &str, mode: u32) -> FsResult<()> {
        debug!("chmod({:?}, mode=0o{:o})", path, mode);
        let res = self.resolver.resolve(path, true)?;
        self.deny_if_read_only(path, &res)?;

        fs::set_permissions(&res.real_path, fs::Permissions::from_mode(mode))
            .map_err(|e| e.into_fs_error(path))?;

        if !res.ignored && res.real_path.is_file() {
            let relative = res.relative().to_string();
            self.record(&[&relative], &format!("Change mode of {relative}"))?;
        }
        Ok(())
    }

    pub fn chown(&mut self, path: &str, uid: Option<u32>, gid: Option<u32>) -> FsResult<()> {
        debug!("chown({:?}, uid={:?}, gid={:?})", path, uid, gid);
        let res = self.resolver.resolve(path, true)?;
        self.deny_if_read_only(path, &res)?;
        Ok(chown(
            &res.real_path,
            uid.map(Uid::from_raw),
            gid.map(Gid::from_raw),
        )?)
    }

    pub fn utimens(&mut self, path: &str, atime: TimeSpec, mtime: TimeSpec) -> FsResult<()> {
        debug!("utimens({:?})", path);
        let res = self.resolver.resolve(path, true)?;
        self.deny_if_read_only(path, &res)?;
        Ok(utimensat(
            AT_FDCWD,
            &res.real_path,
            &atime,
            &mtime,
            UtimensatFlags::NoFollowSymlink,
        )?)
    }

    pub fn mkdir(&mut self, path: &str, mode: u32) -> FsResult<Metadata> {
        debug!("mkdir({:?}, mode=0o{:o})", path, mode);
        let res = self.resolver.resolve(path, false)?;
        self.deny_if_read_only(path, &res)?;

        fs::create_dir(&res.real_path).map_err(|e| e.into_fs_error(path))?;
        if let Err(e) = fs::set_permissions(&res.real_path, fs::Permissions::from_mode(mode)) {
            warn!("mkdir: failed to set permissions on {:?}: {}", res.real_path, e);
        }
        Ok(fs::metadata(&res.real_path)?)
    }

    pub fn rmdir(&mut self, path: &str) -> FsResult<()> {
        debug!("rmdir({:?})", path);
        let res = self.resolver.resolve(path, true)?;
        self.deny_if_read_only(path, &res)?;
        fs::remove_dir(&res.real_path).map_err(|e| e.into_fs_error(path))
    }

    /// Move a file or directory on the host, then record both sides that
    /// are under version control in one commit.
    pub fn rename(&mut self, from: &str, to: &str) -> FsResult<()> {
        debug!("rename({:?} -> {:?})", from, to);
        let source = self.resolver.resolve(from, true)?;
        let target = self.resolver.resolve(to, false)?;
        if source.selector != target.selector {
            // Both sides must live in the same materialized revision.
            return Err(FsError::Io(std::io::Error::from_raw_os_error(libc::EXDEV)));
        }
        self.deny_if_read_only(from, &source)?;
        self.deny_if_read_only(to, &target)?;

        fs::rename(&source.real_path, &target.real_path).map_err(|e| e.into_fs_error(from))?;

        let old = source.relative().to_string();
        let new = target.relative().to_string();
        let moved_dir = target.real_path.is_dir();
        let mut recorded: Vec<&str> = Vec::new();

        if !source.ignored && self.resolver.tracks_any_under(&old) {
            let staged = self.resolver.store_mut().stage_add(&old)?;
            self.check_vcs("add", &old, staged)?;
            recorded.push(&old);
        }
        if !target.ignored && (moved_dir || target.real_path.is_file()) {
            let staged = self.resolver.store_mut().stage_add(&new)?;
            self.check_vcs("add", &new, staged)?;
            recorded.push(&new);
        }
        if !recorded.is_empty() {
            self.record(&recorded, &format!("Rename {old} to {new}"))?;
        }

        if moved_dir {
            // Every tracked path below either side changed name.
            return self.resolver.reload_manifest();
        }
        self.resolver.untrack(&old);
        if !target.ignored && target.real_path.is_file() {
            self.resolver.track(&new);
        }
        Ok(())
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn insert_handle(&mut self, handle: OpenFile) -> u64 {
        let fh = self.next_fh;
        self.next_fh += 1;
        self.handles.insert(fh, handle);
        fh
    }

    fn handle_path(&self, fh: u64) -> FsResult<String> {
        self.handles
            .get(&fh)
            .map(|handle| handle.path.clone())
            .ok_or(FsError::BadHandle(fh))
    }

    /// Reopen a writable handle if a checkout happened since it was opened.
    ///
    /// Checkouts replace tracked files, so the old `File` may point at an
    /// unlinked inode whose writes would never reach the working copy.
    fn refresh_handle(&mut self, fh: u64, res: &Resolution) -> FsResult<()> {
        let generation = self.resolver.generation();
        let handle = self.handles.get_mut(&fh).ok_or(FsError::BadHandle(fh))?;
        if !handle.writable || handle.resolution.ignored || handle.generation == generation {
            return Ok(());
        }

        debug!("reopening {:?}, the working copy was switched", handle.path);
        handle.file = OpenOptions::new()
            .read(handle.readable)
            .write(true)
            .append(handle.append)
            .open(&res.real_path)
            .map_err(|e| e.into_fs_error(&handle.path))?;
        handle.generation = generation;
        Ok(())
    }

    fn deny_if_read_only(&self, path: &str, res: &Resolution) -> FsResult<()> {
        if res.is_read_only() {
            debug!("{:?} is historical, refusing to modify it", path);
            return Err(FsError::PermissionDenied(PathBuf::from(path)));
        }
        Ok(())
    }

    /// Commit `paths` if git sees a change in any of them.
    fn record(&mut self, paths: &[&str], message: &str) -> FsResult<()> {
        let store = self.resolver.store_mut();
        if !store.has_changes(paths)? {
            debug!("record: nothing changed in {:?}", paths);
            return Ok(());
        }
        let output = store.commit(paths, message)?;
        if output.success() {
            info!("Committed: {}", message);
        }
        self.check_vcs("commit", &paths.join(" "), output)
    }

    /// Apply the configured policy to a VCS step that exited non-zero.
    fn check_vcs(&self, step: &str, subject: &str, output: VcsOutput) -> FsResult<()> {
        if output.success() {
            return Ok(());
        }
        match self.on_commit_failure {
            CommitFailurePolicy::Fail => {
                error!("{} of {} failed: {}", step, subject, output.stderr.trim());
                Err(VcsError::Failed {
                    command: format!("{step} {subject}"),
                    output,
                }
                .into())
            }
            CommitFailurePolicy::Warn => {
                warn!("{} of {} failed: {}", step, subject, output.stderr.trim());
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystems::error::FsErrorCode;
    use crate::filesystems::resolver::tests::FakeStore;
    use crate::selector::RevisionSelector;
    use tempfile::TempDir;

    fn day(text: &str) -> Option<RevisionSelector> {
        Some(text.parse().unwrap())
    }

    /// A gateway over a temp dir holding `notes.txt`, tracked live and at 2014-01-06.
    fn setup() -> (FilesystemGateway<FakeStore>, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("notes.txt"), "v1").unwrap();
        let mut store = FakeStore::with_live(&["notes.txt"]);
        store.set(day("2014-01-06"), &["notes.txt"]);
        let gateway = FilesystemGateway::new(store, dir.path()).unwrap();
        (gateway, dir)
    }

    fn commits(gateway: &FilesystemGateway<FakeStore>) -> usize {
        gateway.resolver().store().commits.len()
    }

    #[test]
    fn test_new_rejects_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        let result = FilesystemGateway::new(FakeStore::default(), dir.path().join("nope"));
        assert!(matches!(result, Err(FsError::InvalidPath(_))));
    }

    #[test]
    fn test_root_getattr_uses_captured_stat() {
        let (mut gateway, dir) = setup();
        let attr = gateway.getattr("/").unwrap();
        assert!(attr.is_dir());
        assert_eq!(
            std::os::unix::fs::MetadataExt::ino(&attr),
            std::os::unix::fs::MetadataExt::ino(&fs::metadata(dir.path()).unwrap())
        );
        assert!(gateway.resolver().store().checkouts.is_empty());
    }

    #[test]
    fn test_readdir_includes_dot_entries() {
        let (mut gateway, _dir) = setup();
        let names: Vec<String> = gateway.readdir("/").unwrap().collect();
        assert_eq!(names, [".", "..", "notes.txt"]);

        let names: Vec<String> = gateway.readdir("/2014-01-06").unwrap().collect();
        assert_eq!(names, [".", "..", "notes.txt"]);
    }

    #[test]
    fn test_write_batching_commits_once_on_release() {
        let (mut gateway, dir) = setup();

        let fh = gateway.open("/notes.txt", libc::O_WRONLY).unwrap();
        gateway.write(fh, b"v2", 0).unwrap();
        gateway.write(fh, b"!!", 2).unwrap();
        assert_eq!(commits(&gateway), 0);

        gateway.release(fh).unwrap();
        assert_eq!(commits(&gateway), 1);
        assert_eq!(fs::read_to_string(dir.path().join("notes.txt")).unwrap(), "v2!!");
        assert_eq!(gateway.open_handles(), 0);
    }

    #[test]
    fn test_handles_are_never_reused() {
        let (mut gateway, _dir) = setup();
        let first = gateway.open("/notes.txt", libc::O_RDONLY).unwrap();
        gateway.release(first).unwrap();
        let second = gateway.open("/notes.txt", libc::O_RDONLY).unwrap();
        more_asserts::assert_gt!(second, first);
    }

    #[test]
    fn test_read_only_open_does_not_commit() {
        let (mut gateway, _dir) = setup();
        let fh = gateway.open("/notes.txt", libc::O_RDONLY).unwrap();
        assert_eq!(gateway.read(fh, 0, 16).unwrap(), b"v1");
        gateway.release(fh).unwrap();
        assert_eq!(commits(&gateway), 0);
    }

    #[test]
    fn test_historical_mutations_are_denied() {
        let (mut gateway, dir) = setup();
        let path = "/2014-01-06/notes.txt";

        assert!(matches!(
            gateway.open(path, libc::O_WRONLY),
            Err(FsError::PermissionDenied(_))
        ));
        assert!(matches!(
            gateway.create("/2014-01-06/new.txt", 0o644, 0),
            Err(FsError::PermissionDenied(_))
        ));
        assert!(matches!(gateway.unlink(path), Err(FsError::PermissionDenied(_))));
        assert!(matches!(
            gateway.truncate(path, 0, None),
            Err(FsError::PermissionDenied(_))
        ));
        assert!(matches!(
            gateway.chmod(path, 0o600),
            Err(FsError::PermissionDenied(_))
        ));
        assert!(matches!(
            gateway.access(path, libc::W_OK),
            Err(FsError::PermissionDenied(_))
        ));
        assert!(matches!(
            gateway.mkdir("/2014-01-06/dir", 0o755),
            Err(FsError::PermissionDenied(_))
        ));

        // Nothing was touched.
        assert_eq!(fs::read_to_string(dir.path().join("notes.txt")).unwrap(), "v1");
        assert!(!dir.path().join("new.txt").exists());
        assert_eq!(commits(&gateway), 0);
    }

    #[test]
    fn test_historical_reads_are_allowed() {
        let (mut gateway, _dir) = setup();
        let path = "/2014-01-06/notes.txt";

        assert!(gateway.getattr(path).unwrap().is_file());
        gateway.access(path, libc::R_OK).unwrap();
        let fh = gateway.open(path, libc::O_RDONLY).unwrap();
        assert_eq!(gateway.read(fh, 0, 2).unwrap(), b"v1");
        gateway.release(fh).unwrap();
    }

    #[test]
    fn test_ignored_paths_bypass_history() {
        let (mut gateway, dir) = setup();
        let swap = "/2014-01-06/.notes.txt.swp";

        let (fh, _) = gateway.create(swap, 0o600, 0).unwrap();
        gateway.write(fh, b"swap", 0).unwrap();
        gateway.release(fh).unwrap();
        assert!(dir.path().join(".notes.txt.swp").exists());

        gateway.chmod(swap, 0o644).unwrap();
        gateway.unlink(swap).unwrap();
        assert!(!dir.path().join(".notes.txt.swp").exists());
        assert_eq!(commits(&gateway), 0);
    }

    #[test]
    fn test_create_commits_and_tracks() {
        let (mut gateway, dir) = setup();

        let (fh, attr) = gateway.create("/fresh.txt", 0o644, 0).unwrap();
        assert!(attr.is_file());
        assert!(dir.path().join("fresh.txt").exists());
        assert_eq!(commits(&gateway), 1);
        assert!(gateway.resolver().is_tracked("fresh.txt"));

        gateway.release(fh).unwrap();
        assert_eq!(commits(&gateway), 1);
        assert!(gateway.getattr("/fresh.txt").is_ok());
    }

    #[test]
    fn test_commit_failure_fails_by_default() {
        let (mut gateway, _dir) = setup();
        gateway.resolver_mut().store_mut().fail_commit = true;

        let fh = gateway.open("/notes.txt", libc::O_WRONLY).unwrap();
        gateway.write(fh, b"v2", 0).unwrap();
        let err = gateway.release(fh).unwrap_err();
        assert!(matches!(err, FsError::Vcs(VcsError::Failed { .. })));
        assert_eq!(err.to_error_code(), libc::EIO);
        assert_eq!(gateway.open_handles(), 0);
    }

    #[test]
    fn test_commit_failure_can_be_tolerated() {
        let (gateway, _dir) = setup();
        let mut gateway = gateway.with_commit_failure_policy(CommitFailurePolicy::Warn);
        gateway.resolver_mut().store_mut().fail_commit = true;

        let (fh, _) = gateway.create("/fresh.txt", 0o644, 0).unwrap();
        gateway.release(fh).unwrap();
        assert_eq!(commits(&gateway), 0);
    }

    #[test]
    fn test_unknown_handle() {
        let (mut gateway, _dir) = setup();
        assert!(matches!(gateway.read(42, 0, 1), Err(FsError::BadHandle(42))));
        assert!(matches!(gateway.release(42), Err(FsError::BadHandle(42))));
        assert!(gateway.flush(42).is_ok());
    }

    #[test]
    fn test_write_to_read_only_handle_fails() {
        let (mut gateway, _dir) = setup();
        let fh = gateway.open("/notes.txt", libc::O_RDONLY).unwrap();
        let err = gateway.write(fh, b"x", 0).unwrap_err();
        assert!(matches!(err, FsError::Io(e) if e.raw_os_error() == Some(libc::EBADF)));
    }

    #[test]
    fn test_missing_path_is_not_found() {
        let (mut gateway, _dir) = setup();
        assert!(matches!(
            gateway.getattr("/missing.txt"),
            Err(FsError::NotFound(_))
        ));
        assert!(matches!(
            gateway.open("/2014-01-06/missing.txt", libc::O_RDONLY),
            Err(FsError::NotFound(_))
        ));
    }

    #[test]
    fn test_write_after_checkout_reopens_file() {
        let (mut gateway, dir) = setup();
        let fh = gateway.open("/notes.txt", libc::O_WRONLY).unwrap();

        // A checkout replaces tracked files with fresh inodes.
        gateway.getattr("/2014-01-06/notes.txt").unwrap();
        fs::remove_file(dir.path().join("notes.txt")).unwrap();
        fs::write(dir.path().join("notes.txt"), "v1").unwrap();

        gateway.write(fh, b"v3", 0).unwrap();
        gateway.release(fh).unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("notes.txt")).unwrap(), "v3");
        assert_eq!(commits(&gateway), 1);
    }

    #[test]
    fn test_directory_rename_records_both_sides() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("docs")).unwrap();
        fs::write(dir.path().join("docs/a.txt"), "a").unwrap();
        let store = FakeStore::with_live(&["docs/a.txt"]);
        let mut gateway = FilesystemGateway::new(store, dir.path()).unwrap();

        gateway.rename("/docs", "/papers").unwrap();

        assert!(dir.path().join("papers/a.txt").is_file());
        assert_eq!(gateway.resolver().store().commits, vec![vec!["docs", "papers"]]);
        // The manifest was re-read rather than patched.
        assert_eq!(gateway.resolver().store().listings.get(), 2);
    }

    #[test]
    fn test_checkout_live_leaves_history() {
        let (mut gateway, _dir) = setup();
        gateway.getattr("/2014-01-06/notes.txt").unwrap();

        gateway.checkout_live().unwrap();
        assert_eq!(gateway.resolver().store().checkouts, vec![day("2014-01-06"), None]);
        assert_eq!(
            gateway.resolver().checkout_state(),
            &crate::filesystems::CheckoutState::Materialized(None)
        );
    }
}
