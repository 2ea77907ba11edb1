//! TimeTravelFS - the FUSE face of [`FilesystemGateway`]
//!
//! The kernel speaks in inodes and `(parent, name)` pairs; the gateway
//! speaks in virtual paths. This adapter converts one into the other using
//! an [`InodeTable`] and turns gateway errors into errno replies.
//!
//! Inodes are synthetic: the same host file is visible under many virtual
//! paths (one per selector), and each of those needs its own inode so the
//! kernel does not mix up their cached attributes.

use std::ffi::OsStr;
use std::fs::Metadata;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use libc::{EINVAL, ENOENT, ENOTDIR};
use log::{debug, error, info, warn};
use nix::sys::time::TimeSpec;

use super::error::{FsError, FsErrorCode, FsResult};
use super::gateway::FilesystemGateway;
use super::inodes::InodeTable;
use super::resolver::is_read_only_path;
use crate::config::MountConfig;
use crate::vcs::RevisionStore;

pub struct TimeTravelFS<S> {
    gateway: FilesystemGateway<S>,
    inodes: InodeTable,
    /// How long the kernel may cache entries and attributes
    ttl: Duration,
}

impl<S: RevisionStore> TimeTravelFS<S> {
    pub fn new(gateway: FilesystemGateway<S>) -> Self {
        Self {
            gateway,
            inodes: InodeTable::new(),
            ttl: MountConfig::default().attr_ttl(),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn gateway(&self) -> &FilesystemGateway<S> {
        &self.gateway
    }

    /// Mount in the foreground; returns once the filesystem is unmounted.
    pub fn mount(self, mountpoint: impl AsRef<Path>, config: &MountConfig) -> io::Result<()> {
        let mut options = vec![MountOption::FSName(config.fs_name.clone())];
        if config.allow_other {
            options.push(MountOption::AllowOther);
            options.push(MountOption::AutoUnmount);
        }

        info!(
            "Mounting history of {:?} at {:?}",
            self.gateway.root(),
            mountpoint.as_ref()
        );
        fuser::mount2(self.with_ttl(config.attr_ttl()), mountpoint, &options)
    }

    // =========================================================================
    // Path Helpers
    // =========================================================================

    fn path_of(&self, ino: u64) -> Result<String, i32> {
        self.inodes.get_path(ino).map(str::to_string).ok_or_else(|| {
            debug!("inode {} is unknown", ino);
            ENOENT
        })
    }

    /// Virtual path of `name` inside `parent`. Names must be UTF-8.
    fn child_path(&self, parent: u64, name: &OsStr) -> Result<String, i32> {
        let name = name.to_str().ok_or_else(|| {
            warn!("rejecting non UTF-8 name {:?}", name);
            EINVAL
        })?;
        self.inodes.build_path(parent, name).ok_or(ENOENT)
    }

    fn attr_for(&mut self, path: &str, meta: &Metadata) -> FileAttr {
        let ino = self.inodes.get_or_create(path);
        view_attr(path, meta, ino)
    }

    /// Apply each requested change in turn, stopping at the first failure.
    #[allow(clippy::too_many_arguments)]
    fn apply_setattr(
        &mut self,
        path: &str,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        fh: Option<u64>,
    ) -> FsResult<Metadata> {
        if let Some(size) = size {
            self.gateway.truncate(path, size, fh)?;
        }
        if let Some(mode) = mode {
            self.gateway.chmod(path, mode)?;
        }
        if uid.is_some() || gid.is_some() {
            self.gateway.chown(path, uid, gid)?;
        }
        if atime.is_some() || mtime.is_some() {
            self.gateway
                .utimens(path, to_timespec(atime), to_timespec(mtime))?;
        }
        self.gateway.getattr(path)
    }

    fn parent_path(path: &str) -> &str {
        match path.rfind('/') {
            Some(0) | None => "/",
            Some(idx) => &path[..idx],
        }
    }
}

/// Log a gateway failure and pick the errno to reply with.
fn errno(op: &str, path: &str, e: FsError) -> i32 {
    match e {
        FsError::NotFound(_) => debug!("{}: {:?} not found", op, path),
        FsError::PermissionDenied(_) => debug!("{}: {:?} is read-only", op, path),
        ref other => error!("{}: {:?} failed: {}", op, path, other),
    }
    e.to_error_code()
}

fn file_type(meta: &Metadata) -> FileType {
    let ft = meta.file_type();
    if ft.is_dir() {
        FileType::Directory
    } else if ft.is_symlink() {
        FileType::Symlink
    } else if ft.is_block_device() {
        FileType::BlockDevice
    } else if ft.is_char_device() {
        FileType::CharDevice
    } else if ft.is_fifo() {
        FileType::NamedPipe
    } else if ft.is_socket() {
        FileType::Socket
    } else {
        FileType::RegularFile
    }
}

fn system_time(secs: i64, nsecs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nsecs as u32)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}

/// Host stat, reported under a synthetic inode number
fn metadata_to_attr(meta: &Metadata, ino: u64) -> FileAttr {
    FileAttr {
        ino,
        size: meta.size(),
        blocks: meta.blocks(),
        atime: system_time(meta.atime(), meta.atime_nsec()),
        mtime: system_time(meta.mtime(), meta.mtime_nsec()),
        ctime: system_time(meta.ctime(), meta.ctime_nsec()),
        crtime: UNIX_EPOCH,
        kind: file_type(meta),
        perm: (meta.mode() & 0o7777) as u16,
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev() as u32,
        blksize: meta.blksize() as u32,
        flags: 0,
    }
}

/// Attributes as seen through `path`. Historical views drop the write bits.
fn view_attr(path: &str, meta: &Metadata, ino: u64) -> FileAttr {
    let mut attr = metadata_to_attr(meta, ino);
    if is_read_only_path(path) {
        attr.perm &= !0o222;
    }
    attr
}

fn to_timespec(time: Option<TimeOrNow>) -> TimeSpec {
    match time {
        Some(TimeOrNow::SpecificTime(st)) => {
            let duration = st.duration_since(UNIX_EPOCH).unwrap_or_default();
            TimeSpec::new(duration.as_secs() as i64, duration.subsec_nanos() as i64)
        }
        Some(TimeOrNow::Now) => TimeSpec::UTIME_NOW,
        None => TimeSpec::UTIME_OMIT,
    }
}

impl<S: RevisionStore> Filesystem for TimeTravelFS<S> {
    fn init(
        &mut self,
        _req: &Request<'_>,
        _config: &mut fuser::KernelConfig,
    ) -> Result<(), libc::c_int> {
        info!("TimeTravelFS initialized");
        Ok(())
    }

    fn destroy(&mut self) {
        let open = self.gateway.open_handles();
        if open > 0 {
            warn!("Unmounting with {} open file handles", open);
        }
        if let Err(e) = self.gateway.checkout_live() {
            error!("Failed to restore the live branch: {}", e);
        }
        info!("TimeTravelFS destroyed");
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        debug!("lookup(parent={}, name={:?})", parent, name);
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(code) => return reply.error(code),
        };

        match self.gateway.getattr(&path) {
            Ok(meta) => {
                let attr = self.attr_for(&path, &meta);
                reply.entry(&self.ttl, &attr, 0);
            }
            Err(e) => reply.error(errno("lookup", &path, e)),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        debug!("getattr(ino={})", ino);
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(code) => return reply.error(code),
        };

        match self.gateway.getattr(&path) {
            Ok(meta) => reply.attr(&self.ttl, &view_attr(&path, &meta, ino)),
            Err(e) => reply.error(errno("getattr", &path, e)),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        debug!(
            "setattr(ino={}, mode={:?}, uid={:?}, gid={:?}, size={:?}, fh={:?})",
            ino, mode, uid, gid, size, fh
        );
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(code) => return reply.error(code),
        };

        let result = self.apply_setattr(&path, mode, uid, gid, size, atime, mtime, fh);
        match result {
            Ok(meta) => reply.attr(&self.ttl, &view_attr(&path, &meta, ino)),
            Err(e) => reply.error(errno("setattr", &path, e)),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        debug!("readlink(ino={})", ino);
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(code) => return reply.error(code),
        };

        match self.gateway.readlink(&path) {
            Ok(target) => reply.data(target.as_os_str().as_bytes()),
            Err(e) => reply.error(errno("readlink", &path, e)),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        debug!("mkdir(parent={}, name={:?}, mode=0o{:o})", parent, name, mode);
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(code) => return reply.error(code),
        };

        match self.gateway.mkdir(&path, mode) {
            Ok(meta) => {
                let attr = self.attr_for(&path, &meta);
                reply.entry(&self.ttl, &attr, 0);
            }
            Err(e) => reply.error(errno("mkdir", &path, e)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("unlink(parent={}, name={:?})", parent, name);
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(code) => return reply.error(code),
        };

        match self.gateway.unlink(&path) {
            Ok(()) => {
                self.inodes.remove(&path);
                reply.ok();
            }
            Err(e) => reply.error(errno("unlink", &path, e)),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("rmdir(parent={}, name={:?})", parent, name);
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(code) => return reply.error(code),
        };

        match self.gateway.rmdir(&path) {
            Ok(()) => {
                self.inodes.remove(&path);
                reply.ok();
            }
            Err(e) => reply.error(errno("rmdir", &path, e)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        debug!(
            "rename(parent={}, name={:?}, newparent={}, newname={:?})",
            parent, name, newparent, newname
        );
        let paths = self
            .child_path(parent, name)
            .and_then(|from| Ok((from, self.child_path(newparent, newname)?)));
        let (from, to) = match paths {
            Ok(paths) => paths,
            Err(code) => return reply.error(code),
        };

        match self.gateway.rename(&from, &to) {
            Ok(()) => {
                self.inodes.rename(&from, &to);
                reply.ok();
            }
            Err(e) => reply.error(errno("rename", &from, e)),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        debug!("open(ino={}, flags=0x{:x})", ino, flags);
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(code) => return reply.error(code),
        };

        match self.gateway.open(&path, flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(errno("open", &path, e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Ok(offset) = u64::try_from(offset) else {
            return reply.error(EINVAL);
        };
        match self.gateway.read(fh, offset, size) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(errno("read", &format!("fh {fh}"), e)),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Ok(offset) = u64::try_from(offset) else {
            return reply.error(EINVAL);
        };
        match self.gateway.write(fh, data, offset) {
            Ok(n) => reply.written(n as u32),
            Err(e) => reply.error(errno("write", &format!("fh {fh}"), e)),
        }
    }

    fn flush(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _lock_owner: u64,
        reply: ReplyEmpty,
    ) {
        match self.gateway.flush(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("flush", &format!("fh {fh}"), e)),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.gateway.release(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("release", &format!("fh {fh}"), e)),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        match self.gateway.fsync(fh, datasync) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("fsync", &format!("fh {fh}"), e)),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        debug!(
            "create(parent={}, name={:?}, mode=0o{:o}, flags=0x{:x})",
            parent, name, mode, flags
        );
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(code) => return reply.error(code),
        };

        match self.gateway.create(&path, mode, flags) {
            Ok((fh, meta)) => {
                let attr = self.attr_for(&path, &meta);
                reply.created(&self.ttl, &attr, 0, fh, 0);
            }
            Err(e) => reply.error(errno("create", &path, e)),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        debug!("opendir(ino={})", ino);
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(code) => return reply.error(code),
        };

        match self.gateway.getattr(&path) {
            Ok(meta) if meta.is_dir() => reply.opened(0, 0),
            Ok(_) => reply.error(ENOTDIR),
            Err(e) => reply.error(errno("opendir", &path, e)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        debug!("readdir(ino={}, offset={})", ino, offset);
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(code) => return reply.error(code),
        };

        let names: Vec<String> = match self.gateway.readdir(&path) {
            Ok(names) => names.collect(),
            Err(e) => return reply.error(errno("readdir", &path, e)),
        };

        let mut entries: Vec<(u64, FileType, String)> = Vec::with_capacity(names.len());
        for name in names {
            match name.as_str() {
                "." => entries.push((ino, FileType::Directory, name)),
                ".." => {
                    let parent = self.inodes.get_or_create(Self::parent_path(&path));
                    entries.push((parent, FileType::Directory, name));
                }
                _ => {
                    let Some(child) = self.inodes.build_path(ino, &name) else {
                        continue;
                    };
                    // Tracked in history but absent on disk shows up as a file.
                    let kind = self
                        .gateway
                        .getattr(&child)
                        .map(|meta| file_type(&meta))
                        .unwrap_or(FileType::RegularFile);
                    entries.push((self.inodes.get_or_create(&child), kind, name));
                }
            }
        }

        for (i, (entry_ino, kind, name)) in entries.iter().enumerate().skip(offset as usize) {
            // reply.add returns true if the buffer is full
            if reply.add(*entry_ino, (i + 1) as i64, *kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        debug!("access(ino={}, mask=0x{:x})", ino, mask);
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(code) => return reply.error(code),
        };

        match self.gateway.access(&path, mask) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("access", &path, e)),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        match self.gateway.statfs() {
            Ok(stat) => reply.statfs(
                stat.blocks(),
                stat.blocks_free(),
                stat.blocks_available(),
                stat.files(),
                stat.files_free(),
                stat.block_size() as u32,
                stat.name_max() as u32,
                stat.fragment_size() as u32,
            ),
            Err(e) => reply.error(errno("statfs", "/", e)),
        }
    }
}
