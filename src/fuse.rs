//! FUSE Mount
//!
//! TigerStyle: Inode-based FUSE requests mapped onto the path-based
//! [`HookedFs`] driver.
//!
//! Hooked requests (open, read, write, fsync, mkdir, rmdir, opendir) run on
//! the tokio blocking pool, so a slow fault only holds up its own request.
//! Metadata requests are answered inline on the session thread.

use crate::hooks::Hook;
use crate::passthrough::{DirEntry, EntryKind, FsError, HookedFs};
use fuser::{
    fuse_forget_one, FileAttr, FileType, Filesystem, KernelConfig, MountOption, ReplyAttr,
    ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite,
    Request, TimeOrNow,
};
use libc::c_int;
use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::fs::Metadata;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::runtime::Handle;

// =============================================================================
// TigerStyle Constants
// =============================================================================

/// Inode of the mount root
pub const ROOT_INODE: u64 = 1;

/// Directory-entry inode for children not yet looked up
pub const UNKNOWN_INODE: u64 = 0xffff_ffff;

/// How long the kernel may cache attributes and entries
pub const ATTR_TTL: Duration = Duration::from_secs(1);

/// Filesystem name shown in the mount table
pub const FS_NAME: &str = "qfs";

// =============================================================================
// Inode Table
// =============================================================================

/// Bidirectional inode <-> relative path map with kernel lookup counts.
///
/// Every entry reply (lookup, create, mkdir, symlink) adds one lookup; the
/// kernel's `forget` gives them back, and an inode whose count reaches zero
/// is evicted. The root is never evicted.
#[derive(Debug)]
pub struct InodeTable {
    paths: HashMap<u64, PathBuf>,
    inodes: HashMap<PathBuf, u64>,
    lookups: HashMap<u64, u64>,
    next_inode: u64,
}

impl InodeTable {
    /// Table holding only the root (empty relative path).
    pub fn new() -> Self {
        let mut table = Self {
            paths: HashMap::new(),
            inodes: HashMap::new(),
            lookups: HashMap::new(),
            next_inode: ROOT_INODE + 1,
        };
        table.paths.insert(ROOT_INODE, PathBuf::new());
        table.inodes.insert(PathBuf::new(), ROOT_INODE);
        table
    }

    /// Relative path of `ino`.
    pub fn path(&self, ino: u64) -> Option<PathBuf> {
        self.paths.get(&ino).cloned()
    }

    /// Inode already assigned to `path`, without taking a lookup.
    pub fn get(&self, path: &Path) -> Option<u64> {
        self.inodes.get(path).copied()
    }

    /// Inode for `path`, allocating one on first sight, plus one lookup.
    pub fn lookup(&mut self, path: &Path) -> u64 {
        let ino = match self.inodes.get(path) {
            Some(ino) => *ino,
            None => {
                let ino = self.next_inode;
                self.next_inode += 1;
                self.paths.insert(ino, path.to_path_buf());
                self.inodes.insert(path.to_path_buf(), ino);
                ino
            }
        };
        *self.lookups.entry(ino).or_insert(0) += 1;
        ino
    }

    /// Outstanding kernel lookups on `ino`.
    pub fn lookup_count(&self, ino: u64) -> u64 {
        self.lookups.get(&ino).copied().unwrap_or(0)
    }

    /// Give back `nlookup` lookups; evicts `ino` when none remain.
    pub fn forget(&mut self, ino: u64, nlookup: u64) {
        if ino == ROOT_INODE {
            return;
        }
        let remaining = self.lookup_count(ino).saturating_sub(nlookup);
        if remaining > 0 {
            self.lookups.insert(ino, remaining);
            return;
        }
        self.lookups.remove(&ino);
        if let Some(path) = self.paths.remove(&ino) {
            self.inodes.remove(&path);
        }
    }

    /// Forget a removed path. Lookups still held on its inode are dropped
    /// with it.
    pub fn remove(&mut self, path: &Path) {
        if let Some(ino) = self.inodes.remove(path) {
            self.paths.remove(&ino);
            self.lookups.remove(&ino);
        }
    }

    /// Re-point `from` and everything below it at `to`. Whatever `to` named
    /// before is dropped, as the rename replaced it.
    pub fn rename(&mut self, from: &Path, to: &Path) {
        self.remove_tree(to);

        let moved: Vec<(u64, PathBuf)> = self
            .paths
            .iter()
            .filter(|(_, path)| path.starts_with(from))
            .map(|(ino, path)| (*ino, path.clone()))
            .collect();
        for (ino, old) in moved {
            let Ok(suffix) = old.strip_prefix(from) else {
                continue;
            };
            let new = if suffix.as_os_str().is_empty() {
                to.to_path_buf()
            } else {
                to.join(suffix)
            };
            self.inodes.remove(&old);
            self.inodes.insert(new.clone(), ino);
            self.paths.insert(ino, new);
        }
    }

    fn remove_tree(&mut self, root: &Path) {
        let doomed: Vec<PathBuf> = self
            .inodes
            .keys()
            .filter(|path| path.starts_with(root))
            .cloned()
            .collect();
        for path in doomed {
            self.remove(&path);
        }
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

type SharedInodes = Arc<Mutex<InodeTable>>;

fn lock(inodes: &SharedInodes) -> MutexGuard<'_, InodeTable> {
    inodes.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Filesystem
// =============================================================================

/// `fuser` filesystem backed by a [`HookedFs`].
pub struct QfsFilesystem<H> {
    fs: Arc<HookedFs<H>>,
    inodes: SharedInodes,
    runtime: Handle,
}

impl<H: Hook + 'static> QfsFilesystem<H> {
    /// `runtime` runs the hooked requests; it must outlive the mount.
    pub fn new(fs: Arc<HookedFs<H>>, runtime: Handle) -> Self {
        Self {
            fs,
            inodes: Arc::new(Mutex::new(InodeTable::new())),
            runtime,
        }
    }

    fn path(&self, ino: u64) -> Option<PathBuf> {
        lock(&self.inodes).path(ino)
    }

    fn child(&self, parent: u64, name: &OsStr) -> Option<PathBuf> {
        self.path(parent).map(|p| p.join(name))
    }

    /// Run a request on the blocking pool.
    fn dispatch<F>(&self, job: F)
    where
        F: FnOnce(&HookedFs<H>, &SharedInodes) + Send + 'static,
    {
        let fs = Arc::clone(&self.fs);
        let inodes = Arc::clone(&self.inodes);
        self.runtime.spawn_blocking(move || job(&*fs, &inodes));
    }
}

/// Stat `path` and register its inode.
fn entry_attr<H: Hook>(
    fs: &HookedFs<H>,
    inodes: &SharedInodes,
    path: &Path,
) -> Result<FileAttr, FsError> {
    let meta = fs.getattr(path)?;
    let ino = lock(inodes).lookup(path);
    Ok(file_attr(ino, &meta))
}

impl<H: Hook + 'static> Filesystem for QfsFilesystem<H> {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        tracing::info!(root = %self.fs.root().display(), "fuse session started");
        Ok(())
    }

    fn destroy(&mut self) {
        tracing::info!("fuse session ended");
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(path) = self.child(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match entry_attr(&*self.fs, &self.inodes, &path) {
            Ok(attr) => reply.entry(&ATTR_TTL, &attr, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        lock(&self.inodes).forget(ino, nlookup);
    }

    fn batch_forget(&mut self, _req: &Request<'_>, nodes: &[fuse_forget_one]) {
        let mut inodes = lock(&self.inodes);
        for node in nodes {
            inodes.forget(node.nodeid, node.nlookup);
        }
        tracing::trace!(count = nodes.len(), inodes = inodes.len(), "batch forget");
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let Some(path) = self.path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.getattr(&path) {
            Ok(meta) => reply.attr(&ATTR_TTL, &file_attr(ino, &meta)),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
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
        let Some(path) = self.path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let result = (|| {
            if let Some(size) = size {
                self.fs.truncate(&path, fh, size)?;
            }
            if let Some(mode) = mode {
                self.fs.chmod(&path, mode)?;
            }
            self.fs
                .set_times(&path, atime.map(system_time), mtime.map(system_time))?;
            self.fs.getattr(&path)
        })();
        match result {
            Ok(meta) => reply.attr(&ATTR_TTL, &file_attr(ino, &meta)),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(path) = self.path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        self.dispatch(move |fs, _| match fs.open(&path, flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e.errno()),
        });
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(path) = self.child(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        let created = self
            .fs
            .create(&path, flags, mode & !umask)
            .and_then(|fh| Ok((fh, entry_attr(&*self.fs, &self.inodes, &path)?)));
        match created {
            Ok((fh, attr)) => reply.created(&ATTR_TTL, &attr, 0, fh, 0),
            Err(e) => reply.error(e.errno()),
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
        self.dispatch(move |fs, _| match fs.read(fh, size, offset) {
            Ok(buf) => reply.data(&buf),
            Err(e) => reply.error(e.errno()),
        });
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
        let data = data.to_vec();
        self.dispatch(move |fs, _| match fs.write(fh, &data, offset) {
            Ok(n) => reply.written(u32::try_from(n).unwrap_or(u32::MAX)),
            Err(e) => reply.error(e.errno()),
        });
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        reply.ok();
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
        match self.fs.release(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        self.dispatch(move |fs, _| match fs.fsync(fh, datasync) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        });
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(path) = self.child(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        self.dispatch(move |fs, inodes| {
            let made = fs
                .mkdir(&path, mode & !umask)
                .and_then(|()| entry_attr(fs, inodes, &path));
            match made {
                Ok(attr) => reply.entry(&ATTR_TTL, &attr, 0),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.child(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        self.dispatch(move |fs, inodes| match fs.rmdir(&path) {
            Ok(()) => {
                lock(inodes).remove(&path);
                reply.ok();
            }
            Err(e) => reply.error(e.errno()),
        });
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.child(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.unlink(&path) {
            Ok(()) => {
                lock(&self.inodes).remove(&path);
                reply.ok();
            }
            Err(e) => reply.error(e.errno()),
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
        let (Some(from), Some(to)) = (self.child(parent, name), self.child(newparent, newname))
        else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.rename(&from, &to) {
            Ok(()) => {
                lock(&self.inodes).rename(&from, &to);
                reply.ok();
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let Some(path) = self.path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.readlink(&path) {
            Ok(target) => reply.data(target.as_os_str().as_bytes()),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let Some(path) = self.child(parent, link_name) else {
            reply.error(libc::ENOENT);
            return;
        };
        let made = self
            .fs
            .symlink(target, &path)
            .and_then(|()| entry_attr(&*self.fs, &self.inodes, &path));
        match made {
            Ok(attr) => reply.entry(&ATTR_TTL, &attr, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let Some(path) = self.path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        self.dispatch(move |fs, _| match fs.opendir(&path) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e.errno()),
        });
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(path) = self.path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let entries = match self.fs.readdir(fh) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };

        let listing = dir_listing(&lock(&self.inodes), ino, &path, &entries);
        let skip = usize::try_from(offset).unwrap_or(0);
        for (i, (child_ino, kind, name)) in listing.into_iter().enumerate().skip(skip) {
            // Offset of the next entry
            let next = i64::try_from(i + 1).unwrap_or(i64::MAX);
            if reply.add(child_ino, next, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        match self.fs.releasedir(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }
}

/// `.`, `..`, then the directory's entries.
///
/// Listing takes no lookups, so children the kernel has not looked up yet
/// are reported as [`UNKNOWN_INODE`] instead of being registered.
fn dir_listing(
    inodes: &InodeTable,
    ino: u64,
    path: &Path,
    entries: &[DirEntry],
) -> Vec<(u64, FileType, OsString)> {
    let parent_ino = path
        .parent()
        .and_then(|parent| inodes.get(parent))
        .unwrap_or(ROOT_INODE);
    let mut listing: Vec<(u64, FileType, OsString)> = vec![
        (ino, FileType::Directory, OsString::from(".")),
        (parent_ino, FileType::Directory, OsString::from("..")),
    ];
    for entry in entries {
        let child_ino = inodes
            .get(&path.join(&entry.name))
            .unwrap_or(UNKNOWN_INODE);
        listing.push((child_ino, file_type(entry.kind), entry.name.clone()));
    }
    listing
}

// =============================================================================
// Attributes
// =============================================================================

fn file_type(kind: EntryKind) -> FileType {
    match kind {
        EntryKind::Directory => FileType::Directory,
        EntryKind::Symlink => FileType::Symlink,
        EntryKind::File | EntryKind::Other => FileType::RegularFile,
    }
}

fn system_time(time: TimeOrNow) -> SystemTime {
    match time {
        TimeOrNow::SpecificTime(time) => time,
        TimeOrNow::Now => SystemTime::now(),
    }
}

fn timestamp(secs: i64, nsecs: i64) -> SystemTime {
    let secs = u64::try_from(secs).unwrap_or(0);
    let nsecs = u32::try_from(nsecs).unwrap_or(0);
    UNIX_EPOCH + Duration::new(secs, nsecs)
}

/// Convert backing-file metadata to FUSE attributes under inode `ino`.
pub fn file_attr(ino: u64, meta: &Metadata) -> FileAttr {
    let kind = if meta.is_dir() {
        FileType::Directory
    } else if meta.file_type().is_symlink() {
        FileType::Symlink
    } else {
        FileType::RegularFile
    };
    FileAttr {
        ino,
        size: meta.size(),
        blocks: meta.blocks(),
        atime: timestamp(meta.atime(), meta.atime_nsec()),
        mtime: timestamp(meta.mtime(), meta.mtime_nsec()),
        ctime: timestamp(meta.ctime(), meta.ctime_nsec()),
        crtime: UNIX_EPOCH,
        kind,
        perm: (meta.mode() & 0o7777) as u16,
        nlink: u32::try_from(meta.nlink()).unwrap_or(u32::MAX),
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: u32::try_from(meta.rdev()).unwrap_or(0),
        blksize: u32::try_from(meta.blksize()).unwrap_or(4096),
        flags: 0,
    }
}

// =============================================================================
// Mounting
// =============================================================================

/// Mount options
#[derive(Debug, Clone, Default)]
pub struct MountConfig {
    /// Let users other than the mounting user access the mount
    pub allow_other: bool,
}

impl MountConfig {
    fn options(&self) -> Vec<MountOption> {
        let mut options = vec![
            MountOption::FSName(FS_NAME.to_string()),
            MountOption::Subtype(FS_NAME.to_string()),
        ];
        if self.allow_other {
            options.push(MountOption::AllowOther);
            options.push(MountOption::AutoUnmount);
        }
        options
    }
}

/// Mount `fs` at `mountpoint` on a background session thread.
///
/// The filesystem is unmounted when the returned session is dropped.
pub fn spawn_mount<H: Hook + 'static>(
    fs: Arc<HookedFs<H>>,
    mountpoint: &Path,
    config: &MountConfig,
    runtime: Handle,
) -> io::Result<fuser::BackgroundSession> {
    tracing::info!(
        mountpoint = %mountpoint.display(),
        original = %fs.root().display(),
        "mounting"
    );
    let filesystem = QfsFilesystem::new(fs, runtime);
    fuser::spawn_mount2(filesystem, mountpoint, &config.options())
}

// =============================================================================
// Tests
// =============================================================================
