//! Hooked Passthrough Driver
//!
//! TigerStyle: The interception side of the hook contract, against a real
//! backing directory.
//!
//! For each hooked operation:
//! 1. Call the pre-hook; a short-circuit returns its error and the real
//!    operation never runs
//! 2. Run the real operation with `std::fs`
//! 3. Call the post-hook with the real result; a short-circuit replaces it
//!
//! Paths are relative to the backing directory and may not contain `..`.

use crate::fault::{Errno, Verdict};
use crate::hooks::Hook;
use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::{self, File, FileTimes, Metadata, OpenOptions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, FileExt, OpenOptionsExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

// =============================================================================
// TigerStyle Constants
// =============================================================================

/// First file handle handed out
pub const FILE_HANDLE_FIRST: u64 = 1;

/// Largest single read served, in bytes
pub const READ_SIZE_BYTES_MAX: u32 = 16 * 1024 * 1024;

// =============================================================================
// Types
// =============================================================================

/// Kind of a directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    Other,
}

impl EntryKind {
    fn from_file_type(file_type: fs::FileType) -> Self {
        if file_type.is_dir() {
            Self::Directory
        } else if file_type.is_symlink() {
            Self::Symlink
        } else if file_type.is_file() {
            Self::File
        } else {
            Self::Other
        }
    }
}

/// One entry of an opened directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: OsString,
    pub kind: EntryKind,
}

/// An open regular file
#[derive(Debug)]
struct OpenFile {
    path: PathBuf,
    file: Arc<File>,
}

/// An open directory; entries are listed once, at open time
#[derive(Debug)]
struct OpenDir {
    entries: Vec<DirEntry>,
}

// =============================================================================
// Errors
// =============================================================================

/// Driver errors
#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("injected fault: {0}")]
    Injected(Errno),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("bad file handle: {0}")]
    BadHandle(u64),

    #[error("path escapes the backing directory: {}", .0.display())]
    InvalidPath(PathBuf),

    #[error("invalid offset: {0}")]
    InvalidOffset(i64),
}

impl FsError {
    /// OS error number to report to the filesystem's caller.
    pub fn errno(&self) -> i32 {
        match self {
            Self::Injected(errno) => errno.raw(),
            Self::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Self::BadHandle(_) => libc::EBADF,
            Self::InvalidPath(_) | Self::InvalidOffset(_) => libc::EINVAL,
        }
    }

    /// The injected fault, if this error is one.
    pub fn injected(&self) -> Option<Errno> {
        match self {
            Self::Injected(errno) => Some(*errno),
            _ => None,
        }
    }
}

/// Result type for driver operations
pub type FsResult<T> = Result<T, FsError>;

// =============================================================================
// Hooked Filesystem
// =============================================================================

/// Passthrough over a backing directory with hooks around each operation.
pub struct HookedFs<H> {
    /// Backing directory
    root: PathBuf,
    hook: H,
    files: Mutex<HashMap<u64, OpenFile>>,
    dirs: Mutex<HashMap<u64, OpenDir>>,
    next_handle: AtomicU64,
}

impl<H: Hook> HookedFs<H> {
    /// Create a driver over `root`.
    pub fn new(root: impl Into<PathBuf>, hook: H) -> Self {
        let fs = Self {
            root: root.into(),
            hook,
            files: Mutex::new(HashMap::new()),
            dirs: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(FILE_HANDLE_FIRST),
        };
        fs.hook.init();
        tracing::info!(root = %fs.root.display(), "hooked filesystem ready");
        fs
    }

    /// Backing directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The hook driving fault decisions
    pub fn hook(&self) -> &H {
        &self.hook
    }

    /// Number of open file and directory handles
    pub fn open_handles(&self) -> usize {
        lock(&self.files).len() + lock(&self.dirs).len()
    }

    // -------------------------------------------------------------------------
    // Hooked operations
    // -------------------------------------------------------------------------

    /// Open an existing file. Returns a file handle.
    pub fn open(&self, rel: &Path, flags: i32) -> FsResult<u64> {
        let path = self.real_path(rel)?;

        let (verdict, ctx) = self.hook.pre_open(rel, flags);
        short_circuit(verdict)?;

        let real = open_options(flags).open(&path);
        let verdict = self.hook.post_open(ret_code(&real), &ctx);
        let file = finish(verdict, real)?;

        Ok(self.insert_file(rel, file))
    }

    /// Read up to `size` bytes at `offset`. Short only at end of file.
    pub fn read(&self, fh: u64, size: u32, offset: i64) -> FsResult<Vec<u8>> {
        let (rel, file) = self.file(fh)?;
        let offset = checked_offset(offset)?;
        let size = size.min(READ_SIZE_BYTES_MAX);

        let (served, verdict, ctx) = self.hook.pre_read(&rel, size, offset as i64);
        short_circuit(verdict)?;
        if let Some(buf) = served {
            return Ok(buf);
        }

        let real = read_at_most(&file, size as usize, offset);
        let ret = ret_code(&real);
        let (buf, verdict) = match real {
            Ok(buf) => self.hook.post_read(ret, buf, &ctx),
            Err(e) => {
                let (_, verdict) = self.hook.post_read(ret, Vec::new(), &ctx);
                short_circuit(verdict)?;
                return Err(e.into());
            }
        };
        short_circuit(verdict)?;
        Ok(buf.unwrap_or_default())
    }

    /// Write all of `data` at `offset`. Returns bytes written.
    pub fn write(&self, fh: u64, data: &[u8], offset: i64) -> FsResult<usize> {
        let (rel, file) = self.file(fh)?;
        let offset = checked_offset(offset)?;

        let (verdict, ctx) = self.hook.pre_write(&rel, data, offset as i64);
        short_circuit(verdict)?;

        let real = file.write_all_at(data, offset).map(|()| data.len());
        let verdict = self.hook.post_write(ret_code(&real), &ctx);
        finish(verdict, real)
    }

    /// Flush a file to stable storage.
    pub fn fsync(&self, fh: u64, datasync: bool) -> FsResult<()> {
        let (rel, file) = self.file(fh)?;

        let (verdict, ctx) = self.hook.pre_fsync(&rel, u32::from(datasync));
        short_circuit(verdict)?;

        let real = if datasync {
            file.sync_data()
        } else {
            file.sync_all()
        };
        let verdict = self.hook.post_fsync(ret_code(&real), &ctx);
        finish(verdict, real)
    }

    /// Create a directory.
    pub fn mkdir(&self, rel: &Path, mode: u32) -> FsResult<()> {
        let path = self.real_path(rel)?;

        let (verdict, ctx) = self.hook.pre_mkdir(rel, mode);
        short_circuit(verdict)?;

        let real = fs::DirBuilder::new().mode(mode).create(&path);
        let verdict = self.hook.post_mkdir(ret_code(&real), &ctx);
        finish(verdict, real)
    }

    /// Remove an empty directory.
    pub fn rmdir(&self, rel: &Path) -> FsResult<()> {
        let path = self.real_path(rel)?;

        let (verdict, ctx) = self.hook.pre_rmdir(rel);
        short_circuit(verdict)?;

        let real = fs::remove_dir(&path);
        let verdict = self.hook.post_rmdir(ret_code(&real), &ctx);
        finish(verdict, real)
    }

    /// Open a directory and list it. Returns a directory handle.
    pub fn opendir(&self, rel: &Path) -> FsResult<u64> {
        let path = self.real_path(rel)?;

        let (verdict, ctx) = self.hook.pre_open_dir(rel);
        short_circuit(verdict)?;

        let real = list_dir(&path);
        let verdict = self.hook.post_open_dir(ret_code(&real), &ctx);
        let entries = finish(verdict, real)?;

        let fh = self.next_handle();
        lock(&self.dirs).insert(fh, OpenDir { entries });
        Ok(fh)
    }

    // -------------------------------------------------------------------------
    // Unhooked operations
    // -------------------------------------------------------------------------

    /// Create and open a new regular file. Returns a file handle.
    pub fn create(&self, rel: &Path, flags: i32, mode: u32) -> FsResult<u64> {
        let path = self.real_path(rel)?;
        let file = open_options(flags).create(true).mode(mode).open(&path)?;
        Ok(self.insert_file(rel, file))
    }

    /// Close a file handle.
    pub fn release(&self, fh: u64) -> FsResult<()> {
        lock(&self.files)
            .remove(&fh)
            .map(|_| ())
            .ok_or(FsError::BadHandle(fh))
    }

    /// Entries of an opened directory.
    pub fn readdir(&self, fh: u64) -> FsResult<Vec<DirEntry>> {
        lock(&self.dirs)
            .get(&fh)
            .map(|dir| dir.entries.clone())
            .ok_or(FsError::BadHandle(fh))
    }

    /// Close a directory handle.
    pub fn releasedir(&self, fh: u64) -> FsResult<()> {
        lock(&self.dirs)
            .remove(&fh)
            .map(|_| ())
            .ok_or(FsError::BadHandle(fh))
    }

    /// Metadata without following a final symlink.
    pub fn getattr(&self, rel: &Path) -> FsResult<Metadata> {
        let path = self.real_path(rel)?;
        Ok(fs::symlink_metadata(path)?)
    }

    /// Change file size, through `fh` when the caller has one open.
    pub fn truncate(&self, rel: &Path, fh: Option<u64>, size: u64) -> FsResult<()> {
        if let Some(fh) = fh {
            if let Ok((_, file)) = self.file(fh) {
                return Ok(file.set_len(size)?);
            }
        }
        let path = self.real_path(rel)?;
        OpenOptions::new().write(true).open(path)?.set_len(size)?;
        Ok(())
    }

    /// Change permission bits.
    pub fn chmod(&self, rel: &Path, mode: u32) -> FsResult<()> {
        let path = self.real_path(rel)?;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
        Ok(())
    }

    /// Remove a file.
    pub fn unlink(&self, rel: &Path) -> FsResult<()> {
        let path = self.real_path(rel)?;
        Ok(fs::remove_file(path)?)
    }

    /// Move `from` to `to`, replacing `to` if it exists.
    pub fn rename(&self, from: &Path, to: &Path) -> FsResult<()> {
        let from = self.real_path(from)?;
        let to = self.real_path(to)?;
        Ok(fs::rename(from, to)?)
    }

    /// Target of a symlink, unresolved.
    pub fn readlink(&self, rel: &Path) -> FsResult<PathBuf> {
        let path = self.real_path(rel)?;
        Ok(fs::read_link(path)?)
    }

    /// Create a symlink at `rel` pointing to `target`. The target is stored
    /// verbatim and may point outside the backing directory.
    pub fn symlink(&self, target: &Path, rel: &Path) -> FsResult<()> {
        let path = self.real_path(rel)?;
        Ok(std::os::unix::fs::symlink(target, path)?)
    }

    /// Set access and modification times; `None` leaves a time unchanged.
    pub fn set_times(
        &self,
        rel: &Path,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> FsResult<()> {
        if atime.is_none() && mtime.is_none() {
            return Ok(());
        }
        let path = self.real_path(rel)?;
        let mut times = FileTimes::new();
        if let Some(atime) = atime {
            times = times.set_accessed(atime);
        }
        if let Some(mtime) = mtime {
            times = times.set_modified(mtime);
        }
        File::open(path)?.set_times(times)?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    /// Map a relative path into the backing directory.
    fn real_path(&self, rel: &Path) -> FsResult<PathBuf> {
        let mut path = self.root.clone();
        for component in rel.components() {
            match component {
                Component::Normal(part) => path.push(part),
                Component::RootDir | Component::CurDir => {}
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(FsError::InvalidPath(rel.to_path_buf()));
                }
            }
        }
        Ok(path)
    }

    fn next_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn insert_file(&self, rel: &Path, file: File) -> u64 {
        let fh = self.next_handle();
        lock(&self.files).insert(
            fh,
            OpenFile {
                path: rel.to_path_buf(),
                file: Arc::new(file),
            },
        );
        fh
    }

    /// Path and file behind `fh`. The table lock is released before I/O.
    fn file(&self, fh: u64) -> FsResult<(PathBuf, Arc<File>)> {
        lock(&self.files)
            .get(&fh)
            .map(|open| (open.path.clone(), Arc::clone(&open.file)))
            .ok_or(FsError::BadHandle(fh))
    }
}

impl<H> std::fmt::Debug for HookedFs<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookedFs")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Free helpers
// =============================================================================

/// Handle tables stay usable even if a holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Real return code as post-hooks see it.
fn ret_code<T>(result: &io::Result<T>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(e) => e.raw_os_error().unwrap_or(libc::EIO),
    }
}

fn short_circuit(verdict: Verdict) -> FsResult<()> {
    match verdict {
        Verdict::Proceed => Ok(()),
        Verdict::ShortCircuit(errno) => Err(FsError::Injected(errno)),
    }
}

/// Apply a post-hook verdict to the real result.
fn finish<T>(verdict: Verdict, real: io::Result<T>) -> FsResult<T> {
    short_circuit(verdict)?;
    Ok(real?)
}

fn checked_offset(offset: i64) -> FsResult<u64> {
    u64::try_from(offset).map_err(|_| FsError::InvalidOffset(offset))
}

fn open_options(flags: i32) -> OpenOptions {
    let mut options = OpenOptions::new();
    match flags & libc::O_ACCMODE {
        libc::O_WRONLY => options.write(true),
        libc::O_RDWR => options.read(true).write(true),
        _ => options.read(true),
    };
    // Access mode bits are masked out by std
    options.custom_flags(flags & !libc::O_CREAT);
    options
}

fn read_at_most(file: &File, size: usize, offset: u64) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; size];
    let mut filled = 0;
    while filled < size {
        match file.read_at(&mut buf[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    buf.truncate(filled);
    Ok(buf)
}

fn list_dir(path: &Path) -> io::Result<Vec<DirEntry>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        entries.push(DirEntry {
            name: entry.file_name(),
            kind: EntryKind::from_file_type(entry.file_type()?),
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::NoopHook;
    use tempfile::tempdir;

    #[test]
    fn test_passthrough_roundtrip() {
        let dir = tempdir().unwrap();
        let fs = HookedFs::new(dir.path(), NoopHook);

        let fh = fs.create(Path::new("hello.txt"), libc::O_RDWR, 0o644).unwrap();
        assert_eq!(fs.write(fh, b"hello world", 0).unwrap(), 11);
        fs.fsync(fh, false).unwrap();
        fs.release(fh).unwrap();

        let fh = fs.open(Path::new("hello.txt"), libc::O_RDONLY).unwrap();
        assert_eq!(fs.read(fh, 5, 6).unwrap(), b"world");
        assert_eq!(fs.read(fh, 100, 0).unwrap(), b"hello world");
        assert!(fs.read(fh, 10, 100).unwrap().is_empty());
        fs.release(fh).unwrap();

        assert_eq!(fs.open_handles(), 0);
    }

    #[test]
    fn test_directories() {
        let dir = tempdir().unwrap();
        let fs = HookedFs::new(dir.path(), NoopHook);

        fs.mkdir(Path::new("d"), 0o755).unwrap();
        fs.mkdir(Path::new("d/e"), 0o755).unwrap();
        std::fs::write(dir.path().join("d/f.txt"), b"x").unwrap();

        let fh = fs.opendir(Path::new("d")).unwrap();
        let entries = fs.readdir(fh).unwrap();
        assert_eq!(
            entries,
            vec![
                DirEntry { name: "e".into(), kind: EntryKind::Directory },
                DirEntry { name: "f.txt".into(), kind: EntryKind::File },
            ]
        );
        fs.releasedir(fh).unwrap();

        fs.rmdir(Path::new("d/e")).unwrap();
        assert!(!dir.path().join("d/e").exists());
    }

    #[test]
    fn test_real_errors_propagate() {
        let dir = tempdir().unwrap();
        let fs = HookedFs::new(dir.path(), NoopHook);

        let err = fs.open(Path::new("missing"), libc::O_RDONLY).unwrap_err();
        assert_eq!(err.errno(), libc::ENOENT);
        assert!(err.injected().is_none());

        fs.mkdir(Path::new("d"), 0o755).unwrap();
        let err = fs.mkdir(Path::new("d"), 0o755).unwrap_err();
        assert_eq!(err.errno(), libc::EEXIST);
    }

    #[test]
    fn test_parent_dir_rejected() {
        let dir = tempdir().unwrap();
        let fs = HookedFs::new(dir.path(), NoopHook);
        let err = fs.mkdir(Path::new("../escape"), 0o755).unwrap_err();
        assert!(matches!(err, FsError::InvalidPath(_)));
        assert_eq!(err.errno(), libc::EINVAL);
    }

    #[test]
    fn test_bad_handles() {
        let dir = tempdir().unwrap();
        let fs = HookedFs::new(dir.path(), NoopHook);
        assert!(matches!(fs.read(42, 1, 0), Err(FsError::BadHandle(42))));
        assert_eq!(fs.release(42).unwrap_err().errno(), libc::EBADF);
        assert!(fs.releasedir(42).is_err());
    }

    #[test]
    fn test_truncate_and_chmod() {
        let dir = tempdir().unwrap();
        let fs = HookedFs::new(dir.path(), NoopHook);
        std::fs::write(dir.path().join("t"), b"0123456789").unwrap();

        fs.truncate(Path::new("t"), None, 4).unwrap();
        fs.chmod(Path::new("t"), 0o600).unwrap();

        let meta = fs.getattr(Path::new("t")).unwrap();
        assert_eq!(meta.len(), 4);
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);

        fs.unlink(Path::new("t")).unwrap();
        assert!(fs.getattr(Path::new("t")).is_err());
    }

    #[test]
    fn test_rename_and_symlinks() {
        let dir = tempdir().unwrap();
        let fs = HookedFs::new(dir.path(), NoopHook);
        std::fs::write(dir.path().join("a"), b"data").unwrap();

        fs.rename(Path::new("a"), Path::new("b")).unwrap();
        assert!(!dir.path().join("a").exists());
        assert_eq!(std::fs::read(dir.path().join("b")).unwrap(), b"data");

        fs.symlink(Path::new("b"), Path::new("link")).unwrap();
        assert_eq!(fs.readlink(Path::new("link")).unwrap(), PathBuf::from("b"));
        assert!(fs.getattr(Path::new("link")).unwrap().file_type().is_symlink());

        assert_eq!(
            fs.readlink(Path::new("b")).unwrap_err().errno(),
            libc::EINVAL
        );
        assert_eq!(
            fs.rename(Path::new("missing"), Path::new("c")).unwrap_err().errno(),
            libc::ENOENT
        );
    }

    #[test]
    fn test_set_times() {
        let dir = tempdir().unwrap();
        let fs = HookedFs::new(dir.path(), NoopHook);
        std::fs::write(dir.path().join("t"), b"x").unwrap();
        let mtime = std::time::UNIX_EPOCH + std::time::Duration::from_secs(1_000_000);

        fs.set_times(Path::new("t"), None, Some(mtime)).unwrap();
        fs.set_times(Path::new("t"), None, None).unwrap();

        let meta = fs.getattr(Path::new("t")).unwrap();
        assert_eq!(meta.modified().unwrap(), mtime);
    }

    #[test]
    fn test_negative_offset() {
        let dir = tempdir().unwrap();
        let fs = HookedFs::new(dir.path(), NoopHook);
        let fh = fs.create(Path::new("n"), libc::O_RDWR, 0o644).unwrap();
        assert!(matches!(fs.read(fh, 1, -1), Err(FsError::InvalidOffset(-1))));
    }
}
