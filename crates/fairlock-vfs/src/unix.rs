//! Unix VFS with POSIX fcntl byte-range locking.
//!
//! **Lock byte ranges (at the 1 GB boundary, shared with every other engine
//! process touching the file):**
//! - `PENDING_BYTE`  = `0x4000_0000` (1 byte)
//! - `RESERVED_BYTE` = `0x4000_0001` (1 byte)
//! - `SHARED_FIRST`  = `0x4000_0002` (510 bytes)
//!
//! POSIX locks belong to the process, not the descriptor, and closing any
//! descriptor drops them all. Handles on one inode therefore share a single
//! descriptor and a single [`SharedLockState`] through the process-wide
//! inode table; in-process conflicts are settled there before any `fcntl`.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs::{self, File, OpenOptions};
use std::io::Read;
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::fs::{FileExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use fairlock_error::{FairlockError, Result};
use fairlock_types::LockLevel;
use fairlock_types::cx::Cx;
use fairlock_types::flags::{AccessFlags, SyncFlags, VfsOpenFlags};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::lock_state::{LockRange, OsLocks, RangeLock, SharedLockState};
use crate::shm::ShmRegion;
use crate::traits::{FileControl, FileControlReply, Vfs, VfsFile, normalize_path};

// ---------------------------------------------------------------------------
// Lock byte constants
// ---------------------------------------------------------------------------

const PENDING_BYTE: u64 = 0x4000_0000;
const RESERVED_BYTE: u64 = PENDING_BYTE + 1;
const SHARED_FIRST: u64 = PENDING_BYTE + 2;
const SHARED_SIZE: u64 = 510;

/// System calls this VFS reports through `next_system_call`.
const SYSCALLS: &[&str] = &[
    "open",
    "close",
    "access",
    "getcwd",
    "stat",
    "fstat",
    "ftruncate",
    "fcntl",
    "pread",
    "pwrite",
    "fsync",
    "unlink",
];

// ---------------------------------------------------------------------------
// POSIX fcntl helpers
// ---------------------------------------------------------------------------

fn flock(lock_type: i32, start: u64, len: u64) -> Result<libc::flock> {
    let l_type = i16::try_from(lock_type)
        .map_err(|_| FairlockError::internal("fcntl lock type out of range"))?;
    let l_whence = i16::try_from(libc::SEEK_SET)
        .map_err(|_| FairlockError::internal("SEEK_SET out of range"))?;
    let l_start = libc::off_t::try_from(start)
        .map_err(|_| FairlockError::internal("lock offset out of range"))?;
    let l_len = libc::off_t::try_from(len)
        .map_err(|_| FairlockError::internal("lock length out of range"))?;
    Ok(libc::flock {
        l_type,
        l_whence,
        l_start,
        l_len,
        l_pid: 0,
    })
}

/// Non-blocking `fcntl(F_SETLK)`.
///
/// `Ok(false)` means another process holds a conflicting lock.
fn posix_lock(file: &impl AsFd, lock_type: i32, start: u64, len: u64) -> Result<bool> {
    let request = flock(lock_type, start, len)?;
    match nix::fcntl::fcntl(
        file.as_fd().as_raw_fd(),
        nix::fcntl::FcntlArg::F_SETLK(&request),
    ) {
        Ok(_) => Ok(true),
        Err(nix::errno::Errno::EACCES | nix::errno::Errno::EAGAIN) => Ok(false),
        Err(e) => Err(FairlockError::Io(e.into())),
    }
}

/// `fcntl(F_GETLK)`: the lock that would block `lock_type`, if any.
fn posix_getlk(file: &impl AsFd, lock_type: i32, start: u64, len: u64) -> Result<libc::flock> {
    let mut query = flock(lock_type, start, len)?;
    nix::fcntl::fcntl(
        file.as_fd().as_raw_fd(),
        nix::fcntl::FcntlArg::F_GETLK(&mut query),
    )
    .map_err(|e| FairlockError::Io(e.into()))?;
    Ok(query)
}

/// [`OsLocks`] over one inode's canonical descriptor.
struct PosixLocks<'a> {
    file: &'a File,
    path: &'a Path,
}

impl OsLocks for PosixLocks<'_> {
    fn set(&self, range: LockRange, lock: RangeLock) -> Result<()> {
        let (start, len) = match range {
            LockRange::Pending => (PENDING_BYTE, 1),
            LockRange::Reserved => (RESERVED_BYTE, 1),
            LockRange::Shared => (SHARED_FIRST, SHARED_SIZE),
        };
        let lock_type = match lock {
            RangeLock::Read => libc::F_RDLCK,
            RangeLock::Write => libc::F_WRLCK,
            RangeLock::Unlock => libc::F_UNLCK,
        };
        match posix_lock(self.file, lock_type, start, len) {
            Ok(true) => Ok(()),
            Ok(false) if lock == RangeLock::Unlock => Err(FairlockError::unlock_io(
                self.path.display().to_string(),
                "F_UNLCK reported contention",
            )),
            Ok(false) => Err(FairlockError::Busy),
            Err(err) if lock == RangeLock::Unlock => Err(FairlockError::unlock_io(
                self.path.display().to_string(),
                err.to_string(),
            )),
            Err(err) => Err(FairlockError::lock_io(
                self.path.display().to_string(),
                err.to_string(),
            )),
        }
    }

    fn reserved_elsewhere(&self) -> Result<bool> {
        let held = posix_getlk(self.file, libc::F_WRLCK, RESERVED_BYTE, 1)?;
        Ok(i32::from(held.l_type) != libc::F_UNLCK)
    }
}

// ---------------------------------------------------------------------------
// Inode table
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct InodeKey {
    dev: u64,
    ino: u64,
}

#[derive(Debug)]
struct InodeInfo {
    /// The one descriptor every handle on this inode reads, writes and locks
    /// through.
    file: Arc<File>,
    locks: SharedLockState,
    n_ref: u32,
}

#[derive(Default)]
struct InodeTable {
    map: Mutex<HashMap<InodeKey, Arc<Mutex<InodeInfo>>>>,
}

impl InodeTable {
    fn get(&self, key: InodeKey) -> Option<Arc<Mutex<InodeInfo>>> {
        self.map.lock().get(&key).cloned()
    }

    fn get_or_create(&self, key: InodeKey, file: Arc<File>) -> Arc<Mutex<InodeInfo>> {
        let mut map = self.map.lock();
        Arc::clone(map.entry(key).or_insert_with(|| {
            Arc::new(Mutex::new(InodeInfo {
                file,
                locks: SharedLockState::default(),
                n_ref: 0,
            }))
        }))
    }

    fn maybe_remove(&self, key: InodeKey) {
        let mut map = self.map.lock();
        let unused = map.get(&key).is_some_and(|info| info.lock().n_ref == 0);
        if unused {
            map.remove(&key);
        }
    }
}

fn global_inode_table() -> &'static InodeTable {
    static TABLE: OnceLock<InodeTable> = OnceLock::new();
    TABLE.get_or_init(InodeTable::default)
}

fn inode_key(meta: &fs::Metadata) -> InodeKey {
    InodeKey {
        dev: meta.dev(),
        ino: meta.ino(),
    }
}

fn inode_key_from_path(path: &Path) -> Result<Option<InodeKey>> {
    match fs::metadata(path) {
        Ok(meta) => Ok(Some(inode_key(&meta))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(FairlockError::Io(e)),
    }
}

// ---------------------------------------------------------------------------
// UnixVfs
// ---------------------------------------------------------------------------

/// A VFS backed by the real Unix filesystem.
#[derive(Debug, Default)]
pub struct UnixVfs;

impl UnixVfs {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn temp_path(&self, cx: &Cx) -> PathBuf {
        let mut rng_buf = [0u8; 16];
        self.randomness(cx, &mut rng_buf);
        let mut hex = String::with_capacity(32);
        for b in rng_buf {
            let _ = write!(hex, "{b:02x}");
        }
        std::env::temp_dir().join(format!("fairlock_{hex}.db"))
    }

    fn attach(
        path: PathBuf,
        key: InodeKey,
        info: Arc<Mutex<InodeInfo>>,
        flags: VfsOpenFlags,
    ) -> UnixFile {
        let file = {
            let mut guard = info.lock();
            guard.n_ref += 1;
            Arc::clone(&guard.file)
        };
        UnixFile {
            file,
            path,
            lock_level: LockLevel::None,
            delete_on_close: flags.contains(VfsOpenFlags::DELETEONCLOSE),
            inode_key: key,
            inode_info: info,
        }
    }
}

impl Vfs for UnixVfs {
    type File = UnixFile;

    fn name(&self) -> &str {
        "unix"
    }

    fn version(&self) -> u32 {
        3
    }

    fn open(
        &self,
        cx: &Cx,
        path: Option<&Path>,
        flags: VfsOpenFlags,
    ) -> Result<(Self::File, VfsOpenFlags)> {
        let is_temp = path.is_none();
        let resolved = path.map_or_else(|| self.temp_path(cx), Path::to_path_buf);
        let create_new = is_temp
            || (flags.contains(VfsOpenFlags::CREATE) && flags.contains(VfsOpenFlags::EXCLUSIVE));
        let is_create = is_temp || flags.contains(VfsOpenFlags::CREATE);

        let mut out_flags = flags;
        if is_create {
            out_flags |= VfsOpenFlags::READWRITE;
        }

        // Share the canonical descriptor when this process already has the
        // inode open.
        if !create_new {
            if let Some(key) = inode_key_from_path(&resolved)? {
                if let Some(info) = global_inode_table().get(key) {
                    debug!(path = %resolved.display(), "unix vfs open: reusing inode");
                    return Ok((Self::attach(resolved, key, info, flags), out_flags));
                }
            }
        }

        let is_rw = is_create || flags.contains(VfsOpenFlags::READWRITE);
        let file = OpenOptions::new()
            .read(true)
            .write(is_rw)
            .create(is_create)
            .create_new(create_new)
            .open(&resolved)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    FairlockError::CannotOpen {
                        path: resolved.clone(),
                    }
                } else {
                    FairlockError::Io(e)
                }
            })?;

        let key = inode_key(&file.metadata()?);
        let info = global_inode_table().get_or_create(key, Arc::new(file));
        debug!(path = %resolved.display(), "unix vfs open");
        Ok((Self::attach(resolved, key, info, flags), out_flags))
    }

    fn delete(&self, _cx: &Cx, path: &Path, sync_dir: bool) -> Result<()> {
        fs::remove_file(path)?;
        if sync_dir {
            if let Some(dir) = path.parent().and_then(|p| File::open(p).ok()) {
                drop(dir.sync_all());
            }
        }
        Ok(())
    }

    fn access(&self, _cx: &Cx, path: &Path, flags: AccessFlags) -> Result<bool> {
        match fs::metadata(path) {
            Ok(meta) if flags.contains(AccessFlags::READWRITE) => {
                Ok(!meta.permissions().readonly())
            }
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(FairlockError::Io(e)),
        }
    }

    fn full_pathname(&self, _cx: &Cx, path: &Path) -> Result<PathBuf> {
        if path.is_absolute() {
            Ok(normalize_path(path))
        } else {
            Ok(normalize_path(&std::env::current_dir()?.join(path)))
        }
    }

    fn randomness(&self, _cx: &Cx, buf: &mut [u8]) {
        static FALLBACK_SEQ: AtomicU64 = AtomicU64::new(0);

        if let Ok(mut f) = File::open("/dev/urandom") {
            if f.read_exact(buf).is_ok() {
                return;
            }
        }

        let seq = FALLBACK_SEQ.fetch_add(1, Ordering::Relaxed);
        let mut state: u64 = 0x5DEE_CE66_D1A4_F681 ^ seq.wrapping_mul(0x9E37_79B9_7F4A_7C15);
        for chunk in buf.chunks_mut(8) {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            for (dst, src) in chunk.iter_mut().zip(state.to_le_bytes()) {
                *dst = src;
            }
        }
    }

    fn next_system_call(&self, after: Option<&str>) -> Option<&'static str> {
        match after {
            None => SYSCALLS.first().copied(),
            Some(name) => {
                let at = SYSCALLS.iter().position(|s| *s == name)?;
                SYSCALLS.get(at + 1).copied()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// UnixFile
// ---------------------------------------------------------------------------

/// A file handle opened by [`UnixVfs`].
#[derive(Debug)]
pub struct UnixFile {
    file: Arc<File>,
    path: PathBuf,
    lock_level: LockLevel,
    delete_on_close: bool,
    inode_key: InodeKey,
    inode_info: Arc<Mutex<InodeInfo>>,
}

impl UnixFile {
    /// The level this handle currently holds.
    #[must_use]
    pub fn lock_level(&self) -> LockLevel {
        self.lock_level
    }
}

impl VfsFile for UnixFile {
    fn close(&mut self, cx: &Cx) -> Result<()> {
        self.unlock(cx, LockLevel::None)?;
        {
            let mut info = self.inode_info.lock();
            info.n_ref = info.n_ref.saturating_sub(1);
        }
        global_inode_table().maybe_remove(self.inode_key);

        if self.delete_on_close {
            if let Err(err) = fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), error = %err, "delete-on-close failed");
            }
        }
        Ok(())
    }

    fn read(&mut self, _cx: &Cx, buf: &mut [u8], offset: u64) -> Result<usize> {
        let mut total = 0_usize;
        while total < buf.len() {
            let n = self.file.read_at(&mut buf[total..], offset + total as u64)?;
            if n == 0 {
                break;
            }
            total += n;
        }
        buf[total..].fill(0);
        Ok(total)
    }

    fn write(&mut self, _cx: &Cx, buf: &[u8], offset: u64) -> Result<()> {
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn truncate(&mut self, _cx: &Cx, size: u64) -> Result<()> {
        self.file.set_len(size)?;
        Ok(())
    }

    fn sync(&mut self, _cx: &Cx, flags: SyncFlags) -> Result<()> {
        if flags.contains(SyncFlags::DATAONLY) {
            self.file.sync_data()?;
        } else {
            self.file.sync_all()?;
        }
        Ok(())
    }

    fn file_size(&self, _cx: &Cx) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn lock(&mut self, _cx: &Cx, level: LockLevel) -> Result<()> {
        let mut info = self.inode_info.lock();
        let os = PosixLocks {
            file: &self.file,
            path: &self.path,
        };
        info.locks.acquire(&mut self.lock_level, level, &os)
    }

    fn unlock(&mut self, _cx: &Cx, level: LockLevel) -> Result<()> {
        let mut info = self.inode_info.lock();
        let os = PosixLocks {
            file: &self.file,
            path: &self.path,
        };
        info.locks.release(&mut self.lock_level, level, &os)
    }

    fn check_reserved_lock(&self, _cx: &Cx) -> Result<bool> {
        if self.inode_info.lock().locks.reserved_in_process() {
            return Ok(true);
        }
        PosixLocks {
            file: &self.file,
            path: &self.path,
        }
        .reserved_elsewhere()
    }

    fn file_control(&mut self, _cx: &Cx, op: FileControl) -> Result<FileControlReply> {
        match op {
            FileControl::LockState => Ok(FileControlReply::LockState(self.lock_level)),
            FileControl::SizeHint(size) => {
                if size > self.file.metadata()?.len() {
                    self.file.set_len(size)?;
                }
                Ok(FileControlReply::Done)
            }
            FileControl::ChunkSize(_) => Ok(FileControlReply::Done),
            FileControl::Other(op) => Err(FairlockError::FileControlNotFound { op }),
        }
    }

    fn shm_map(&mut self, _cx: &Cx, _region: u32, _size: u32, _extend: bool) -> Result<ShmRegion> {
        Err(FairlockError::Unsupported)
    }

    fn shm_lock(&mut self, _cx: &Cx, _offset: u32, _n: u32, _flags: u32) -> Result<()> {
        Err(FairlockError::Unsupported)
    }

    fn shm_barrier(&self) {
        std::sync::atomic::fence(Ordering::SeqCst);
    }

    fn shm_unmap(&mut self, _cx: &Cx, _delete: bool) -> Result<()> {
        Ok(())
    }
}
