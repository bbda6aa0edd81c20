use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use fairlock_error::{FairlockError, Result};
use fairlock_types::LockLevel;
use fairlock_types::cx::Cx;
use fairlock_types::flags::{AccessFlags, SyncFlags, VfsOpenFlags};

use crate::shm::ShmRegion;

/// Collapse `.` and `..` components without touching the filesystem.
///
/// `..` at the root stays at the root. Symlinks are not resolved.
#[must_use]
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other),
        }
    }
    out
}

/// A virtual filesystem implementation.
///
/// Modeled after the engine's `sqlite3_vfs` struct. The table is versioned:
/// [`Vfs::version`] reports which tier of operations the implementation
/// defines (1: base operations, 2: adds `current_time_i64`, 3: adds the
/// system-call override hooks).
pub trait Vfs: Send + Sync {
    /// The file handle type produced by this VFS.
    type File: VfsFile;

    /// The registry name of this VFS (e.g., "unix", "memory").
    fn name(&self) -> &str;

    /// Operation-table version implemented by this VFS.
    fn version(&self) -> u32 {
        1
    }

    /// Open a file.
    ///
    /// `path` is `None` for temporary files that should be auto-named.
    /// `flags` describes what kind of file (main DB, journal, WAL, etc.)
    /// and how to open it (create, read-write, exclusive, etc.).
    ///
    /// Returns the opened file and the flags that were actually used.
    fn open(
        &self,
        cx: &Cx,
        path: Option<&Path>,
        flags: VfsOpenFlags,
    ) -> Result<(Self::File, VfsOpenFlags)>;

    /// Delete a file.
    fn delete(&self, cx: &Cx, path: &Path, sync_dir: bool) -> Result<()>;

    /// Check file access.
    fn access(&self, cx: &Cx, path: &Path, flags: AccessFlags) -> Result<bool>;

    /// Resolve a potentially relative path into an absolute path.
    fn full_pathname(&self, cx: &Cx, path: &Path) -> Result<PathBuf>;

    /// Fill `buf` with bytes suitable for temporary file naming.
    ///
    /// The default implementation is deterministic (xorshift) for
    /// reproducible tests.
    fn randomness(&self, cx: &Cx, buf: &mut [u8]) {
        let mut state: u64 = 0x5DEE_CE66_D1A4_F681 ^ cx.unix_millis();
        for chunk in buf.chunks_mut(8) {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let bytes = state.to_le_bytes();
            for (dst, &src) in chunk.iter_mut().zip(bytes.iter()) {
                *dst = src;
            }
        }
    }

    /// Sleep for at least `duration`; returns the time actually slept.
    fn sleep(&self, _cx: &Cx, duration: Duration) -> Duration {
        std::thread::sleep(duration);
        duration
    }

    /// Return the current time as a Julian day number.
    fn current_time(&self, cx: &Cx) -> f64 {
        cx.current_time_julian_day()
    }

    /// Return the current time as milliseconds since the Julian epoch
    /// (version 2 and later).
    #[allow(clippy::cast_possible_truncation)]
    fn current_time_i64(&self, cx: &Cx) -> i64 {
        (self.current_time(cx) * 86_400_000.0) as i64
    }

    /// The most recent error recorded for this caller.
    fn last_error(&self, cx: &Cx) -> Option<String> {
        cx.pending_error().map(|e| e.message)
    }

    /// Iterate the names of overridable system calls (version 3 and later).
    ///
    /// `after = None` returns the first name; otherwise the name following
    /// `after`.
    fn next_system_call(&self, _after: Option<&str>) -> Option<&'static str> {
        None
    }
}

/// A file-control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileControl {
    /// Report the handle's current lock level.
    LockState,
    /// Advise the file of its expected final size.
    SizeHint(u64),
    /// Set the allocation chunk size.
    ChunkSize(u32),
    /// An opcode this crate does not model.
    Other(i32),
}

impl FileControl {
    /// The engine's `SQLITE_FCNTL_*` opcode.
    #[must_use]
    pub const fn opcode(self) -> i32 {
        match self {
            Self::LockState => 1,
            Self::SizeHint(_) => 5,
            Self::ChunkSize(_) => 6,
            Self::Other(op) => op,
        }
    }
}

/// Reply to a [`FileControl`] request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileControlReply {
    /// The request was handled and has no result.
    Done,
    /// Reply to [`FileControl::LockState`].
    LockState(LockLevel),
}

/// A file handle opened by a VFS.
///
/// Corresponds to the engine's `sqlite3_file` + `sqlite3_io_methods`.
/// [`VfsFile::io_version`] reports the method-table tier: 1 covers the base
/// operations, 2 adds the shared-memory methods.
pub trait VfsFile: Send + Sync {
    /// Method-table version implemented by this file.
    fn io_version(&self) -> u32 {
        1
    }

    /// Close the file.
    ///
    /// After a successful close, the file handle should not be used. A failed
    /// close leaves the handle usable so the caller can retry.
    fn close(&mut self, cx: &Cx) -> Result<()>;

    /// Read `buf.len()` bytes starting at byte offset `offset`.
    ///
    /// Returns the number of bytes actually read. If fewer bytes are read
    /// than requested (short read), the remaining bytes in `buf` are zeroed.
    fn read(&mut self, cx: &Cx, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Write `buf` starting at byte offset `offset`.
    fn write(&mut self, cx: &Cx, buf: &[u8], offset: u64) -> Result<()>;

    /// Truncate the file to `size` bytes.
    fn truncate(&mut self, cx: &Cx, size: u64) -> Result<()>;

    /// Sync the file contents to stable storage.
    fn sync(&mut self, cx: &Cx, flags: SyncFlags) -> Result<()>;

    /// Return the current file size in bytes.
    fn file_size(&self, cx: &Cx) -> Result<u64>;

    /// Acquire a file lock at the given level.
    ///
    /// Five-level locking: None < Shared < Reserved < Pending < Exclusive.
    /// Requesting a level at or below the one held is a no-op.
    fn lock(&mut self, cx: &Cx, level: LockLevel) -> Result<()>;

    /// Release the file lock down to the given level.
    fn unlock(&mut self, cx: &Cx, level: LockLevel) -> Result<()>;

    /// Check if another connection holds a RESERVED or higher lock.
    fn check_reserved_lock(&self, cx: &Cx) -> Result<bool>;

    /// Handle a file-control request.
    fn file_control(&mut self, _cx: &Cx, op: FileControl) -> Result<FileControlReply> {
        Err(FairlockError::FileControlNotFound { op: op.opcode() })
    }

    /// Return the sector size for this file.
    fn sector_size(&self) -> u32 {
        4096
    }

    /// Return device characteristics flags (0 for none).
    fn device_characteristics(&self) -> u32 {
        0
    }

    // --- Shared-memory methods (version 2, required for WAL mode) ---

    /// Map a region of shared memory. `region` is a 0-based index of `size`
    /// byte regions. If `extend` is true and the region does not exist,
    /// create it.
    fn shm_map(&mut self, cx: &Cx, region: u32, size: u32, extend: bool) -> Result<ShmRegion>;

    /// Acquire or release a shared-memory lock over slots `offset..offset+n`.
    fn shm_lock(&mut self, cx: &Cx, offset: u32, n: u32, flags: u32) -> Result<()>;

    /// Memory barrier for shared memory.
    fn shm_barrier(&self);

    /// Unmap all shared-memory regions. If `delete` is true, also delete
    /// the underlying SHM file.
    fn shm_unmap(&mut self, cx: &Cx, delete: bool) -> Result<()>;
}
