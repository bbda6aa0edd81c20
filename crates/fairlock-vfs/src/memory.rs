use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use fairlock_error::{FairlockError, Result};
use fairlock_types::LockLevel;
use fairlock_types::cx::Cx;
use fairlock_types::flags::{AccessFlags, SyncFlags, VfsOpenFlags};
use parking_lot::Mutex;
use tracing::debug;

use crate::lock_state::{NoOsLocks, SharedLockState};
use crate::shm::{ShmLockFlags, ShmLockTable, ShmRegion};
use crate::traits::{FileControl, FileControlReply, Vfs, VfsFile, normalize_path};

/// Shared storage for one named file in the memory VFS.
///
/// Every handle open on the same path shares the bytes, the lock record and
/// the shared-memory regions.
#[derive(Debug, Default)]
struct FileStorage {
    data: Vec<u8>,
    locks: SharedLockState,
    shm_regions: Vec<ShmRegion>,
    shm_locks: ShmLockTable,
}

#[derive(Debug, Default)]
struct MemoryVfsInner {
    files: HashMap<PathBuf, Arc<Mutex<FileStorage>>>,
    next_temp_id: u64,
}

/// An in-memory VFS for tests and embedders without a filesystem.
///
/// Handles opened through one `MemoryVfs` on the same path see the same bytes
/// and contend for the same five-level lock, exactly as two handles on one
/// inode would.
#[derive(Debug, Clone)]
pub struct MemoryVfs {
    name: String,
    inner: Arc<Mutex<MemoryVfsInner>>,
    next_handle: Arc<AtomicU64>,
}

impl Default for MemoryVfs {
    fn default() -> Self {
        Self::named("memory")
    }
}

impl MemoryVfs {
    /// Create a new empty in-memory VFS.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty in-memory VFS registered under `name`.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Arc::default(),
            next_handle: Arc::new(AtomicU64::new(1)),
        }
    }
}

/// Storage key for `path`: absolute under `/`, dots collapsed.
fn storage_key(path: &Path) -> PathBuf {
    normalize_path(&Path::new("/").join(path))
}

impl Vfs for MemoryVfs {
    type File = MemoryFile;

    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> u32 {
        2
    }

    fn open(
        &self,
        _cx: &Cx,
        path: Option<&Path>,
        flags: VfsOpenFlags,
    ) -> Result<(Self::File, VfsOpenFlags)> {
        let mut inner = self.inner.lock();

        let resolved_path = if let Some(p) = path {
            storage_key(p)
        } else {
            let id = inner.next_temp_id;
            inner.next_temp_id += 1;
            PathBuf::from(format!("__temp_{id}__"))
        };

        let is_create = flags.contains(VfsOpenFlags::CREATE);
        let storage = if let Some(existing) = inner.files.get(&resolved_path) {
            Arc::clone(existing)
        } else if is_create {
            let storage = Arc::new(Mutex::new(FileStorage::default()));
            inner
                .files
                .insert(resolved_path.clone(), Arc::clone(&storage));
            storage
        } else {
            return Err(FairlockError::CannotOpen {
                path: resolved_path,
            });
        };
        drop(inner);

        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        debug!(path = %resolved_path.display(), handle, "memory vfs open");

        let file = MemoryFile {
            path: resolved_path,
            storage,
            handle,
            lock_level: LockLevel::None,
            delete_on_close: flags.contains(VfsOpenFlags::DELETEONCLOSE),
            vfs: Arc::clone(&self.inner),
        };

        let mut out_flags = flags;
        if is_create {
            out_flags |= VfsOpenFlags::READWRITE;
        }
        Ok((file, out_flags))
    }

    fn delete(&self, _cx: &Cx, path: &Path, _sync_dir: bool) -> Result<()> {
        self.inner.lock().files.remove(&storage_key(path));
        Ok(())
    }

    fn access(&self, _cx: &Cx, path: &Path, _flags: AccessFlags) -> Result<bool> {
        Ok(self.inner.lock().files.contains_key(&storage_key(path)))
    }

    fn full_pathname(&self, _cx: &Cx, path: &Path) -> Result<PathBuf> {
        Ok(storage_key(path))
    }
}

fn out_of_range(path: &Path, offset: u64) -> FairlockError {
    FairlockError::Io(io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("offset {offset} out of range for {}", path.display()),
    ))
}

/// A file handle in the memory VFS.
#[derive(Debug)]
pub struct MemoryFile {
    path: PathBuf,
    storage: Arc<Mutex<FileStorage>>,
    handle: u64,
    lock_level: LockLevel,
    delete_on_close: bool,
    vfs: Arc<Mutex<MemoryVfsInner>>,
}

impl MemoryFile {
    /// The level this handle currently holds.
    #[must_use]
    pub fn lock_level(&self) -> LockLevel {
        self.lock_level
    }
}

impl VfsFile for MemoryFile {
    fn io_version(&self) -> u32 {
        2
    }

    fn close(&mut self, cx: &Cx) -> Result<()> {
        self.unlock(cx, LockLevel::None)?;
        self.storage.lock().shm_locks.release_all(self.handle);
        if self.delete_on_close {
            self.vfs.lock().files.remove(&self.path);
        }
        Ok(())
    }

    fn read(&mut self, _cx: &Cx, buf: &mut [u8], offset: u64) -> Result<usize> {
        let storage = self.storage.lock();
        let file_len = storage.data.len();
        let offset = match usize::try_from(offset) {
            Ok(offset) if offset < file_len => offset,
            _ => {
                drop(storage);
                buf.fill(0);
                return Ok(0);
            }
        };

        let to_read = buf.len().min(file_len - offset);
        buf[..to_read].copy_from_slice(&storage.data[offset..offset + to_read]);
        drop(storage);

        buf[to_read..].fill(0);
        Ok(to_read)
    }

    fn write(&mut self, _cx: &Cx, buf: &[u8], offset: u64) -> Result<()> {
        let start = usize::try_from(offset).map_err(|_| out_of_range(&self.path, offset))?;
        let end = start
            .checked_add(buf.len())
            .ok_or_else(|| out_of_range(&self.path, offset))?;

        let mut storage = self.storage.lock();
        if end > storage.data.len() {
            let grow = end - storage.data.len();
            storage
                .data
                .try_reserve(grow)
                .map_err(|_| out_of_range(&self.path, offset))?;
            storage.data.resize(end, 0);
        }
        storage.data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn truncate(&mut self, _cx: &Cx, size: u64) -> Result<()> {
        // A size past usize::MAX is past the end of any buffer, so nothing to cut.
        if let Ok(size) = usize::try_from(size) {
            self.storage.lock().data.truncate(size);
        }
        Ok(())
    }

    fn sync(&mut self, _cx: &Cx, _flags: SyncFlags) -> Result<()> {
        Ok(())
    }

    fn file_size(&self, _cx: &Cx) -> Result<u64> {
        Ok(self.storage.lock().data.len() as u64)
    }

    fn lock(&mut self, _cx: &Cx, level: LockLevel) -> Result<()> {
        let mut storage = self.storage.lock();
        storage
            .locks
            .acquire(&mut self.lock_level, level, &NoOsLocks)
    }

    fn unlock(&mut self, _cx: &Cx, level: LockLevel) -> Result<()> {
        let mut storage = self.storage.lock();
        storage
            .locks
            .release(&mut self.lock_level, level, &NoOsLocks)
    }

    fn check_reserved_lock(&self, _cx: &Cx) -> Result<bool> {
        Ok(self.storage.lock().locks.reserved_in_process())
    }

    fn file_control(&mut self, _cx: &Cx, op: FileControl) -> Result<FileControlReply> {
        match op {
            FileControl::LockState => Ok(FileControlReply::LockState(self.lock_level)),
            FileControl::SizeHint(_) | FileControl::ChunkSize(_) => Ok(FileControlReply::Done),
            FileControl::Other(op) => Err(FairlockError::FileControlNotFound { op }),
        }
    }

    fn shm_map(&mut self, _cx: &Cx, region: u32, size: u32, extend: bool) -> Result<ShmRegion> {
        let mut storage = self.storage.lock();
        let index = region as usize;
        if index >= storage.shm_regions.len() {
            if !extend {
                return Err(FairlockError::internal(format!(
                    "shm region {region} not mapped"
                )));
            }
            storage
                .shm_regions
                .resize_with(index + 1, || ShmRegion::new(size as usize));
        }
        Ok(storage.shm_regions[index].clone())
    }

    fn shm_lock(&mut self, _cx: &Cx, offset: u32, n: u32, flags: u32) -> Result<()> {
        let flags = ShmLockFlags::from_bits(flags)
            .ok_or_else(|| FairlockError::misuse(format!("shm lock flags {flags:#x}")))?;
        self.storage
            .lock()
            .shm_locks
            .apply(self.handle, offset, n, flags)
    }

    fn shm_barrier(&self) {
        std::sync::atomic::fence(Ordering::SeqCst);
    }

    fn shm_unmap(&mut self, _cx: &Cx, delete: bool) -> Result<()> {
        let mut storage = self.storage.lock();
        storage.shm_locks.release_all(self.handle);
        if delete {
            storage.shm_regions.clear();
        }
        Ok(())
    }
}
