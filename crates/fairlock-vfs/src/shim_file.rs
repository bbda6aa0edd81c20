//! Per-file decorator routing lock traffic through an arbiter.

use std::sync::Arc;

use fairlock_error::{FairlockError, Result};
use fairlock_types::LockLevel;
use fairlock_types::cx::Cx;
use fairlock_types::flags::SyncFlags;
use tracing::debug;

use crate::arbiter::Arbiter;
use crate::connection::{ConnectionId, ConnectionRegistry};
use crate::coordinator::{LockTarget, coordinate_lock, coordinate_unlock};
use crate::methods::{IoMethods, IoSlot};
use crate::registry::BoxedFile;
use crate::shm::ShmRegion;
use crate::traits::{FileControl, FileControlReply, VfsFile};

/// What a coordinated file is bound to for its lifetime.
pub struct FileBinding {
    pub filename: String,
    pub connection: ConnectionId,
    pub connections: Arc<ConnectionRegistry>,
    pub arbiter: Arc<dyn Arbiter>,
}

impl FileBinding {
    fn target(&self) -> LockTarget<'_> {
        LockTarget {
            filename: &self.filename,
            connection: self.connection,
            connections: &self.connections,
            arbiter: self.arbiter.as_ref(),
        }
    }
}

/// A main database file whose lock and unlock go through the arbiter.
///
/// Every other operation forwards to the root file, limited to the slots
/// negotiated for it. After a successful close the binding is gone and every
/// operation is misuse.
pub struct FileShim {
    root: BoxedFile,
    methods: IoMethods,
    binding: Option<FileBinding>,
}

fn closed() -> FairlockError {
    FairlockError::misuse("file shim used after close")
}

impl FileShim {
    #[must_use]
    pub fn new(root: BoxedFile, methods: IoMethods, binding: FileBinding) -> Self {
        debug!(
            file = %binding.filename,
            connection = %binding.connection,
            io_version = methods.version(),
            "file shim installed"
        );
        Self {
            root,
            methods,
            binding: Some(binding),
        }
    }

    #[must_use]
    pub fn filename(&self) -> Option<&str> {
        self.binding.as_ref().map(|b| b.filename.as_str())
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.binding.is_none()
    }

    fn root(&self) -> Result<&dyn VfsFile> {
        if self.binding.is_none() {
            return Err(closed());
        }
        Ok(self.root.as_ref())
    }

    fn root_mut(&mut self) -> Result<&mut dyn VfsFile> {
        if self.binding.is_none() {
            return Err(closed());
        }
        Ok(self.root.as_mut())
    }

    fn has_shm(&self) -> bool {
        self.methods.has(IoSlot::ShmMap)
    }
}

impl VfsFile for FileShim {
    fn io_version(&self) -> u32 {
        self.methods.version()
    }

    fn close(&mut self, cx: &Cx) -> Result<()> {
        self.root_mut()?.close(cx)?;
        if let Some(binding) = self.binding.take() {
            debug!(file = %binding.filename, "file shim released");
        }
        Ok(())
    }

    fn read(&mut self, cx: &Cx, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.root_mut()?.read(cx, buf, offset)
    }

    fn write(&mut self, cx: &Cx, buf: &[u8], offset: u64) -> Result<()> {
        self.root_mut()?.write(cx, buf, offset)
    }

    fn truncate(&mut self, cx: &Cx, size: u64) -> Result<()> {
        self.root_mut()?.truncate(cx, size)
    }

    fn sync(&mut self, cx: &Cx, flags: SyncFlags) -> Result<()> {
        self.root_mut()?.sync(cx, flags)
    }

    fn file_size(&self, cx: &Cx) -> Result<u64> {
        self.root()?.file_size(cx)
    }

    fn lock(&mut self, cx: &Cx, level: LockLevel) -> Result<()> {
        let binding = self.binding.as_ref().ok_or_else(closed)?;
        coordinate_lock(cx, self.root.as_mut(), &binding.target(), level)
    }

    fn unlock(&mut self, cx: &Cx, level: LockLevel) -> Result<()> {
        let binding = self.binding.as_ref().ok_or_else(closed)?;
        coordinate_unlock(cx, self.root.as_mut(), &binding.target(), level)
    }

    fn check_reserved_lock(&self, cx: &Cx) -> Result<bool> {
        self.root()?.check_reserved_lock(cx)
    }

    fn file_control(&mut self, cx: &Cx, op: FileControl) -> Result<FileControlReply> {
        self.root_mut()?.file_control(cx, op)
    }

    fn sector_size(&self) -> u32 {
        self.root.sector_size()
    }

    fn device_characteristics(&self) -> u32 {
        self.root.device_characteristics()
    }

    fn shm_map(&mut self, cx: &Cx, region: u32, size: u32, extend: bool) -> Result<ShmRegion> {
        if !self.has_shm() {
            return Err(FairlockError::Unsupported);
        }
        self.root_mut()?.shm_map(cx, region, size, extend)
    }

    fn shm_lock(&mut self, cx: &Cx, offset: u32, n: u32, flags: u32) -> Result<()> {
        if !self.has_shm() {
            return Err(FairlockError::Unsupported);
        }
        self.root_mut()?.shm_lock(cx, offset, n, flags)
    }

    fn shm_barrier(&self) {
        if self.has_shm() && self.binding.is_some() {
            self.root.shm_barrier();
        }
    }

    fn shm_unmap(&mut self, cx: &Cx, delete: bool) -> Result<()> {
        if !self.has_shm() {
            return Ok(());
        }
        self.root_mut()?.shm_unmap(cx, delete)
    }
}

impl std::fmt::Debug for FileShim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileShim")
            .field("filename", &self.filename())
            .field("connection", &self.binding.as_ref().map(|b| b.connection))
            .field("io_version", &self.methods.version())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// A file handed out by a connection VFS.
pub enum ShimFile {
    /// Journals, WAL and temp files, or any file while coordination is
    /// disabled: the root handle untouched.
    Passthrough(BoxedFile),
    Coordinated(FileShim),
}

impl std::fmt::Debug for ShimFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Passthrough(root) => f
                .debug_tuple("Passthrough")
                .field(&format_args!("io_version: {}", root.io_version()))
                .finish(),
            Self::Coordinated(shim) => f.debug_tuple("Coordinated").field(shim).finish(),
        }
    }
}

impl ShimFile {
    #[must_use]
    pub fn is_coordinated(&self) -> bool {
        matches!(self, Self::Coordinated(_))
    }

    fn file(&self) -> &dyn VfsFile {
        match self {
            Self::Passthrough(root) => root.as_ref(),
            Self::Coordinated(shim) => shim,
        }
    }

    fn file_mut(&mut self) -> &mut dyn VfsFile {
        match self {
            Self::Passthrough(root) => root.as_mut(),
            Self::Coordinated(shim) => shim,
        }
    }
}

impl VfsFile for ShimFile {
    fn io_version(&self) -> u32 {
        self.file().io_version()
    }

    fn close(&mut self, cx: &Cx) -> Result<()> {
        self.file_mut().close(cx)
    }

    fn read(&mut self, cx: &Cx, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.file_mut().read(cx, buf, offset)
    }

    fn write(&mut self, cx: &Cx, buf: &[u8], offset: u64) -> Result<()> {
        self.file_mut().write(cx, buf, offset)
    }

    fn truncate(&mut self, cx: &Cx, size: u64) -> Result<()> {
        self.file_mut().truncate(cx, size)
    }

    fn sync(&mut self, cx: &Cx, flags: SyncFlags) -> Result<()> {
        self.file_mut().sync(cx, flags)
    }

    fn file_size(&self, cx: &Cx) -> Result<u64> {
        self.file().file_size(cx)
    }

    fn lock(&mut self, cx: &Cx, level: LockLevel) -> Result<()> {
        self.file_mut().lock(cx, level)
    }

    fn unlock(&mut self, cx: &Cx, level: LockLevel) -> Result<()> {
        self.file_mut().unlock(cx, level)
    }

    fn check_reserved_lock(&self, cx: &Cx) -> Result<bool> {
        self.file().check_reserved_lock(cx)
    }

    fn file_control(&mut self, cx: &Cx, op: FileControl) -> Result<FileControlReply> {
        self.file_mut().file_control(cx, op)
    }

    fn sector_size(&self) -> u32 {
        self.file().sector_size()
    }

    fn device_characteristics(&self) -> u32 {
        self.file().device_characteristics()
    }

    fn shm_map(&mut self, cx: &Cx, region: u32, size: u32, extend: bool) -> Result<ShmRegion> {
        self.file_mut().shm_map(cx, region, size, extend)
    }

    fn shm_lock(&mut self, cx: &Cx, offset: u32, n: u32, flags: u32) -> Result<()> {
        self.file_mut().shm_lock(cx, offset, n, flags)
    }

    fn shm_barrier(&self) {
        self.file().shm_barrier();
    }

    fn shm_unmap(&mut self, cx: &Cx, delete: bool) -> Result<()> {
        self.file_mut().shm_unmap(cx, delete)
    }
}
