//! Process-wide set of named VFSes, with one designated default.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use fairlock_error::{FairlockError, Result};
use fairlock_types::cx::Cx;
use fairlock_types::flags::{AccessFlags, VfsOpenFlags};
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::traits::{Vfs, VfsFile};

/// A file handle of any backend.
pub type BoxedFile = Box<dyn VfsFile>;

/// Object-safe view of a [`Vfs`], as stored in a [`VfsRegistry`].
pub trait DynVfs: Send + Sync {
    fn name(&self) -> &str;
    fn version(&self) -> u32;
    fn open(
        &self,
        cx: &Cx,
        path: Option<&Path>,
        flags: VfsOpenFlags,
    ) -> Result<(BoxedFile, VfsOpenFlags)>;
    fn delete(&self, cx: &Cx, path: &Path, sync_dir: bool) -> Result<()>;
    fn access(&self, cx: &Cx, path: &Path, flags: AccessFlags) -> Result<bool>;
    fn full_pathname(&self, cx: &Cx, path: &Path) -> Result<PathBuf>;
    fn randomness(&self, cx: &Cx, buf: &mut [u8]);
    fn sleep(&self, cx: &Cx, duration: Duration) -> Duration;
    fn current_time(&self, cx: &Cx) -> f64;
    fn current_time_i64(&self, cx: &Cx) -> i64;
    fn last_error(&self, cx: &Cx) -> Option<String>;
    fn next_system_call(&self, after: Option<&str>) -> Option<&'static str>;
}

struct ErasedVfs<V>(Arc<V>);

impl<V> DynVfs for ErasedVfs<V>
where
    V: Vfs + 'static,
    V::File: 'static,
{
    fn name(&self) -> &str {
        self.0.name()
    }

    fn version(&self) -> u32 {
        self.0.version()
    }

    fn open(
        &self,
        cx: &Cx,
        path: Option<&Path>,
        flags: VfsOpenFlags,
    ) -> Result<(BoxedFile, VfsOpenFlags)> {
        let (file, out) = self.0.open(cx, path, flags)?;
        Ok((Box::new(file), out))
    }

    fn delete(&self, cx: &Cx, path: &Path, sync_dir: bool) -> Result<()> {
        self.0.delete(cx, path, sync_dir)
    }

    fn access(&self, cx: &Cx, path: &Path, flags: AccessFlags) -> Result<bool> {
        self.0.access(cx, path, flags)
    }

    fn full_pathname(&self, cx: &Cx, path: &Path) -> Result<PathBuf> {
        self.0.full_pathname(cx, path)
    }

    fn randomness(&self, cx: &Cx, buf: &mut [u8]) {
        self.0.randomness(cx, buf);
    }

    fn sleep(&self, cx: &Cx, duration: Duration) -> Duration {
        self.0.sleep(cx, duration)
    }

    fn current_time(&self, cx: &Cx) -> f64 {
        self.0.current_time(cx)
    }

    fn current_time_i64(&self, cx: &Cx) -> i64 {
        self.0.current_time_i64(cx)
    }

    fn last_error(&self, cx: &Cx) -> Option<String> {
        self.0.last_error(cx)
    }

    fn next_system_call(&self, after: Option<&str>) -> Option<&'static str> {
        self.0.next_system_call(after)
    }
}

/// Erase a concrete VFS into its registry form.
pub fn erase<V>(vfs: Arc<V>) -> Arc<dyn DynVfs>
where
    V: Vfs + 'static,
    V::File: 'static,
{
    Arc::new(ErasedVfs(vfs))
}

type Entries = RwLock<Vec<Arc<dyn DynVfs>>>;

/// Named VFS registry. The first entry is the default.
#[derive(Clone, Default)]
pub struct VfsRegistry {
    entries: Arc<Entries>,
}

impl VfsRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `vfs`. The first registration, or one with `make_default`,
    /// becomes the default.
    pub fn register<V>(&self, vfs: Arc<V>, make_default: bool) -> Result<VfsRegistration>
    where
        V: Vfs + 'static,
        V::File: 'static,
    {
        self.register_dyn(erase(vfs), make_default)
    }

    /// Register an already erased VFS.
    pub fn register_dyn(
        &self,
        vfs: Arc<dyn DynVfs>,
        make_default: bool,
    ) -> Result<VfsRegistration> {
        let name = vfs.name().to_owned();
        let mut entries = self.entries.write();
        if entries.iter().any(|v| v.name() == name) {
            return Err(FairlockError::VfsNameTaken { name });
        }
        if make_default {
            entries.insert(0, Arc::clone(&vfs));
        } else {
            entries.push(Arc::clone(&vfs));
        }
        drop(entries);

        info!(vfs = %name, default = make_default, "vfs registered");
        Ok(VfsRegistration {
            entries: Arc::downgrade(&self.entries),
            vfs: Arc::downgrade(&vfs),
            name,
            released: false,
        })
    }

    /// Look up a VFS by name, or the default when `name` is `None`.
    #[must_use]
    pub fn find(&self, name: Option<&str>) -> Option<Arc<dyn DynVfs>> {
        let entries = self.entries.read();
        match name {
            None => entries.first().cloned(),
            Some(name) => entries.iter().find(|v| v.name() == name).cloned(),
        }
    }

    /// Look up a VFS by name, failing when absent.
    pub fn get(&self, name: &str) -> Result<Arc<dyn DynVfs>> {
        self.find(Some(name))
            .ok_or_else(|| FairlockError::VfsNotFound {
                name: name.to_owned(),
            })
    }

    /// Registered names, default first.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.entries
            .read()
            .iter()
            .map(|v| v.name().to_owned())
            .collect()
    }
}

impl std::fmt::Debug for VfsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VfsRegistry")
            .field("names", &self.names())
            .finish()
    }
}

/// Keeps a VFS registered until released or dropped.
#[derive(Debug)]
pub struct VfsRegistration {
    entries: Weak<Entries>,
    vfs: Weak<dyn DynVfs>,
    name: String,
    released: bool,
}

impl VfsRegistration {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Unregister. Calling this more than once is harmless.
    pub fn release(&mut self) {
        if std::mem::replace(&mut self.released, true) {
            return;
        }
        let Some(entries) = self.entries.upgrade() else {
            return;
        };
        let mut entries = entries.write();
        let before = entries.len();
        entries.retain(|v| !Weak::ptr_eq(&Arc::downgrade(v), &self.vfs));
        if entries.len() != before {
            debug!(vfs = %self.name, "vfs unregistered");
        }
    }
}

impl Drop for VfsRegistration {
    fn drop(&mut self) {
        self.release();
    }
}
