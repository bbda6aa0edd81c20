//! Per-connection VFS that installs file shims on main database files.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use fairlock_error::{FairlockError, Result};
use fairlock_types::cx::Cx;
use fairlock_types::flags::{AccessFlags, VfsOpenFlags};
use tracing::{debug, warn};

use crate::arbiter::{ArbiterRegistry, ArbiterSlot};
use crate::connection::{ConnectionId, ConnectionRegistry};
use crate::methods::{IoMethods, IoSlot, Slot, VfsMethods, VfsSlot, negotiate_table};
use crate::registry::{DynVfs, VfsRegistration, VfsRegistry};
use crate::shim_file::{FileBinding, FileShim, ShimFile};
use crate::traits::Vfs;

/// Where a connection VFS finds its collaborators.
#[derive(Debug, Clone)]
pub struct Coordination {
    pub connections: Arc<ConnectionRegistry>,
    pub arbiters: ArbiterRegistry,
    /// Registry name file shims bind their arbiter from.
    pub arbiter_name: String,
}

/// Wraps a root VFS for one connection.
///
/// Only `open` is intercepted; everything else forwards to the root, limited
/// to the slots the root's table version defines.
pub struct ConnectionVfs {
    name: String,
    root: Arc<dyn DynVfs>,
    methods: VfsMethods,
    connection: ConnectionId,
    coordination: Coordination,
}

impl ConnectionVfs {
    /// Wrap `root_name` (or the registry default) for `connection` and
    /// register the wrapper under a unique name. It does not become the
    /// default.
    pub fn create(
        registry: &VfsRegistry,
        coordination: Coordination,
        connection: ConnectionId,
        root_name: Option<&str>,
    ) -> Result<ShimVfsHandle> {
        let root = match root_name {
            Some(name) => registry.get(name)?,
            None => registry.find(None).ok_or(FairlockError::NoDefaultVfs)?,
        };
        if !coordination.connections.contains(connection) {
            return Err(FairlockError::misuse(format!(
                "{connection} is closed; cannot wrap a VFS for it"
            )));
        }

        let mut methods = VfsMethods::empty();
        negotiate_table(&mut methods, root.version(), VfsSlot::CEILING)?;

        let vfs = Arc::new_cyclic(|me| Self {
            name: format!("{:p}-fairlock", me.as_ptr()),
            root,
            methods,
            connection,
            coordination,
        });
        let registration = registry.register(Arc::clone(&vfs), false)?;
        debug!(
            vfs = %vfs.name,
            root = vfs.root.name(),
            connection = %connection,
            version = methods.version(),
            "connection vfs created"
        );
        Ok(ShimVfsHandle {
            vfs,
            registration: Some(registration),
        })
    }

    #[must_use]
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    #[must_use]
    pub fn methods(&self) -> VfsMethods {
        self.methods
    }

    #[must_use]
    pub fn root_name(&self) -> &str {
        self.root.name()
    }

    /// Name the arbiter knows the file by: the root's full pathname.
    /// Every spelling of one path maps to the same name.
    fn arbiter_filename(&self, cx: &Cx, path: Option<&Path>) -> Result<String> {
        match path {
            Some(path) => Ok(self
                .root
                .full_pathname(cx, path)?
                .to_string_lossy()
                .into_owned()),
            None => Ok(String::new()),
        }
    }

    /// Negotiate the file's table and bind its arbiter. `None` means
    /// coordination is disabled for this file.
    fn bind(&self, io_version: u32) -> Result<Option<(IoMethods, ArbiterSlot)>> {
        let mut methods = IoMethods::empty();
        negotiate_table(&mut methods, io_version, IoSlot::CEILING)?;
        match self
            .coordination
            .arbiters
            .resolve(&self.coordination.arbiter_name)?
        {
            ArbiterSlot::Disabled => Ok(None),
            slot @ ArbiterSlot::Installed(_) => Ok(Some((methods, slot))),
        }
    }
}

impl Vfs for ConnectionVfs {
    type File = ShimFile;

    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> u32 {
        self.methods.version()
    }

    fn open(
        &self,
        cx: &Cx,
        path: Option<&Path>,
        flags: VfsOpenFlags,
    ) -> Result<(Self::File, VfsOpenFlags)> {
        let (mut root_file, out_flags) = self.root.open(cx, path, flags)?;
        if !flags.is_main_db() {
            return Ok((ShimFile::Passthrough(root_file), out_flags));
        }

        let setup = self
            .arbiter_filename(cx, path)
            .and_then(|filename| Ok((filename, self.bind(root_file.io_version())?)));
        match setup {
            Ok((filename, Some((methods, ArbiterSlot::Installed(arbiter))))) => {
                let binding = FileBinding {
                    filename,
                    connection: self.connection,
                    connections: Arc::clone(&self.coordination.connections),
                    arbiter,
                };
                let shim = FileShim::new(root_file, methods, binding);
                Ok((ShimFile::Coordinated(shim), out_flags))
            }
            Ok((filename, _)) => {
                debug!(file = %filename, "arbiter disabled; file left uncoordinated");
                Ok((ShimFile::Passthrough(root_file), out_flags))
            }
            Err(err) => {
                if let Err(close_err) = root_file.close(cx) {
                    warn!(
                        file = ?path,
                        error = %close_err,
                        "closing root file after failed shim setup"
                    );
                }
                Err(err)
            }
        }
    }

    fn delete(&self, cx: &Cx, path: &Path, sync_dir: bool) -> Result<()> {
        self.root.delete(cx, path, sync_dir)
    }

    fn access(&self, cx: &Cx, path: &Path, flags: AccessFlags) -> Result<bool> {
        self.root.access(cx, path, flags)
    }

    fn full_pathname(&self, cx: &Cx, path: &Path) -> Result<PathBuf> {
        self.root.full_pathname(cx, path)
    }

    fn randomness(&self, cx: &Cx, buf: &mut [u8]) {
        self.root.randomness(cx, buf);
    }

    fn sleep(&self, cx: &Cx, duration: Duration) -> Duration {
        self.root.sleep(cx, duration)
    }

    fn current_time(&self, cx: &Cx) -> f64 {
        self.root.current_time(cx)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn current_time_i64(&self, cx: &Cx) -> i64 {
        if self.methods.has(VfsSlot::CurrentTimeInt64) {
            self.root.current_time_i64(cx)
        } else {
            (self.root.current_time(cx) * 86_400_000.0) as i64
        }
    }

    fn last_error(&self, cx: &Cx) -> Option<String> {
        self.root.last_error(cx)
    }

    fn next_system_call(&self, after: Option<&str>) -> Option<&'static str> {
        if self.methods.has(VfsSlot::NextSystemCall) {
            self.root.next_system_call(after)
        } else {
            None
        }
    }
}

impl std::fmt::Debug for ConnectionVfs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionVfs")
            .field("name", &self.name)
            .field("root", &self.root.name())
            .field("table", &VfsSlot::TABLE)
            .field("version", &self.methods.version())
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

/// Owns a registered [`ConnectionVfs`]; destroying it unregisters the VFS.
#[derive(Debug)]
pub struct ShimVfsHandle {
    vfs: Arc<ConnectionVfs>,
    registration: Option<VfsRegistration>,
}

impl ShimVfsHandle {
    #[must_use]
    pub fn vfs(&self) -> &Arc<ConnectionVfs> {
        &self.vfs
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.vfs.name
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.registration.is_none()
    }

    /// Unregister the VFS. Calling this again does nothing.
    pub fn destroy(&mut self) {
        if let Some(mut registration) = self.registration.take() {
            registration.release();
            debug!(vfs = %self.vfs.name, "connection vfs destroyed");
        }
    }
}

impl Drop for ShimVfsHandle {
    fn drop(&mut self) {
        self.destroy();
    }
}
