//! Fair, externally programmable lock coordination for embedded database
//! files.
//!
//! An [`Environment`] owns the VFS, connection and arbiter registries. Each
//! [`Connection`] gets its own wrapping VFS; main database files opened
//! through it send every lock and unlock through the arbiter bound under
//! the configured name.
//!
//! ```no_run
//! use std::path::Path;
//!
//! use fairlock::{Environment, FairlockConfig};
//! use fairlock::types::{LockLevel, cx::Cx};
//! use fairlock::vfs::VfsFile;
//!
//! let config = FairlockConfig { fair_locking: true, ..FairlockConfig::default() };
//! let env = Environment::new(config)?;
//! let conn = env.connect("reader")?;
//! let cx = Cx::new();
//! let mut file = conn.open_main(&cx, Path::new("app.db"))?;
//! file.lock(&cx, LockLevel::Shared)?;
//! # Ok::<(), fairlock::FairlockError>(())
//! ```

pub mod config;

use std::path::Path;
use std::sync::Arc;

use fairlock_types::cx::Cx;
use fairlock_types::flags::VfsOpenFlags;
use fairlock_vfs::{
    Arbiter, ArbiterRegistry, ConnectionId, ConnectionRegistry, ConnectionVfs, Coordination,
    ShimFile, ShimVfsHandle, Vfs, VfsRegistration, VfsRegistry,
};
use tracing::info;

pub use config::FairlockConfig;
pub use fairlock_arbiter::{ArbiterStats, FairArbiter, FairArbiterConfig};
pub use fairlock_error::{ErrorCode, FairlockError, Result};
pub use fairlock_types as types;
pub use fairlock_types::LockLevel;
pub use fairlock_vfs as vfs;

/// Registries shared by every connection of one process.
pub struct Environment {
    config: FairlockConfig,
    vfs: VfsRegistry,
    connections: Arc<ConnectionRegistry>,
    arbiters: ArbiterRegistry,
    fair: Option<Arc<FairArbiter>>,
    _root: VfsRegistration,
}

impl Environment {
    /// Build an environment over the platform VFS (`unix` on Unix hosts,
    /// `memory` elsewhere).
    pub fn new(config: FairlockConfig) -> Result<Self> {
        #[cfg(unix)]
        let root = Arc::new(fairlock_vfs::UnixVfs::new());
        #[cfg(not(unix))]
        let root = Arc::new(fairlock_vfs::MemoryVfs::new());
        Self::with_root_vfs(config, root)
    }

    /// Build an environment whose default VFS is `root`.
    pub fn with_root_vfs<V>(config: FairlockConfig, root: Arc<V>) -> Result<Self>
    where
        V: Vfs + 'static,
        V::File: 'static,
    {
        let vfs = VfsRegistry::new();
        let registration = vfs.register(root, true)?;
        let arbiters = ArbiterRegistry::new();
        let fair = if config.fair_locking {
            let arbiter = Arc::new(FairArbiter::new(config.arbiter_config()));
            arbiters.install(config.arbiter_name.clone(), Arc::clone(&arbiter) as Arc<dyn Arbiter>);
            Some(arbiter)
        } else {
            arbiters.disable(config.arbiter_name.clone());
            None
        };
        info!(
            root = registration.name(),
            fair_locking = config.fair_locking,
            arbiter = %config.arbiter_name,
            "fairlock environment ready"
        );
        Ok(Self {
            config,
            vfs,
            connections: Arc::new(ConnectionRegistry::new()),
            arbiters,
            fair,
            _root: registration,
        })
    }

    #[must_use]
    pub fn config(&self) -> &FairlockConfig {
        &self.config
    }

    #[must_use]
    pub fn vfs_registry(&self) -> &VfsRegistry {
        &self.vfs
    }

    #[must_use]
    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }

    #[must_use]
    pub fn arbiters(&self) -> &ArbiterRegistry {
        &self.arbiters
    }

    /// The arbiter installed from `fair_locking`, if any. Arbiters installed
    /// later through [`install_arbiter`](Self::install_arbiter) are not
    /// reported here.
    #[must_use]
    pub fn fair_arbiter(&self) -> Option<&Arc<FairArbiter>> {
        self.fair.as_ref()
    }

    /// Bind the configured arbiter name to `arbiter`. Files opened from now
    /// on use it; open files keep the arbiter they were bound to.
    pub fn install_arbiter(&self, arbiter: Arc<dyn Arbiter>) {
        self.arbiters
            .install(self.config.arbiter_name.clone(), arbiter);
    }

    /// Switch coordination off for files opened from now on.
    pub fn disable_arbiter(&self) {
        self.arbiters.disable(self.config.arbiter_name.clone());
    }

    /// Register a connection and create its VFS.
    pub fn connect(&self, label: impl Into<String>) -> Result<Connection> {
        let label = label.into();
        let id = self.connections.register(label.clone());
        let coordination = Coordination {
            connections: Arc::clone(&self.connections),
            arbiters: self.arbiters.clone(),
            arbiter_name: self.config.arbiter_name.clone(),
        };
        match ConnectionVfs::create(&self.vfs, coordination, id, self.config.root_vfs.as_deref()) {
            Ok(shim) => {
                info!(connection = %id, %label, vfs = shim.name(), "connection opened");
                Ok(Connection {
                    id,
                    label,
                    connections: Arc::clone(&self.connections),
                    shim,
                    closed: false,
                })
            }
            Err(err) => {
                self.connections.remove(id);
                Err(err)
            }
        }
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("config", &self.config)
            .field("vfs", &self.vfs)
            .field("connections", &self.connections.len())
            .finish_non_exhaustive()
    }
}

/// A database connection's view of the lock layer.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    label: String,
    connections: Arc<ConnectionRegistry>,
    shim: ShimVfsHandle,
    closed: bool,
}

impl Connection {
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The connection's wrapping VFS.
    #[must_use]
    pub fn vfs(&self) -> &Arc<ConnectionVfs> {
        self.shim.vfs()
    }

    /// Name the wrapping VFS is registered under.
    #[must_use]
    pub fn vfs_name(&self) -> &str {
        self.shim.name()
    }

    /// Lowest level every lock on this connection's files is raised to.
    #[must_use]
    pub fn minimum_lock_level(&self) -> LockLevel {
        self.connections
            .minimum_lock_level(self.id)
            .unwrap_or_default()
    }

    pub fn set_minimum_lock_level(&self, level: LockLevel) -> Result<()> {
        self.connections.set_minimum_lock_level(self.id, level)
    }

    /// Open (creating if needed) a main database file through this
    /// connection's VFS.
    pub fn open_main(&self, cx: &Cx, path: &Path) -> Result<ShimFile> {
        let flags = VfsOpenFlags::MAIN_DB | VfsOpenFlags::CREATE | VfsOpenFlags::READWRITE;
        let (file, _) = self.vfs().open(cx, Some(path), flags)?;
        Ok(file)
    }

    /// Unregister the VFS and the connection. Dropping does the same.
    pub fn close(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if std::mem::replace(&mut self.closed, true) {
            return;
        }
        self.shim.destroy();
        self.connections.remove(self.id);
        info!(connection = %self.id, label = %self.label, "connection closed");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.teardown();
    }
}
