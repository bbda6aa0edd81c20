//! The lock arbiter contract and the registry file shims bind arbiters from.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use fairlock_error::{ErrorCode, FairlockError, Result};
use fairlock_types::LockLevel;
use fairlock_types::cx::Cx;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::info;

use crate::connection::ConnectionId;

/// Well-known registry name file shims bind to by default.
pub const DEFAULT_ARBITER_NAME: &str = "fairlock.lock_manager";

/// Callback into the file's real lock primitive.
///
/// Calling it never re-enters the arbiter.
pub type LockForward<'a> = dyn FnMut(LockLevel) -> Result<()> + 'a;

/// Outcome classes of an arbiter call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArbiterError {
    /// The request would deadlock (or waited too long). The engine may retry.
    #[error("lock request would deadlock")]
    Deadlock,
    /// A status code to hand the engine verbatim.
    #[error("lock failed with status {0:?}")]
    Coded(ErrorCode),
    /// The arbiter itself misbehaved.
    #[error("arbiter failure: {0}")]
    Failed(String),
}

impl From<FairlockError> for ArbiterError {
    fn from(err: FairlockError) -> Self {
        Self::Coded(err.error_code())
    }
}

/// Pluggable lock policy.
///
/// `lock` may block for as long as its policy requires. A successful return
/// promises the real lock for at least `level` is held, acquired through
/// `forward`.
pub trait Arbiter: Send + Sync {
    fn lock(
        &self,
        cx: &Cx,
        forward: &mut LockForward<'_>,
        filename: &str,
        level: LockLevel,
        connection: ConnectionId,
    ) -> std::result::Result<(), ArbiterError>;

    /// Called after the real lock was lowered to `level`.
    fn unlock(
        &self,
        cx: &Cx,
        filename: &str,
        level: LockLevel,
        connection: ConnectionId,
    ) -> std::result::Result<(), ArbiterError>;

    /// Hears the final status of every [`lock`](Self::lock) request,
    /// after verification. `level` is the level the arbiter was asked for.
    fn lock_result(
        &self,
        _cx: &Cx,
        _filename: &str,
        _level: LockLevel,
        _connection: ConnectionId,
        _status: ErrorCode,
    ) {
    }
}

/// What a name in the [`ArbiterRegistry`] resolves to.
#[derive(Clone)]
pub enum ArbiterSlot {
    /// Coordination is switched off; files open uninstrumented.
    Disabled,
    Installed(Arc<dyn Arbiter>),
}

impl fmt::Debug for ArbiterSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => f.write_str("Disabled"),
            Self::Installed(_) => f.write_str("Installed(..)"),
        }
    }
}

/// Process-wide map from well-known names to arbiters.
#[derive(Debug, Clone, Default)]
pub struct ArbiterRegistry {
    slots: Arc<RwLock<HashMap<String, ArbiterSlot>>>,
}

impl ArbiterRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name` to `arbiter`, replacing whatever was there.
    pub fn install(&self, name: impl Into<String>, arbiter: Arc<dyn Arbiter>) {
        let name = name.into();
        info!(arbiter = %name, "arbiter installed");
        self.slots
            .write()
            .insert(name, ArbiterSlot::Installed(arbiter));
    }

    /// Bind `name` to the disabled sentinel.
    pub fn disable(&self, name: impl Into<String>) {
        let name = name.into();
        info!(arbiter = %name, "arbiter disabled");
        self.slots.write().insert(name, ArbiterSlot::Disabled);
    }

    /// Forget `name`. Later binds to it fail.
    pub fn remove(&self, name: &str) -> Option<ArbiterSlot> {
        self.slots.write().remove(name)
    }

    /// Resolve `name`; an unknown name is an error.
    pub fn resolve(&self, name: &str) -> Result<ArbiterSlot> {
        self.slots
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| FairlockError::ArbiterNotFound {
                name: name.to_owned(),
            })
    }
}
