//! Live database connections and their minimum lock floors.
//!
//! A shim refers to its owning connection by [`ConnectionId`] rather than by
//! pointer. Ids carry a generation, so an id whose connection has gone away
//! (and whose slot may since have been reused) resolves to nothing instead of
//! to the wrong connection.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use fairlock_error::{FairlockError, Result};
use fairlock_types::LockLevel;
use parking_lot::RwLock;
use tracing::debug;

/// Handle to a registered connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId {
    slot: u32,
    generation: u32,
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}.{}", self.slot, self.generation)
    }
}

#[derive(Debug)]
struct ConnectionState {
    label: String,
    minimum_lock_level: AtomicU8,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    state: Option<Arc<ConnectionState>>,
}

/// Registry of live connections.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    slots: RwLock<Vec<Slot>>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection with a floor of NONE.
    pub fn register(&self, label: impl Into<String>) -> ConnectionId {
        let state = Arc::new(ConnectionState {
            label: label.into(),
            minimum_lock_level: AtomicU8::new(LockLevel::None.as_u8()),
        });
        let mut slots = self.slots.write();
        let free = slots.iter().position(|s| s.state.is_none());
        let index = free.unwrap_or_else(|| {
            slots.push(Slot::default());
            slots.len() - 1
        });
        let slot = &mut slots[index];
        slot.generation = slot.generation.wrapping_add(1);
        slot.state = Some(state);
        let id = ConnectionId {
            slot: u32::try_from(index).unwrap_or(u32::MAX),
            generation: slot.generation,
        };
        debug!(connection = %id, "connection registered");
        id
    }

    fn state(&self, id: ConnectionId) -> Option<Arc<ConnectionState>> {
        let slots = self.slots.read();
        let slot = slots.get(id.slot as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.state.clone()
    }

    /// Whether `id` still names a live connection.
    #[must_use]
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.state(id).is_some()
    }

    /// The connection's label, if it is still live.
    #[must_use]
    pub fn label(&self, id: ConnectionId) -> Option<String> {
        self.state(id).map(|s| s.label.clone())
    }

    /// The connection's lock floor, or `None` if it is gone.
    #[must_use]
    pub fn minimum_lock_level(&self, id: ConnectionId) -> Option<LockLevel> {
        let raw = self.state(id)?.minimum_lock_level.load(Ordering::Acquire);
        LockLevel::from_u8(raw)
    }

    /// Change the connection's lock floor. Takes effect on the next lock.
    pub fn set_minimum_lock_level(&self, id: ConnectionId, level: LockLevel) -> Result<()> {
        let state = self
            .state(id)
            .ok_or_else(|| FairlockError::misuse(format!("{id} is closed")))?;
        state
            .minimum_lock_level
            .store(level.as_u8(), Ordering::Release);
        Ok(())
    }

    /// Forget a connection. Returns whether it was live.
    pub fn remove(&self, id: ConnectionId) -> bool {
        let mut slots = self.slots.write();
        let Some(slot) = slots.get_mut(id.slot as usize) else {
            return false;
        };
        if slot.generation != id.generation || slot.state.is_none() {
            return false;
        }
        slot.state = None;
        debug!(connection = %id, "connection removed");
        true
    }

    /// Number of live connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots
            .read()
            .iter()
            .filter(|s| s.state.is_some())
            .count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_connection_has_no_floor() {
        let registry = ConnectionRegistry::new();
        let id = registry.register("a");
        assert_eq!(registry.minimum_lock_level(id), Some(LockLevel::None));
        assert_eq!(registry.label(id).as_deref(), Some("a"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn floor_round_trips() {
        let registry = ConnectionRegistry::new();
        let id = registry.register("a");
        registry
            .set_minimum_lock_level(id, LockLevel::Reserved)
            .unwrap();
        assert_eq!(registry.minimum_lock_level(id), Some(LockLevel::Reserved));
    }

    #[test]
    fn removed_id_resolves_to_nothing() {
        let registry = ConnectionRegistry::new();
        let id = registry.register("a");
        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        assert!(!registry.contains(id));
        assert_eq!(registry.minimum_lock_level(id), None);
        assert!(matches!(
            registry.set_minimum_lock_level(id, LockLevel::Shared),
            Err(FairlockError::Misuse(_))
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn reused_slot_does_not_alias_old_id() {
        let registry = ConnectionRegistry::new();
        let old = registry.register("old");
        registry.remove(old);
        let new = registry.register("new");

        assert_ne!(old, new);
        registry
            .set_minimum_lock_level(new, LockLevel::Exclusive)
            .unwrap();
        assert_eq!(registry.minimum_lock_level(old), None);
        assert_eq!(registry.label(new).as_deref(), Some("new"));
    }
}
