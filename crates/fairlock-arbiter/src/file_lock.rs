//! Shared/exclusive lock state for one database file.
//!
//! Pure bookkeeping: callers hold the arbiter mutex while touching a
//! [`FileLock`] and do the blocking themselves.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use fairlock_types::LockLevel;
use fairlock_vfs::ConnectionId;
use parking_lot::Condvar;

/// Wakeup channel of one blocked request.
#[derive(Debug, Default)]
pub(crate) struct Signal {
    pub(crate) cv: Condvar,
    granted: AtomicBool,
}

impl Signal {
    pub(crate) fn is_granted(&self) -> bool {
        self.granted.load(Ordering::Acquire)
    }

    fn grant(&self) {
        self.granted.store(true, Ordering::Release);
        self.cv.notify_one();
    }
}

#[derive(Debug)]
struct Waiter {
    connection: ConnectionId,
    level: LockLevel,
    signal: Arc<Signal>,
}

/// Result of asking for a higher level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    Granted,
    /// Must block; `front` jumps the queue (a writer already at PENDING).
    Wait { front: bool },
    Deadlock,
}

#[derive(Debug, Default)]
pub(crate) struct FileLock {
    holders: HashMap<ConnectionId, LockLevel>,
    blocked: VecDeque<Waiter>,
}

impl FileLock {
    pub(crate) fn level_of(&self, connection: ConnectionId) -> LockLevel {
        self.holders.get(&connection).copied().unwrap_or_default()
    }

    fn max_other(&self, connection: ConnectionId) -> LockLevel {
        self.holders
            .iter()
            .filter(|(holder, _)| **holder != connection)
            .map(|(_, level)| *level)
            .max()
            .unwrap_or_default()
    }

    fn set_level(&mut self, connection: ConnectionId, level: LockLevel) {
        if level == LockLevel::None {
            self.holders.remove(&connection);
        } else {
            self.holders.insert(connection, level);
        }
    }

    /// Try to raise `connection` from `old` to `level`. Only SHARED,
    /// RESERVED and EXCLUSIVE are requested, always above `old`.
    pub(crate) fn admit(
        &mut self,
        connection: ConnectionId,
        old: LockLevel,
        level: LockLevel,
    ) -> Admission {
        debug_assert!(level > old);
        let others = self.max_other(connection);
        let admission = match level {
            LockLevel::Shared => {
                if others < LockLevel::Pending && self.blocked.is_empty() {
                    Admission::Granted
                } else {
                    Admission::Wait { front: false }
                }
            }
            LockLevel::Reserved => {
                if others < LockLevel::Reserved && self.blocked.is_empty() {
                    Admission::Granted
                } else if old != LockLevel::None {
                    Admission::Deadlock
                } else {
                    Admission::Wait { front: false }
                }
            }
            _ => match others {
                LockLevel::None => Admission::Granted,
                LockLevel::Shared => {
                    // Readers drain while we hold PENDING; no new reader gets in.
                    self.holders.insert(connection, LockLevel::Pending);
                    Admission::Wait { front: true }
                }
                _ if old == LockLevel::None => Admission::Wait { front: false },
                _ => Admission::Deadlock,
            },
        };
        if admission == Admission::Granted {
            self.holders.insert(connection, level);
        }
        self.check_invariant();
        admission
    }

    pub(crate) fn enqueue(
        &mut self,
        connection: ConnectionId,
        level: LockLevel,
        front: bool,
    ) -> Arc<Signal> {
        let signal = Arc::new(Signal::default());
        let waiter = Waiter {
            connection,
            level,
            signal: Arc::clone(&signal),
        };
        if front {
            self.blocked.push_front(waiter);
        } else {
            self.blocked.push_back(waiter);
        }
        signal
    }

    /// Withdraw a request that gave up waiting, undoing its PENDING
    /// promotion.
    pub(crate) fn cancel(&mut self, signal: &Arc<Signal>, connection: ConnectionId, old: LockLevel) {
        self.blocked.retain(|w| !Arc::ptr_eq(&w.signal, signal));
        if self.level_of(connection) == LockLevel::Pending {
            self.set_level(connection, old);
        }
        self.wake_blocked();
    }

    /// Lower `connection` to `level`. Never raises. Returns whether anything
    /// changed.
    pub(crate) fn lower(&mut self, connection: ConnectionId, level: LockLevel) -> bool {
        if level >= self.level_of(connection) {
            return false;
        }
        self.set_level(connection, level);
        self.wake_blocked();
        true
    }

    /// Grant queued requests in order, stopping at the first that still
    /// conflicts.
    fn wake_blocked(&mut self) {
        while let Some(waiter) = self.blocked.pop_front() {
            let others = self.max_other(waiter.connection);
            let grantable = match waiter.level {
                LockLevel::Shared => others < LockLevel::Pending,
                LockLevel::Reserved => others < LockLevel::Reserved,
                _ => others == LockLevel::None,
            };
            if grantable {
                self.holders.insert(waiter.connection, waiter.level);
                waiter.signal.grant();
                continue;
            }
            if waiter.level == LockLevel::Exclusive && others == LockLevel::Shared {
                self.holders.insert(waiter.connection, LockLevel::Pending);
            }
            self.blocked.push_front(waiter);
            break;
        }
        self.check_invariant();
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.holders.is_empty() && self.blocked.is_empty()
    }

    pub(crate) fn blocked(&self) -> usize {
        self.blocked.len()
    }

    pub(crate) fn count_levels(&self, counts: &mut BTreeMap<LockLevel, usize>) {
        for level in self.holders.values() {
            *counts.entry(*level).or_default() += 1;
        }
    }

    fn check_invariant(&self) {
        if cfg!(debug_assertions) {
            let above_shared = self
                .holders
                .values()
                .filter(|l| **l > LockLevel::Shared)
                .count();
            debug_assert!(above_shared <= 1, "two holders above SHARED: {self:?}");
            debug_assert!(
                !self.holders.values().any(|l| *l == LockLevel::Exclusive)
                    || self.holders.len() == 1,
                "EXCLUSIVE holder is not alone: {self:?}"
            );
            debug_assert!(
                !self.holders.values().any(|l| *l == LockLevel::Pending)
                    || self.holders.values().any(|l| *l == LockLevel::Shared),
                "PENDING without SHARED holders to wait for: {self:?}"
            );
            debug_assert!(
                self.blocked.is_empty() || !self.holders.is_empty(),
                "requests queued while nobody holds a lock: {self:?}"
            );
        }
    }
}
