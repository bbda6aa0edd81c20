//! Five-level lock bookkeeping shared by every handle open on one file.
//!
//! The rules follow the engine's POSIX locking scheme: one record per file
//! (per inode on Unix) tracks the strongest level any handle in this process
//! holds and how many handles hold SHARED or better. Conflicts between
//! handles of the same process are resolved here; conflicts with other
//! processes are resolved by the byte-range locks issued through
//! [`OsLocks`].

use fairlock_error::{FairlockError, Result};
use fairlock_types::LockLevel;

/// Byte ranges of the lock page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockRange {
    /// The single byte gating new SHARED locks.
    Pending,
    /// The single byte held by a RESERVED writer.
    Reserved,
    /// The range readers share and an EXCLUSIVE writer owns.
    Shared,
}

/// What to do to a [`LockRange`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeLock {
    Read,
    Write,
    Unlock,
}

/// Cross-process locking primitive beneath the in-process rules.
///
/// Implementations return [`FairlockError::Busy`] on contention and a lock
/// or unlock I/O error for anything else.
pub trait OsLocks {
    fn set(&self, range: LockRange, lock: RangeLock) -> Result<()>;

    /// Whether some other process holds the RESERVED byte.
    fn reserved_elsewhere(&self) -> Result<bool> {
        Ok(false)
    }
}

/// Backends with no other process to coordinate with.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOsLocks;

impl OsLocks for NoOsLocks {
    fn set(&self, _range: LockRange, _lock: RangeLock) -> Result<()> {
        Ok(())
    }
}

/// Lock record shared by all handles on one file.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SharedLockState {
    /// Strongest level held by any handle.
    pub level: LockLevel,
    /// Handles holding SHARED or better.
    pub n_shared: u32,
    /// Handles holding any lock.
    pub n_lock: u32,
}

impl SharedLockState {
    /// Raise `held` to `level`.
    ///
    /// A handle holding nothing is walked up through SHARED first, and a
    /// SHARED holder asking for EXCLUSIVE passes through RESERVED. PENDING is
    /// never requested directly; a handle lands there when EXCLUSIVE is
    /// refused because readers remain, and keeps it so new readers stay out.
    pub fn acquire(
        &mut self,
        held: &mut LockLevel,
        level: LockLevel,
        os: &impl OsLocks,
    ) -> Result<()> {
        if *held >= level {
            return Ok(());
        }
        if level == LockLevel::Pending {
            return Err(FairlockError::misuse("PENDING cannot be requested directly"));
        }
        if *held == LockLevel::None && level > LockLevel::Shared {
            self.acquire(held, LockLevel::Shared, os)?;
        }
        if *held == LockLevel::Shared && level == LockLevel::Exclusive {
            self.acquire(held, LockLevel::Reserved, os)?;
        }
        self.acquire_step(held, level, os)
    }

    fn acquire_step(
        &mut self,
        held: &mut LockLevel,
        level: LockLevel,
        os: &impl OsLocks,
    ) -> Result<()> {
        if *held >= level {
            return Ok(());
        }
        if *held != self.level && (self.level >= LockLevel::Pending || level > LockLevel::Shared) {
            return Err(FairlockError::Busy);
        }

        if level == LockLevel::Shared
            && matches!(self.level, LockLevel::Shared | LockLevel::Reserved)
        {
            *held = LockLevel::Shared;
            self.n_shared += 1;
            self.n_lock += 1;
            return Ok(());
        }

        let gated = level == LockLevel::Shared
            || (level == LockLevel::Exclusive && *held < LockLevel::Pending);
        if gated {
            let gate = if level == LockLevel::Shared {
                RangeLock::Read
            } else {
                RangeLock::Write
            };
            os.set(LockRange::Pending, gate)?;
        }

        if level == LockLevel::Shared {
            let shared = os.set(LockRange::Shared, RangeLock::Read);
            let ungate = os.set(LockRange::Pending, RangeLock::Unlock);
            shared?;
            ungate?;
            self.n_shared = 1;
            self.n_lock += 1;
            *held = LockLevel::Shared;
            self.level = LockLevel::Shared;
            return Ok(());
        }

        if level == LockLevel::Exclusive && self.n_shared > 1 {
            *held = LockLevel::Pending;
            self.level = LockLevel::Pending;
            return Err(FairlockError::Busy);
        }

        let range = if level == LockLevel::Reserved {
            LockRange::Reserved
        } else {
            LockRange::Shared
        };
        match os.set(range, RangeLock::Write) {
            Ok(()) => {
                *held = level;
                self.level = level;
                Ok(())
            }
            Err(err) => {
                if level == LockLevel::Exclusive {
                    *held = LockLevel::Pending;
                    self.level = LockLevel::Pending;
                }
                Err(err)
            }
        }
    }

    /// Lower `held` to `level`, which must be SHARED or NONE.
    pub fn release(
        &mut self,
        held: &mut LockLevel,
        level: LockLevel,
        os: &impl OsLocks,
    ) -> Result<()> {
        if level > LockLevel::Shared {
            return Err(FairlockError::misuse(format!(
                "cannot unlock to {level}; only SHARED or NONE"
            )));
        }
        if *held <= level {
            return Ok(());
        }

        if *held > LockLevel::Shared {
            if level == LockLevel::Shared {
                os.set(LockRange::Shared, RangeLock::Read)?;
            }
            os.set(LockRange::Pending, RangeLock::Unlock)?;
            os.set(LockRange::Reserved, RangeLock::Unlock)?;
            self.level = LockLevel::Shared;
        }

        if level == LockLevel::None {
            self.n_shared = self.n_shared.saturating_sub(1);
            if self.n_shared == 0 {
                os.set(LockRange::Shared, RangeLock::Unlock)?;
                self.level = LockLevel::None;
            }
            self.n_lock = self.n_lock.saturating_sub(1);
        }
        *held = level;
        Ok(())
    }

    /// RESERVED or better is held by some handle in this process.
    #[must_use]
    pub fn reserved_in_process(&self) -> bool {
        self.level > LockLevel::Shared
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;

    #[derive(Default)]
    struct RecordingOs {
        calls: RefCell<Vec<(LockRange, RangeLock)>>,
    }

    impl OsLocks for RecordingOs {
        fn set(&self, range: LockRange, lock: RangeLock) -> Result<()> {
            self.calls.borrow_mut().push((range, lock));
            Ok(())
        }
    }

    struct ContendedOs(LockRange);

    impl OsLocks for ContendedOs {
        fn set(&self, range: LockRange, lock: RangeLock) -> Result<()> {
            if range == self.0 && lock != RangeLock::Unlock {
                Err(FairlockError::Busy)
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn test_shared_locks_coexist() {
        let mut state = SharedLockState::default();
        let (mut a, mut b) = (LockLevel::None, LockLevel::None);
        state.acquire(&mut a, LockLevel::Shared, &NoOsLocks).unwrap();
        state.acquire(&mut b, LockLevel::Shared, &NoOsLocks).unwrap();
        assert_eq!((a, b), (LockLevel::Shared, LockLevel::Shared));
        assert_eq!(state.n_shared, 2);
        assert_eq!(state.n_lock, 2);
    }

    #[test]
    fn test_second_reserved_is_busy() {
        let mut state = SharedLockState::default();
        let (mut a, mut b) = (LockLevel::None, LockLevel::None);
        state.acquire(&mut a, LockLevel::Reserved, &NoOsLocks).unwrap();
        state.acquire(&mut b, LockLevel::Shared, &NoOsLocks).unwrap();
        let err = state
            .acquire(&mut b, LockLevel::Reserved, &NoOsLocks)
            .unwrap_err();
        assert!(matches!(err, FairlockError::Busy));
        assert_eq!(b, LockLevel::Shared);
        assert!(state.reserved_in_process());
    }

    #[test]
    fn test_exclusive_waits_for_readers_at_pending() {
        let mut state = SharedLockState::default();
        let (mut writer, mut reader) = (LockLevel::None, LockLevel::None);
        state.acquire(&mut reader, LockLevel::Shared, &NoOsLocks).unwrap();
        state.acquire(&mut writer, LockLevel::Reserved, &NoOsLocks).unwrap();

        let err = state
            .acquire(&mut writer, LockLevel::Exclusive, &NoOsLocks)
            .unwrap_err();
        assert!(matches!(err, FairlockError::Busy));
        assert_eq!(writer, LockLevel::Pending);

        // PENDING keeps new readers out.
        let mut late = LockLevel::None;
        assert!(
            state
                .acquire(&mut late, LockLevel::Shared, &NoOsLocks)
                .is_err()
        );

        state.release(&mut reader, LockLevel::None, &NoOsLocks).unwrap();
        state.acquire(&mut writer, LockLevel::Exclusive, &NoOsLocks).unwrap();
        assert_eq!(writer, LockLevel::Exclusive);
        assert_eq!(state.level, LockLevel::Exclusive);
    }

    #[test]
    fn test_none_to_exclusive_escalates() {
        let os = RecordingOs::default();
        let mut state = SharedLockState::default();
        let mut held = LockLevel::None;
        state.acquire(&mut held, LockLevel::Exclusive, &os).unwrap();
        assert_eq!(held, LockLevel::Exclusive);
        assert_eq!(
            os.calls.borrow().as_slice(),
            &[
                (LockRange::Pending, RangeLock::Read),
                (LockRange::Shared, RangeLock::Read),
                (LockRange::Pending, RangeLock::Unlock),
                (LockRange::Reserved, RangeLock::Write),
                (LockRange::Pending, RangeLock::Write),
                (LockRange::Shared, RangeLock::Write),
            ]
        );
    }

    #[test]
    fn test_pending_request_is_misuse() {
        let mut state = SharedLockState::default();
        let mut held = LockLevel::Shared;
        let err = state
            .acquire(&mut held, LockLevel::Pending, &NoOsLocks)
            .unwrap_err();
        assert!(matches!(err, FairlockError::Misuse(_)));
    }

    #[test]
    fn test_release_rules() {
        let mut state = SharedLockState::default();
        let mut held = LockLevel::None;
        state.acquire(&mut held, LockLevel::Exclusive, &NoOsLocks).unwrap();

        assert!(matches!(
            state.release(&mut held, LockLevel::Reserved, &NoOsLocks),
            Err(FairlockError::Misuse(_))
        ));

        state.release(&mut held, LockLevel::Shared, &NoOsLocks).unwrap();
        assert_eq!(held, LockLevel::Shared);
        assert_eq!(state.level, LockLevel::Shared);

        state.release(&mut held, LockLevel::None, &NoOsLocks).unwrap();
        assert_eq!(held, LockLevel::None);
        assert_eq!(state, SharedLockState::default());

        // Releasing what is not held is a no-op.
        state.release(&mut held, LockLevel::None, &NoOsLocks).unwrap();
        assert_eq!(state, SharedLockState::default());
    }

    #[test]
    fn test_os_contention_is_busy() {
        let mut state = SharedLockState::default();
        let mut held = LockLevel::None;
        state
            .acquire(&mut held, LockLevel::Shared, &NoOsLocks)
            .unwrap();

        let err = state
            .acquire(&mut held, LockLevel::Reserved, &ContendedOs(LockRange::Reserved))
            .unwrap_err();
        assert!(matches!(err, FairlockError::Busy));
        assert_eq!(held, LockLevel::Shared);
        assert_eq!(state.level, LockLevel::Shared);
    }

    #[test]
    fn test_failed_exclusive_parks_at_pending() {
        let mut state = SharedLockState::default();
        let mut held = LockLevel::None;
        state
            .acquire(&mut held, LockLevel::Reserved, &NoOsLocks)
            .unwrap();
        let err = state
            .acquire(&mut held, LockLevel::Exclusive, &ContendedOs(LockRange::Shared))
            .unwrap_err();
        assert!(matches!(err, FairlockError::Busy));
        assert_eq!(held, LockLevel::Pending);
    }
}
