//! Shared-memory regions and the slot lock table behind `shm_map`/`shm_lock`.
//!
//! Regions are handed out as [`ShmRegion`] handles, never raw pointers. A
//! region is a fixed-size chunk of the WAL index; every handle to the same
//! region observes the same bytes.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use fairlock_error::{FairlockError, Result};
use parking_lot::{Mutex, MutexGuard};

/// Number of shared-memory lock slots (`SQLITE_SHM_NLOCK`).
pub const SHM_NLOCK: u32 = 8;

bitflags::bitflags! {
    /// Flags for `VfsFile::shm_lock`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ShmLockFlags: u32 {
        const UNLOCK = 1;
        const LOCK = 2;
        const SHARED = 4;
        const EXCLUSIVE = 8;
    }
}

/// A handle to a mapped shared-memory region.
#[derive(Debug, Clone)]
pub struct ShmRegion {
    len: usize,
    data: Arc<Mutex<Vec<u8>>>,
}

impl ShmRegion {
    /// Create a new zeroed region of the given size.
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            len: size,
            data: Arc::new(Mutex::new(vec![0; size])),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Borrow the region's bytes. The guard releases on drop.
    pub fn lock(&self) -> ShmRegionGuard<'_> {
        ShmRegionGuard {
            guard: self.data.lock(),
        }
    }

    /// Read a little-endian `u32`; `None` when out of bounds.
    #[must_use]
    pub fn read_u32_le(&self, offset: usize) -> Option<u32> {
        let guard = self.lock();
        let bytes = guard.get(offset..offset.checked_add(4)?)?;
        Some(u32::from_le_bytes(bytes.try_into().ok()?))
    }

    /// Write a little-endian `u32`.
    pub fn write_u32_le(&self, offset: usize, val: u32) -> Result<()> {
        let mut guard = self.lock();
        let end = offset.checked_add(4).filter(|&end| end <= guard.len());
        let Some(end) = end else {
            return Err(FairlockError::internal(format!(
                "shm write at {offset} past region end {}",
                self.len
            )));
        };
        guard[offset..end].copy_from_slice(&val.to_le_bytes());
        Ok(())
    }

    /// Whether two handles refer to the same backing storage.
    #[must_use]
    pub fn same_region(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

/// Locked region access guard.
pub struct ShmRegionGuard<'a> {
    guard: MutexGuard<'a, Vec<u8>>,
}

impl Deref for ShmRegionGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.guard.as_slice()
    }
}

impl DerefMut for ShmRegionGuard<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.guard.as_mut_slice()
    }
}

/// Per-slot shared/exclusive state, keyed by an opaque owner id.
#[derive(Debug, Default)]
pub struct ShmLockTable {
    slots: [ShmSlot; SHM_NLOCK as usize],
}

#[derive(Debug, Default, Clone)]
struct ShmSlot {
    shared: Vec<u64>,
    exclusive: Option<u64>,
}

impl ShmLockTable {
    /// Apply a `shm_lock` request for `owner` over `offset..offset + n`.
    ///
    /// Either all slots change or none do; contention reports `Busy`.
    pub fn apply(&mut self, owner: u64, offset: u32, n: u32, flags: ShmLockFlags) -> Result<()> {
        let end = offset
            .checked_add(n)
            .filter(|&end| n > 0 && end <= SHM_NLOCK)
            .ok_or_else(|| FairlockError::misuse(format!("shm lock range {offset}+{n}")))?;
        let range = offset as usize..end as usize;
        let exclusive = flags.contains(ShmLockFlags::EXCLUSIVE);

        if flags.contains(ShmLockFlags::UNLOCK) {
            for slot in &mut self.slots[range] {
                slot.shared.retain(|&o| o != owner);
                if slot.exclusive == Some(owner) {
                    slot.exclusive = None;
                }
            }
            return Ok(());
        }
        if !flags.contains(ShmLockFlags::LOCK) {
            return Err(FairlockError::misuse("shm lock flags name no action"));
        }

        let conflict = self.slots[range.clone()].iter().any(|slot| {
            let foreign_exclusive = slot.exclusive.is_some_and(|o| o != owner);
            let foreign_shared = slot.shared.iter().any(|&o| o != owner);
            foreign_exclusive || (exclusive && foreign_shared)
        });
        if conflict {
            return Err(FairlockError::Busy);
        }
        for slot in &mut self.slots[range] {
            if exclusive {
                slot.exclusive = Some(owner);
            } else if !slot.shared.contains(&owner) {
                slot.shared.push(owner);
            }
        }
        Ok(())
    }

    /// Drop every slot `owner` holds.
    pub fn release_all(&mut self, owner: u64) {
        for slot in &mut self.slots {
            slot.shared.retain(|&o| o != owner);
            if slot.exclusive == Some(owner) {
                slot.exclusive = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shm_region_new_zeroed() {
        let region = ShmRegion::new(4096);
        assert_eq!(region.len(), 4096);
        assert!(region.lock().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_shm_region_u32_bounds() {
        let region = ShmRegion::new(8);
        region.write_u32_le(4, 0xDEAD_BEEF).unwrap();
        assert_eq!(region.read_u32_le(4), Some(0xDEAD_BEEF));
        assert_eq!(region.read_u32_le(5), None);
        assert!(region.write_u32_le(6, 1).is_err());
    }

    #[test]
    fn test_shm_region_clones_share_bytes() {
        let region = ShmRegion::new(4);
        let alias = region.clone();
        alias.lock()[0] = 0xFF;
        assert_eq!(region.lock()[0], 0xFF);
        assert!(region.same_region(&alias));
        assert!(!region.same_region(&ShmRegion::new(4)));
    }

    #[test]
    fn test_shm_lock_table_shared_then_exclusive() {
        let lock = ShmLockFlags::LOCK;
        let unlock = ShmLockFlags::UNLOCK;
        let mut table = ShmLockTable::default();

        table.apply(1, 0, 1, lock | ShmLockFlags::SHARED).unwrap();
        table.apply(2, 0, 1, lock | ShmLockFlags::SHARED).unwrap();
        let err = table
            .apply(1, 0, 1, lock | ShmLockFlags::EXCLUSIVE)
            .unwrap_err();
        assert!(matches!(err, FairlockError::Busy));

        table.apply(2, 0, 1, unlock | ShmLockFlags::SHARED).unwrap();
        table.apply(1, 0, 1, lock | ShmLockFlags::EXCLUSIVE).unwrap();
        assert!(
            table
                .apply(2, 0, 1, lock | ShmLockFlags::SHARED)
                .is_err()
        );

        table.release_all(1);
        table.apply(2, 0, 1, lock | ShmLockFlags::EXCLUSIVE).unwrap();
    }

    #[test]
    fn test_shm_lock_table_rejects_bad_range() {
        let mut table = ShmLockTable::default();
        let flags = ShmLockFlags::LOCK | ShmLockFlags::SHARED;
        assert!(matches!(
            table.apply(1, 7, 2, flags),
            Err(FairlockError::Misuse(_))
        ));
        assert!(table.apply(1, 0, 0, flags).is_err());
    }
}
