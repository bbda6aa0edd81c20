//! Versioned operation tables and capability negotiation.
//!
//! A shim may only advertise the operations its backing table actually
//! defines. Each table is described by its slots and the version that
//! introduced each one; [`negotiate_table`] copies exactly the slots a source
//! of a given version defines, and refuses versions newer than this crate
//! knows the layout of.

use std::fmt;
use std::marker::PhantomData;

use fairlock_error::{FairlockError, Result};

/// An entry of a versioned operation table.
pub trait Slot: Copy + fmt::Debug + 'static {
    /// Table name used in diagnostics.
    const TABLE: &'static str;
    /// Newest table version whose layout is known.
    const CEILING: u32;
    /// Every slot, in table order.
    const ALL: &'static [Self];

    /// Table version that introduced this slot.
    fn introduced(self) -> u32;

    /// Bit position in a [`MethodTable`] mask.
    fn bit(self) -> u32;
}

/// VFS-level operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VfsSlot {
    Open,
    Delete,
    Access,
    FullPathname,
    DlOpen,
    DlError,
    DlSym,
    DlClose,
    Randomness,
    Sleep,
    CurrentTime,
    GetLastError,
    CurrentTimeInt64,
    SetSystemCall,
    GetSystemCall,
    NextSystemCall,
}

impl Slot for VfsSlot {
    const TABLE: &'static str = "vfs";
    const CEILING: u32 = 3;
    const ALL: &'static [Self] = &[
        Self::Open,
        Self::Delete,
        Self::Access,
        Self::FullPathname,
        Self::DlOpen,
        Self::DlError,
        Self::DlSym,
        Self::DlClose,
        Self::Randomness,
        Self::Sleep,
        Self::CurrentTime,
        Self::GetLastError,
        Self::CurrentTimeInt64,
        Self::SetSystemCall,
        Self::GetSystemCall,
        Self::NextSystemCall,
    ];

    fn introduced(self) -> u32 {
        match self {
            Self::CurrentTimeInt64 => 2,
            Self::SetSystemCall | Self::GetSystemCall | Self::NextSystemCall => 3,
            _ => 1,
        }
    }

    fn bit(self) -> u32 {
        self as u32
    }
}

/// File-level (I/O) operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoSlot {
    Close,
    Read,
    Write,
    Truncate,
    Sync,
    FileSize,
    Lock,
    Unlock,
    CheckReservedLock,
    FileControl,
    SectorSize,
    DeviceCharacteristics,
    ShmMap,
    ShmLock,
    ShmBarrier,
    ShmUnmap,
}

impl Slot for IoSlot {
    const TABLE: &'static str = "io methods";
    const CEILING: u32 = 2;
    const ALL: &'static [Self] = &[
        Self::Close,
        Self::Read,
        Self::Write,
        Self::Truncate,
        Self::Sync,
        Self::FileSize,
        Self::Lock,
        Self::Unlock,
        Self::CheckReservedLock,
        Self::FileControl,
        Self::SectorSize,
        Self::DeviceCharacteristics,
        Self::ShmMap,
        Self::ShmLock,
        Self::ShmBarrier,
        Self::ShmUnmap,
    ];

    fn introduced(self) -> u32 {
        match self {
            Self::ShmMap | Self::ShmLock | Self::ShmBarrier | Self::ShmUnmap => 2,
            _ => 1,
        }
    }

    fn bit(self) -> u32 {
        self as u32
    }
}

/// The set of operations a shim advertises, plus the table version.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct MethodTable<S: Slot> {
    version: u32,
    mask: u32,
    _slot: PhantomData<S>,
}

/// Negotiated VFS-level table.
pub type VfsMethods = MethodTable<VfsSlot>;
/// Negotiated file-level table.
pub type IoMethods = MethodTable<IoSlot>;

impl<S: Slot> MethodTable<S> {
    /// An empty table (version 0, nothing defined).
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            version: 0,
            mask: 0,
            _slot: PhantomData,
        }
    }

    #[must_use]
    pub const fn version(&self) -> u32 {
        self.version
    }

    /// Whether `slot` is defined.
    #[must_use]
    pub fn has(&self, slot: S) -> bool {
        self.mask & (1 << slot.bit()) != 0
    }

    /// The defined slots, in table order.
    pub fn slots(&self) -> impl Iterator<Item = S> + '_ {
        S::ALL.iter().copied().filter(|&s| self.has(s))
    }
}

impl<S: Slot> Default for MethodTable<S> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<S: Slot> fmt::Debug for MethodTable<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodTable")
            .field("table", &S::TABLE)
            .field("version", &self.version)
            .field("slots", &self.slots().collect::<Vec<_>>())
            .finish()
    }
}

/// Build `dest` to mirror a source table of `source_version`.
///
/// `dest` is only written on success. Version 0 is not a valid table
/// version and is rejected as misuse; versions above `ceiling` (or above the
/// table's known layout) are rejected because their extra slots cannot be
/// interpreted.
pub fn negotiate_table<S: Slot>(
    dest: &mut MethodTable<S>,
    source_version: u32,
    ceiling: u32,
) -> Result<()> {
    if source_version == 0 {
        return Err(FairlockError::misuse(format!(
            "{} table reports version 0",
            S::TABLE
        )));
    }
    let ceiling = ceiling.min(S::CEILING);
    if source_version > ceiling {
        return Err(FairlockError::UnsupportedVersion {
            table: S::TABLE,
            version: source_version,
            ceiling,
        });
    }

    let mask = S::ALL
        .iter()
        .filter(|slot| slot.introduced() <= source_version)
        .fold(0_u32, |mask, slot| mask | (1 << slot.bit()));
    *dest = MethodTable {
        version: source_version,
        mask,
        _slot: PhantomData,
    };
    Ok(())
}
