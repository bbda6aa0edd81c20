pub mod cx;
pub mod flags;

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lock level for database file locking (the engine's five-state lock).
///
/// Ordered `None < Shared < Reserved < Pending < Exclusive`; comparisons on
/// this type are the comparisons the locking protocol relies on.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum LockLevel {
    /// No lock held.
    #[default]
    None = 0,
    /// Shared lock (reading).
    Shared = 1,
    /// Reserved lock (intending to write).
    Reserved = 2,
    /// Pending lock (waiting for shared locks to clear).
    Pending = 3,
    /// Exclusive lock (writing).
    Exclusive = 4,
}

impl LockLevel {
    /// All levels in ascending order.
    pub const ALL: [Self; 5] = [
        Self::None,
        Self::Shared,
        Self::Reserved,
        Self::Pending,
        Self::Exclusive,
    ];

    /// Convert from the engine's integer representation.
    #[must_use]
    pub const fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::None),
            1 => Some(Self::Shared),
            2 => Some(Self::Reserved),
            3 => Some(Self::Pending),
            4 => Some(Self::Exclusive),
            _ => None,
        }
    }

    /// The engine's integer representation.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Upper-case name as used in diagnostics.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Shared => "SHARED",
            Self::Reserved => "RESERVED",
            Self::Pending => "PENDING",
            Self::Exclusive => "EXCLUSIVE",
        }
    }
}

impl fmt::Display for LockLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
