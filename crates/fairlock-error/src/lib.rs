use std::path::PathBuf;

use thiserror::Error;

/// Primary error type for fairlock operations.
///
/// Every variant maps onto the host engine's integer result space through
/// [`FairlockError::error_code`], so a VFS hook can always hand the engine a
/// status it understands.
#[derive(Error, Debug)]
pub enum FairlockError {
    // === Contention ===
    /// The lock could not be granted right now; the engine may retry.
    #[error("database is busy")]
    Busy,

    // === I/O Errors ===
    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Locking failed for a reason other than contention.
    #[error("lock I/O error on '{path}': {detail}")]
    LockIo { path: String, detail: String },

    /// The real unlock happened but the follow-up bookkeeping failed.
    #[error("unlock I/O error on '{path}': {detail}")]
    UnlockIo { path: String, detail: String },

    /// Cannot open file.
    #[error("unable to open database file: '{path}'")]
    CannotOpen { path: PathBuf },

    // === Status passthrough ===
    /// A status code produced by pluggable code and propagated verbatim.
    #[error("lock arbiter reported status {0:?}")]
    Status(ErrorCode),

    // === Environment ===
    /// No VFS is registered as the default.
    #[error("no default VFS registered")]
    NoDefaultVfs,

    /// Named VFS is not registered.
    #[error("no such VFS: {name}")]
    VfsNotFound { name: String },

    /// A VFS with the same name is already registered.
    #[error("VFS name already registered: {name}")]
    VfsNameTaken { name: String },

    /// An operation table reports a layout newer than this crate understands.
    #[error("{table} version {version} is newer than supported version {ceiling}")]
    UnsupportedVersion {
        table: &'static str,
        version: u32,
        ceiling: u32,
    },

    /// No lock arbiter is registered under the requested name.
    #[error("no lock arbiter registered as '{name}'")]
    ArbiterNotFound { name: String },

    /// The arbiter returned success but the real lock is not held.
    #[error("lock arbiter failed to lock file '{path}' at level {level}")]
    ArbiterContract { path: String, level: &'static str },

    /// File control opcode not handled by this file.
    #[error("file control opcode {op} not handled")]
    FileControlNotFound { op: i32 },

    // === Internal Errors ===
    /// Internal logic error (should never happen).
    #[error("internal error: {0}")]
    Internal(String),

    /// Operation is not supported by the current backend or configuration.
    #[error("unsupported operation")]
    Unsupported,

    /// Library used incorrectly.
    #[error("library used incorrectly: {0}")]
    Misuse(String),

    /// Out of memory.
    #[error("out of memory")]
    OutOfMemory,
}

/// Engine result codes.
///
/// These match the numeric values from C SQLite's `sqlite3.h`, including the
/// two extended I/O codes this layer reports for lock and unlock failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    /// Successful result.
    Ok = 0,
    /// Generic error.
    Error = 1,
    /// Internal logic error.
    Internal = 2,
    /// Access permission denied.
    Perm = 3,
    /// Callback requested abort.
    Abort = 4,
    /// Database file is locked.
    Busy = 5,
    /// Table is locked.
    Locked = 6,
    /// Out of memory.
    NoMem = 7,
    /// Attempt to write a read-only database.
    ReadOnly = 8,
    /// Interrupted.
    Interrupt = 9,
    /// Disk I/O error.
    IoErr = 10,
    /// Database disk image is malformed.
    Corrupt = 11,
    /// Unknown opcode in file control.
    NotFound = 12,
    /// Database or disk is full.
    Full = 13,
    /// Unable to open database file.
    CantOpen = 14,
    /// Locking protocol error.
    Protocol = 15,
    /// Library used incorrectly.
    Misuse = 21,
    /// OS feature not available.
    NoLfs = 22,
    /// I/O error while releasing a lock (`SQLITE_IOERR_UNLOCK`).
    IoErrUnlock = 2058,
    /// I/O error while acquiring a lock (`SQLITE_IOERR_LOCK`).
    IoErrLock = 3850,
}

impl ErrorCode {
    /// Fold an extended code onto its primary code.
    #[must_use]
    pub const fn primary(self) -> Self {
        match self {
            Self::IoErrUnlock | Self::IoErrLock => Self::IoErr,
            other => other,
        }
    }

    /// Look up a code by its numeric value.
    #[must_use]
    pub const fn from_raw(raw: i32) -> Option<Self> {
        Some(match raw {
            0 => Self::Ok,
            1 => Self::Error,
            2 => Self::Internal,
            3 => Self::Perm,
            4 => Self::Abort,
            5 => Self::Busy,
            6 => Self::Locked,
            7 => Self::NoMem,
            8 => Self::ReadOnly,
            9 => Self::Interrupt,
            10 => Self::IoErr,
            11 => Self::Corrupt,
            12 => Self::NotFound,
            13 => Self::Full,
            14 => Self::CantOpen,
            15 => Self::Protocol,
            21 => Self::Misuse,
            22 => Self::NoLfs,
            2058 => Self::IoErrUnlock,
            3850 => Self::IoErrLock,
            _ => return None,
        })
    }
}

impl FairlockError {
    /// Map this error to an engine result code.
    #[allow(clippy::match_same_arms)]
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::Busy => ErrorCode::Busy,
            Self::Io(_) => ErrorCode::IoErr,
            Self::LockIo { .. } => ErrorCode::IoErrLock,
            Self::UnlockIo { .. } => ErrorCode::IoErrUnlock,
            Self::CannotOpen { .. } => ErrorCode::CantOpen,
            Self::Status(code) => *code,
            Self::NoDefaultVfs
            | Self::VfsNotFound { .. }
            | Self::VfsNameTaken { .. }
            | Self::UnsupportedVersion { .. }
            | Self::ArbiterNotFound { .. } => ErrorCode::Error,
            Self::ArbiterContract { .. } | Self::Internal(_) => ErrorCode::Internal,
            Self::FileControlNotFound { .. } => ErrorCode::NotFound,
            Self::Unsupported => ErrorCode::NoLfs,
            Self::Misuse(_) => ErrorCode::Misuse,
            Self::OutOfMemory => ErrorCode::NoMem,
        }
    }

    /// Whether this is a transient error that may succeed on retry.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Busy | Self::Status(ErrorCode::Busy | ErrorCode::Locked)
        )
    }

    /// Human-friendly suggestion for fixing this error.
    pub const fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::Busy => Some("Retry the operation after a short delay"),
            Self::ArbiterContract { .. } => {
                Some("The lock arbiter must acquire the real lock through the forwarding callable")
            }
            Self::ArbiterNotFound { .. } => {
                Some("Install an arbiter under this name or disable coordination for it")
            }
            Self::NoDefaultVfs => Some("Register a VFS before creating connections"),
            _ => None,
        }
    }

    /// Create a lock I/O error.
    pub fn lock_io(path: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::LockIo {
            path: path.into(),
            detail: detail.into(),
        }
    }

    /// Create an unlock I/O error.
    pub fn unlock_io(path: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::UnlockIo {
            path: path.into(),
            detail: detail.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a misuse error.
    pub fn misuse(msg: impl Into<String>) -> Self {
        Self::Misuse(msg.into())
    }
}

/// Result type alias using `FairlockError`.
pub type Result<T> = std::result::Result<T, FairlockError>;
