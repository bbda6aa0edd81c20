//! Flag sets passed through the VFS interface.
//!
//! Bit values match the engine's `SQLITE_OPEN_*`, `SQLITE_SYNC_*` and
//! `SQLITE_ACCESS_*` constants so they can cross the boundary unchanged.

bitflags::bitflags! {
    /// Flags for `Vfs::open`: the kind of file and how to open it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct VfsOpenFlags: u32 {
        const READONLY = 0x0000_0001;
        const READWRITE = 0x0000_0002;
        const CREATE = 0x0000_0004;
        const DELETEONCLOSE = 0x0000_0008;
        const EXCLUSIVE = 0x0000_0010;
        const AUTOPROXY = 0x0000_0020;
        const URI = 0x0000_0040;
        const MEMORY = 0x0000_0080;
        const MAIN_DB = 0x0000_0100;
        const TEMP_DB = 0x0000_0200;
        const TRANSIENT_DB = 0x0000_0400;
        const MAIN_JOURNAL = 0x0000_0800;
        const TEMP_JOURNAL = 0x0000_1000;
        const SUBJOURNAL = 0x0000_2000;
        const SUPER_JOURNAL = 0x0000_4000;
        const NOMUTEX = 0x0000_8000;
        const FULLMUTEX = 0x0001_0000;
        const SHAREDCACHE = 0x0002_0000;
        const PRIVATECACHE = 0x0004_0000;
        const WAL = 0x0008_0000;
    }
}

impl VfsOpenFlags {
    /// Whether these flags describe the primary database file (as opposed to
    /// a journal, WAL, temp or transient file).
    #[must_use]
    pub const fn is_main_db(self) -> bool {
        self.contains(Self::MAIN_DB)
    }
}

bitflags::bitflags! {
    /// Flags for `VfsFile::sync`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SyncFlags: u32 {
        const NORMAL = 0x0000_0002;
        const FULL = 0x0000_0003;
        const DATAONLY = 0x0000_0010;
    }
}

bitflags::bitflags! {
    /// Flags for `Vfs::access`.
    ///
    /// `EXISTS` is the zero value, matching `SQLITE_ACCESS_EXISTS`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccessFlags: u32 {
        const EXISTS = 0;
        const READWRITE = 1;
        const READ = 2;
    }
}
