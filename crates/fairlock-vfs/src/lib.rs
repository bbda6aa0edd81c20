//! VFS traits, the memory and unix backends, and the per-connection shim
//! that routes main database locks through a lock arbiter.

pub mod arbiter;
pub mod connection;
pub mod coordinator;
pub mod lock_state;
pub mod memory;
pub mod methods;
pub mod registry;
pub mod shim_file;
pub mod shim_vfs;
pub mod shm;
pub mod traits;
#[cfg(unix)]
pub mod unix;

#[cfg(test)]
pub(crate) mod test_support;

pub use arbiter::{
    Arbiter, ArbiterError, ArbiterRegistry, ArbiterSlot, DEFAULT_ARBITER_NAME, LockForward,
};
pub use connection::{ConnectionId, ConnectionRegistry};
pub use memory::{MemoryFile, MemoryVfs};
pub use methods::{IoMethods, IoSlot, VfsMethods, VfsSlot, negotiate_table};
pub use registry::{BoxedFile, DynVfs, VfsRegistration, VfsRegistry};
pub use shim_file::{FileShim, ShimFile};
pub use shim_vfs::{ConnectionVfs, Coordination, ShimVfsHandle};
pub use shm::ShmRegion;
pub use traits::{FileControl, FileControlReply, Vfs, VfsFile, normalize_path};
#[cfg(unix)]
pub use unix::{UnixFile, UnixVfs};
