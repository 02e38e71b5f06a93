//! File Storage subsystem
//!
//! - `open_mode`: open flags and their validity rule
//! - `info`: per-file metadata
//! - `stream`: block-cached positional I/O
//! - `accessor`: read and read-write accessors
//! - `storage`: the public [`FileStorage`]

mod accessor;
mod info;
mod open_mode;
mod storage;
mod stream;

pub use accessor::{Origin, ReadAccessor, ReadWriteAccessor};
pub use info::{now_nanos, FileCreationState, FileInfo, FileModificationState};
pub use open_mode::{Access, OpenMode};
pub use storage::FileStorage;
pub use stream::DEFAULT_BLOCK_SIZE;

pub(crate) use storage::FileStorageCore;
