//! Storage device abstraction
//!
//! Data files and the disk-backed index talk to storage through
//! [`SyncStorageDevice`]: positional reads and writes that never move a shared
//! cursor, so one writer and many readers can use the same handle.

mod file_device;
mod traits;

pub use file_device::FileSystemFile;
pub use traits::SyncStorageDevice;
