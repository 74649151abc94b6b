pub mod fs;
pub mod http;
pub mod memory;

pub use fs::{FileStateStore, FsMediaSource};
pub use http::{HttpObjectStorage, HttpRemoteProcessor};
pub use memory::MemoryStateStore;
