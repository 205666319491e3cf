// 远程存储模块

pub mod memory;
pub mod mirror;
pub mod storage;
pub mod types;

pub use memory::{MemoryNode, MemoryStorage, StorageOperation, MEMORY_ROOT_ID};
pub use mirror::{LocalMirrorStorage, MIRROR_ROOT_ID};
pub use storage::{
    ProgressCallback, RemoteClient, RemoteClientFactory, RemoteStorage, UPLOAD_CHUNK_SIZE,
};
pub use types::*;
