// Unified Uploader Library
// 文件夹批量上传核心库

// 配置管理模块
pub mod config;

// 事件模块
pub mod events;

// 日志模块
pub mod logging;

// 远程存储模块
pub mod netdisk;

// 上传模块
pub mod uploader;

// 导出常用类型
pub use config::AppConfig;
pub use events::{EventBus, QueueEvent, ScanEvent, SessionEvent, UploadEvent};
pub use netdisk::{
    LocalMirrorStorage, MemoryStorage, RemoteClient, RemoteClientFactory, RemoteError,
    RemoteStorage,
};
pub use uploader::{
    FileStatus, FolderInfo, QueueOrdering, QueueStatistics, QueuedFile, SessionState,
    UnifiedUploadManager, UploadQueue,
};
