// 上传模块
//
// 两层并发：
// - 工作者池：num_workers 个独立的队列工作者
// - 每个工作者内部最多同时上传 files_per_worker 个文件
//
// 文件夹扫描与上传同时进行，扫描到的文件分批进入共享队列

pub mod folder;
pub mod manager;
pub mod queue;
pub mod scheduler;
pub mod task;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use folder::{
    folder_key, format_bytes, scan_local_tree, BatchFolderScanner, BatchSummary, FolderScanner, LocalTree,
    ScanOptions, ScanOutcome, ScanSummary, ScannedFile, DEFAULT_SCAN_BATCH_SIZE,
};
pub use manager::{AggregateStatistics, SessionState, UnifiedUploadManager};
pub use queue::{QueueOrdering, QueueStatistics, UploadQueue};
pub use scheduler::{IdleSignal, WorkerManager, WorkerPoolConfig, WorkerPoolStatistics};
pub use task::{FileStatus, FolderInfo, QueuedFile, DEFAULT_MAX_RETRIES};
pub use worker::{QueueWorker, WorkerOptions, WorkerStatistics, SKIP_REASON_EXISTS};
