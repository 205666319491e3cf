//! 事件类型定义
//!
//! 上传核心对外只发布事件，不读取任何展示层状态

use crate::uploader::{AggregateStatistics, FileStatus, QueueOrdering};
use serde::{Deserialize, Serialize};

/// 事件优先级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventPriority {
    /// 低优先级：进度更新、统计快照
    Low = 0,
    /// 中优先级：状态变更
    Medium = 1,
    /// 高优先级：完成、失败等关键事件
    High = 2,
}

/// 上传队列事件
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum QueueEvent {
    /// 单个文件入队
    FileAdded {
        file_id: String,
        source_folder: String,
    },
    /// 一批文件入队（供展示层合并刷新）
    FilesBatchAdded { file_ids: Vec<String> },
    /// 文件状态或进度变化
    FileUpdated {
        file_id: String,
        status: FileStatus,
        progress: u8,
    },
    /// 文件从队列移除
    FileRemoved { file_id: String },
    /// 文件夹登记
    FolderAdded { folder_path: String },
    /// 文件夹汇总信息变化
    FolderUpdated { folder_path: String },
    /// 待上传列表重新排序
    Reordered {
        ordering: QueueOrdering,
        count: usize,
    },
}

impl QueueEvent {
    pub fn priority(&self) -> EventPriority {
        match self {
            QueueEvent::FileUpdated { status, .. } => match status {
                FileStatus::Pending | FileStatus::InProgress => EventPriority::Low,
                _ => EventPriority::High,
            },
            QueueEvent::FolderUpdated { .. } => EventPriority::Low,
            QueueEvent::FileAdded { .. }
            | QueueEvent::FilesBatchAdded { .. }
            | QueueEvent::FolderAdded { .. }
            | QueueEvent::Reordered { .. } => EventPriority::Medium,
            QueueEvent::FileRemoved { .. } => EventPriority::High,
        }
    }

    pub fn event_type_name(&self) -> &'static str {
        match self {
            QueueEvent::FileAdded { .. } => "file_added",
            QueueEvent::FilesBatchAdded { .. } => "files_batch_added",
            QueueEvent::FileUpdated { .. } => "file_updated",
            QueueEvent::FileRemoved { .. } => "file_removed",
            QueueEvent::FolderAdded { .. } => "folder_added",
            QueueEvent::FolderUpdated { .. } => "folder_updated",
            QueueEvent::Reordered { .. } => "reordered",
        }
    }
}

/// 文件夹扫描事件
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum ScanEvent {
    /// 开始扫描
    Started { folder_path: String },
    /// 远程文件夹已创建（或复用）
    FolderCreated {
        relative_path: String,
        remote_id: String,
        reused: bool,
    },
    /// 子文件夹创建失败，其内容改投到父文件夹
    FolderCreateFailed {
        relative_path: String,
        fallback_id: String,
        error: String,
    },
    /// 一批文件已加入队列
    FilesAdded { folder_path: String, count: usize },
    /// 扫描完成
    Completed {
        folder_path: String,
        files_added: usize,
        remote_folder_id: String,
    },
    /// 扫描失败
    Failed { folder_path: String, error: String },

    /// 批量扫描开始
    BatchStarted { total_folders: usize },
    /// 批量扫描中的第 index 个文件夹开始
    BatchFolderStarted { index: usize, folder_path: String },
    /// 批量扫描中的第 index 个文件夹完成
    BatchFolderCompleted {
        index: usize,
        folder_path: String,
        files_added: usize,
        remote_folder_id: String,
    },
    /// 批量扫描中的第 index 个文件夹失败
    BatchFolderFailed {
        index: usize,
        folder_path: String,
        error: String,
    },
    /// 批量扫描结束
    BatchCompleted {
        total_folders: usize,
        total_files_added: usize,
    },
}

impl ScanEvent {
    pub fn priority(&self) -> EventPriority {
        match self {
            ScanEvent::FolderCreated { .. } | ScanEvent::FilesAdded { .. } => EventPriority::Low,
            ScanEvent::Started { .. }
            | ScanEvent::BatchStarted { .. }
            | ScanEvent::BatchFolderStarted { .. } => EventPriority::Medium,
            _ => EventPriority::High,
        }
    }

    pub fn event_type_name(&self) -> &'static str {
        match self {
            ScanEvent::Started { .. } => "started",
            ScanEvent::FolderCreated { .. } => "folder_created",
            ScanEvent::FolderCreateFailed { .. } => "folder_create_failed",
            ScanEvent::FilesAdded { .. } => "files_added",
            ScanEvent::Completed { .. } => "completed",
            ScanEvent::Failed { .. } => "failed",
            ScanEvent::BatchStarted { .. } => "batch_started",
            ScanEvent::BatchFolderStarted { .. } => "batch_folder_started",
            ScanEvent::BatchFolderCompleted { .. } => "batch_folder_completed",
            ScanEvent::BatchFolderFailed { .. } => "batch_folder_failed",
            ScanEvent::BatchCompleted { .. } => "batch_completed",
        }
    }

    /// 扫描成功结束时返回 (文件夹路径, 新增文件数)
    pub fn completed_folder(&self) -> Option<(&str, usize)> {
        match self {
            ScanEvent::Completed {
                folder_path,
                files_added,
                ..
            }
            | ScanEvent::BatchFolderCompleted {
                folder_path,
                files_added,
                ..
            } => Some((folder_path.as_str(), *files_added)),
            _ => None,
        }
    }

    /// 扫描失败时返回 (文件夹路径, 错误信息)
    pub fn failed_folder(&self) -> Option<(&str, &str)> {
        match self {
            ScanEvent::Failed { folder_path, error }
            | ScanEvent::BatchFolderFailed {
                folder_path, error, ..
            } => Some((folder_path.as_str(), error.as_str())),
            _ => None,
        }
    }
}

/// 上传会话事件
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum SessionEvent {
    Started {
        num_workers: usize,
        files_per_worker: usize,
    },
    Paused,
    Resumed,
    Stopped,
    /// 工作者池空闲且没有待上传文件
    WorkersIdle,
    /// 全部工作已处理完
    Completed {
        completed: usize,
        failed: usize,
        skipped: usize,
    },
    /// 非致命提示，例如传入了无效路径
    Warning { message: String },
}

impl SessionEvent {
    pub fn priority(&self) -> EventPriority {
        match self {
            SessionEvent::WorkersIdle => EventPriority::Medium,
            _ => EventPriority::High,
        }
    }

    pub fn event_type_name(&self) -> &'static str {
        match self {
            SessionEvent::Started { .. } => "started",
            SessionEvent::Paused => "paused",
            SessionEvent::Resumed => "resumed",
            SessionEvent::Stopped => "stopped",
            SessionEvent::WorkersIdle => "workers_idle",
            SessionEvent::Completed { .. } => "completed",
            SessionEvent::Warning { .. } => "warning",
        }
    }
}

/// 统一上传事件
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "category", content = "event")]
pub enum UploadEvent {
    #[serde(rename = "queue")]
    Queue(QueueEvent),
    #[serde(rename = "scan")]
    Scan(ScanEvent),
    #[serde(rename = "session")]
    Session(SessionEvent),
    /// 聚合统计快照
    #[serde(rename = "statistics")]
    Statistics(AggregateStatistics),
}

impl UploadEvent {
    pub fn priority(&self) -> EventPriority {
        match self {
            UploadEvent::Queue(e) => e.priority(),
            UploadEvent::Scan(e) => e.priority(),
            UploadEvent::Session(e) => e.priority(),
            UploadEvent::Statistics(_) => EventPriority::Low,
        }
    }

    pub fn category(&self) -> &'static str {
        match self {
            UploadEvent::Queue(_) => "queue",
            UploadEvent::Scan(_) => "scan",
            UploadEvent::Session(_) => "session",
            UploadEvent::Statistics(_) => "statistics",
        }
    }

    pub fn event_type_name(&self) -> &'static str {
        match self {
            UploadEvent::Queue(e) => e.event_type_name(),
            UploadEvent::Scan(e) => e.event_type_name(),
            UploadEvent::Session(e) => e.event_type_name(),
            UploadEvent::Statistics(_) => "snapshot",
        }
    }
}

impl From<QueueEvent> for UploadEvent {
    fn from(event: QueueEvent) -> Self {
        UploadEvent::Queue(event)
    }
}

impl From<ScanEvent> for UploadEvent {
    fn from(event: ScanEvent) -> Self {
        UploadEvent::Scan(event)
    }
}

impl From<SessionEvent> for UploadEvent {
    fn from(event: SessionEvent) -> Self {
        UploadEvent::Session(event)
    }
}
