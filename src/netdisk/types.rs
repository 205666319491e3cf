// 远程存储数据类型定义

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 文件夹的 MIME 类型标记
pub const FOLDER_MIME_TYPE: &str = "application/vnd.netdisk.folder";

/// 普通文件的默认 MIME 类型
pub const DEFAULT_FILE_MIME_TYPE: &str = "application/octet-stream";

/// 远程目录下的一个条目
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteEntry {
    /// 条目名称
    pub name: String,
    /// 远程标识符
    pub id: String,
    /// MIME 类型（文件夹为 FOLDER_MIME_TYPE）
    pub mime_type: String,
    /// 文件大小（文件夹为 0）
    pub size: u64,
}

impl RemoteEntry {
    pub fn folder(name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
            mime_type: FOLDER_MIME_TYPE.to_string(),
            size: 0,
        }
    }

    pub fn file(name: impl Into<String>, id: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
            mime_type: DEFAULT_FILE_MIME_TYPE.to_string(),
            size,
        }
    }

    /// 是否为文件夹
    pub fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME_TYPE
    }
}

/// 远程存储操作错误
#[derive(Debug, Error)]
pub enum RemoteError {
    /// 本地或远端 IO 错误
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    /// 目标不存在
    #[error("远程对象不存在: {0}")]
    NotFound(String),

    /// 非法的远程标识符
    #[error("非法的远程标识符: {0}")]
    InvalidId(String),

    /// 服务端拒绝
    #[error("远程操作被拒绝: {0}")]
    Rejected(String),

    /// 上传被进度回调取消
    #[error("上传已取消")]
    Cancelled,
}

impl RemoteError {
    /// 是否值得由调用方重试
    pub fn is_retriable(&self) -> bool {
        matches!(self, RemoteError::Io(_) | RemoteError::Rejected(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_kind() {
        assert!(RemoteEntry::folder("docs", "f1").is_folder());
        assert!(!RemoteEntry::file("a.txt", "x1", 3).is_folder());
    }

    #[test]
    fn test_error_retriable() {
        assert!(RemoteError::Rejected("quota".into()).is_retriable());
        assert!(!RemoteError::Cancelled.is_retriable());
        assert!(!RemoteError::InvalidId("../x".into()).is_retriable());
    }
}
