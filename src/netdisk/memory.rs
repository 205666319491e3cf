//! 内存远程存储
//!
//! 用于演练模式（--dry-run）和测试:
//! - 在内存中维护一棵文件夹树
//! - 记录所有远程操作的顺序
//! - 统计同时进行的上传数峰值
//! - 可按名称注入失败，可为每个分块设置延迟

use super::storage::{ProgressCallback, RemoteStorage, UPLOAD_CHUNK_SIZE};
use super::types::{RemoteEntry, RemoteError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::debug;
use uuid::Uuid;

/// 根文件夹标识符
pub const MEMORY_ROOT_ID: &str = "root";

/// 已执行的远程操作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageOperation {
    List {
        folder_id: String,
    },
    CreateFolder {
        name: String,
        parent_id: String,
        id: String,
    },
    Upload {
        name: String,
        parent_id: String,
        id: String,
    },
}

/// 内存树中的节点
#[derive(Debug, Clone)]
pub struct MemoryNode {
    pub id: String,
    pub name: String,
    pub parent_id: Option<String>,
    pub is_folder: bool,
    pub size: u64,
}

impl MemoryNode {
    fn to_entry(&self) -> RemoteEntry {
        if self.is_folder {
            RemoteEntry::folder(&self.name, &self.id)
        } else {
            RemoteEntry::file(&self.name, &self.id, self.size)
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    nodes: HashMap<String, MemoryNode>,
    operations: Vec<StorageOperation>,
    rejected_names: HashSet<String>,
}

impl MemoryState {
    fn ensure_folder(&self, id: &str) -> Result<(), RemoteError> {
        match self.nodes.get(id) {
            Some(node) if node.is_folder => Ok(()),
            _ => Err(RemoteError::NotFound(id.to_string())),
        }
    }

    fn insert(&mut self, name: &str, parent_id: &str, is_folder: bool, size: u64) -> String {
        let prefix = if is_folder { "folder" } else { "file" };
        let id = format!("{}-{}", prefix, Uuid::new_v4().simple());
        self.nodes.insert(
            id.clone(),
            MemoryNode {
                id: id.clone(),
                name: name.to_string(),
                parent_id: Some(parent_id.to_string()),
                is_folder,
                size,
            },
        );
        id
    }
}

/// 内存远程存储
#[derive(Debug)]
pub struct MemoryStorage {
    state: Mutex<MemoryState>,
    chunk_size: u64,
    chunk_delay: Duration,
    active_uploads: AtomicUsize,
    peak_uploads: AtomicUsize,
}

/// 上传期间占用一个并发计数
struct UploadSlot<'a> {
    active: &'a AtomicUsize,
}

impl<'a> UploadSlot<'a> {
    fn enter(active: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self { active }
    }
}

impl Drop for UploadSlot<'_> {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        let mut state = MemoryState::default();
        state.nodes.insert(
            MEMORY_ROOT_ID.to_string(),
            MemoryNode {
                id: MEMORY_ROOT_ID.to_string(),
                name: String::new(),
                parent_id: None,
                is_folder: true,
                size: 0,
            },
        );
        Self {
            state: Mutex::new(state),
            chunk_size: UPLOAD_CHUNK_SIZE,
            chunk_delay: Duration::ZERO,
            active_uploads: AtomicUsize::new(0),
            peak_uploads: AtomicUsize::new(0),
        }
    }

    /// 设置上传分块大小
    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// 每个分块之后等待一段时间，模拟慢速网络
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// 对指定名称的文件夹创建和文件上传返回错误
    pub fn reject_name(&self, name: impl Into<String>) {
        self.state.lock().rejected_names.insert(name.into());
    }

    pub fn accept_name(&self, name: &str) {
        self.state.lock().rejected_names.remove(name);
    }

    /// 预置一个文件夹
    pub fn seed_folder(&self, parent_id: &str, name: &str) -> String {
        self.state.lock().insert(name, parent_id, true, 0)
    }

    /// 预置一个文件
    pub fn seed_file(&self, parent_id: &str, name: &str, size: u64) -> String {
        self.state.lock().insert(name, parent_id, false, size)
    }

    pub fn node(&self, id: &str) -> Option<MemoryNode> {
        self.state.lock().nodes.get(id).cloned()
    }

    /// 某个文件夹下的子节点（按名称排序）
    pub fn children(&self, parent_id: &str) -> Vec<MemoryNode> {
        let state = self.state.lock();
        let mut children: Vec<MemoryNode> = state
            .nodes
            .values()
            .filter(|n| n.parent_id.as_deref() == Some(parent_id))
            .cloned()
            .collect();
        children.sort_by(|a, b| a.name.cmp(&b.name));
        children
    }

    /// 已上传的文件数
    pub fn file_count(&self) -> usize {
        self.state.lock().nodes.values().filter(|n| !n.is_folder).count()
    }

    /// 按执行顺序返回全部操作记录
    pub fn operations(&self) -> Vec<StorageOperation> {
        self.state.lock().operations.clone()
    }

    /// 同时进行中的上传数峰值
    pub fn peak_concurrent_uploads(&self) -> usize {
        self.peak_uploads.load(Ordering::SeqCst)
    }

    fn is_rejected(&self, name: &str) -> bool {
        self.state.lock().rejected_names.contains(name)
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStorage for MemoryStorage {
    async fn list(&self, folder_id: &str) -> Result<Vec<RemoteEntry>, RemoteError> {
        let mut state = self.state.lock();
        state.ensure_folder(folder_id)?;
        state.operations.push(StorageOperation::List {
            folder_id: folder_id.to_string(),
        });

        let mut entries: Vec<RemoteEntry> = state
            .nodes
            .values()
            .filter(|n| n.parent_id.as_deref() == Some(folder_id))
            .map(MemoryNode::to_entry)
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn create_folder(&self, name: &str, parent_id: &str) -> Result<String, RemoteError> {
        let mut state = self.state.lock();
        if state.rejected_names.contains(name) {
            return Err(RemoteError::Rejected(format!("创建文件夹被拒绝: {}", name)));
        }
        state.ensure_folder(parent_id)?;

        let id = state.insert(name, parent_id, true, 0);
        state.operations.push(StorageOperation::CreateFolder {
            name: name.to_string(),
            parent_id: parent_id.to_string(),
            id: id.clone(),
        });
        debug!("内存存储创建文件夹: {} -> {}", name, id);
        Ok(id)
    }

    async fn upload(
        &self,
        local_path: &Path,
        parent_id: &str,
        progress: ProgressCallback<'_>,
    ) -> Result<String, RemoteError> {
        let name = local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| RemoteError::InvalidId(local_path.display().to_string()))?;

        if self.is_rejected(&name) {
            return Err(RemoteError::Rejected(format!("上传被拒绝: {}", name)));
        }
        self.state.lock().ensure_folder(parent_id)?;

        let _slot = UploadSlot::enter(&self.active_uploads, &self.peak_uploads);

        let mut file = tokio::fs::File::open(local_path).await?;
        let total = file.metadata().await?.len();
        if !progress(0, total) {
            return Err(RemoteError::Cancelled);
        }

        let mut buffer = vec![0u8; self.chunk_size as usize];
        let mut sent = 0u64;
        loop {
            let n = file.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            if !self.chunk_delay.is_zero() {
                tokio::time::sleep(self.chunk_delay).await;
            }
            sent += n as u64;
            if !progress(sent, total) {
                return Err(RemoteError::Cancelled);
            }
        }

        let mut state = self.state.lock();
        let id = state.insert(&name, parent_id, false, sent);
        state.operations.push(StorageOperation::Upload {
            name,
            parent_id: parent_id.to_string(),
            id: id.clone(),
        });
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_create_and_list() {
        let storage = MemoryStorage::new();
        let docs = storage.create_folder("docs", MEMORY_ROOT_ID).await.unwrap();
        storage.seed_file(&docs, "a.txt", 5);

        let entries = storage.list(&docs).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "a.txt");

        let root = storage.list(MEMORY_ROOT_ID).await.unwrap();
        assert!(root[0].is_folder());
    }

    #[tokio::test]
    async fn test_missing_parent() {
        let storage = MemoryStorage::new();
        let result = storage.create_folder("x", "nope").await;
        assert!(matches!(result, Err(RemoteError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_upload_reports_progress() {
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(&[7u8; 10]).unwrap();

        let storage = MemoryStorage::new().with_chunk_size(4);
        let calls = Mutex::new(Vec::new());
        let id = storage
            .upload(temp.path(), MEMORY_ROOT_ID, &|sent, total| {
                calls.lock().push((sent, total));
                true
            })
            .await
            .unwrap();

        assert_eq!(storage.node(&id).unwrap().size, 10);
        assert_eq!(calls.lock().last(), Some(&(10, 10)));
        assert_eq!(storage.peak_concurrent_uploads(), 1);
    }

    #[tokio::test]
    async fn test_upload_cancelled_by_callback() {
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(&[1u8; 8]).unwrap();

        let storage = MemoryStorage::new().with_chunk_size(2);
        let result = storage
            .upload(temp.path(), MEMORY_ROOT_ID, &|sent, _| sent < 4)
            .await;

        assert!(matches!(result, Err(RemoteError::Cancelled)));
        assert_eq!(storage.file_count(), 0, "取消的上传不应留下文件");
    }

    #[tokio::test]
    async fn test_rejected_name() {
        let storage = MemoryStorage::new();
        storage.reject_name("bad");
        assert!(matches!(
            storage.create_folder("bad", MEMORY_ROOT_ID).await,
            Err(RemoteError::Rejected(_))
        ));
    }
}
