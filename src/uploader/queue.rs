//! 统一上传队列
//!
//! 负责:
//! - 维护全部文件与文件夹的登记表（唯一数据源）
//! - 维护待分发列表，默认先进先出
//! - 在同一把锁内完成状态转换与文件夹汇总计数，汇总永远不会滞后
//!
//! 所有操作对不存在的 ID 静默忽略（文件可能已被并发清理）

use super::task::{FileStatus, FolderInfo, QueuedFile};
use crate::events::{EventBus, QueueEvent};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info};

/// 待上传列表排序策略
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueueOrdering {
    /// 先进先出（保持原顺序）
    #[default]
    Fifo,
    /// 随机打乱
    Random,
    /// 小文件优先
    SizeAsc,
    /// 大文件优先
    SizeDesc,
    /// 按文件名（忽略大小写）
    Alphabetical,
    /// 按源文件夹轮转，多个文件夹交替上传
    RoundRobin,
}

impl fmt::Display for QueueOrdering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueueOrdering::Fifo => "fifo",
            QueueOrdering::Random => "random",
            QueueOrdering::SizeAsc => "size_asc",
            QueueOrdering::SizeDesc => "size_desc",
            QueueOrdering::Alphabetical => "alphabetical",
            QueueOrdering::RoundRobin => "round_robin",
        };
        f.write_str(name)
    }
}

/// 队列统计快照
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QueueStatistics {
    pub total_files: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
    /// 全部文件总大小
    pub total_size: u64,
    /// 已处理字节数（完成 + 跳过，用于进度条）
    pub transferred_size: u64,
    /// 实际上传的字节数（仅完成）
    pub uploaded_size: u64,
    /// 总体进度 0-100
    pub progress_percentage: u8,
    /// 进行中文件的速度之和 (bytes/s)
    pub active_speed: f64,
}

impl QueueStatistics {
    /// 已处理的文件数（完成 + 失败 + 跳过）
    pub fn processed(&self) -> usize {
        self.completed + self.failed + self.skipped
    }
}

#[derive(Debug, Default)]
struct QueueState {
    files: HashMap<String, QueuedFile>,
    /// 文件登记顺序
    file_order: Vec<String>,
    folders: HashMap<String, FolderInfo>,
    /// 文件夹登记顺序
    folder_order: Vec<String>,
    /// 待分发列表
    pending: VecDeque<String>,
    total_size: u64,
    transferred_size: u64,
    uploaded_size: u64,
}

/// 一次登记的结果
enum Inserted {
    Rejected,
    Added { new_folder: bool },
}

impl QueueState {
    fn insert(&mut self, file: QueuedFile) -> Inserted {
        if self.files.contains_key(&file.unique_id) {
            return Inserted::Rejected;
        }

        let mut new_folder = false;
        let folder = self
            .folders
            .entry(file.source_folder.clone())
            .or_insert_with(|| {
                new_folder = true;
                FolderInfo::new(file.source_folder.clone(), file.destination_id.clone())
            });
        folder.track(&file);
        if new_folder {
            self.folder_order.push(file.source_folder.clone());
        }

        self.total_size += file.file_size;
        self.pending.push_back(file.unique_id.clone());
        self.file_order.push(file.unique_id.clone());
        self.files.insert(file.unique_id.clone(), file);
        Inserted::Added { new_folder }
    }

    /// 对文件执行状态转换并同步更新文件夹汇总与全局字节计数
    ///
    /// `apply` 返回 false 表示当前状态不允许该转换
    fn transition<F>(&mut self, id: &str, apply: F) -> Option<(FileStatus, &QueuedFile)>
    where
        F: FnOnce(&mut QueuedFile) -> bool,
    {
        let file = self.files.get_mut(id)?;
        let from = file.status;
        if !apply(file) {
            return None;
        }
        let to = file.status;

        if let Some(folder) = self.folders.get_mut(&file.source_folder) {
            folder.transition(from, to);
        }

        let size = file.file_size;
        let counts_as_transferred = |s: FileStatus| matches!(s, FileStatus::Completed | FileStatus::Skipped);
        if counts_as_transferred(from) {
            self.transferred_size = self.transferred_size.saturating_sub(size);
        }
        if counts_as_transferred(to) {
            self.transferred_size += size;
        }
        if from == FileStatus::Completed {
            self.uploaded_size = self.uploaded_size.saturating_sub(size);
        }
        if to == FileStatus::Completed {
            self.uploaded_size += size;
        }

        Some((to, &*file))
    }

    fn is_dispatchable(&self, id: &str) -> bool {
        self.files
            .get(id)
            .map_or(false, |f| f.status == FileStatus::Pending)
    }

    fn recompute_totals(&mut self) {
        self.total_size = 0;
        self.transferred_size = 0;
        self.uploaded_size = 0;
        for file in self.files.values() {
            self.total_size += file.file_size;
            match file.status {
                FileStatus::Completed => {
                    self.transferred_size += file.file_size;
                    self.uploaded_size += file.file_size;
                }
                FileStatus::Skipped => self.transferred_size += file.file_size,
                _ => {}
            }
        }
    }
}

/// 统一上传队列
#[derive(Debug)]
pub struct UploadQueue {
    state: Mutex<QueueState>,
    events: EventBus,
    /// 有新的可分发文件时唤醒等待中的工作者
    work_available: Notify,
}

impl UploadQueue {
    /// 创建使用独立事件总线的队列
    pub fn new() -> Self {
        Self::with_events(EventBus::default())
    }

    pub fn with_events(events: EventBus) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            events,
            work_available: Notify::new(),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    // =====================================================
    // 入队
    // =====================================================

    /// 加入单个文件，ID 已存在时返回 false
    pub fn add_file(&self, file: QueuedFile) -> bool {
        let file_id = file.unique_id.clone();
        let source_folder = file.source_folder.clone();

        let inserted = self.state.lock().insert(file);
        match inserted {
            Inserted::Rejected => {
                debug!("文件已在队列中，忽略: {}", file_id);
                false
            }
            Inserted::Added { new_folder } => {
                if new_folder {
                    self.events.publish(QueueEvent::FolderAdded {
                        folder_path: source_folder.clone(),
                    });
                } else {
                    self.events.publish(QueueEvent::FolderUpdated {
                        folder_path: source_folder.clone(),
                    });
                }
                self.events.publish(QueueEvent::FileAdded {
                    file_id,
                    source_folder,
                });
                self.work_available.notify_waiters();
                true
            }
        }
    }

    /// 批量加入文件（一次加锁），返回实际加入的数量
    pub fn add_files_batch(&self, files: Vec<QueuedFile>) -> usize {
        let mut added_ids = Vec::with_capacity(files.len());
        let mut new_folders = Vec::new();
        let mut touched_folders: Vec<String> = Vec::new();

        {
            let mut state = self.state.lock();
            for file in files {
                let id = file.unique_id.clone();
                let folder = file.source_folder.clone();
                if let Inserted::Added { new_folder } = state.insert(file) {
                    added_ids.push(id);
                    if new_folder {
                        new_folders.push(folder);
                    } else if !new_folders.contains(&folder) && !touched_folders.contains(&folder) {
                        touched_folders.push(folder);
                    }
                }
            }
        }

        if added_ids.is_empty() {
            return 0;
        }

        let count = added_ids.len();
        for folder_path in new_folders {
            self.events.publish(QueueEvent::FolderAdded { folder_path });
        }
        for folder_path in touched_folders {
            self.events.publish(QueueEvent::FolderUpdated { folder_path });
        }
        self.events
            .publish(QueueEvent::FilesBatchAdded { file_ids: added_ids });
        self.work_available.notify_waiters();

        debug!("批量入队 {} 个文件", count);
        count
    }

    // =====================================================
    // 文件夹登记
    // =====================================================

    /// 扫描开始前登记文件夹，使其立即可见（幂等）
    pub fn register_folder_for_scanning(&self, folder_path: &str, destination_id: &str) {
        let is_new = {
            let mut state = self.state.lock();
            let is_new = !state.folders.contains_key(folder_path);
            let folder = state
                .folders
                .entry(folder_path.to_string())
                .or_insert_with(|| FolderInfo::new(folder_path, destination_id));
            folder.destination_id = destination_id.to_string();
            folder.is_scanning = true;
            folder.scan_completed = false;
            folder.scan_error = None;
            if is_new {
                state.folder_order.push(folder_path.to_string());
            }
            is_new
        };

        let folder_path = folder_path.to_string();
        if is_new {
            self.events.publish(QueueEvent::FolderAdded { folder_path });
        } else {
            self.events.publish(QueueEvent::FolderUpdated { folder_path });
        }
    }

    /// 记录扫描为该文件夹创建的远程文件夹
    pub fn set_folder_remote_id(&self, folder_path: &str, remote_folder_id: &str) {
        self.update_folder(folder_path, |folder| {
            folder.remote_folder_id = Some(remote_folder_id.to_string());
        });
    }

    pub fn mark_folder_scan_completed(&self, folder_path: &str) {
        self.update_folder(folder_path, |folder| {
            folder.is_scanning = false;
            folder.scan_completed = true;
        });
    }

    pub fn mark_folder_scan_failed(&self, folder_path: &str, message: &str) {
        self.update_folder(folder_path, |folder| {
            folder.is_scanning = false;
            folder.scan_completed = false;
            folder.scan_error = Some(message.to_string());
        });
    }

    fn update_folder<F: FnOnce(&mut FolderInfo)>(&self, folder_path: &str, apply: F) {
        let found = match self.state.lock().folders.get_mut(folder_path) {
            Some(folder) => {
                apply(folder);
                true
            }
            None => false,
        };
        if found {
            self.events.publish(QueueEvent::FolderUpdated {
                folder_path: folder_path.to_string(),
            });
        }
    }

    // =====================================================
    // 分发与状态转换
    // =====================================================

    /// 取出下一个待上传文件
    ///
    /// 跳过已经不是 Pending 的过期条目；返回 None 仅表示当前没有可分发的文件
    pub fn get_next_pending_file(&self) -> Option<QueuedFile> {
        let mut state = self.state.lock();
        while let Some(id) = state.pending.pop_front() {
            match state.files.get(&id) {
                Some(file) if file.status == FileStatus::Pending => return Some(file.clone()),
                _ => continue,
            }
        }
        None
    }

    /// Pending -> InProgress
    pub fn start_file(&self, id: &str, worker_id: &str) -> bool {
        self.transition(id, |file| {
            if file.status != FileStatus::Pending {
                return false;
            }
            file.mark_started(worker_id);
            true
        })
    }

    /// 更新上传进度，仅对进行中的文件生效
    pub fn update_file_progress(&self, id: &str, progress: u8, bytes_transferred: u64, speed: f64) {
        let updated = {
            let mut state = self.state.lock();
            match state.files.get_mut(id) {
                Some(file) if file.status == FileStatus::InProgress => {
                    file.update_progress(progress, bytes_transferred, speed);
                    Some(file.progress)
                }
                _ => None,
            }
        };

        if let Some(progress) = updated {
            self.events.publish(QueueEvent::FileUpdated {
                file_id: id.to_string(),
                status: FileStatus::InProgress,
                progress,
            });
        }
    }

    pub fn complete_file(&self, id: &str, remote_file_id: &str) -> bool {
        self.finish(id, |file| file.mark_completed(remote_file_id))
    }

    pub fn fail_file(&self, id: &str, message: &str) -> bool {
        self.finish(id, |file| file.mark_failed(message))
    }

    pub fn skip_file(&self, id: &str, reason: &str) -> bool {
        self.finish(id, |file| file.mark_skipped(reason))
    }

    pub fn cancel_file(&self, id: &str) -> bool {
        self.finish(id, |file| file.mark_cancelled())
    }

    /// 进入终态，已在终态的文件不再变化
    fn finish<F: FnOnce(&mut QueuedFile)>(&self, id: &str, apply: F) -> bool {
        self.transition(id, |file| {
            if file.status.is_terminal() {
                return false;
            }
            apply(file);
            true
        })
    }

    fn transition<F>(&self, id: &str, apply: F) -> bool
    where
        F: FnOnce(&mut QueuedFile) -> bool,
    {
        let changed = {
            let mut state = self.state.lock();
            state
                .transition(id, apply)
                .map(|(status, file)| (status, file.progress, file.source_folder.clone()))
        };

        match changed {
            Some((status, progress, folder_path)) => {
                self.events.publish(QueueEvent::FileUpdated {
                    file_id: id.to_string(),
                    status,
                    progress,
                });
                self.events
                    .publish(QueueEvent::FolderUpdated { folder_path });
                true
            }
            None => false,
        }
    }

    // =====================================================
    // 重试
    // =====================================================

    /// 重试失败的文件，超过重试次数时返回 false
    pub fn retry_file(&self, id: &str) -> bool {
        let retried = {
            let mut state = self.state.lock();
            let ok = state
                .transition(id, |file| {
                    if !file.can_retry() {
                        return false;
                    }
                    file.reset_for_retry();
                    true
                })
                .is_some();
            if ok {
                state.pending.push_back(id.to_string());
            }
            ok
        };

        if retried {
            self.publish_requeued(std::slice::from_ref(&id.to_string()));
        }
        retried
    }

    /// 重试全部可重试的失败文件，返回重试数量
    pub fn retry_all_failed(&self) -> usize {
        let ids = self.requeue_where(|file| file.can_retry(), QueuedFile::reset_for_retry);
        if !ids.is_empty() {
            info!("重新排队 {} 个失败文件", ids.len());
        }
        ids.len()
    }

    /// 将已取消的文件放回队列，不计入重试次数
    pub fn requeue_cancelled(&self) -> usize {
        let ids = self.requeue_where(
            |file| file.status == FileStatus::Cancelled,
            QueuedFile::reset_cancelled,
        );
        if !ids.is_empty() {
            info!("恢复 {} 个已取消的文件", ids.len());
        }
        ids.len()
    }

    fn requeue_where<P, R>(&self, eligible: P, reset: R) -> Vec<String>
    where
        P: Fn(&QueuedFile) -> bool,
        R: Fn(&mut QueuedFile),
    {
        let ids = {
            let mut state = self.state.lock();
            let candidates: Vec<String> = state
                .file_order
                .iter()
                .filter(|id| state.files.get(*id).map_or(false, &eligible))
                .cloned()
                .collect();

            for id in &candidates {
                state.transition(id, |file| {
                    reset(file);
                    true
                });
                state.pending.push_back(id.clone());
            }
            candidates
        };

        self.publish_requeued(&ids);
        ids
    }

    fn publish_requeued(&self, ids: &[String]) {
        if ids.is_empty() {
            return;
        }
        for id in ids {
            self.events.publish(QueueEvent::FileUpdated {
                file_id: id.clone(),
                status: FileStatus::Pending,
                progress: 0,
            });
        }
        self.work_available.notify_waiters();
    }

    // =====================================================
    // 排序与清理
    // =====================================================

    /// 重排待上传列表，只有 Pending 的文件参与，返回参与排序的数量
    pub fn reorder_queue(&self, ordering: QueueOrdering) -> usize {
        let count = {
            let mut state = self.state.lock();

            // 去掉过期与重复条目
            let mut seen = std::collections::HashSet::new();
            let mut ids: Vec<String> = std::mem::take(&mut state.pending)
                .into_iter()
                .filter(|id| state.is_dispatchable(id) && seen.insert(id.clone()))
                .collect();

            let files = &state.files;
            match ordering {
                QueueOrdering::Fifo => {}
                QueueOrdering::Random => ids.shuffle(&mut rand::thread_rng()),
                QueueOrdering::SizeAsc => ids.sort_by_key(|id| files[id].file_size),
                QueueOrdering::SizeDesc => {
                    ids.sort_by_key(|id| std::cmp::Reverse(files[id].file_size))
                }
                QueueOrdering::Alphabetical => {
                    ids.sort_by_cached_key(|id| files[id].file_name.to_lowercase())
                }
                QueueOrdering::RoundRobin => ids = round_robin(ids, files),
            }

            let count = ids.len();
            state.pending = ids.into();
            count
        };

        debug!("待上传列表已重排: 策略={}, 数量={}", ordering, count);
        self.events
            .publish(QueueEvent::Reordered { ordering, count });
        self.work_available.notify_waiters();
        count
    }

    /// 移除所有终态文件，返回移除数量
    pub fn clear_completed(&self) -> usize {
        let removed = {
            let mut state = self.state.lock();
            let removed: Vec<String> = state
                .file_order
                .iter()
                .filter(|id| state.files.get(*id).map_or(false, |f| f.status.is_terminal()))
                .cloned()
                .collect();
            if removed.is_empty() {
                return 0;
            }

            for id in &removed {
                state.files.remove(id);
            }
            let QueueState {
                files,
                file_order,
                folders,
                pending,
                ..
            } = &mut *state;
            file_order.retain(|id| files.contains_key(id));
            pending.retain(|id| files.contains_key(id));

            for folder in folders.values_mut() {
                let path = folder.folder_path.clone();
                folder.recompute(files.values().filter(|f| f.source_folder == path));
            }
            state.recompute_totals();
            removed
        };

        info!("已清理 {} 个已结束的文件", removed.len());
        for file_id in &removed {
            self.events.publish(QueueEvent::FileRemoved {
                file_id: file_id.clone(),
            });
        }
        let folder_paths = self.state.lock().folder_order.clone();
        for folder_path in folder_paths {
            self.events.publish(QueueEvent::FolderUpdated { folder_path });
        }
        removed.len()
    }

    // =====================================================
    // 查询
    // =====================================================

    pub fn get_file(&self, id: &str) -> Option<QueuedFile> {
        self.state.lock().files.get(id).cloned()
    }

    /// 按登记顺序返回全部文件
    pub fn get_all_files(&self) -> Vec<QueuedFile> {
        let state = self.state.lock();
        state
            .file_order
            .iter()
            .filter_map(|id| state.files.get(id).cloned())
            .collect()
    }

    pub fn get_files_by_status(&self, status: FileStatus) -> Vec<QueuedFile> {
        let state = self.state.lock();
        state
            .file_order
            .iter()
            .filter_map(|id| state.files.get(id))
            .filter(|f| f.status == status)
            .cloned()
            .collect()
    }

    /// 某个源文件夹下的文件，按登记顺序
    pub fn get_files_by_folder(&self, folder_path: &str) -> Vec<QueuedFile> {
        let state = self.state.lock();
        state
            .file_order
            .iter()
            .filter_map(|id| state.files.get(id))
            .filter(|f| f.source_folder == folder_path)
            .cloned()
            .collect()
    }

    pub fn get_folder(&self, folder_path: &str) -> Option<FolderInfo> {
        self.state.lock().folders.get(folder_path).cloned()
    }

    /// 按登记顺序返回全部文件夹
    pub fn get_all_folders(&self) -> Vec<FolderInfo> {
        let state = self.state.lock();
        state
            .folder_order
            .iter()
            .filter_map(|path| state.folders.get(path).cloned())
            .collect()
    }

    /// 状态为 Pending 的文件数（包括已取出但尚未开始的）
    pub fn get_pending_count(&self) -> usize {
        self.state
            .lock()
            .files
            .values()
            .filter(|f| f.status == FileStatus::Pending)
            .count()
    }

    /// 待分发列表中是否还有可分发的文件
    pub fn has_pending_files(&self) -> bool {
        let state = self.state.lock();
        state.pending.iter().any(|id| state.is_dispatchable(id))
    }

    pub fn len(&self) -> usize {
        self.state.lock().files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get_queue_statistics(&self) -> QueueStatistics {
        let state = self.state.lock();
        let mut stats = QueueStatistics {
            total_files: state.files.len(),
            total_size: state.total_size,
            transferred_size: state.transferred_size,
            uploaded_size: state.uploaded_size,
            ..Default::default()
        };

        for file in state.files.values() {
            match file.status {
                FileStatus::Pending => stats.pending += 1,
                FileStatus::InProgress => {
                    stats.in_progress += 1;
                    stats.active_speed += file.speed;
                }
                FileStatus::Completed => stats.completed += 1,
                FileStatus::Error => stats.failed += 1,
                FileStatus::Cancelled => stats.cancelled += 1,
                FileStatus::Skipped => stats.skipped += 1,
            }
        }

        if stats.total_size > 0 {
            stats.progress_percentage =
                ((stats.transferred_size as f64 / stats.total_size as f64) * 100.0).min(100.0) as u8;
        } else if stats.total_files > 0 {
            stats.progress_percentage = ((stats.processed() * 100) / stats.total_files) as u8;
        }
        stats
    }

    /// 等待新的可分发文件，最长等待 `timeout`
    pub async fn wait_for_work(&self, timeout: Duration) {
        let notified = self.work_available.notified();
        if self.has_pending_files() {
            return;
        }
        let _ = tokio::time::timeout(timeout, notified).await;
    }

    /// 唤醒所有等待中的工作者
    pub fn notify_work_available(&self) {
        self.work_available.notify_waiters();
    }
}

impl Default for UploadQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// 按源文件夹首次出现的顺序分组，每轮从每组各取一个
fn round_robin(ids: Vec<String>, files: &HashMap<String, QueuedFile>) -> Vec<String> {
    let mut group_index: HashMap<&str, usize> = HashMap::new();
    let mut groups: Vec<VecDeque<String>> = Vec::new();

    for id in ids {
        let folder = files[&id].source_folder.as_str();
        let index = *group_index.entry(folder).or_insert_with(|| {
            groups.push(VecDeque::new());
            groups.len() - 1
        });
        groups[index].push_back(id);
    }

    let total = groups.iter().map(VecDeque::len).sum();
    let mut ordered = Vec::with_capacity(total);
    while ordered.len() < total {
        for group in groups.iter_mut() {
            if let Some(id) = group.pop_front() {
                ordered.push(id);
            }
        }
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::path::PathBuf;

    fn file(folder: &str, name: &str, size: u64) -> QueuedFile {
        QueuedFile::new(
            PathBuf::from(format!("{}/{}", folder, name)),
            name,
            size,
            folder,
            "",
            "dest",
        )
    }

    fn drain_names(queue: &UploadQueue) -> Vec<String> {
        std::iter::from_fn(|| queue.get_next_pending_file())
            .map(|f| f.file_name)
            .collect()
    }

    #[test]
    fn test_duplicate_rejected() {
        let queue = UploadQueue::new();
        assert!(queue.add_file(file("/a", "x.txt", 1)));
        assert!(!queue.add_file(file("/a", "x.txt", 99)), "重复文件应被拒绝");
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get_queue_statistics().total_size, 1);

        let added = queue.add_files_batch(vec![file("/a", "x.txt", 1), file("/a", "y.txt", 1)]);
        assert_eq!(added, 1);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_fifo_default() {
        let queue = UploadQueue::new();
        for name in ["f1", "f2", "f3"] {
            queue.add_file(file("/a", name, 1));
        }
        assert_eq!(drain_names(&queue), vec!["f1", "f2", "f3"]);
        assert!(queue.get_next_pending_file().is_none());
    }

    #[test]
    fn test_round_robin_interleaves_folders() {
        let queue = UploadQueue::new();
        queue.add_files_batch(vec![file("/A", "a1", 1), file("/A", "a2", 1), file("/A", "a3", 1)]);
        queue.add_files_batch(vec![file("/B", "b1", 1), file("/B", "b2", 1)]);

        assert_eq!(queue.reorder_queue(QueueOrdering::RoundRobin), 5);
        assert_eq!(drain_names(&queue), vec!["a1", "b1", "a2", "b2", "a3"]);
    }

    #[test]
    fn test_files_by_folder_keeps_insertion_order() {
        let queue = UploadQueue::new();
        queue.add_file(file("/A", "a2", 1));
        queue.add_file(file("/B", "b1", 1));
        queue.add_file(file("/A", "a1", 1));

        let a1 = queue.get_all_files()[2].unique_id.clone();
        queue.start_file(&a1, "worker_1");
        queue.complete_file(&a1, "remote-a1");

        let names: Vec<String> = queue
            .get_files_by_folder("/A")
            .into_iter()
            .map(|f| f.file_name)
            .collect();
        assert_eq!(names, vec!["a2", "a1"]);
        assert_eq!(queue.get_files_by_folder("/A")[1].status, FileStatus::Completed);
        assert_eq!(queue.get_files_by_folder("/B").len(), 1);
        assert!(queue.get_files_by_folder("/missing").is_empty());
    }

    #[test]
    fn test_size_orderings() {
        let queue = UploadQueue::new();
        queue.add_file(file("/a", "thirty", 30));
        queue.add_file(file("/a", "ten", 10));
        queue.add_file(file("/a", "twenty", 20));

        queue.reorder_queue(QueueOrdering::SizeAsc);
        let sizes: Vec<u64> = std::iter::from_fn(|| queue.get_next_pending_file())
            .map(|f| f.file_size)
            .collect();
        assert_eq!(sizes, vec![10, 20, 30]);
    }

    #[test]
    fn test_size_desc_and_alphabetical() {
        let queue = UploadQueue::new();
        queue.add_file(file("/a", "beta", 1));
        queue.add_file(file("/a", "Alpha", 3));
        queue.add_file(file("/a", "gamma", 2));

        queue.reorder_queue(QueueOrdering::SizeDesc);
        assert_eq!(
            queue.get_next_pending_file().map(|f| f.file_name),
            Some("Alpha".to_string())
        );

        queue.reorder_queue(QueueOrdering::Alphabetical);
        assert_eq!(drain_names(&queue), vec!["beta", "gamma"]);
    }

    #[test]
    fn test_random_keeps_same_set() {
        let queue = UploadQueue::new();
        for i in 0..20 {
            queue.add_file(file("/a", &format!("f{:02}", i), 1));
        }
        assert_eq!(queue.reorder_queue(QueueOrdering::Random), 20);
        let mut names = drain_names(&queue);
        names.sort();
        let expected: Vec<String> = (0..20).map(|i| format!("f{:02}", i)).collect();
        assert_eq!(names, expected);
    }

    #[test]
    fn test_reorder_ignores_in_flight_files() {
        let queue = UploadQueue::new();
        queue.add_file(file("/a", "one", 5));
        queue.add_file(file("/a", "two", 1));
        let taken = queue.get_next_pending_file().unwrap();
        queue.start_file(&taken.unique_id, "worker_1");

        assert_eq!(queue.reorder_queue(QueueOrdering::SizeAsc), 1);
        assert_eq!(drain_names(&queue), vec!["two"]);
        assert_eq!(
            queue.get_file(&taken.unique_id).unwrap().status,
            FileStatus::InProgress
        );
    }

    #[test]
    fn test_next_skips_stale_entries() {
        let queue = UploadQueue::new();
        let a = file("/a", "a", 1);
        let b = file("/a", "b", 1);
        let a_id = a.unique_id.clone();
        queue.add_file(a);
        queue.add_file(b);

        // 尚在列表中的文件被取消
        queue.cancel_file(&a_id);
        assert_eq!(drain_names(&queue), vec!["b"]);
    }

    #[test]
    fn test_retry_bound() {
        let queue = UploadQueue::new();
        let f = file("/a", "flaky", 10).with_max_retries(3);
        let id = f.unique_id.clone();
        queue.add_file(f);

        for attempt in 1..=3 {
            let next = queue.get_next_pending_file().unwrap();
            queue.start_file(&next.unique_id, "worker_1");
            queue.fail_file(&id, "boom");
            assert!(queue.retry_file(&id), "第 {} 次重试应该成功", attempt);
        }

        let next = queue.get_next_pending_file().unwrap();
        queue.start_file(&next.unique_id, "worker_1");
        queue.fail_file(&id, "boom");

        let stuck = queue.get_file(&id).unwrap();
        assert_eq!(stuck.retry_count, 3);
        assert!(!stuck.can_retry());
        assert!(!queue.retry_file(&id), "超过重试次数后不能再重试");
        assert_eq!(queue.retry_all_failed(), 0);
    }

    #[test]
    fn test_retry_requires_error_status() {
        let queue = UploadQueue::new();
        let f = file("/a", "ok", 1);
        let id = f.unique_id.clone();
        queue.add_file(f);
        assert!(!queue.retry_file(&id));
        assert!(!queue.retry_file("missing"));
    }

    #[test]
    fn test_missing_ids_are_noops() {
        let queue = UploadQueue::new();
        queue.update_file_progress("ghost", 50, 5, 1.0);
        assert!(!queue.complete_file("ghost", "r"));
        assert!(!queue.fail_file("ghost", "e"));
        assert!(!queue.skip_file("ghost", "s"));
        assert!(!queue.start_file("ghost", "w"));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_terminal_state_is_final() {
        let queue = UploadQueue::new();
        let f = file("/a", "x", 8);
        let id = f.unique_id.clone();
        queue.add_file(f);
        queue.start_file(&id, "w");
        queue.cancel_file(&id);

        assert!(!queue.complete_file(&id, "late"), "取消后不能再完成");
        queue.update_file_progress(&id, 90, 7, 1.0);
        let stats = queue.get_queue_statistics();
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.transferred_size, 0);
    }

    #[test]
    fn test_folder_rollup_follows_mutations() {
        let queue = UploadQueue::new();
        queue.register_folder_for_scanning("/photos", "dest");
        let folder = queue.get_folder("/photos").unwrap();
        assert!(folder.is_scanning);
        assert_eq!(folder.total_files, 0);

        let a = file("/photos", "a", 10);
        let b = file("/photos", "b", 20);
        let (a_id, b_id) = (a.unique_id.clone(), b.unique_id.clone());
        queue.add_files_batch(vec![a, b]);

        queue.start_file(&a_id, "w");
        assert_eq!(queue.get_folder("/photos").unwrap().in_progress_files, 1);
        queue.complete_file(&a_id, "r1");
        queue.start_file(&b_id, "w");
        queue.skip_file(&b_id, "File already exists");
        queue.mark_folder_scan_completed("/photos");

        let folder = queue.get_folder("/photos").unwrap();
        assert_eq!(folder.completed_files, 1);
        assert_eq!(folder.skipped_files, 1);
        assert_eq!(folder.in_progress_files, 0);
        assert!(folder.is_completed());
        assert!(!folder.is_scanning);

        let stats = queue.get_queue_statistics();
        assert_eq!(stats.transferred_size, 30, "跳过的文件计入已处理字节");
        assert_eq!(stats.uploaded_size, 10, "实际上传字节不含跳过的文件");
        assert_eq!(stats.progress_percentage, 100);
    }

    #[test]
    fn test_clear_completed() {
        let queue = UploadQueue::new();
        let files: Vec<QueuedFile> = (0..4).map(|i| file("/a", &format!("f{}", i), 10)).collect();
        let ids: Vec<String> = files.iter().map(|f| f.unique_id.clone()).collect();
        queue.add_files_batch(files);

        queue.start_file(&ids[0], "w");
        queue.complete_file(&ids[0], "r");
        queue.start_file(&ids[1], "w");
        queue.fail_file(&ids[1], "err");
        queue.start_file(&ids[2], "w");

        assert_eq!(queue.clear_completed(), 2);
        let stats = queue.get_queue_statistics();
        assert_eq!(stats.total_files, 2);
        assert_eq!(stats.total_size, 20);
        assert_eq!(stats.transferred_size, 0);
        assert_eq!(stats.in_progress, 1);
        assert_eq!(stats.pending, 1);

        let folder = queue.get_folder("/a").unwrap();
        assert_eq!(folder.total_files, 2);
        assert_eq!(folder.completed_files, 0);
        assert_eq!(folder.failed_files, 0);
    }

    #[test]
    fn test_requeue_cancelled_keeps_retry_budget() {
        let queue = UploadQueue::new();
        let f = file("/a", "x", 1);
        let id = f.unique_id.clone();
        queue.add_file(f);
        let next = queue.get_next_pending_file().unwrap();
        queue.start_file(&next.unique_id, "w");
        queue.cancel_file(&id);

        assert_eq!(queue.requeue_cancelled(), 1);
        let requeued = queue.get_file(&id).unwrap();
        assert_eq!(requeued.status, FileStatus::Pending);
        assert_eq!(requeued.retry_count, 0);
        assert!(queue.has_pending_files());
    }

    #[test]
    fn test_events_published() {
        let queue = UploadQueue::new();
        let mut rx = queue.events().subscribe();
        queue.add_files_batch(vec![file("/a", "x", 1), file("/a", "y", 1)]);

        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(event.event_type_name());
        }
        assert_eq!(names, vec!["folder_added", "files_batch_added"]);
    }

    #[tokio::test]
    async fn test_wait_for_work_wakes_on_add() {
        let queue = std::sync::Arc::new(UploadQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move {
                let started = std::time::Instant::now();
                queue.wait_for_work(Duration::from_secs(10)).await;
                started.elapsed()
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.add_file(file("/a", "x", 1));
        let waited = waiter.await.unwrap();
        assert!(waited < Duration::from_secs(5), "入队后应立即唤醒");
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add(u8, u8),
        Next,
        Start(u8),
        Complete(u8),
        Fail(u8),
        Skip(u8),
        Cancel(u8),
        Retry(u8),
        Reorder(u8),
        Clear,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..3, 0u8..6).prop_map(|(f, n)| Op::Add(f, n)),
            Just(Op::Next),
            (0u8..18).prop_map(Op::Start),
            (0u8..18).prop_map(Op::Complete),
            (0u8..18).prop_map(Op::Fail),
            (0u8..18).prop_map(Op::Skip),
            (0u8..18).prop_map(Op::Cancel),
            (0u8..18).prop_map(Op::Retry),
            (0u8..6).prop_map(Op::Reorder),
            Just(Op::Clear),
        ]
    }

    fn id_of(n: u8) -> String {
        let folder = format!("/f{}", n / 6);
        QueuedFile::make_unique_id(&folder, "", &format!("n{}", n % 6))
    }

    proptest! {
        #[test]
        fn prop_counts_are_conserved(ops in proptest::collection::vec(op_strategy(), 1..80)) {
            let queue = UploadQueue::new();
            let mut added = 0usize;
            let mut removed = 0usize;

            for op in ops {
                match op {
                    Op::Add(f, n) => {
                        if queue.add_file(file(&format!("/f{}", f), &format!("n{}", n), n as u64 + 1)) {
                            added += 1;
                        }
                    }
                    Op::Next => { queue.get_next_pending_file(); }
                    Op::Start(n) => { queue.start_file(&id_of(n), "w"); }
                    Op::Complete(n) => { queue.complete_file(&id_of(n), "r"); }
                    Op::Fail(n) => { queue.fail_file(&id_of(n), "e"); }
                    Op::Skip(n) => { queue.skip_file(&id_of(n), "s"); }
                    Op::Cancel(n) => { queue.cancel_file(&id_of(n)); }
                    Op::Retry(n) => { queue.retry_file(&id_of(n)); }
                    Op::Reorder(k) => {
                        let ordering = [
                            QueueOrdering::Fifo,
                            QueueOrdering::Random,
                            QueueOrdering::SizeAsc,
                            QueueOrdering::SizeDesc,
                            QueueOrdering::Alphabetical,
                            QueueOrdering::RoundRobin,
                        ][k as usize];
                        queue.reorder_queue(ordering);
                    }
                    Op::Clear => { removed += queue.clear_completed(); }
                }

                let stats = queue.get_queue_statistics();
                prop_assert_eq!(
                    stats.pending + stats.in_progress + stats.completed
                        + stats.failed + stats.skipped + stats.cancelled,
                    added - removed
                );
                prop_assert_eq!(stats.total_files, added - removed);

                // 增量维护的汇总必须与完整重算一致
                let state = queue.state.lock();
                for folder in state.folders.values() {
                    let mut expected = folder.clone();
                    let path = folder.folder_path.clone();
                    expected.recompute(state.files.values().filter(|f| f.source_folder == path));
                    prop_assert_eq!(folder.total_files, expected.total_files);
                    prop_assert_eq!(folder.completed_files, expected.completed_files);
                    prop_assert_eq!(folder.failed_files, expected.failed_files);
                    prop_assert_eq!(folder.skipped_files, expected.skipped_files);
                    prop_assert_eq!(folder.in_progress_files, expected.in_progress_files);
                    prop_assert_eq!(folder.cancelled_files, expected.cancelled_files);
                }
            }
        }
    }
}
