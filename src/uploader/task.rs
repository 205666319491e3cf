// 上传队列数据模型
//
// QueuedFile: 单个文件的身份与传输状态
// FolderInfo: 按源文件夹汇总的统计（由队列在同一把锁内同步维护）

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// 默认最大重试次数
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// 文件状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    /// 等待上传
    Pending,
    /// 上传中
    InProgress,
    /// 已完成
    Completed,
    /// 失败
    Error,
    /// 已取消
    Cancelled,
    /// 远程已存在同名文件，跳过
    Skipped,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Pending => "pending",
            FileStatus::InProgress => "in_progress",
            FileStatus::Completed => "completed",
            FileStatus::Error => "error",
            FileStatus::Cancelled => "cancelled",
            FileStatus::Skipped => "skipped",
        }
    }

    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FileStatus::Completed | FileStatus::Error | FileStatus::Cancelled | FileStatus::Skipped
        )
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 当前 Unix 毫秒时间戳
fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// 队列中的一个文件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedFile {
    /// 队列主键，由 (source_folder, relative_path, file_name) 组成
    pub unique_id: String,
    /// 本地文件绝对路径
    pub file_path: PathBuf,
    /// 文件名
    pub file_name: String,
    /// 文件大小（字节）
    pub file_size: u64,
    /// 所属源文件夹（扫描根目录，或单文件所在目录）
    pub source_folder: String,
    /// 相对源文件夹的目录，使用 '/' 分隔，根目录为空串
    pub relative_path: String,
    /// 远程目标文件夹标识符
    pub destination_id: String,

    pub status: FileStatus,
    /// 进度 0-100
    pub progress: u8,
    /// 速度 (bytes/s)
    pub speed: f64,
    /// 已传输字节数
    pub bytes_transferred: u64,

    /// 入队时间 (Unix 毫秒时间戳)
    pub queued_at: i64,
    /// 开始时间 (Unix 毫秒时间戳)
    pub started_at: Option<i64>,
    /// 结束时间 (Unix 毫秒时间戳)
    pub completed_at: Option<i64>,

    /// 错误信息（跳过时为原因）
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,

    /// 上传成功后的远程文件标识符
    pub remote_file_id: Option<String>,
    /// 当前负责该文件的工作者
    pub worker_id: Option<String>,
}

impl QueuedFile {
    pub fn new(
        file_path: PathBuf,
        file_name: impl Into<String>,
        file_size: u64,
        source_folder: impl Into<String>,
        relative_path: impl Into<String>,
        destination_id: impl Into<String>,
    ) -> Self {
        let file_name = file_name.into();
        let source_folder = source_folder.into();
        let relative_path = relative_path.into();
        let unique_id = Self::make_unique_id(&source_folder, &relative_path, &file_name);

        Self {
            unique_id,
            file_path,
            file_name,
            file_size,
            source_folder,
            relative_path,
            destination_id: destination_id.into(),
            status: FileStatus::Pending,
            progress: 0,
            speed: 0.0,
            bytes_transferred: 0,
            queued_at: now_millis(),
            started_at: None,
            completed_at: None,
            error_message: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            remote_file_id: None,
            worker_id: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// 生成队列主键
    pub fn make_unique_id(source_folder: &str, relative_path: &str, file_name: &str) -> String {
        format!("{}::{}::{}", source_folder, relative_path, file_name)
    }

    pub fn is_active(&self) -> bool {
        self.status == FileStatus::InProgress
    }

    /// 成功结束（完成或跳过）
    pub fn is_completed(&self) -> bool {
        matches!(self.status, FileStatus::Completed | FileStatus::Skipped)
    }

    pub fn can_retry(&self) -> bool {
        self.status == FileStatus::Error && self.retry_count < self.max_retries
    }

    /// 已用时间，未开始时为 None
    pub fn elapsed(&self) -> Option<Duration> {
        let start = self.started_at?;
        let end = self.completed_at.unwrap_or_else(now_millis);
        Some(Duration::from_millis(end.saturating_sub(start).max(0) as u64))
    }

    /// 按当前速度估算的剩余时间
    pub fn eta(&self) -> Option<Duration> {
        if !self.is_active() || self.speed <= 0.0 {
            return None;
        }
        let remaining = self.file_size.saturating_sub(self.bytes_transferred) as f64;
        Some(Duration::from_secs_f64(remaining / self.speed))
    }

    // ---- 状态转换，仅由 UploadQueue 在持锁时调用 ----

    pub(crate) fn mark_started(&mut self, worker_id: &str) {
        self.status = FileStatus::InProgress;
        self.worker_id = Some(worker_id.to_string());
        self.started_at = Some(now_millis());
    }

    pub(crate) fn update_progress(&mut self, progress: u8, bytes_transferred: u64, speed: f64) {
        self.progress = progress.min(100);
        self.bytes_transferred = bytes_transferred.min(self.file_size);
        self.speed = if speed.is_finite() { speed.max(0.0) } else { 0.0 };
    }

    pub(crate) fn mark_completed(&mut self, remote_file_id: &str) {
        self.status = FileStatus::Completed;
        self.progress = 100;
        self.bytes_transferred = self.file_size;
        self.speed = 0.0;
        self.completed_at = Some(now_millis());
        self.remote_file_id = Some(remote_file_id.to_string());
    }

    pub(crate) fn mark_failed(&mut self, message: &str) {
        self.status = FileStatus::Error;
        self.speed = 0.0;
        self.completed_at = Some(now_millis());
        self.error_message = Some(message.to_string());
    }

    pub(crate) fn mark_skipped(&mut self, reason: &str) {
        self.status = FileStatus::Skipped;
        self.progress = 100;
        self.speed = 0.0;
        self.completed_at = Some(now_millis());
        self.error_message = Some(reason.to_string());
    }

    pub(crate) fn mark_cancelled(&mut self) {
        self.status = FileStatus::Cancelled;
        self.speed = 0.0;
        self.completed_at = Some(now_millis());
    }

    /// 回到等待状态，清空本次传输的痕迹（保留上次错误信息）
    fn reset_transfer(&mut self) {
        self.status = FileStatus::Pending;
        self.progress = 0;
        self.speed = 0.0;
        self.bytes_transferred = 0;
        self.started_at = None;
        self.completed_at = None;
        self.worker_id = None;
    }

    pub(crate) fn reset_for_retry(&mut self) {
        self.reset_transfer();
        self.retry_count += 1;
    }

    pub(crate) fn reset_cancelled(&mut self) {
        self.reset_transfer();
        self.error_message = None;
    }
}

/// 源文件夹汇总信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderInfo {
    /// 本地文件夹路径（与 QueuedFile::source_folder 对应）
    pub folder_path: String,
    /// 显示名称
    pub folder_name: String,
    /// 远程目标文件夹标识符
    pub destination_id: String,
    /// 扫描时创建的远程文件夹标识符
    pub remote_folder_id: Option<String>,

    pub is_scanning: bool,
    pub scan_completed: bool,
    pub scan_error: Option<String>,

    pub total_files: usize,
    pub completed_files: usize,
    pub failed_files: usize,
    pub skipped_files: usize,
    pub in_progress_files: usize,
    pub cancelled_files: usize,
    pub total_size: u64,
}

impl FolderInfo {
    pub fn new(folder_path: impl Into<String>, destination_id: impl Into<String>) -> Self {
        let folder_path = folder_path.into();
        let folder_name = std::path::Path::new(&folder_path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| folder_path.clone());

        Self {
            folder_path,
            folder_name,
            destination_id: destination_id.into(),
            remote_folder_id: None,
            is_scanning: false,
            scan_completed: false,
            scan_error: None,
            total_files: 0,
            completed_files: 0,
            failed_files: 0,
            skipped_files: 0,
            in_progress_files: 0,
            cancelled_files: 0,
            total_size: 0,
        }
    }

    /// 已处理的文件数（完成 + 失败 + 跳过）
    pub fn processed_files(&self) -> usize {
        self.completed_files + self.failed_files + self.skipped_files
    }

    pub fn pending_files(&self) -> usize {
        self.total_files
            .saturating_sub(self.processed_files() + self.in_progress_files + self.cancelled_files)
    }

    pub fn progress_percentage(&self) -> u8 {
        if self.total_files == 0 {
            return 0;
        }
        ((self.processed_files() * 100) / self.total_files).min(100) as u8
    }

    pub fn is_completed(&self) -> bool {
        if self.total_files == 0 {
            return self.scan_completed;
        }
        self.processed_files() >= self.total_files
    }

    pub fn has_errors(&self) -> bool {
        self.failed_files > 0
    }

    /// 供展示层使用的状态描述
    pub fn status_text(&self) -> String {
        if let Some(error) = &self.scan_error {
            return format!("扫描失败: {}", error);
        }
        if self.is_scanning {
            return format!("扫描中... 已发现 {} 个文件", self.total_files);
        }
        if self.is_completed() {
            if self.has_errors() {
                return format!("已完成，{} 个文件失败", self.failed_files);
            }
            return format!("已完成 ({} 个文件)", self.total_files);
        }
        if self.in_progress_files > 0 {
            return format!(
                "上传中 {}/{} ({} 个进行中)",
                self.processed_files(),
                self.total_files,
                self.in_progress_files
            );
        }
        format!("等待中 {}/{}", self.processed_files(), self.total_files)
    }

    // ---- 汇总计数维护 ----

    fn counter_mut(&mut self, status: FileStatus) -> Option<&mut usize> {
        match status {
            FileStatus::Pending => None,
            FileStatus::InProgress => Some(&mut self.in_progress_files),
            FileStatus::Completed => Some(&mut self.completed_files),
            FileStatus::Error => Some(&mut self.failed_files),
            FileStatus::Cancelled => Some(&mut self.cancelled_files),
            FileStatus::Skipped => Some(&mut self.skipped_files),
        }
    }

    pub(crate) fn track(&mut self, file: &QueuedFile) {
        self.total_files += 1;
        self.total_size += file.file_size;
        if let Some(counter) = self.counter_mut(file.status) {
            *counter += 1;
        }
    }

    pub(crate) fn transition(&mut self, from: FileStatus, to: FileStatus) {
        if from == to {
            return;
        }
        if let Some(counter) = self.counter_mut(from) {
            *counter = counter.saturating_sub(1);
        }
        if let Some(counter) = self.counter_mut(to) {
            *counter += 1;
        }
    }

    /// 根据成员文件完整重算汇总计数
    pub(crate) fn recompute<'a>(&mut self, members: impl Iterator<Item = &'a QueuedFile>) {
        self.total_files = 0;
        self.total_size = 0;
        self.completed_files = 0;
        self.failed_files = 0;
        self.skipped_files = 0;
        self.in_progress_files = 0;
        self.cancelled_files = 0;
        for file in members {
            self.track(file);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(name: &str, size: u64) -> QueuedFile {
        QueuedFile::new(
            PathBuf::from(format!("/data/photos/{}", name)),
            name,
            size,
            "/data/photos",
            "",
            "remote-root",
        )
    }

    #[test]
    fn test_unique_id_format() {
        let file = QueuedFile::new(
            PathBuf::from("/data/photos/2023/a.jpg"),
            "a.jpg",
            10,
            "/data/photos",
            "2023",
            "dest",
        );
        assert_eq!(file.unique_id, "/data/photos::2023::a.jpg");
    }

    #[test]
    fn test_progress_is_clamped() {
        let mut file = sample("a.bin", 100);
        file.mark_started("worker_1");
        file.update_progress(150, 500, f64::NAN);
        assert_eq!(file.progress, 100);
        assert_eq!(file.bytes_transferred, 100, "已传输字节不能超过文件大小");
        assert_eq!(file.speed, 0.0);
    }

    #[test]
    fn test_complete_and_skip() {
        let mut file = sample("a.bin", 42);
        file.mark_started("worker_1");
        file.mark_completed("remote-1");
        assert!(file.is_completed());
        assert_eq!(file.bytes_transferred, 42);
        assert_eq!(file.remote_file_id.as_deref(), Some("remote-1"));

        let mut other = sample("b.bin", 7);
        other.mark_started("worker_1");
        other.mark_skipped("File already exists");
        assert!(other.is_completed());
        assert_eq!(other.progress, 100);
        assert_eq!(other.error_message.as_deref(), Some("File already exists"));
    }

    #[test]
    fn test_retry_resets_but_keeps_error() {
        let mut file = sample("a.bin", 10);
        file.mark_started("worker_2");
        file.update_progress(50, 5, 1.0);
        file.mark_failed("timeout");
        assert!(file.can_retry());

        file.reset_for_retry();
        assert_eq!(file.status, FileStatus::Pending);
        assert_eq!(file.retry_count, 1);
        assert_eq!(file.bytes_transferred, 0);
        assert!(file.worker_id.is_none());
        assert_eq!(file.error_message.as_deref(), Some("timeout"));
    }

    #[test]
    fn test_eta_requires_speed() {
        let mut file = sample("a.bin", 1000);
        assert!(file.eta().is_none());
        file.mark_started("w");
        file.update_progress(50, 500, 100.0);
        assert_eq!(file.eta(), Some(Duration::from_secs(5)));
        assert!(file.elapsed().is_some());
    }

    #[test]
    fn test_folder_rollup() {
        let mut folder = FolderInfo::new("/data/photos", "dest");
        assert_eq!(folder.folder_name, "photos");

        let a = sample("a", 1);
        let b = sample("b", 1);
        folder.track(&a);
        folder.track(&b);
        assert_eq!(folder.pending_files(), 2);

        folder.transition(FileStatus::Pending, FileStatus::InProgress);
        folder.transition(FileStatus::InProgress, FileStatus::Completed);
        folder.transition(FileStatus::Pending, FileStatus::InProgress);
        folder.transition(FileStatus::InProgress, FileStatus::Error);

        assert_eq!(folder.progress_percentage(), 100);
        assert!(folder.is_completed());
        assert!(folder.has_errors());
        assert_eq!(folder.in_progress_files, 0);
    }

    #[test]
    fn test_empty_folder_completion() {
        let mut folder = FolderInfo::new("/empty", "dest");
        folder.is_scanning = true;
        assert!(!folder.is_completed());
        assert!(folder.status_text().starts_with("扫描中"));

        folder.is_scanning = false;
        folder.scan_completed = true;
        assert!(folder.is_completed());
        assert_eq!(folder.progress_percentage(), 0);
    }
}
