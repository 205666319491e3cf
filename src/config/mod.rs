// 配置管理模块

use crate::uploader::ScanOptions;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

/// 工作者数量范围
pub const MIN_NUM_WORKERS: usize = 1;
pub const MAX_NUM_WORKERS: usize = 10;
/// 每个工作者并发文件数范围
pub const MIN_FILES_PER_WORKER: usize = 1;
pub const MAX_FILES_PER_WORKER: usize = 20;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 远程存储配置
    #[serde(default)]
    pub remote: RemoteConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    false
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 远程存储配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// 作为远程端的本地目录，未设置时使用内存存储
    #[serde(default)]
    pub mirror_root: Option<PathBuf>,
    /// 默认上传目标文件夹
    #[serde(default)]
    pub root_folder_id: Option<String>,
}

/// 上传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 工作者数量（1-10）
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    /// 每个工作者同时上传的文件数（1-20）
    #[serde(default = "default_files_per_worker")]
    pub files_per_worker: usize,
    /// 最大重试次数
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 远程已有同名文件夹时直接复用
    #[serde(default = "default_true")]
    pub reuse_existing_folders: bool,
    /// 上传文件夹时是否跳过隐藏文件（以.开头的文件/文件夹）
    #[serde(default)]
    pub skip_hidden_files: bool,
    /// 扫描时跟随符号链接
    #[serde(default)]
    pub follow_symlinks: bool,
    /// 超过此大小的文件不入队
    #[serde(default)]
    pub max_file_size: Option<u64>,
    /// 单个文件夹最多入队的文件数
    #[serde(default)]
    pub max_files: Option<usize>,
    /// 每批入队的文件数
    #[serde(default = "default_scan_batch_size")]
    pub scan_batch_size: usize,
    /// 全部处理完后自动结束会话
    #[serde(default = "default_true")]
    pub auto_stop_when_idle: bool,
    /// 进度更新间隔（毫秒）
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    /// 统计事件间隔（毫秒）
    #[serde(default = "default_stats_interval_ms")]
    pub stats_interval_ms: u64,
    /// 空闲检测间隔（毫秒）
    #[serde(default = "default_idle_check_interval_ms")]
    pub idle_check_interval_ms: u64,
    /// 工作者无任务时的等待上限（毫秒）
    #[serde(default = "default_worker_poll_interval_ms")]
    pub worker_poll_interval_ms: u64,
    /// 停止工作者时的等待上限（毫秒）
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
}

fn default_num_workers() -> usize {
    2
}

fn default_files_per_worker() -> usize {
    5
}

fn default_max_retries() -> u32 {
    crate::uploader::DEFAULT_MAX_RETRIES
}

fn default_true() -> bool {
    true
}

fn default_scan_batch_size() -> usize {
    crate::uploader::DEFAULT_SCAN_BATCH_SIZE
}

fn default_progress_interval_ms() -> u64 {
    500
}

fn default_stats_interval_ms() -> u64 {
    1000
}

fn default_idle_check_interval_ms() -> u64 {
    2000
}

fn default_worker_poll_interval_ms() -> u64 {
    500
}

fn default_stop_timeout_ms() -> u64 {
    5000
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            num_workers: default_num_workers(),
            files_per_worker: default_files_per_worker(),
            max_retries: default_max_retries(),
            reuse_existing_folders: true,
            skip_hidden_files: false,
            follow_symlinks: false,
            max_file_size: None,
            max_files: None,
            scan_batch_size: default_scan_batch_size(),
            auto_stop_when_idle: true,
            progress_interval_ms: default_progress_interval_ms(),
            stats_interval_ms: default_stats_interval_ms(),
            idle_check_interval_ms: default_idle_check_interval_ms(),
            worker_poll_interval_ms: default_worker_poll_interval_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
        }
    }
}

impl UploadConfig {
    /// 超出范围的并发参数重置为默认值
    pub fn validated(mut self) -> Self {
        if !(MIN_NUM_WORKERS..=MAX_NUM_WORKERS).contains(&self.num_workers) {
            tracing::warn!(
                "num_workers={} 超出范围 {}-{}，使用默认值 {}",
                self.num_workers,
                MIN_NUM_WORKERS,
                MAX_NUM_WORKERS,
                default_num_workers()
            );
            self.num_workers = default_num_workers();
        }
        if !(MIN_FILES_PER_WORKER..=MAX_FILES_PER_WORKER).contains(&self.files_per_worker) {
            tracing::warn!(
                "files_per_worker={} 超出范围 {}-{}，使用默认值 {}",
                self.files_per_worker,
                MIN_FILES_PER_WORKER,
                MAX_FILES_PER_WORKER,
                default_files_per_worker()
            );
            self.files_per_worker = default_files_per_worker();
        }
        if self.scan_batch_size == 0 {
            self.scan_batch_size = default_scan_batch_size();
        }
        self
    }

    /// 扫描参数
    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            follow_symlinks: self.follow_symlinks,
            max_file_size: self.max_file_size,
            max_files: self.max_files,
            skip_hidden: self.skip_hidden_files,
            batch_size: self.scan_batch_size,
            reuse_existing_folders: self.reuse_existing_folders,
            max_retries: self.max_retries,
        }
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }

    pub fn idle_check_interval(&self) -> Duration {
        Duration::from_millis(self.idle_check_interval_ms)
    }

    pub fn worker_poll_interval(&self) -> Duration {
        Duration::from_millis(self.worker_poll_interval_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let mut config: AppConfig =
            toml::from_str(&content).context("Failed to parse config file")?;
        config.upload = config.upload.validated();

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);
        Ok(())
    }

    /// 加载配置，文件不存在或无效时使用默认配置
    pub async fn load_or_default(path: &str) -> Self {
        if !std::path::Path::new(path).exists() {
            tracing::info!("配置文件不存在，使用默认配置: {}", path);
            return Self::default();
        }

        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.upload.num_workers, 2);
        assert_eq!(config.upload.files_per_worker, 5);
        assert_eq!(config.upload.idle_check_interval(), Duration::from_secs(2));
        assert!(config.upload.auto_stop_when_idle);
        assert!(config.remote.mirror_root.is_none());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_str().unwrap();

        let mut config = AppConfig::default();
        config.upload.num_workers = 4;
        config.upload.files_per_worker = 8;
        config.remote.root_folder_id = Some("/backup".to_string());
        config.save_to_file(path).await.unwrap();

        let loaded = AppConfig::load_from_file(path).await.unwrap();
        assert_eq!(loaded.upload.num_workers, 4);
        assert_eq!(loaded.upload.files_per_worker, 8);
        assert_eq!(loaded.remote.root_folder_id.as_deref(), Some("/backup"));
    }

    #[tokio::test]
    async fn test_partial_file_uses_defaults() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "[upload]\nnum_workers = 3\n").unwrap();

        let loaded = AppConfig::load_from_file(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(loaded.upload.num_workers, 3);
        assert_eq!(loaded.upload.files_per_worker, 5);
        assert_eq!(loaded.upload.stop_timeout_ms, 5000);
        assert_eq!(loaded.log.level, "info");
    }

    #[tokio::test]
    async fn test_load_or_default_on_invalid_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "this is = = not toml").unwrap();

        let loaded = AppConfig::load_or_default(temp_file.path().to_str().unwrap()).await;
        assert_eq!(loaded.upload.num_workers, 2);

        let missing = AppConfig::load_or_default("/nonexistent/uploader.toml").await;
        assert_eq!(missing.upload.files_per_worker, 5);
    }

    #[test]
    fn test_validated_resets_out_of_range() {
        let config = UploadConfig {
            num_workers: 0,
            files_per_worker: 50,
            ..UploadConfig::default()
        }
        .validated();
        assert_eq!(config.num_workers, 2);
        assert_eq!(config.files_per_worker, 5);

        let config = UploadConfig {
            num_workers: 10,
            files_per_worker: 20,
            ..UploadConfig::default()
        }
        .validated();
        assert_eq!(config.num_workers, 10);
        assert_eq!(config.files_per_worker, 20);
    }

    #[test]
    fn test_scan_options_follow_config() {
        let config = UploadConfig {
            skip_hidden_files: true,
            reuse_existing_folders: false,
            max_retries: 7,
            ..UploadConfig::default()
        };
        let options = config.scan_options();
        assert!(options.skip_hidden);
        assert!(!options.reuse_existing_folders);
        assert_eq!(options.max_retries, 7);
        assert_eq!(options.batch_size, 100);
    }
}
