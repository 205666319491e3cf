//! 文件夹扫描模块
//!
//! 负责:
//! - 遍历本地文件夹，记录目录结构和文件列表
//! - 按深度顺序在远程创建对应的文件夹（父文件夹先于子文件夹）
//! - 将发现的文件分批加入上传队列
//! - 批量扫描时逐个文件夹顺序执行

use super::queue::UploadQueue;
use super::task::{QueuedFile, DEFAULT_MAX_RETRIES};
use crate::events::ScanEvent;
use crate::netdisk::{RemoteClient, RemoteError};
use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

/// 每批加入队列的文件数
pub const DEFAULT_SCAN_BATCH_SIZE: usize = 100;

/// 文件夹扫描配置
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// 是否跟随符号链接
    pub follow_symlinks: bool,
    /// 最大文件大小（字节），超过此大小的文件将被跳过
    pub max_file_size: Option<u64>,
    /// 最大文件数量，超过此数量将停止扫描
    pub max_files: Option<usize>,
    /// 跳过隐藏文件（以.开头的文件和文件夹）
    pub skip_hidden: bool,
    /// 每批入队的文件数
    pub batch_size: usize,
    /// 远程已有同名文件夹时直接复用
    pub reuse_existing_folders: bool,
    /// 赋给每个文件的最大重试次数
    pub max_retries: u32,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            follow_symlinks: false,
            max_file_size: None,
            max_files: None,
            skip_hidden: false,
            batch_size: DEFAULT_SCAN_BATCH_SIZE,
            reuse_existing_folders: true,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// 扫描到的文件
#[derive(Debug, Clone)]
pub struct ScannedFile {
    /// 本地文件绝对路径
    pub local_path: PathBuf,
    pub file_name: String,
    /// 所在目录相对扫描根目录的路径（'/' 分隔，根为空串）
    pub relative_dir: String,
    /// 文件大小（字节）
    pub size: u64,
}

/// 本地目录树
#[derive(Debug, Default)]
pub struct LocalTree {
    /// 相对目录 -> 直接子文件夹名
    pub subfolders: BTreeMap<String, Vec<String>>,
    /// 子文件夹的遍历顺序（不含根）
    folder_order: Vec<String>,
    pub files: Vec<ScannedFile>,
    /// 因无法访问而跳过的条目数
    pub skipped_entries: usize,
}

impl LocalTree {
    /// 全部子文件夹，按深度递增排序（同深度保持遍历顺序）
    pub fn folders_by_depth(&self) -> Vec<String> {
        let mut folders = self.folder_order.clone();
        folders.sort_by_key(|rel| path_depth(rel));
        folders
    }

    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

/// 相对路径的深度，根为 0
fn path_depth(relative: &str) -> usize {
    if relative.is_empty() {
        0
    } else {
        relative.matches('/').count() + 1
    }
}

/// 拆分为 (父目录, 名称)
fn split_relative(relative: &str) -> (&str, &str) {
    match relative.rfind('/') {
        Some(pos) => (&relative[..pos], &relative[pos + 1..]),
        None => ("", relative),
    }
}

fn relative_of(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .map_or(false, |name| name.starts_with('.'))
}

/// 本地文件夹在队列中的键
pub fn folder_key(root: &Path) -> String {
    root.to_string_lossy().into_owned()
}

/// 遍历本地目录树
///
/// 单个条目无法访问时记录警告并跳过，不会中断整个扫描
pub fn scan_local_tree(
    root: &Path,
    options: &ScanOptions,
    cancel_token: &CancellationToken,
) -> Result<LocalTree> {
    let metadata = std::fs::metadata(root)
        .with_context(|| format!("扫描路径不存在: {}", root.display()))?;
    if !metadata.is_dir() {
        anyhow::bail!("扫描路径不是文件夹: {}", root.display());
    }

    let mut tree = LocalTree::default();
    tree.subfolders.insert(String::new(), Vec::new());

    let walker = WalkDir::new(root)
        .follow_links(options.follow_symlinks)
        .sort_by_file_name()
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| !(options.skip_hidden && is_hidden(e)));

    for entry in walker {
        if cancel_token.is_cancelled() {
            debug!("本地遍历被取消: {}", root.display());
            break;
        }

        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("无法访问，已跳过: {}", e);
                tree.skipped_entries += 1;
                continue;
            }
        };

        let Some(relative) = relative_of(root, entry.path()) else {
            continue;
        };
        let (parent, name) = split_relative(&relative);

        if entry.file_type().is_dir() {
            tree.subfolders
                .entry(parent.to_string())
                .or_default()
                .push(name.to_string());
            tree.subfolders.entry(relative.clone()).or_default();
            tree.folder_order.push(relative);
            continue;
        }

        if !entry.file_type().is_file() {
            debug!("跳过非常规文件: {}", entry.path().display());
            continue;
        }

        let size = match entry.metadata() {
            Ok(meta) => meta.len(),
            Err(e) => {
                warn!("读取文件信息失败，已跳过: {}, 错误: {}", entry.path().display(), e);
                tree.skipped_entries += 1;
                continue;
            }
        };

        if let Some(max_size) = options.max_file_size {
            if size > max_size {
                warn!("跳过超大文件: {} ({})", entry.path().display(), format_bytes(size));
                continue;
            }
        }

        if let Some(max_files) = options.max_files {
            if tree.files.len() >= max_files {
                warn!("已达到最大文件数量限制 ({}), 停止扫描", max_files);
                break;
            }
        }

        tree.files.push(ScannedFile {
            local_path: entry.path().to_path_buf(),
            file_name: name.to_string(),
            relative_dir: parent.to_string(),
            size,
        });
    }

    Ok(tree)
}

/// 单个文件夹扫描的结果摘要
#[derive(Debug, Clone)]
pub struct ScanSummary {
    pub folder_path: String,
    pub files_added: usize,
    pub remote_folder_id: String,
    pub folders_created: usize,
    pub folders_failed: usize,
    pub skipped_entries: usize,
}

/// 扫描结束方式
#[derive(Debug, Clone)]
pub enum ScanOutcome {
    Completed(ScanSummary),
    Failed(String),
    Cancelled,
}

/// 文件夹扫描器
///
/// 扫描在后台任务中运行，通过 mpsc 通道报告进度；
/// 取消令牌在文件夹之间和批次之间检查
#[derive(Clone)]
pub struct FolderScanner {
    queue: Arc<UploadQueue>,
    client: RemoteClient,
    options: ScanOptions,
    events: mpsc::UnboundedSender<ScanEvent>,
    cancel_token: CancellationToken,
}

impl FolderScanner {
    pub fn new(
        queue: Arc<UploadQueue>,
        client: RemoteClient,
        options: ScanOptions,
        events: mpsc::UnboundedSender<ScanEvent>,
    ) -> Self {
        Self {
            queue,
            client,
            options,
            events,
            cancel_token: CancellationToken::new(),
        }
    }

    /// 使用外部的取消令牌
    pub fn with_cancel_token(mut self, cancel_token: CancellationToken) -> Self {
        self.cancel_token = cancel_token;
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn stop(&self) {
        self.cancel_token.cancel();
    }

    /// 在后台任务中扫描
    pub fn spawn(self, root: PathBuf, destination_id: String) -> JoinHandle<ScanOutcome> {
        tokio::spawn(async move { self.scan_folder(&root, &destination_id).await })
    }

    /// 扫描一个文件夹，结束时发出完成或失败事件（取消时都不发）
    pub async fn scan_folder(&self, root: &Path, destination_id: &str) -> ScanOutcome {
        let folder_path = folder_key(root);
        self.queue
            .register_folder_for_scanning(&folder_path, destination_id);
        self.emit(ScanEvent::Started {
            folder_path: folder_path.clone(),
        });

        let outcome = self.scan_one(root, destination_id).await;
        match &outcome {
            ScanOutcome::Completed(summary) => self.emit(ScanEvent::Completed {
                folder_path,
                files_added: summary.files_added,
                remote_folder_id: summary.remote_folder_id.clone(),
            }),
            ScanOutcome::Failed(error) => self.emit(ScanEvent::Failed {
                folder_path,
                error: error.clone(),
            }),
            ScanOutcome::Cancelled => info!("文件夹扫描已取消: {}", folder_path),
        }
        outcome
    }

    /// 单个文件夹的完整扫描流程，不发出开始/结束事件
    pub(crate) async fn scan_one(&self, root: &Path, destination_id: &str) -> ScanOutcome {
        match self.run_protocol(root, destination_id).await {
            Ok(Some(summary)) => ScanOutcome::Completed(summary),
            Ok(None) => ScanOutcome::Cancelled,
            Err(_) if self.cancel_token.is_cancelled() => ScanOutcome::Cancelled,
            Err(e) => {
                warn!("文件夹扫描失败: {}, 错误: {:#}", root.display(), e);
                ScanOutcome::Failed(format!("{:#}", e))
            }
        }
    }

    async fn run_protocol(&self, root: &Path, destination_id: &str) -> Result<Option<ScanSummary>> {
        let folder_path = folder_key(root);
        info!("开始扫描文件夹: {}", folder_path);

        // 1. 遍历本地目录树
        let tree = {
            let root = root.to_path_buf();
            let options = self.options.clone();
            let token = self.cancel_token.clone();
            tokio::task::spawn_blocking(move || scan_local_tree(&root, &options, &token))
                .await
                .context("本地扫描任务异常退出")??
        };
        if self.cancel_token.is_cancelled() {
            return Ok(None);
        }
        info!(
            "本地遍历完成: {} 个文件，{} 个子文件夹，总大小 {}",
            tree.files.len(),
            tree.folder_order.len(),
            format_bytes(tree.total_size())
        );

        // 2. 创建根文件夹，失败则整个扫描失败
        let root_name = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .with_context(|| format!("无法确定文件夹名称: {}", root.display()))?;
        let (root_id, reused) = self
            .resolve_folder(&root_name, destination_id)
            .await
            .with_context(|| format!("创建主文件夹失败: {}", root_name))?;

        self.queue.set_folder_remote_id(&folder_path, &root_id);
        self.emit(ScanEvent::FolderCreated {
            relative_path: String::new(),
            remote_id: root_id.clone(),
            reused,
        });

        let mut folder_mapping: HashMap<String, String> = HashMap::new();
        folder_mapping.insert(String::new(), root_id.clone());

        // 3. 按深度创建子文件夹
        let mut folders_created = 0;
        let mut folders_failed = 0;
        for relative in tree.folders_by_depth() {
            if self.cancel_token.is_cancelled() {
                return Ok(None);
            }

            let (parent, name) = split_relative(&relative);
            let parent_id = folder_mapping
                .get(parent)
                .cloned()
                .unwrap_or_else(|| root_id.clone());

            match self.resolve_folder(name, &parent_id).await {
                Ok((remote_id, reused)) => {
                    debug!("远程文件夹就绪: {} -> {}", relative, remote_id);
                    folders_created += 1;
                    folder_mapping.insert(relative.clone(), remote_id.clone());
                    self.emit(ScanEvent::FolderCreated {
                        relative_path: relative,
                        remote_id,
                        reused,
                    });
                }
                Err(e) => {
                    // 子文件夹内容改投到父文件夹
                    warn!(
                        "创建子文件夹失败: {}, 错误: {}, 改用父文件夹 {}",
                        relative, e, parent_id
                    );
                    folders_failed += 1;
                    folder_mapping.insert(relative.clone(), parent_id.clone());
                    self.emit(ScanEvent::FolderCreateFailed {
                        relative_path: relative,
                        fallback_id: parent_id,
                        error: e.to_string(),
                    });
                }
            }
        }

        // 4. 分批入队
        let batch_size = self.options.batch_size.max(1);
        let mut files_added = 0;
        for chunk in tree.files.chunks(batch_size) {
            if self.cancel_token.is_cancelled() {
                return Ok(None);
            }

            let batch: Vec<QueuedFile> = chunk
                .iter()
                .map(|scanned| {
                    let destination = folder_mapping
                        .get(&scanned.relative_dir)
                        .unwrap_or(&root_id)
                        .clone();
                    QueuedFile::new(
                        scanned.local_path.clone(),
                        scanned.file_name.clone(),
                        scanned.size,
                        folder_path.clone(),
                        scanned.relative_dir.clone(),
                        destination,
                    )
                    .with_max_retries(self.options.max_retries)
                })
                .collect();

            let count = self.queue.add_files_batch(batch);
            files_added += count;
            self.emit(ScanEvent::FilesAdded {
                folder_path: folder_path.clone(),
                count,
            });
        }

        info!(
            "文件夹扫描完成: {}, 入队 {} 个文件, 远程文件夹 {}",
            folder_path, files_added, root_id
        );

        Ok(Some(ScanSummary {
            folder_path,
            files_added,
            remote_folder_id: root_id,
            folders_created,
            folders_failed,
            skipped_entries: tree.skipped_entries,
        }))
    }

    /// 获取或创建远程文件夹，返回 (标识符, 是否复用)
    async fn resolve_folder(&self, name: &str, parent_id: &str) -> Result<(String, bool), RemoteError> {
        if self.options.reuse_existing_folders {
            match self.client.list(parent_id).await {
                Ok(entries) => {
                    if let Some(existing) = entries.iter().find(|e| e.is_folder() && e.name == name) {
                        debug!("复用已存在的远程文件夹: {} ({})", name, existing.id);
                        return Ok((existing.id.clone(), true));
                    }
                }
                Err(e) => warn!("列出远程文件夹失败，直接创建: {}, 错误: {}", parent_id, e),
            }
        }

        let id = self.client.create_folder(name, parent_id).await?;
        Ok((id, false))
    }

    fn emit(&self, event: ScanEvent) {
        // 接收端已关闭说明没人关心进度
        let _ = self.events.send(event);
    }
}

/// 批量文件夹扫描器
///
/// 先登记全部文件夹，再逐个顺序扫描，避免远程建文件夹请求集中爆发
#[derive(Clone)]
pub struct BatchFolderScanner {
    scanner: FolderScanner,
}

/// 批量扫描的汇总
#[derive(Debug, Clone, Default)]
pub struct BatchSummary {
    pub total_folders: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub total_files_added: usize,
    pub cancelled: bool,
}

impl BatchFolderScanner {
    pub fn new(
        queue: Arc<UploadQueue>,
        client: RemoteClient,
        options: ScanOptions,
        events: mpsc::UnboundedSender<ScanEvent>,
    ) -> Self {
        Self {
            scanner: FolderScanner::new(queue, client, options, events),
        }
    }

    pub fn with_cancel_token(mut self, cancel_token: CancellationToken) -> Self {
        self.scanner = self.scanner.with_cancel_token(cancel_token);
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.scanner.cancel_token()
    }

    pub fn stop(&self) {
        self.scanner.stop();
    }

    pub fn spawn(self, roots: Vec<PathBuf>, destination_id: String) -> JoinHandle<BatchSummary> {
        tokio::spawn(async move { self.scan_folders(&roots, &destination_id).await })
    }

    pub async fn scan_folders(&self, roots: &[PathBuf], destination_id: &str) -> BatchSummary {
        let scanner = &self.scanner;
        for root in roots {
            scanner
                .queue
                .register_folder_for_scanning(&folder_key(root), destination_id);
        }

        let mut summary = BatchSummary {
            total_folders: roots.len(),
            ..Default::default()
        };
        info!("开始批量扫描 {} 个文件夹", roots.len());
        scanner.emit(ScanEvent::BatchStarted {
            total_folders: roots.len(),
        });

        for (index, root) in roots.iter().enumerate() {
            if scanner.cancel_token.is_cancelled() {
                summary.cancelled = true;
                break;
            }

            let folder_path = folder_key(root);
            scanner.emit(ScanEvent::BatchFolderStarted {
                index,
                folder_path: folder_path.clone(),
            });

            match scanner.scan_one(root, destination_id).await {
                ScanOutcome::Completed(result) => {
                    summary.succeeded += 1;
                    summary.total_files_added += result.files_added;
                    scanner.emit(ScanEvent::BatchFolderCompleted {
                        index,
                        folder_path,
                        files_added: result.files_added,
                        remote_folder_id: result.remote_folder_id,
                    });
                }
                ScanOutcome::Failed(error) => {
                    // 单个文件夹失败不影响后续文件夹
                    summary.failed += 1;
                    scanner.emit(ScanEvent::BatchFolderFailed {
                        index,
                        folder_path,
                        error,
                    });
                }
                ScanOutcome::Cancelled => {
                    summary.cancelled = true;
                    break;
                }
            }
        }

        if summary.cancelled {
            info!("批量扫描已取消");
        } else {
            info!(
                "批量扫描完成: {} 个文件夹, 成功 {}, 失败 {}, 入队 {} 个文件",
                summary.total_folders, summary.succeeded, summary.failed, summary.total_files_added
            );
            scanner.emit(ScanEvent::BatchCompleted {
                total_folders: summary.total_folders,
                total_files_added: summary.total_files_added,
            });
        }
        summary
    }
}

/// 辅助函数：格式化字节大小
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    match bytes {
        b if b >= GB => format!("{:.2} GB", b as f64 / GB as f64),
        b if b >= MB => format!("{:.2} MB", b as f64 / MB as f64),
        b if b >= KB => format!("{:.2} KB", b as f64 / KB as f64),
        b => format!("{} B", b),
    }
}
