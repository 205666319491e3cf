//! 队列工作者
//!
//! 一个工作者循环从队列取文件，并把每个文件交给独立的任务上传，
//! 自身最多同时处理 `max_parallel_files` 个文件（第二层并发）。
//! 远程客户端句柄在工作者内部复用，不与其他工作者共享

use super::queue::UploadQueue;
use super::task::QueuedFile;
use crate::events::ProgressThrottler;
use crate::netdisk::{RemoteClient, RemoteClientFactory, RemoteError};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 暂停时的检查间隔
const PAUSED_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// 远程已存在同名文件时的跳过原因
pub const SKIP_REASON_EXISTS: &str = "File already exists";

/// 工作者参数
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// 同时上传的文件数上限
    pub max_parallel_files: usize,
    /// 没有待上传文件时的最长等待时间
    pub poll_interval: Duration,
    /// 进度写回队列的最小间隔
    pub progress_interval: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            max_parallel_files: 5,
            poll_interval: Duration::from_millis(500),
            progress_interval: Duration::from_millis(500),
        }
    }
}

/// 单个工作者的统计
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatistics {
    pub worker_id: String,
    /// 已处理文件数（完成 + 跳过）
    pub files_processed: u64,
    /// 实际上传的字节数
    pub bytes_transferred: u64,
    /// 运行时长（秒）
    pub elapsed_secs: f64,
    pub active_files: usize,
    pub is_running: bool,
    pub is_paused: bool,
}

/// 单个文件的上传结果
enum TransferOutcome {
    Completed(String),
    Skipped,
    Cancelled,
    Failed(String),
}

pub struct QueueWorker {
    worker_id: String,
    queue: Arc<UploadQueue>,
    factory: Arc<dyn RemoteClientFactory>,
    options: WorkerOptions,
    /// 并发槽位，拿不到说明已满
    slots: Arc<Semaphore>,
    active_files: Mutex<HashSet<String>>,
    client_pool: Mutex<Vec<RemoteClient>>,
    is_running: AtomicBool,
    is_paused: AtomicBool,
    cancel_token: CancellationToken,
    files_processed: AtomicU64,
    bytes_transferred: AtomicU64,
    started_at: Mutex<Option<Instant>>,
}

impl QueueWorker {
    pub fn new(
        worker_id: impl Into<String>,
        queue: Arc<UploadQueue>,
        factory: Arc<dyn RemoteClientFactory>,
        options: WorkerOptions,
        cancel_token: CancellationToken,
    ) -> Self {
        let max_parallel_files = options.max_parallel_files.max(1);
        Self {
            worker_id: worker_id.into(),
            queue,
            factory,
            options: WorkerOptions {
                max_parallel_files,
                ..options
            },
            slots: Arc::new(Semaphore::new(max_parallel_files)),
            active_files: Mutex::new(HashSet::new()),
            client_pool: Mutex::new(Vec::with_capacity(max_parallel_files)),
            is_running: AtomicBool::new(false),
            is_paused: AtomicBool::new(false),
            cancel_token,
            files_processed: AtomicU64::new(0),
            bytes_transferred: AtomicU64::new(0),
            started_at: Mutex::new(None),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// 工作者主循环，直到取消令牌触发
    pub async fn run(self: Arc<Self>) {
        self.is_running.store(true, Ordering::SeqCst);
        *self.started_at.lock() = Some(Instant::now());
        info!(
            "工作者 {} 启动, 并发上限 {}",
            self.worker_id, self.options.max_parallel_files
        );

        loop {
            if self.cancel_token.is_cancelled() {
                break;
            }

            if self.is_paused() {
                tokio::select! {
                    _ = self.cancel_token.cancelled() => break,
                    _ = tokio::time::sleep(PAUSED_POLL_INTERVAL) => continue,
                }
            }

            // 并发已满时在这里等待空位
            let permit = tokio::select! {
                _ = self.cancel_token.cancelled() => break,
                permit = self.slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            if self.is_paused() {
                continue;
            }

            match self.queue.get_next_pending_file() {
                Some(file) => self.dispatch(file, permit),
                None => {
                    drop(permit);
                    tokio::select! {
                        _ = self.cancel_token.cancelled() => break,
                        _ = self.queue.wait_for_work(self.options.poll_interval) => {}
                    }
                }
            }
        }

        self.is_running.store(false, Ordering::SeqCst);
        info!("工作者 {} 已停止", self.worker_id);
    }

    /// 把文件交给独立任务上传，不等待其完成
    fn dispatch(self: &Arc<Self>, file: QueuedFile, permit: OwnedSemaphorePermit) {
        let file_id = file.unique_id.clone();
        self.active_files.lock().insert(file_id.clone());
        debug!("工作者 {} 分发文件: {}", self.worker_id, file_id);

        let worker = self.clone();
        tokio::spawn(async move {
            let _permit = permit;
            match worker.acquire_client() {
                Ok(client) => {
                    let result = AssertUnwindSafe(worker.process_file(&client, file))
                        .catch_unwind()
                        .await;
                    // 任务异常终止时客户端同样归还
                    worker.release_client(client);
                    if result.is_err() {
                        error!("上传任务异常终止: {}", file_id);
                        worker.queue.fail_file(&file_id, "上传任务异常终止");
                    }
                }
                Err(e) => {
                    warn!("创建远程客户端失败: {}, 文件: {}", e, file_id);
                    worker
                        .queue
                        .fail_file(&file_id, &format!("创建远程客户端失败: {}", e));
                }
            }
            worker.active_files.lock().remove(&file_id);
        });
    }

    async fn process_file(&self, client: &RemoteClient, file: QueuedFile) {
        let file_id = file.unique_id.as_str();

        // 取出后可能已被取消或清理
        if !self.queue.start_file(file_id, &self.worker_id) {
            return;
        }

        let outcome = if self.cancel_token.is_cancelled() {
            TransferOutcome::Cancelled
        } else {
            self.transfer(client, &file).await
        };

        match outcome {
            TransferOutcome::Completed(remote_id) => {
                self.queue.complete_file(file_id, &remote_id);
                self.files_processed.fetch_add(1, Ordering::Relaxed);
                self.bytes_transferred
                    .fetch_add(file.file_size, Ordering::Relaxed);
                info!("上传完成: {} -> {}", file.file_path.display(), remote_id);
            }
            TransferOutcome::Skipped => {
                self.queue.skip_file(file_id, SKIP_REASON_EXISTS);
                self.files_processed.fetch_add(1, Ordering::Relaxed);
                info!("远程已存在同名文件，跳过: {}", file.file_name);
            }
            TransferOutcome::Cancelled => {
                self.queue.cancel_file(file_id);
                info!("上传已取消: {}", file.file_name);
            }
            TransferOutcome::Failed(message) => {
                warn!("上传失败: {}, 错误: {}", file.file_path.display(), message);
                self.queue.fail_file(file_id, &message);
            }
        }
    }

    async fn transfer(&self, client: &RemoteClient, file: &QueuedFile) -> TransferOutcome {
        match client.list(&file.destination_id).await {
            Ok(entries) if entries.iter().any(|e| e.name == file.file_name) => {
                return TransferOutcome::Skipped;
            }
            Ok(_) => {}
            Err(e) => warn!(
                "检查远程同名文件失败，继续上传: {}, 错误: {}",
                file.file_name, e
            ),
        }

        if self.cancel_token.is_cancelled() {
            return TransferOutcome::Cancelled;
        }

        let started = Instant::now();
        let throttler = ProgressThrottler::new(self.options.progress_interval);
        let cancel_observed = AtomicBool::new(false);
        let queue = &self.queue;
        let cancel_token = &self.cancel_token;
        let file_id = file.unique_id.as_str();

        let progress = |sent: u64, total: u64| -> bool {
            if cancel_token.is_cancelled() {
                cancel_observed.store(true, Ordering::SeqCst);
                return false;
            }
            if throttler.should_emit() {
                let percent = if total == 0 {
                    100
                } else {
                    (sent.saturating_mul(100) / total).min(100) as u8
                };
                let secs = started.elapsed().as_secs_f64();
                let speed = if secs > 0.0 { sent as f64 / secs } else { 0.0 };
                queue.update_file_progress(file_id, percent, sent, speed);
            }
            true
        };

        let result = client
            .upload(&file.file_path, &file.destination_id, &progress)
            .await;
        let cancelled = cancel_observed.load(Ordering::SeqCst);

        match result {
            Ok(remote_id) if !cancelled => TransferOutcome::Completed(remote_id),
            Ok(_) => TransferOutcome::Cancelled,
            Err(RemoteError::Cancelled) => TransferOutcome::Cancelled,
            Err(_) if cancelled => TransferOutcome::Cancelled,
            Err(e) => TransferOutcome::Failed(e.to_string()),
        }
    }

    // =====================================================
    // 客户端池
    // =====================================================

    fn acquire_client(&self) -> Result<RemoteClient, RemoteError> {
        if let Some(client) = self.client_pool.lock().pop() {
            return Ok(client);
        }
        debug!("工作者 {} 创建新的远程客户端", self.worker_id);
        self.factory.connect()
    }

    fn release_client(&self, client: RemoteClient) {
        let mut pool = self.client_pool.lock();
        if pool.len() < self.options.max_parallel_files {
            pool.push(client);
        }
    }

    // =====================================================
    // 控制与状态
    // =====================================================

    pub fn pause(&self) {
        self.is_paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.is_paused.store(false, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_paused(&self) -> bool {
        self.is_paused.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// 正在处理的文件数
    pub fn active_count(&self) -> usize {
        self.active_files.lock().len()
    }

    pub fn active_files(&self) -> Vec<String> {
        self.active_files.lock().iter().cloned().collect()
    }

    pub fn get_statistics(&self) -> WorkerStatistics {
        let started_at = *self.started_at.lock();
        let elapsed_secs = started_at
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        WorkerStatistics {
            worker_id: self.worker_id.clone(),
            files_processed: self.files_processed.load(Ordering::Relaxed),
            bytes_transferred: self.bytes_transferred.load(Ordering::Relaxed),
            elapsed_secs,
            active_files: self.active_count(),
            is_running: self.is_running(),
            is_paused: self.is_paused(),
        }
    }
}
