//! 统一上传管理器
//!
//! 把队列、文件夹扫描和工作者池组合成一个上传会话：
//! - 加入文件或文件夹会自动开始会话
//! - 每个文件夹扫描完成后按源文件夹轮询重排队列，让多个文件夹交替上传
//! - 工作者池空闲、没有扫描且没有待上传文件时会话结束
//!
//! 所有状态变化通过 [`EventBus`] 广播

use super::folder::{folder_key, BatchFolderScanner, FolderScanner, ScanOutcome};
use super::queue::{QueueOrdering, QueueStatistics, UploadQueue};
use super::scheduler::{IdleSignal, WorkerManager, WorkerPoolConfig, WorkerPoolStatistics};
use super::task::{FileStatus, FolderInfo, QueuedFile};
use crate::config::UploadConfig;
use crate::events::{EventBus, ScanEvent, SessionEvent, UploadEvent, DEFAULT_EVENT_CAPACITY};
use crate::netdisk::{RemoteClient, RemoteClientFactory};
use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 会话被停止时未完成扫描的文件夹记录的错误
const SCAN_CANCELLED: &str = "扫描已取消";

/// 会话状态
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Idle,
    Active,
    Paused,
}

/// 聚合统计快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateStatistics {
    pub queue: QueueStatistics,
    /// 工作者池从未启动时为 None
    pub workers: Option<WorkerPoolStatistics>,
    pub session: SessionState,
}

pub struct UnifiedUploadManager {
    inner: Arc<Inner>,
}

struct Inner {
    queue: Arc<UploadQueue>,
    /// 扫描器使用的客户端
    client: RemoteClient,
    workers: WorkerManager,
    config: UploadConfig,
    events: EventBus,
    state: Mutex<SessionState>,
    /// 串行化会话的开始、停止和结束判定
    session_lock: tokio::sync::Mutex<()>,
    active_scans: AtomicUsize,
    /// 所有扫描令牌的父令牌，停止会话时整体取消并替换
    scan_root: Mutex<CancellationToken>,
    workers_started: AtomicBool,
    /// 本轮是否已经报告过处理完成
    drain_reported: AtomicBool,
    drained: Notify,
    shutdown: CancellationToken,
}

impl UnifiedUploadManager {
    /// 创建管理器并启动后台任务，需要在 tokio 运行时中调用
    pub fn new(factory: Arc<dyn RemoteClientFactory>, config: UploadConfig) -> Result<Self> {
        let events = EventBus::new(DEFAULT_EVENT_CAPACITY);
        let queue = Arc::new(UploadQueue::with_events(events.clone()));
        let client = factory.connect().context("创建远程客户端失败")?;
        let workers = WorkerManager::new(queue.clone(), factory, WorkerPoolConfig::from(&config));
        let idle_rx = workers.idle_signals();

        let inner = Arc::new(Inner {
            queue,
            client,
            workers,
            config,
            events,
            state: Mutex::new(SessionState::Idle),
            session_lock: tokio::sync::Mutex::new(()),
            active_scans: AtomicUsize::new(0),
            scan_root: Mutex::new(CancellationToken::new()),
            workers_started: AtomicBool::new(false),
            drain_reported: AtomicBool::new(false),
            drained: Notify::new(),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(inner.clone().run_idle_listener(idle_rx));
        tokio::spawn(inner.clone().run_statistics_publisher());

        info!(
            "上传管理器已创建: {} 个工作者 × 每个 {} 个文件",
            inner.config.num_workers, inner.config.files_per_worker
        );
        Ok(Self { inner })
    }

    // =====================================================
    // 会话控制
    // =====================================================

    /// 开始会话，已取消的文件重新排队
    pub async fn start_session(&self) {
        self.inner.start_session().await;
    }

    /// 停止会话：取消扫描和进行中的上传
    pub async fn stop_session(&self) {
        let _guard = self.inner.session_lock.lock().await;
        self.inner.stop_locked().await;
    }

    /// 暂停会话，进行中的上传继续完成，不再分发新文件
    pub async fn pause_session(&self) {
        let _guard = self.inner.session_lock.lock().await;
        if self.state() != SessionState::Active {
            return;
        }
        self.inner.workers.pause_workers();
        *self.inner.state.lock() = SessionState::Paused;
        self.inner.events.publish(SessionEvent::Paused);
        info!("上传会话已暂停");
    }

    pub async fn resume_session(&self) {
        {
            let _guard = self.inner.session_lock.lock().await;
            if self.state() != SessionState::Paused {
                return;
            }
            self.inner.workers.resume_workers();
            *self.inner.state.lock() = SessionState::Active;
            self.inner.events.publish(SessionEvent::Resumed);
            info!("上传会话已恢复");
        }
        self.inner.check_drained().await;
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.lock()
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    pub fn is_paused(&self) -> bool {
        self.state() == SessionState::Paused
    }

    /// 等待所有已加入的工作处理完
    ///
    /// 开启自动结束时还会等到会话回到 Idle；会话暂停期间不会返回
    pub async fn wait_until_drained(&self) {
        loop {
            let notified = self.inner.drained.notified();
            self.inner.check_drained().await;
            if self.inner.is_settled() {
                return;
            }
            let _ = tokio::time::timeout(self.inner.config.idle_check_interval(), notified).await;
        }
    }

    // =====================================================
    // 添加工作
    // =====================================================

    /// 加入单独的文件，无效路径发出警告后忽略，返回实际入队数
    pub async fn add_files(&self, paths: &[PathBuf], destination_id: &str) -> usize {
        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            match self.inner.prepare_file(path, destination_id) {
                Ok(file) => files.push(file),
                Err(e) => self.inner.warn(format!("{:#}", e)),
            }
        }
        if files.is_empty() {
            return 0;
        }

        // 入队与会话检查在同一把锁内完成
        let _guard = self.inner.session_lock.lock().await;
        let added = self.inner.queue.add_files_batch(files);
        if added > 0 {
            info!("加入 {} 个文件到上传队列", added);
            self.inner.ensure_session_locked().await;
        }
        added
    }

    /// 在后台扫描一个文件夹并加入队列，路径无效时返回 false
    pub async fn add_folder(&self, path: &Path, destination_id: &str) -> bool {
        let root = match resolve_folder(path) {
            Ok(root) => root,
            Err(e) => {
                self.inner.warn(format!("{:#}", e));
                return false;
            }
        };

        let token = self.inner.begin_scans(&[root.clone()], destination_id).await;
        let inner = self.inner.clone();
        let destination_id = destination_id.to_string();
        tokio::spawn(async move {
            let (tx, rx) = mpsc::unbounded_channel();
            let scanner = FolderScanner::new(
                inner.queue.clone(),
                inner.client.clone(),
                inner.config.scan_options(),
                tx,
            )
            .with_cancel_token(token);
            let handle = scanner.spawn(root.clone(), destination_id);
            inner.forward_scan_events(rx).await;

            match handle.await {
                Ok(ScanOutcome::Cancelled) => inner.release_unfinished(&[root], SCAN_CANCELLED),
                Ok(_) => {}
                Err(e) => inner.release_unfinished(&[root], &format!("扫描任务异常退出: {}", e)),
            }
            inner.finish_scan().await;
        });
        true
    }

    /// 按顺序扫描多个文件夹，全部无效时返回 false
    pub async fn add_folders(&self, paths: &[PathBuf], destination_id: &str) -> bool {
        let mut roots = Vec::with_capacity(paths.len());
        for path in paths {
            match resolve_folder(path) {
                Ok(root) => roots.push(root),
                Err(e) => self.inner.warn(format!("{:#}", e)),
            }
        }
        if roots.is_empty() {
            self.inner.warn("没有有效的文件夹".to_string());
            return false;
        }

        let token = self.inner.begin_scans(&roots, destination_id).await;
        let inner = self.inner.clone();
        let destination_id = destination_id.to_string();
        tokio::spawn(async move {
            let (tx, rx) = mpsc::unbounded_channel();
            let scanner = BatchFolderScanner::new(
                inner.queue.clone(),
                inner.client.clone(),
                inner.config.scan_options(),
                tx,
            )
            .with_cancel_token(token);
            let handle = scanner.spawn(roots.clone(), destination_id);
            inner.forward_scan_events(rx).await;

            match handle.await {
                Ok(summary) if summary.cancelled => inner.release_unfinished(&roots, SCAN_CANCELLED),
                Ok(_) => {}
                Err(e) => inner.release_unfinished(&roots, &format!("扫描任务异常退出: {}", e)),
            }
            inner.finish_scan().await;
        });
        true
    }

    // =====================================================
    // 重试与清理
    // =====================================================

    /// 重试所有可重试的失败文件
    pub async fn retry_failed_files(&self) -> usize {
        let _guard = self.inner.session_lock.lock().await;
        let count = self.inner.queue.retry_all_failed();
        if count > 0 {
            self.inner.ensure_session_locked().await;
        } else {
            info!("没有可重试的文件");
        }
        count
    }

    pub async fn retry_file(&self, file_id: &str) -> bool {
        let _guard = self.inner.session_lock.lock().await;
        let retried = self.inner.queue.retry_file(file_id);
        if retried {
            self.inner.ensure_session_locked().await;
        }
        retried
    }

    /// 移除已完成、失败和跳过的文件
    pub fn clear_completed_files(&self) -> usize {
        self.inner.queue.clear_completed()
    }

    // =====================================================
    // 查询
    // =====================================================

    pub fn get_queue_statistics(&self) -> QueueStatistics {
        self.inner.queue.get_queue_statistics()
    }

    pub fn get_statistics(&self) -> AggregateStatistics {
        self.inner.aggregate_statistics()
    }

    pub fn get_all_files(&self) -> Vec<QueuedFile> {
        self.inner.queue.get_all_files()
    }

    pub fn get_all_folders(&self) -> Vec<FolderInfo> {
        self.inner.queue.get_all_folders()
    }

    pub fn get_files_by_status(&self, status: FileStatus) -> Vec<QueuedFile> {
        self.inner.queue.get_files_by_status(status)
    }

    pub fn get_files_by_folder(&self, folder_path: &str) -> Vec<QueuedFile> {
        self.inner.queue.get_files_by_folder(folder_path)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.inner.events.subscribe()
    }

    pub fn queue(&self) -> Arc<UploadQueue> {
        self.inner.queue.clone()
    }

    pub fn config(&self) -> &UploadConfig {
        &self.inner.config
    }
}

impl Drop for UnifiedUploadManager {
    fn drop(&mut self) {
        self.inner.scan_root.lock().cancel();
        self.inner.shutdown.cancel();
    }
}

impl Inner {
    /// 有新工作加入：没有会话时开始一个，调用方需持有 session_lock
    async fn ensure_session_locked(&self) {
        self.drain_reported.store(false, Ordering::SeqCst);
        if *self.state.lock() == SessionState::Idle {
            self.start_locked().await;
        }
    }

    async fn start_session(&self) {
        let _guard = self.session_lock.lock().await;
        self.start_locked().await;
    }

    /// 调用方需持有 session_lock
    async fn start_locked(&self) {
        if *self.state.lock() != SessionState::Idle {
            return;
        }

        let restored = self.queue.requeue_cancelled();
        if restored > 0 {
            info!("恢复 {} 个上次取消的文件", restored);
        }
        self.workers.start_workers().await;
        self.workers_started.store(true, Ordering::SeqCst);
        self.drain_reported.store(false, Ordering::SeqCst);
        *self.state.lock() = SessionState::Active;

        self.events.publish(SessionEvent::Started {
            num_workers: self.config.num_workers,
            files_per_worker: self.config.files_per_worker,
        });
        info!("上传会话已开始");
    }

    /// 调用方需持有 session_lock
    async fn stop_locked(&self) {
        if *self.state.lock() == SessionState::Idle {
            return;
        }

        {
            let mut root = self.scan_root.lock();
            root.cancel();
            *root = CancellationToken::new();
        }
        self.workers.stop_workers().await;
        *self.state.lock() = SessionState::Idle;

        self.events.publish(SessionEvent::Stopped);
        info!("上传会话已停止");
        self.drained.notify_waiters();
    }

    /// 登记扫描并确保会话已开始，返回本次扫描的取消令牌
    ///
    /// 令牌在会话确认开始后才从 scan_root 派生，不会被正在进行的停止取消
    async fn begin_scans(&self, roots: &[PathBuf], destination_id: &str) -> CancellationToken {
        let _guard = self.session_lock.lock().await;
        for root in roots {
            self.queue
                .register_folder_for_scanning(&folder_key(root), destination_id);
        }
        self.active_scans.fetch_add(1, Ordering::SeqCst);
        self.ensure_session_locked().await;
        self.scan_root.lock().child_token()
    }

    /// 按顺序处理一次扫描的事件，直到扫描器退出
    async fn forward_scan_events(&self, mut rx: mpsc::UnboundedReceiver<ScanEvent>) {
        while let Some(event) = rx.recv().await {
            if let Some((folder_path, files_added)) = event.completed_folder() {
                self.queue.mark_folder_scan_completed(folder_path);
                let reordered = self.queue.reorder_queue(QueueOrdering::RoundRobin);
                debug!(
                    "文件夹扫描完成: {} ({} 个文件), 重排 {} 个待上传文件",
                    folder_path, files_added, reordered
                );
            } else if let Some((folder_path, error)) = event.failed_folder() {
                self.queue.mark_folder_scan_failed(folder_path, error);
            }
            self.events.publish(event);
        }
    }

    /// 扫描未走到结束的文件夹标记为失败
    fn release_unfinished(&self, roots: &[PathBuf], message: &str) {
        for root in roots {
            let folder_path = folder_key(root);
            if let Some(folder) = self.queue.get_folder(&folder_path) {
                if folder.is_scanning {
                    self.queue.mark_folder_scan_failed(&folder_path, message);
                }
            }
        }
    }

    async fn finish_scan(&self) {
        self.active_scans.fetch_sub(1, Ordering::SeqCst);
        self.check_drained().await;
    }

    fn prepare_file(&self, path: &Path, destination_id: &str) -> Result<QueuedFile> {
        let path = dunce::canonicalize(path)
            .with_context(|| format!("文件不存在: {}", path.display()))?;
        let metadata = std::fs::metadata(&path)
            .with_context(|| format!("无法读取文件信息: {}", path.display()))?;
        if !metadata.is_file() {
            bail!("不是文件: {}", path.display());
        }

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .with_context(|| format!("无法确定文件名: {}", path.display()))?;
        let source_folder = path.parent().map(folder_key).unwrap_or_default();

        Ok(QueuedFile::new(
            path,
            file_name,
            metadata.len(),
            source_folder,
            "",
            destination_id,
        )
        .with_max_retries(self.config.max_retries))
    }

    fn warn(&self, message: String) {
        warn!("{}", message);
        self.events.publish(SessionEvent::Warning { message });
    }

    // =====================================================
    // 结束判定
    // =====================================================

    /// 没有扫描、待上传和进行中的文件
    fn is_drained(&self) -> bool {
        if self.active_scans.load(Ordering::SeqCst) > 0 || !self.workers.is_idle() {
            return false;
        }
        if self.queue.get_queue_statistics().in_progress > 0 {
            return false;
        }
        !self.queue.get_all_folders().iter().any(|f| f.is_scanning)
    }

    fn is_settled(&self) -> bool {
        if !self.is_drained() {
            return false;
        }
        !self.config.auto_stop_when_idle || *self.state.lock() == SessionState::Idle
    }

    async fn check_drained(&self) {
        if !self.is_drained() {
            return;
        }
        let _guard = self.session_lock.lock().await;
        if !self.is_drained() {
            return;
        }

        let active = *self.state.lock() == SessionState::Active;
        if active && !self.drain_reported.swap(true, Ordering::SeqCst) {
            let stats = self.queue.get_queue_statistics();
            info!(
                "所有上传已处理完: 完成 {}, 失败 {}, 跳过 {}",
                stats.completed, stats.failed, stats.skipped
            );
            self.events.publish(SessionEvent::Completed {
                completed: stats.completed,
                failed: stats.failed,
                skipped: stats.skipped,
            });
            if self.config.auto_stop_when_idle {
                self.stop_locked().await;
            }
        }
        self.drained.notify_waiters();
    }

    fn aggregate_statistics(&self) -> AggregateStatistics {
        let workers = self
            .workers_started
            .load(Ordering::SeqCst)
            .then(|| self.workers.get_overall_statistics());
        AggregateStatistics {
            queue: self.queue.get_queue_statistics(),
            workers,
            session: *self.state.lock(),
        }
    }

    // =====================================================
    // 后台任务
    // =====================================================

    async fn run_idle_listener(self: Arc<Self>, mut idle_rx: mpsc::UnboundedReceiver<IdleSignal>) {
        loop {
            let signal = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                signal = idle_rx.recv() => match signal {
                    Some(signal) => signal,
                    None => break,
                },
            };

            debug!("收到工作者空闲信号 (第 {} 次)", signal.cycle);
            if *self.state.lock() == SessionState::Active {
                self.events.publish(SessionEvent::WorkersIdle);
            }
            self.check_drained().await;
        }
    }

    async fn run_statistics_publisher(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.stats_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if *self.state.lock() != SessionState::Idle {
                self.events
                    .publish(UploadEvent::Statistics(self.aggregate_statistics()));
            }
        }
    }
}

fn resolve_folder(path: &Path) -> Result<PathBuf> {
    let root = dunce::canonicalize(path)
        .with_context(|| format!("文件夹不存在: {}", path.display()))?;
    if !root.is_dir() {
        bail!("不是文件夹: {}", root.display());
    }
    Ok(root)
}
