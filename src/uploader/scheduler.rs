// 工作者池调度
//
// 功能：
// - 启动/停止一代工作者（每代共享一个取消令牌）
// - 暂停/恢复广播到所有工作者
// - 空闲监视：所有工作者无活动文件且队列无待上传文件时发出一次空闲信号
// - 汇总工作者统计

use super::queue::UploadQueue;
use super::worker::{QueueWorker, WorkerOptions, WorkerStatistics};
use crate::config::UploadConfig;
use crate::netdisk::RemoteClientFactory;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 停止时检查活动文件的间隔
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(20);

// =====================================================
// 配置
// =====================================================

/// 工作者池配置
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub num_workers: usize,
    pub files_per_worker: usize,
    pub poll_interval: Duration,
    pub progress_interval: Duration,
    pub idle_check_interval: Duration,
    pub stop_timeout: Duration,
}

impl From<&UploadConfig> for WorkerPoolConfig {
    fn from(config: &UploadConfig) -> Self {
        Self {
            num_workers: config.num_workers,
            files_per_worker: config.files_per_worker,
            poll_interval: config.worker_poll_interval(),
            progress_interval: config.progress_interval(),
            idle_check_interval: config.idle_check_interval(),
            stop_timeout: config.stop_timeout(),
        }
    }
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self::from(&UploadConfig::default())
    }
}

impl WorkerPoolConfig {
    fn worker_options(&self) -> WorkerOptions {
        WorkerOptions {
            max_parallel_files: self.files_per_worker,
            poll_interval: self.poll_interval,
            progress_interval: self.progress_interval,
        }
    }
}

/// 空闲信号，`cycle` 从 1 开始，每次由忙转闲加一
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleSignal {
    pub cycle: u64,
}

/// 工作者池统计
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerPoolStatistics {
    pub total_workers: usize,
    pub running_workers: usize,
    pub total_files_processed: u64,
    pub total_bytes_transferred: u64,
    pub total_active_files: usize,
    pub elapsed_secs: f64,
    /// 平均上传速度 (bytes/s)
    pub average_speed: f64,
    pub workers: Vec<WorkerStatistics>,
}

// =====================================================
// 工作者管理器
// =====================================================

pub struct WorkerManager {
    queue: Arc<UploadQueue>,
    factory: Arc<dyn RemoteClientFactory>,
    config: WorkerPoolConfig,
    workers: Mutex<Vec<Arc<QueueWorker>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    /// 当前这一代工作者的取消令牌，None 表示未运行
    generation: Mutex<Option<CancellationToken>>,
    paused: AtomicBool,
    idle_tx: Mutex<Option<mpsc::UnboundedSender<IdleSignal>>>,
    idle_cycles: Arc<AtomicU64>,
    started_at: Mutex<Option<Instant>>,
}

impl WorkerManager {
    pub fn new(
        queue: Arc<UploadQueue>,
        factory: Arc<dyn RemoteClientFactory>,
        config: WorkerPoolConfig,
    ) -> Self {
        Self {
            queue,
            factory,
            config,
            workers: Mutex::new(Vec::new()),
            handles: Mutex::new(Vec::new()),
            generation: Mutex::new(None),
            paused: AtomicBool::new(false),
            idle_tx: Mutex::new(None),
            idle_cycles: Arc::new(AtomicU64::new(0)),
            started_at: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    /// 订阅空闲信号，替换之前的订阅者；下次启动工作者时生效
    pub fn idle_signals(&self) -> mpsc::UnboundedReceiver<IdleSignal> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.idle_tx.lock() = Some(tx);
        rx
    }

    /// 启动一代新的工作者，已在运行的上一代先停止
    pub async fn start_workers(&self) {
        if self.is_running() {
            self.stop_workers().await;
        }

        let token = CancellationToken::new();
        let options = self.config.worker_options();
        let mut workers = Vec::with_capacity(self.config.num_workers);
        let mut handles = Vec::with_capacity(self.config.num_workers + 1);

        self.paused.store(false, Ordering::SeqCst);
        for i in 0..self.config.num_workers {
            let worker = Arc::new(QueueWorker::new(
                format!("worker_{}", i + 1),
                self.queue.clone(),
                self.factory.clone(),
                options.clone(),
                token.child_token(),
            ));
            handles.push(tokio::spawn(worker.clone().run()));
            workers.push(worker);
        }

        let monitor = IdleMonitor {
            workers: workers.clone(),
            queue: self.queue.clone(),
            interval: self.config.idle_check_interval,
            idle_tx: self.idle_tx.lock().clone(),
            cycles: self.idle_cycles.clone(),
        };
        handles.push(tokio::spawn(monitor.run(token.clone())));

        *self.workers.lock() = workers;
        *self.handles.lock() = handles;
        *self.generation.lock() = Some(token);
        *self.started_at.lock() = Some(Instant::now());

        info!(
            "工作者池已启动: {} 个工作者 × 每个 {} 个文件",
            self.config.num_workers, self.config.files_per_worker
        );
    }

    /// 停止所有工作者，等待进行中的上传结束（最多 stop_timeout）
    pub async fn stop_workers(&self) {
        let Some(token) = self.generation.lock().take() else {
            return;
        };
        token.cancel();

        let handles = std::mem::take(&mut *self.handles.lock());
        let workers = self.workers.lock().clone();

        let drain = async {
            for handle in handles {
                let _ = handle.await;
            }
            while workers.iter().any(|w| w.active_count() > 0) {
                tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
            }
        };

        if tokio::time::timeout(self.config.stop_timeout, drain)
            .await
            .is_err()
        {
            warn!(
                "等待工作者停止超时 ({:?})，仍有上传未结束",
                self.config.stop_timeout
            );
        } else {
            info!("工作者池已停止");
        }
    }

    pub fn pause_workers(&self) {
        self.paused.store(true, Ordering::SeqCst);
        for worker in self.workers.lock().iter() {
            worker.pause();
        }
        info!("工作者池已暂停");
    }

    pub fn resume_workers(&self) {
        self.paused.store(false, Ordering::SeqCst);
        for worker in self.workers.lock().iter() {
            worker.resume();
        }
        self.queue.notify_work_available();
        info!("工作者池已恢复");
    }

    pub fn is_running(&self) -> bool {
        self.generation.lock().is_some()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// 所有工作者都没有活动文件且队列没有待上传文件
    pub fn is_idle(&self) -> bool {
        pool_idle(&self.workers.lock(), &self.queue)
    }

    /// 已发出的空闲信号次数
    pub fn idle_cycles(&self) -> u64 {
        self.idle_cycles.load(Ordering::SeqCst)
    }

    pub fn get_worker_statistics(&self) -> Vec<WorkerStatistics> {
        self.workers
            .lock()
            .iter()
            .map(|w| w.get_statistics())
            .collect()
    }

    pub fn get_overall_statistics(&self) -> WorkerPoolStatistics {
        let workers = self.get_worker_statistics();
        let started_at = *self.started_at.lock();
        let elapsed_secs = started_at
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0);

        let total_bytes_transferred: u64 = workers.iter().map(|w| w.bytes_transferred).sum();
        let average_speed = if elapsed_secs > 0.0 {
            total_bytes_transferred as f64 / elapsed_secs
        } else {
            0.0
        };

        WorkerPoolStatistics {
            total_workers: workers.len(),
            running_workers: workers.iter().filter(|w| w.is_running).count(),
            total_files_processed: workers.iter().map(|w| w.files_processed).sum(),
            total_bytes_transferred,
            total_active_files: workers.iter().map(|w| w.active_files).sum(),
            elapsed_secs,
            average_speed,
            workers,
        }
    }
}

impl Drop for WorkerManager {
    fn drop(&mut self) {
        if let Some(token) = self.generation.lock().take() {
            token.cancel();
        }
    }
}

fn pool_idle(workers: &[Arc<QueueWorker>], queue: &UploadQueue) -> bool {
    workers.iter().all(|w| w.active_count() == 0) && queue.get_pending_count() == 0
}

/// 空闲监视任务
struct IdleMonitor {
    workers: Vec<Arc<QueueWorker>>,
    queue: Arc<UploadQueue>,
    interval: Duration,
    idle_tx: Option<mpsc::UnboundedSender<IdleSignal>>,
    cycles: Arc<AtomicU64>,
}

impl IdleMonitor {
    async fn run(self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut was_idle = false;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let idle = pool_idle(&self.workers, &self.queue);
            if idle && !was_idle {
                let cycle = self.cycles.fetch_add(1, Ordering::SeqCst) + 1;
                debug!("工作者池空闲 (第 {} 次)", cycle);
                if let Some(tx) = &self.idle_tx {
                    let _ = tx.send(IdleSignal { cycle });
                }
            }
            was_idle = idle;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netdisk::{MemoryStorage, MEMORY_ROOT_ID};
    use crate::uploader::testing::{queued_file, wait_until};
    use crate::uploader::FileStatus;
    use tempfile::TempDir;

    fn pool_config(num_workers: usize, files_per_worker: usize) -> WorkerPoolConfig {
        WorkerPoolConfig {
            num_workers,
            files_per_worker,
            poll_interval: Duration::from_millis(20),
            progress_interval: Duration::from_millis(10),
            idle_check_interval: Duration::from_millis(30),
            stop_timeout: Duration::from_secs(2),
        }
    }

    fn manager(
        queue: &Arc<UploadQueue>,
        storage: &Arc<MemoryStorage>,
        config: WorkerPoolConfig,
    ) -> WorkerManager {
        WorkerManager::new(queue.clone(), Arc::new(storage.clone()), config)
    }

    fn slow_storage() -> Arc<MemoryStorage> {
        Arc::new(
            MemoryStorage::new()
                .with_chunk_size(4)
                .with_chunk_delay(Duration::from_millis(10)),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_bounded_concurrency() {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(UploadQueue::new());
        let storage = slow_storage();
        for i in 0..20 {
            queue.add_file(queued_file(dir.path(), &format!("f{:02}.bin", i), 32, MEMORY_ROOT_ID));
        }

        let pool = manager(&queue, &storage, pool_config(2, 3));
        pool.start_workers().await;

        let mut max_in_progress = 0;
        let done = wait_until(Duration::from_secs(20), || {
            let stats = queue.get_queue_statistics();
            max_in_progress = max_in_progress.max(stats.in_progress);
            stats.completed == 20
        })
        .await;

        assert!(done);
        assert!(max_in_progress <= 6, "同时进行的上传数: {}", max_in_progress);
        assert!(storage.peak_concurrent_uploads() <= 6);

        let stats = pool.get_overall_statistics();
        assert_eq!(stats.total_workers, 2);
        assert_eq!(stats.total_files_processed, 20);
        assert_eq!(stats.total_bytes_transferred, 20 * 32);
        pool.stop_workers().await;
    }

    #[tokio::test]
    async fn test_idle_signal_once_per_drain() {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(UploadQueue::new());
        let storage = Arc::new(MemoryStorage::new());
        for i in 0..3 {
            queue.add_file(queued_file(dir.path(), &format!("a{}.txt", i), 8, MEMORY_ROOT_ID));
        }

        let pool = manager(&queue, &storage, pool_config(2, 2));
        let mut idle_rx = pool.idle_signals();
        pool.start_workers().await;

        let first = tokio::time::timeout(Duration::from_secs(5), idle_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.cycle, 1);
        assert_eq!(queue.get_files_by_status(FileStatus::Completed).len(), 3);

        // 保持空闲不应重复发信号
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(idle_rx.try_recv().is_err());

        queue.add_file(queued_file(dir.path(), "b.txt", 8, MEMORY_ROOT_ID));
        let second = tokio::time::timeout(Duration::from_secs(5), idle_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.cycle, 2);
        assert_eq!(queue.get_files_by_status(FileStatus::Completed).len(), 4);
        pool.stop_workers().await;
    }

    #[tokio::test]
    async fn test_stop_cancels_in_flight() {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(UploadQueue::new());
        let storage = Arc::new(
            MemoryStorage::new()
                .with_chunk_size(1)
                .with_chunk_delay(Duration::from_millis(20)),
        );
        for i in 0..4 {
            queue.add_file(queued_file(dir.path(), &format!("s{}.bin", i), 500, MEMORY_ROOT_ID));
        }

        let pool = manager(&queue, &storage, pool_config(1, 2));
        pool.start_workers().await;
        assert!(
            wait_until(Duration::from_secs(5), || {
                queue.get_files_by_status(FileStatus::InProgress).len() == 2
            })
            .await
        );

        pool.stop_workers().await;
        assert!(!pool.is_running());
        assert_eq!(queue.get_files_by_status(FileStatus::Cancelled).len(), 2);
        assert_eq!(queue.get_files_by_status(FileStatus::Pending).len(), 2);
        assert_eq!(pool.get_overall_statistics().total_active_files, 0);
        assert_eq!(storage.file_count(), 0);
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(UploadQueue::new());
        let storage = Arc::new(MemoryStorage::new());

        let pool = manager(&queue, &storage, pool_config(2, 2));
        pool.start_workers().await;
        pool.pause_workers();
        assert!(pool.is_paused());

        for i in 0..3 {
            queue.add_file(queued_file(dir.path(), &format!("p{}.txt", i), 8, MEMORY_ROOT_ID));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(queue.get_pending_count(), 3);

        pool.resume_workers();
        assert!(
            wait_until(Duration::from_secs(5), || {
                queue.get_files_by_status(FileStatus::Completed).len() == 3
            })
            .await
        );
        pool.stop_workers().await;
    }

    #[tokio::test]
    async fn test_restart_replaces_generation() {
        let queue = Arc::new(UploadQueue::new());
        let storage = Arc::new(MemoryStorage::new());
        let pool = manager(&queue, &storage, pool_config(3, 1));

        pool.start_workers().await;
        pool.start_workers().await;
        assert!(pool.is_running());

        let stats = pool.get_overall_statistics();
        assert_eq!(stats.total_workers, 3);
        let ids: Vec<_> = stats.workers.iter().map(|w| w.worker_id.clone()).collect();
        assert_eq!(ids, vec!["worker_1", "worker_2", "worker_3"]);

        pool.stop_workers().await;
        pool.stop_workers().await;
        assert!(!pool.is_running());
        assert!(pool.is_idle());
    }
}
