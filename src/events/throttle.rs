//! 进度更新节流器
//!
//! 上传进度回调每个分块触发一次，直接写队列会造成锁竞争，
//! 这里限制为每个文件大约每 500ms 更新一次

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// 默认节流间隔（毫秒）
pub const DEFAULT_THROTTLE_INTERVAL_MS: u64 = 500;

/// 尚未发布过的标记
const NEVER_EMITTED: u64 = u64::MAX;

/// 进度节流器
///
/// 线程安全，使用原子操作避免锁竞争。
/// 每次进度更新时调用 `should_emit()`，返回 true 时才写入队列
#[derive(Debug)]
pub struct ProgressThrottler {
    /// 计时起点
    epoch: Instant,
    /// 上次发布距起点的纳秒数
    last_emit_nanos: AtomicU64,
    /// 节流间隔（纳秒）
    interval_nanos: u64,
}

impl ProgressThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            epoch: Instant::now(),
            last_emit_nanos: AtomicU64::new(NEVER_EMITTED),
            interval_nanos: interval.as_nanos() as u64,
        }
    }

    pub fn with_millis(interval_ms: u64) -> Self {
        Self::new(Duration::from_millis(interval_ms))
    }

    /// 距上次发布超过间隔（或从未发布）时返回 true 并更新时间戳
    pub fn should_emit(&self) -> bool {
        let now = self.elapsed_nanos();
        let last = self.last_emit_nanos.load(Ordering::Relaxed);

        let due = last == NEVER_EMITTED || now.saturating_sub(last) >= self.interval_nanos;
        if !due {
            return false;
        }

        // 被其他线程抢先更新时本次不发布
        self.last_emit_nanos
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    /// 不检查间隔，直接记录一次发布
    pub fn force_emit(&self) -> bool {
        self.last_emit_nanos
            .store(self.elapsed_nanos(), Ordering::Relaxed);
        true
    }

    pub fn reset(&self) {
        self.last_emit_nanos.store(NEVER_EMITTED, Ordering::Relaxed);
    }

    fn elapsed_nanos(&self) -> u64 {
        // 不会达到 NEVER_EMITTED
        (self.epoch.elapsed().as_nanos() as u64).min(NEVER_EMITTED - 1)
    }
}

impl Default for ProgressThrottler {
    fn default() -> Self {
        Self::with_millis(DEFAULT_THROTTLE_INTERVAL_MS)
    }
}
