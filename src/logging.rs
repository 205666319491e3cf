//! 日志初始化
//!
//! 控制台始终输出；启用文件日志时另写入按大小滚动的文件
//! `unified-uploader.<启动时间>[_N].log`，启动时清理超过保留天数的文件

use crate::config::LogConfig;
use chrono::{Local, NaiveDate};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

const LOG_FILE_PREFIX: &str = "unified-uploader.";
const LOG_FILE_SUFFIX: &str = ".log";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// 按大小滚动的日志文件
struct RollingState {
    log_dir: PathBuf,
    /// 启动时间（YYYY-MM-DD-HHMMSS）
    started: String,
    index: u32,
    max_file_size: u64,
    written: u64,
    file: File,
}

impl RollingState {
    fn open(log_dir: PathBuf, started: String, index: u32, max_file_size: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_dir.join(log_file_name(&started, index)))?;
        Ok(Self {
            log_dir,
            started,
            index,
            max_file_size,
            written: 0,
            file,
        })
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.max_file_size {
            self.file.flush()?;
            *self = Self::open(
                self.log_dir.clone(),
                self.started.clone(),
                self.index + 1,
                self.max_file_size,
            )?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }
}

/// 可克隆的滚动文件写入器
#[derive(Clone)]
pub struct RollingFileWriter {
    state: Arc<Mutex<RollingState>>,
}

impl RollingFileWriter {
    pub fn new(log_dir: impl Into<PathBuf>, max_file_size: u64) -> io::Result<Self> {
        let started = Local::now().format("%Y-%m-%d-%H%M%S").to_string();
        let state = RollingState::open(log_dir.into(), started, 0, max_file_size.max(1))?;
        Ok(Self {
            state: Arc::new(Mutex::new(state)),
        })
    }

    /// 当前写入的文件
    pub fn current_path(&self) -> PathBuf {
        let state = self.state.lock();
        state.log_dir.join(log_file_name(&state.started, state.index))
    }
}

impl Write for RollingFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.state.lock().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.state.lock().file.flush()
    }
}

fn log_file_name(started: &str, index: u32) -> String {
    if index == 0 {
        format!("{}{}{}", LOG_FILE_PREFIX, started, LOG_FILE_SUFFIX)
    } else {
        format!("{}{}_{}{}", LOG_FILE_PREFIX, started, index, LOG_FILE_SUFFIX)
    }
}

/// 日志守卫，需要保持存活直到程序结束，否则文件日志会丢失
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// 初始化全局日志，`RUST_LOG` 优先于配置的级别
pub fn init_logging(config: &LogConfig) -> LogGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_timer(ChronoLocal::new(TIMESTAMP_FORMAT.to_string()))
        .with_ansi(true)
        .with_writer(io::stderr);

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = vec![console_layer.boxed()];
    let mut file_guard = None;
    let mut file_error = None;

    if config.enabled {
        match open_file_writer(config) {
            Ok(writer) => {
                let (non_blocking, guard) = tracing_appender::non_blocking(writer);
                layers.push(
                    fmt::layer()
                        .with_target(true)
                        .with_timer(ChronoLocal::new(TIMESTAMP_FORMAT.to_string()))
                        .with_ansi(false)
                        .with_writer(non_blocking)
                        .boxed(),
                );
                file_guard = Some(guard);
            }
            Err(e) => file_error = Some(e),
        }
    }

    // 测试中可能重复初始化，忽略已设置的全局订阅器
    let _ = tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .try_init();

    if let Some(e) = file_error {
        warn!("创建日志文件失败，仅输出到控制台: {:?}, 错误: {}", config.log_dir, e);
    }
    if file_guard.is_some() {
        info!(
            "日志系统初始化完成: 目录={:?}, 保留天数={}, 级别={}",
            config.log_dir, config.retention_days, config.level
        );
        let removed = cleanup_old_logs(&config.log_dir, config.retention_days, Local::now().date_naive());
        if removed > 0 {
            info!("已清理 {} 个过期日志文件", removed);
        }
    }

    LogGuard {
        _file_guard: file_guard,
    }
}

fn open_file_writer(config: &LogConfig) -> io::Result<RollingFileWriter> {
    fs::create_dir_all(&config.log_dir)?;
    RollingFileWriter::new(config.log_dir.clone(), config.max_file_size)
}

/// 删除启动日期早于 `today - retention_days` 的日志文件，返回删除数
pub fn cleanup_old_logs(log_dir: &Path, retention_days: u32, today: NaiveDate) -> usize {
    let entries = match fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("读取日志目录失败: {:?}, 错误: {}", log_dir, e);
            return 0;
        }
    };

    let retention = chrono::Duration::days(i64::from(retention_days));
    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(date) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(log_file_date)
        else {
            continue;
        };

        if today.signed_duration_since(date) > retention {
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!("删除过期日志文件失败: {:?}, 错误: {}", path, e),
            }
        }
    }
    removed
}

/// 从日志文件名中取出启动日期
fn log_file_date(file_name: &str) -> Option<NaiveDate> {
    let stem = file_name
        .strip_prefix(LOG_FILE_PREFIX)?
        .strip_suffix(LOG_FILE_SUFFIX)?;
    NaiveDate::parse_from_str(stem.get(..10)?, "%Y-%m-%d").ok()
}
