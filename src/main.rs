use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use unified_uploader::{
    config::AppConfig,
    logging,
    netdisk::{MEMORY_ROOT_ID, MIRROR_ROOT_ID},
    uploader::format_bytes,
    FileStatus, LocalMirrorStorage, MemoryStorage, QueueStatistics, RemoteClientFactory,
    ScanEvent, SessionEvent, UnifiedUploadManager, UploadEvent,
};

/// 有文件最终失败时的退出码
const EXIT_FAILED_FILES: u8 = 1;

#[derive(Parser)]
#[command(name = "unified-uploader")]
#[command(
    author,
    version,
    about = "Upload files and whole folder trees with a bounded pool of parallel workers"
)]
struct Cli {
    /// Config file (TOML)
    #[arg(short, long, env = "UNIFIED_UPLOADER_CONFIG", default_value = "config/uploader.toml")]
    config: String,

    /// Use a local directory as the remote side
    #[arg(long, conflicts_with = "dry_run")]
    mirror: Option<PathBuf>,

    /// Upload into an in-memory remote (nothing is written)
    #[arg(long)]
    dry_run: bool,

    /// Destination folder id on the remote
    #[arg(short, long)]
    dest: Option<String>,

    /// Number of workers (1-10)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Parallel files per worker (1-20)
    #[arg(short, long)]
    files_per_worker: Option<usize>,

    /// Print every event as a JSON line on stdout
    #[arg(long)]
    json: bool,

    /// Enable debug logging (RUST_LOG takes precedence)
    #[arg(short, long)]
    verbose: bool,

    /// Files and folders to upload
    #[arg(required = true)]
    paths: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let mut config = AppConfig::load_or_default(&cli.config).await;
    if cli.verbose {
        config.log.level = "debug".to_string();
    }
    let _log_guard = logging::init_logging(&config.log);

    info!("Unified Uploader v{} 启动中...", env!("CARGO_PKG_VERSION"));

    if let Some(workers) = cli.workers {
        config.upload.num_workers = workers;
    }
    if let Some(files_per_worker) = cli.files_per_worker {
        config.upload.files_per_worker = files_per_worker;
    }
    config.upload = config.upload.validated();

    let mirror_root = if cli.dry_run {
        None
    } else {
        cli.mirror.clone().or_else(|| config.remote.mirror_root.clone())
    };
    let (factory, default_destination): (Arc<dyn RemoteClientFactory>, &str) = match mirror_root {
        Some(root) => {
            let storage = LocalMirrorStorage::new(&root)
                .with_context(|| format!("无法打开镜像目录: {}", root.display()))?;
            info!("远程端: 本地镜像 {}", storage.root().display());
            (Arc::new(Arc::new(storage)), MIRROR_ROOT_ID)
        }
        None => {
            info!("远程端: 内存存储（演练模式）");
            (Arc::new(Arc::new(MemoryStorage::new())), MEMORY_ROOT_ID)
        }
    };
    let destination = cli
        .dest
        .clone()
        .or_else(|| config.remote.root_folder_id.clone())
        .unwrap_or_else(|| default_destination.to_string());

    let manager = UnifiedUploadManager::new(factory, config.upload.clone())?;
    let printer = tokio::spawn(print_events(manager.subscribe(), cli.json));

    let (folders, files): (Vec<PathBuf>, Vec<PathBuf>) =
        cli.paths.iter().cloned().partition(|p| p.is_dir());
    if !files.is_empty() {
        manager.add_files(&files, &destination).await;
    }
    match folders.len() {
        0 => {}
        1 => {
            manager.add_folder(&folders[0], &destination).await;
        }
        _ => {
            manager.add_folders(&folders, &destination).await;
        }
    }

    tokio::select! {
        _ = manager.wait_until_drained() => {}
        _ = tokio::signal::ctrl_c() => {
            warn!("收到 Ctrl+C，停止上传...");
        }
    }
    manager.stop_session().await;
    printer.abort();

    let stats = manager.get_queue_statistics();
    let failed = manager.get_files_by_status(FileStatus::Error);
    if cli.json {
        println!("{}", serde_json::to_string(&stats)?);
    } else {
        print_summary(&stats);
        for file in &failed {
            println!(
                "  ✗ {} : {}",
                file.file_path.display(),
                file.error_message.as_deref().unwrap_or("未知错误")
            );
        }
    }

    Ok(if failed.is_empty() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_FAILED_FILES)
    })
}

async fn print_events(mut rx: broadcast::Receiver<UploadEvent>, json: bool) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("事件输出落后，丢弃 {} 条事件", skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        if json {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!("事件序列化失败: {}", e),
            }
            continue;
        }

        match event {
            UploadEvent::Scan(ScanEvent::Started { folder_path }) => {
                println!("🔍 扫描文件夹: {}", folder_path)
            }
            UploadEvent::Scan(ScanEvent::Completed {
                folder_path,
                files_added,
                ..
            })
            | UploadEvent::Scan(ScanEvent::BatchFolderCompleted {
                folder_path,
                files_added,
                ..
            }) => println!("✓ 扫描完成: {} ({} 个文件)", folder_path, files_added),
            UploadEvent::Scan(ScanEvent::Failed { folder_path, error })
            | UploadEvent::Scan(ScanEvent::BatchFolderFailed {
                folder_path, error, ..
            }) => println!("✗ 扫描失败: {} : {}", folder_path, error),
            UploadEvent::Session(SessionEvent::Warning { message }) => println!("⚠ {}", message),
            UploadEvent::Statistics(stats) => {
                let queue = stats.queue;
                println!(
                    "  {}% | {}/{} 个文件 | {}/s",
                    queue.progress_percentage,
                    queue.processed(),
                    queue.total_files,
                    format_bytes(queue.active_speed as u64)
                );
            }
            _ => {}
        }
    }
}

fn print_summary(stats: &QueueStatistics) {
    println!();
    println!("上传结束:");
    println!("  完成: {}", stats.completed);
    println!("  跳过: {}", stats.skipped);
    println!("  失败: {}", stats.failed);
    println!("  取消: {}", stats.cancelled);
    println!("  未开始: {}", stats.pending);
    println!(
        "  已上传: {} / {}",
        format_bytes(stats.uploaded_size),
        format_bytes(stats.total_size)
    );
}
