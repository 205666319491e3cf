// 测试辅助函数

use super::task::QueuedFile;
use std::path::Path;
use std::time::{Duration, Instant};

/// 轮询等待条件成立，超时返回 false
pub(crate) async fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut condition: F) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// 在目录下写入一个文件并构建对应的 QueuedFile（源文件夹为该目录）
pub(crate) fn queued_file(dir: &Path, name: &str, size: usize, destination_id: &str) -> QueuedFile {
    let path = dir.join(name);
    std::fs::write(&path, vec![b'x'; size]).unwrap();
    QueuedFile::new(
        path,
        name,
        size as u64,
        dir.to_string_lossy(),
        "",
        destination_id,
    )
}
