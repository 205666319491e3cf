// 远程存储抽象
//
// 上传核心只依赖这里的 trait，不关心具体的网络协议、鉴权和分页

use super::types::{RemoteEntry, RemoteError};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

/// 流式上传的分块大小（1MB）
pub const UPLOAD_CHUNK_SIZE: u64 = 1024 * 1024;

/// 上传进度回调
///
/// 参数为 (已发送字节数, 总字节数)，返回 false 表示请求中止传输
pub type ProgressCallback<'a> = &'a (dyn Fn(u64, u64) -> bool + Send + Sync);

/// 远程存储客户端
#[async_trait]
pub trait RemoteStorage: Send + Sync {
    /// 列出文件夹下的直接子条目
    async fn list(&self, folder_id: &str) -> Result<Vec<RemoteEntry>, RemoteError>;

    /// 在父文件夹下创建文件夹，返回新文件夹的标识符
    async fn create_folder(&self, name: &str, parent_id: &str) -> Result<String, RemoteError>;

    /// 上传本地文件到父文件夹，返回远程文件标识符
    ///
    /// 每写完一个分块调用一次 `progress`，回调返回 false 时必须以
    /// `RemoteError::Cancelled` 结束
    async fn upload(
        &self,
        local_path: &Path,
        parent_id: &str,
        progress: ProgressCallback<'_>,
    ) -> Result<String, RemoteError>;
}

/// 共享的客户端句柄
pub type RemoteClient = Arc<dyn RemoteStorage>;

/// 客户端工厂，工作者按需从这里创建连接
pub trait RemoteClientFactory: Send + Sync {
    fn connect(&self) -> Result<RemoteClient, RemoteError>;
}

/// 共享状态的后端直接把自身的克隆作为客户端
impl<T: RemoteStorage + 'static> RemoteClientFactory for Arc<T> {
    fn connect(&self) -> Result<RemoteClient, RemoteError> {
        Ok(self.clone() as RemoteClient)
    }
}
