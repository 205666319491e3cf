//! 本地镜像存储
//!
//! 把一个本地目录当作远程存储使用，文件夹标识符为相对根目录的路径（根为 "/"）

use super::storage::{ProgressCallback, RemoteStorage, UPLOAD_CHUNK_SIZE};
use super::types::{RemoteEntry, RemoteError};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

/// 镜像根目录的标识符
pub const MIRROR_ROOT_ID: &str = "/";

/// 上传中临时文件的后缀
const PARTIAL_SUFFIX: &str = ".partial";

#[derive(Debug, Clone)]
pub struct LocalMirrorStorage {
    root: PathBuf,
    chunk_size: u64,
}

impl LocalMirrorStorage {
    /// 创建镜像存储，根目录不存在时自动创建
    pub fn new(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root: dunce::canonicalize(&root)?,
            chunk_size: UPLOAD_CHUNK_SIZE,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 将标识符解析为根目录下的路径，拒绝任何越界的形式
    fn resolve(&self, id: &str) -> Result<PathBuf, RemoteError> {
        let relative = id
            .strip_prefix('/')
            .ok_or_else(|| RemoteError::InvalidId(id.to_string()))?;

        let mut path = self.root.clone();
        for component in Path::new(relative).components() {
            match component {
                Component::Normal(part) => path.push(part),
                _ => return Err(RemoteError::InvalidId(id.to_string())),
            }
        }
        Ok(path)
    }

    fn child_id(parent_id: &str, name: &str) -> String {
        if parent_id == MIRROR_ROOT_ID {
            format!("/{}", name)
        } else {
            format!("{}/{}", parent_id.trim_end_matches('/'), name)
        }
    }

    fn validate_name(name: &str) -> Result<(), RemoteError> {
        if name.is_empty()
            || name == "."
            || name == ".."
            || name.contains('/')
            || name.contains('\\')
        {
            return Err(RemoteError::InvalidId(name.to_string()));
        }
        Ok(())
    }

    async fn ensure_dir(path: &Path, id: &str) -> Result<(), RemoteError> {
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(RemoteError::NotFound(id.to_string())),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(RemoteError::NotFound(id.to_string())),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl RemoteStorage for LocalMirrorStorage {
    async fn list(&self, folder_id: &str) -> Result<Vec<RemoteEntry>, RemoteError> {
        let dir = self.resolve(folder_id)?;
        Self::ensure_dir(&dir, folder_id).await?;

        let mut entries = Vec::new();
        let mut read_dir = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(PARTIAL_SUFFIX) {
                continue;
            }
            let meta = match entry.metadata().await {
                Ok(meta) => meta,
                Err(e) => {
                    warn!("读取镜像条目失败: {:?}, 错误: {}", entry.path(), e);
                    continue;
                }
            };
            let id = Self::child_id(folder_id, &name);
            if meta.is_dir() {
                entries.push(RemoteEntry::folder(name, id));
            } else {
                entries.push(RemoteEntry::file(name, id, meta.len()));
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn create_folder(&self, name: &str, parent_id: &str) -> Result<String, RemoteError> {
        Self::validate_name(name)?;
        let parent = self.resolve(parent_id)?;
        Self::ensure_dir(&parent, parent_id).await?;

        let path = parent.join(name);
        match tokio::fs::create_dir(&path).await {
            Ok(()) => {}
            // 镜像目录无法保存同名文件夹，直接复用
            Err(e) if e.kind() == ErrorKind::AlreadyExists && path.is_dir() => {}
            Err(e) => return Err(e.into()),
        }
        Ok(Self::child_id(parent_id, name))
    }

    async fn upload(
        &self,
        local_path: &Path,
        parent_id: &str,
        progress: ProgressCallback<'_>,
    ) -> Result<String, RemoteError> {
        let name = local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| RemoteError::InvalidId(local_path.display().to_string()))?;
        Self::validate_name(&name)?;

        let parent = self.resolve(parent_id)?;
        Self::ensure_dir(&parent, parent_id).await?;

        let mut source = tokio::fs::File::open(local_path).await?;
        let total = source.metadata().await?.len();

        let target = parent.join(&name);
        let partial = parent.join(format!(".{}{}", name, PARTIAL_SUFFIX));
        let mut sink = tokio::fs::File::create(&partial).await?;

        let mut buffer = vec![0u8; self.chunk_size as usize];
        let mut sent = 0u64;
        let copied: Result<(), RemoteError> = async {
            if !progress(0, total) {
                return Err(RemoteError::Cancelled);
            }
            loop {
                let n = source.read(&mut buffer).await?;
                if n == 0 {
                    break;
                }
                sink.write_all(&buffer[..n]).await?;
                sent += n as u64;
                if !progress(sent, total) {
                    return Err(RemoteError::Cancelled);
                }
            }
            sink.flush().await?;
            Ok(())
        }
        .await;

        drop(sink);
        if let Err(e) = copied {
            if let Err(remove_err) = tokio::fs::remove_file(&partial).await {
                warn!("清理临时文件失败: {:?}, 错误: {}", partial, remove_err);
            }
            return Err(e);
        }

        tokio::fs::rename(&partial, &target).await?;
        debug!("镜像上传完成: {:?} -> {:?} ({} bytes)", local_path, target, sent);
        Ok(Self::child_id(parent_id, &name))
    }
}
