use super::{
    temp_path, ObjectStore, RemoteObject, StorageError, TransferProgress, TRANSFER_CHUNK_SIZE,
};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use walkdir::WalkDir;

/// 以本地目录充当存储桶（NAS 挂载、离线测试）
pub struct LocalObjectStore {
    base_path: PathBuf,
    name: String,
}

impl LocalObjectStore {
    pub fn new(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let base_path = path.as_ref().to_path_buf();
        if !base_path.exists() {
            std::fs::create_dir_all(&base_path)?;
        }
        let name = format!("local:{}", base_path.display());
        Ok(Self { base_path, name })
    }

    fn resolve_key(&self, key: &str) -> PathBuf {
        let key = key.trim_start_matches('/').trim_start_matches('\\');
        let mut path = self.base_path.clone();
        for part in key.split('/').filter(|p| !p.is_empty() && *p != "." && *p != "..") {
            path.push(part);
        }
        path
    }

    /// 规范化路径分隔符（统一使用 /）
    fn normalize_key(path: &Path) -> Option<String> {
        Some(path.to_str()?.replace('\\', "/"))
    }

    async fn copy_file(
        from: &Path,
        to: &Path,
        on_progress: TransferProgress<'_>,
    ) -> Result<(), StorageError> {
        let mut src = fs::File::open(from).await?;
        let total = src.metadata().await?.len();

        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent).await?;
        }

        // 使用临时文件写入，然后原子重命名
        let temp_path = temp_path(to);
        let result = async {
            let mut dst = fs::File::create(&temp_path).await?;
            let mut buf = vec![0u8; TRANSFER_CHUNK_SIZE];
            let mut sent = 0u64;
            loop {
                let n = src.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                dst.write_all(&buf[..n]).await?;
                sent += n as u64;
                on_progress(sent, total);
            }
            dst.sync_all().await?;
            fs::rename(&temp_path, to).await
        }
        .await;

        if let Err(e) = result {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(
        &self,
        local_path: &Path,
        remote_key: &str,
        on_progress: TransferProgress<'_>,
    ) -> Result<(), StorageError> {
        Self::copy_file(local_path, &self.resolve_key(remote_key), on_progress).await
    }

    async fn get(&self, remote_key: &str, local_path: &Path) -> Result<(), StorageError> {
        let source = self.resolve_key(remote_key);
        if !source.is_file() {
            return Err(StorageError::NotFound(remote_key.to_string()));
        }
        Self::copy_file(&source, local_path, &|_: u64, _: u64| {}).await
    }

    async fn delete(&self, remote_key: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.resolve_key(remote_key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_by_prefix(
        &self,
        prefix: &str,
    ) -> Result<BoxStream<'static, Result<RemoteObject, StorageError>>, StorageError> {
        let base_path = self.base_path.clone();
        let prefix = prefix.trim_start_matches('/').to_string();

        // 使用 spawn_blocking 避免阻塞 async runtime
        let objects: Vec<RemoteObject> = tokio::task::spawn_blocking(move || {
            WalkDir::new(&base_path)
                .follow_links(false)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .filter_map(|entry| {
                    let metadata = entry.metadata().ok()?;
                    let relative = entry.path().strip_prefix(&base_path).ok()?;
                    let key = Self::normalize_key(relative)?;
                    if !key.starts_with(&prefix) || key.ends_with(".tmp") {
                        return None;
                    }
                    let modified = metadata
                        .modified()
                        .ok()?
                        .duration_since(std::time::UNIX_EPOCH)
                        .ok()?
                        .as_secs() as i64;
                    Some(RemoteObject {
                        key,
                        size: metadata.len(),
                        modified_time: modified,
                    })
                })
                .collect()
        })
        .await
        .map_err(|e| StorageError::Transient(e.to_string()))?;

        Ok(futures::stream::iter(objects.into_iter().map(Ok)).boxed())
    }

    async fn ping(&self) -> Result<(), StorageError> {
        if fs::metadata(&self.base_path).await.is_ok_and(|m| m.is_dir()) {
            Ok(())
        } else {
            Err(StorageError::Transient(format!(
                "存储目录不可访问: {}",
                self.base_path.display()
            )))
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}
