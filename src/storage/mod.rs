pub mod local;
pub mod s3;

use crate::config::{StorageProfile, StorageType};
use crate::secrets::Credentials;
use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

pub use local::LocalObjectStore;
pub use s3::S3ObjectStore;

// ============ 公共常量 ============

/// 非 IO 操作超时（秒）- stat, delete 等
pub const OP_TIMEOUT_SECS: u64 = 60;
/// IO 操作超时（秒）- read, write 等
pub const IO_TIMEOUT_SECS: u64 = 300;
/// 上传时每次读取的块大小，同时决定进度回调的粒度
pub const TRANSFER_CHUNK_SIZE: usize = 1024 * 1024;

/// 对象存储错误
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("网络或服务错误: {0}")]
    Transient(String),

    #[error("认证失败: {0}")]
    Unauthorized(String),

    #[error("对象不存在: {0}")]
    NotFound(String),

    #[error("本地文件错误: {0}")]
    Io(#[from] io::Error),
}

/// 错误类别，供重试策略判断
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    Transient,
    Unauthorized,
    NotFound,
    Io,
}

impl StorageError {
    pub fn kind(&self) -> StorageErrorKind {
        match self {
            StorageError::Transient(_) => StorageErrorKind::Transient,
            StorageError::Unauthorized(_) => StorageErrorKind::Unauthorized,
            StorageError::NotFound(_) => StorageErrorKind::NotFound,
            StorageError::Io(_) => StorageErrorKind::Io,
        }
    }

    /// 本地文件或目录不存在，重试也不会成功
    pub fn is_local_not_found(&self) -> bool {
        matches!(self, StorageError::Io(e) if e.kind() == io::ErrorKind::NotFound)
    }
}

/// 同目录下的临时文件名 `<name>.<uuid>.tmp`，写完后重命名到目标
pub(crate) fn temp_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!("{}.{}.tmp", name, uuid::Uuid::new_v4().simple()))
}

impl From<opendal::Error> for StorageError {
    fn from(e: opendal::Error) -> Self {
        match e.kind() {
            opendal::ErrorKind::NotFound => StorageError::NotFound(e.to_string()),
            opendal::ErrorKind::PermissionDenied | opendal::ErrorKind::ConfigInvalid => {
                StorageError::Unauthorized(e.to_string())
            }
            _ => StorageError::Transient(e.to_string()),
        }
    }
}

/// `listByPrefix` 返回的远程对象
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteObject {
    pub key: String,
    pub size: u64,
    pub modified_time: i64,
}

/// 上传进度回调：(已传输字节, 总字节)
pub type TransferProgress<'a> = &'a (dyn Fn(u64, u64) + Send + Sync);

/// 对象存储能力。远程 key 即文件相对路径（`/` 分隔）。
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// 上传本地文件，按块读取，内存占用与文件大小无关
    async fn put(
        &self,
        local_path: &Path,
        remote_key: &str,
        on_progress: TransferProgress<'_>,
    ) -> Result<(), StorageError>;

    /// 下载对象到本地路径（先写临时文件再重命名）
    async fn get(&self, remote_key: &str, local_path: &Path) -> Result<(), StorageError>;

    /// 删除对象，不存在时视为成功
    async fn delete(&self, remote_key: &str) -> Result<(), StorageError>;

    /// 递归列出前缀下的所有对象
    async fn list_by_prefix(
        &self,
        prefix: &str,
    ) -> Result<BoxStream<'static, Result<RemoteObject, StorageError>>, StorageError>;

    /// 连通性检查，每轮同步开始前调用一次
    async fn ping(&self) -> Result<(), StorageError>;

    /// 获取存储名称（用于日志）
    fn name(&self) -> &str;
}

/// 根据配置创建存储实例
pub async fn create_object_store(
    profile: &StorageProfile,
    credentials: Option<&Credentials>,
) -> Result<Arc<dyn ObjectStore>> {
    match profile.typ {
        StorageType::Local => {
            let path = profile
                .path
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("Local storage requires path"))?;
            tracing::info!("初始化本地存储: {}", path);
            Ok(Arc::new(LocalObjectStore::new(path)?) as Arc<dyn ObjectStore>)
        }
        StorageType::S3 => {
            let bucket = profile
                .bucket
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("S3 storage requires bucket"))?;
            let region = profile
                .region
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("S3 storage requires region"))?;
            let credentials = credentials
                .ok_or_else(|| anyhow::anyhow!("S3 storage requires credentials"))?;
            tracing::info!("初始化S3存储: bucket={}, region={}", bucket, region);
            Ok(Arc::new(S3ObjectStore::new(
                bucket,
                region,
                credentials,
                profile.endpoint.clone(),
                profile.prefix.clone(),
            )?) as Arc<dyn ObjectStore>)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opendal_error_mapping() {
        let nf = opendal::Error::new(opendal::ErrorKind::NotFound, "missing");
        assert_eq!(StorageError::from(nf).kind(), StorageErrorKind::NotFound);

        let denied = opendal::Error::new(opendal::ErrorKind::PermissionDenied, "denied");
        assert_eq!(StorageError::from(denied).kind(), StorageErrorKind::Unauthorized);

        let other = opendal::Error::new(opendal::ErrorKind::Unexpected, "503");
        assert_eq!(StorageError::from(other).kind(), StorageErrorKind::Transient);
    }

    #[test]
    fn test_local_not_found() {
        assert!(StorageError::Io(io::Error::from(io::ErrorKind::NotFound)).is_local_not_found());
        assert!(!StorageError::Io(io::Error::from(io::ErrorKind::Interrupted)).is_local_not_found());
        assert!(!StorageError::NotFound("key".into()).is_local_not_found());
    }

    #[test]
    fn test_temp_path_keeps_directory_and_name() {
        let target = Path::new("photos/2024/report.pdf");
        let first = temp_path(target);
        let second = temp_path(target);

        assert_eq!(first.parent(), target.parent());
        let name = first.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("report.pdf."));
        assert!(name.ends_with(".tmp"));
        // 并发下载同一文件时互不覆盖
        assert_ne!(first, second);
    }
}
