//! 错误分类
//!
//! 单文件错误（`NotFound`、`TransientIo`、`PermissionDenied`）只会进入 `SyncResult.errors`，
//! 不会中断同步；整轮错误（`Offline`、`AlreadyRunning`）在触碰任何文件之前返回。

use crate::storage::StorageError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    /// 扫描过程中文件消失，调用方应当跳过而不是报错
    #[error("文件不存在: {0}")]
    NotFound(PathBuf),

    #[error("元数据文件损坏: {path}: {reason}")]
    CorruptMetadata { path: PathBuf, reason: String },

    /// 重试耗尽后的存储错误
    #[error("存储操作失败 (已尝试 {attempts} 次): {source}")]
    TransientIo {
        attempts: u32,
        #[source]
        source: StorageError,
    },

    #[error("权限不足: {0}")]
    PermissionDenied(PathBuf),

    #[error("无法连接对象存储: {0}")]
    Offline(String),

    #[error("文件夹正在同步中: {0}")]
    AlreadyRunning(PathBuf),

    /// 相对路径包含 `..`、根目录等，会落到文件夹之外
    #[error("无效的相对路径: {0}")]
    InvalidPath(String),

    #[error("操作已取消")]
    Cancelled,

    #[error("IO 错误: {0}")]
    Io(#[from] io::Error),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SyncError {
    /// 按路径归类本地 IO 错误
    pub fn from_io(path: impl Into<PathBuf>, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => SyncError::NotFound(path.into()),
            io::ErrorKind::PermissionDenied => SyncError::PermissionDenied(path.into()),
            _ => SyncError::Io(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
