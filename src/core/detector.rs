//! 变更检测 - 以内容指纹为准，不看修改时间
//!
//! 修改时间在不同文件系统、复制工具之间不可靠，宁可每个文件多读一遍。

use crate::core::fingerprint::fingerprint;
use crate::core::metadata::SyncRecord;
use crate::error::Result;
use std::path::Path;

/// 单个文件的检测结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    /// 当前内容指纹，上传成功后写入记录
    pub current_hash: String,
    pub dirty: bool,
}

/// 无记录、记录无指纹、或指纹不同都视为需要同步
pub fn is_dirty(current_hash: &str, record: Option<&SyncRecord>) -> bool {
    match record.and_then(|r| r.content_hash.as_deref()) {
        Some(stored) => stored != current_hash,
        None => true,
    }
}

pub struct ChangeDetector;

impl ChangeDetector {
    /// 计算指纹并与记录比较。文件在扫描后消失时返回 `NotFound`。
    pub async fn inspect(path: &Path, record: Option<&SyncRecord>) -> Result<Change> {
        let current_hash = fingerprint(path.to_path_buf()).await?;
        let dirty = is_dirty(&current_hash, record);
        Ok(Change {
            current_hash,
            dirty,
        })
    }

    pub async fn needs_sync(path: &Path, record: Option<&SyncRecord>) -> Result<bool> {
        Ok(Self::inspect(path, record).await?.dirty)
    }
}
