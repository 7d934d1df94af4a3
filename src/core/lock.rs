//! 每个文件夹一把锁，同一文件夹的同步、策略修改、恢复互斥
//!
//! 进程内用一张表挡住同一引擎的重复触发；跨引擎、跨进程靠文件夹里的
//! `.foldersync.json.lock` 上的建议锁（`flock` / `LockFileEx`）。锁文件不删除，
//! 扫描时与元数据文件一样被忽略。

use crate::core::metadata::METADATA_FILE_NAME;
use crate::error::{Result, SyncError};
use fs2::FileExt;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

/// 锁文件路径
pub fn lock_file_path(folder: &Path) -> PathBuf {
    folder.join(format!("{}.lock", METADATA_FILE_NAME))
}

#[derive(Debug, Clone, Default)]
pub struct FolderLocks {
    held: Arc<Mutex<HashSet<PathBuf>>>,
}

fn lock(held: &Mutex<HashSet<PathBuf>>) -> MutexGuard<'_, HashSet<PathBuf>> {
    held.lock().unwrap_or_else(|e| e.into_inner())
}

/// 同一文件夹的不同写法（相对路径、符号链接）映射到同一把锁
fn lock_key(folder: &Path) -> PathBuf {
    std::fs::canonicalize(folder).unwrap_or_else(|_| folder.to_path_buf())
}

/// 对锁文件加独占建议锁，已被其他持有者占用时返回 `AlreadyRunning`
pub fn lock_folder_file(folder: &Path) -> Result<File> {
    let path = lock_file_path(folder);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .map_err(|e| SyncError::from_io(folder, e))?;

    match file.try_lock_exclusive() {
        Ok(()) => Ok(file),
        Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
            debug!("锁文件已被占用: {:?}", path);
            Err(SyncError::AlreadyRunning(folder.to_path_buf()))
        }
        Err(e) => Err(SyncError::from_io(&path, e)),
    }
}

impl FolderLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// 尝试加锁，已被占用时返回 `AlreadyRunning`；文件夹不存在时返回 `NotFound`
    pub fn try_acquire(&self, folder: &Path) -> Result<FolderGuard> {
        let key = lock_key(folder);
        if !lock(&self.held).insert(key.clone()) {
            debug!("文件夹已被占用: {:?}", key);
            return Err(SyncError::AlreadyRunning(folder.to_path_buf()));
        }

        // 进程内的表项先登记，锁文件失败时由 guard 的 Drop 撤销
        let mut guard = FolderGuard {
            held: Some(self.held.clone()),
            key,
            file: None,
        };
        guard.file = Some(lock_folder_file(folder)?);
        Ok(guard)
    }

    /// 不经过进程内的表，只加文件锁；供没有引擎的命令行路径使用
    pub fn acquire_standalone(folder: &Path) -> Result<FolderGuard> {
        Ok(FolderGuard {
            held: None,
            key: lock_key(folder),
            file: Some(lock_folder_file(folder)?),
        })
    }

    pub fn is_locked(&self, folder: &Path) -> bool {
        lock(&self.held).contains(&lock_key(folder))
    }
}

/// 离开作用域时释放
#[derive(Debug)]
pub struct FolderGuard {
    held: Option<Arc<Mutex<HashSet<PathBuf>>>>,
    key: PathBuf,
    file: Option<File>,
}

impl Drop for FolderGuard {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = file.unlock() {
                warn!("释放锁文件失败: {:?} - {}", self.key, e);
            }
        }
        if let Some(held) = &self.held {
            lock(held).remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_fails_until_released() {
        let dir = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let locks = FolderLocks::new();

        let guard = locks.try_acquire(dir.path()).unwrap();
        assert!(matches!(
            locks.try_acquire(dir.path()),
            Err(SyncError::AlreadyRunning(_))
        ));
        assert!(locks.try_acquire(&dir.path().join(".")).is_err());
        // 其他文件夹互不影响
        assert!(locks.try_acquire(other.path()).is_ok());

        drop(guard);
        assert!(!locks.is_locked(dir.path()));
        assert!(locks.try_acquire(dir.path()).is_ok());
    }

    #[test]
    fn test_separate_registries_share_the_lock_file() {
        let dir = tempfile::tempdir().unwrap();
        let first = FolderLocks::new();
        let second = FolderLocks::new();

        let guard = first.try_acquire(dir.path()).unwrap();
        assert!(lock_file_path(dir.path()).exists());
        assert!(matches!(
            second.try_acquire(dir.path()),
            Err(SyncError::AlreadyRunning(_))
        ));
        assert!(matches!(
            FolderLocks::acquire_standalone(dir.path()),
            Err(SyncError::AlreadyRunning(_))
        ));
        // 文件锁失败不能把第二张表的表项留下
        assert!(!second.is_locked(dir.path()));

        drop(guard);
        let standalone = FolderLocks::acquire_standalone(dir.path()).unwrap();
        assert!(second.try_acquire(dir.path()).is_err());
        drop(standalone);
        assert!(second.try_acquire(dir.path()).is_ok());
    }

    #[test]
    fn test_missing_folder_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let locks = FolderLocks::new();
        let missing = dir.path().join("gone");

        assert!(matches!(
            locks.try_acquire(&missing),
            Err(SyncError::NotFound(_))
        ));
        assert!(!locks.is_locked(&missing));
    }
}
