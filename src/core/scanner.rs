//! 文件夹快照 - 每轮同步重新从文件系统读取，不持久化

use crate::config::ScanConfig;
use crate::core::metadata::{is_metadata_file, record_key};
use crate::error::{Result, SyncError};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// 快照条目
#[derive(Debug, Clone)]
pub struct SnapshotEntry {
    /// 相对路径（`/` 分隔），也是远程 key
    pub path: String,
    pub abs_path: PathBuf,
    pub is_dir: bool,
    pub size: u64,
    pub modified_time: i64,
}

/// 深度优先顺序的文件树
#[derive(Debug, Clone, Default)]
pub struct FolderSnapshot {
    pub entries: Vec<SnapshotEntry>,
}

impl FolderSnapshot {
    pub fn files(&self) -> impl Iterator<Item = &SnapshotEntry> {
        self.entries.iter().filter(|e| !e.is_dir)
    }

    pub fn file_count(&self) -> usize {
        self.files().count()
    }
}

/// 简单的 glob 规则：`**` 前后缀、`*` 通配、精确或末级匹配
#[derive(Debug, Clone)]
enum IgnoreRule {
    Subtree { prefix: String, suffix: String },
    Wildcard(Regex),
    Exact(String),
}

impl IgnoreRule {
    fn parse(pattern: &str) -> Option<Self> {
        let pattern = pattern.to_lowercase();

        if let Some((prefix, suffix)) = pattern.split_once("**") {
            return Some(IgnoreRule::Subtree {
                prefix: prefix.trim_end_matches('/').to_string(),
                suffix: suffix.trim_start_matches('/').to_string(),
            });
        }

        if pattern.contains('*') {
            let regex_pattern = regex::escape(&pattern).replace("\\*", "[^/]*");
            return match Regex::new(&format!("(^|/){}$", regex_pattern)) {
                Ok(re) => Some(IgnoreRule::Wildcard(re)),
                Err(e) => {
                    warn!("忽略规则无效: {} ({})", pattern, e);
                    None
                }
            };
        }

        Some(IgnoreRule::Exact(pattern))
    }

    fn matches(&self, path: &str) -> bool {
        let path = path.to_lowercase();
        match self {
            IgnoreRule::Subtree { prefix, suffix } => {
                (prefix.is_empty() || path == *prefix || path.starts_with(&format!("{}/", prefix)))
                    && (suffix.is_empty() || path.ends_with(suffix.as_str()))
            }
            IgnoreRule::Wildcard(re) => re.is_match(&path),
            IgnoreRule::Exact(exact) => path == *exact || path.ends_with(&format!("/{}", exact)),
        }
    }
}

/// 文件夹扫描器
pub struct FolderScanner {
    rules: Vec<IgnoreRule>,
    cancel_flag: Option<Arc<AtomicBool>>,
}

impl FolderScanner {
    pub fn new(config: &ScanConfig) -> Self {
        Self {
            rules: config
                .ignore_patterns
                .iter()
                .filter_map(|p| IgnoreRule::parse(p))
                .collect(),
            cancel_flag: None,
        }
    }

    pub fn with_cancel(mut self, cancel_flag: Arc<AtomicBool>) -> Self {
        self.cancel_flag = Some(cancel_flag);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel_flag
            .as_ref()
            .is_some_and(|f| f.load(Ordering::Relaxed))
    }

    /// 检查路径是否应该被忽略
    pub fn should_ignore(&self, path: &str) -> bool {
        let name = path.rsplit('/').next().unwrap_or(path);
        is_metadata_file(name) || self.rules.iter().any(|r| r.matches(path))
    }

    /// 同步扫描；调用方负责放到阻塞线程
    pub fn scan_blocking(&self, root: &Path) -> Result<FolderSnapshot> {
        if !root.is_dir() {
            return Err(SyncError::NotFound(root.to_path_buf()));
        }

        let mut entries = Vec::new();
        let mut ignored = 0usize;

        let walker = WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .min_depth(1)
            .into_iter()
            .filter_entry(|entry| {
                let keep = entry
                    .path()
                    .strip_prefix(root)
                    .map(|rel| !self.should_ignore(&record_key(rel)))
                    .unwrap_or(true);
                if !keep {
                    ignored += 1;
                }
                keep
            });

        for item in walker {
            // 每处理一定数量检查一次取消状态
            if entries.len() % 100 == 0 && self.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            let entry = match item {
                Ok(e) => e,
                Err(e) => {
                    warn!("扫描时跳过不可读条目: {}", e);
                    continue;
                }
            };
            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    debug!("读取元信息失败，跳过: {:?} ({})", entry.path(), e);
                    continue;
                }
            };
            // 符号链接既不是普通文件也不是目录，不参与同步
            if !metadata.is_file() && !metadata.is_dir() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(root) else {
                continue;
            };

            let modified_time = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map_or(0, |d| d.as_secs() as i64);

            entries.push(SnapshotEntry {
                path: record_key(relative),
                abs_path: entry.path().to_path_buf(),
                is_dir: metadata.is_dir(),
                size: if metadata.is_dir() { 0 } else { metadata.len() },
                modified_time,
            });
        }

        let snapshot = FolderSnapshot { entries };
        info!(
            "扫描完成: {} 个文件, {} 个目录, {} 个被忽略",
            snapshot.file_count(),
            snapshot.entries.len() - snapshot.file_count(),
            ignored
        );
        Ok(snapshot)
    }

    /// 在阻塞线程池中扫描
    pub async fn scan(self, root: PathBuf) -> Result<FolderSnapshot> {
        tokio::task::spawn_blocking(move || self.scan_blocking(&root))
            .await
            .map_err(|e| SyncError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::metadata::METADATA_FILE_NAME;
    use std::fs;

    fn scanner(patterns: &[&str]) -> FolderScanner {
        FolderScanner::new(&ScanConfig {
            ignore_patterns: patterns.iter().map(|s| s.to_string()).collect(),
        })
    }

    #[test]
    fn test_snapshot_is_depth_first_and_skips_metadata() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a/sub")).unwrap();
        fs::write(dir.path().join("a/sub/x.txt"), b"x").unwrap();
        fs::write(dir.path().join("a/y.txt"), b"yy").unwrap();
        fs::write(dir.path().join("b.txt"), b"b").unwrap();
        fs::write(dir.path().join(METADATA_FILE_NAME), b"{}").unwrap();

        let snapshot = scanner(&[]).scan_blocking(dir.path()).unwrap();
        let paths: Vec<&str> = snapshot.entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["a", "a/sub", "a/sub/x.txt", "a/y.txt", "b.txt"]);
        assert_eq!(snapshot.file_count(), 3);

        let y = snapshot.entries.iter().find(|e| e.path == "a/y.txt").unwrap();
        assert_eq!(y.size, 2);
        assert!(!y.is_dir);
    }

    #[test]
    fn test_ignore_rules() {
        let s = scanner(&[".git/**", "*.tmp", "Thumbs.db"]);
        assert!(s.should_ignore(".git"));
        assert!(s.should_ignore(".git/config"));
        assert!(s.should_ignore("notes.tmp"));
        assert!(s.should_ignore("deep/dir/notes.TMP"));
        assert!(s.should_ignore("pics/thumbs.db"));
        assert!(!s.should_ignore("notes.txt"));
        assert!(!s.should_ignore(".github/workflow.yml"));
        assert!(s.should_ignore(".foldersync.json"));
    }

    #[test]
    fn test_ignored_directory_subtree_is_pruned() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join(".git/objects")).unwrap();
        fs::write(dir.path().join(".git/objects/1"), b"1").unwrap();
        fs::write(dir.path().join("keep.txt"), b"k").unwrap();

        let snapshot = scanner(&[".git/**"]).scan_blocking(dir.path()).unwrap();
        let paths: Vec<&str> = snapshot.entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["keep.txt"]);
    }

    #[test]
    fn test_cancelled_scan() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a"), b"a").unwrap();
        let flag = Arc::new(AtomicBool::new(true));
        let result = scanner(&[]).with_cancel(flag).scan_blocking(dir.path());
        assert!(matches!(result, Err(SyncError::Cancelled)));
    }

    #[test]
    fn test_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        let result = scanner(&[]).scan_blocking(&dir.path().join("nope"));
        assert!(matches!(result, Err(SyncError::NotFound(_))));
    }
}
