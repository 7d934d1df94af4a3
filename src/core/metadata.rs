//! 同步元数据 - 每个监视文件夹一个隐藏 JSON 文件
//!
//! 文件内容是 `相对路径 -> 记录` 的对象。记录可以是旧版的纯策略字符串
//! （`"both"` / `"object_storage_only"` / `"no_sync"`），也可以是当前的
//! `{policy, hash, timestamp, state}` 对象；读取时两种都接受，写入时只写后者。
//! 每次修改立即原子落盘（临时文件 + fsync + rename）。

use crate::error::{Result, SyncError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// 元数据文件名（点开头，普通列表不可见）
pub const METADATA_FILE_NAME: &str = ".foldersync.json";

/// 同步策略
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPolicy {
    /// 本地和远程都保留
    #[default]
    #[serde(alias = "both")]
    Mirrored,
    /// 上传后删除本地副本
    #[serde(alias = "object_storage_only")]
    RemoteOnly,
    /// 从不同步；作用于目录时向下覆盖所有子项
    #[serde(alias = "no_sync")]
    Excluded,
}

impl SyncPolicy {
    /// 三态切换顺序：Mirrored -> RemoteOnly -> Excluded -> Mirrored
    pub fn next(self) -> Self {
        match self {
            SyncPolicy::Mirrored => SyncPolicy::RemoteOnly,
            SyncPolicy::RemoteOnly => SyncPolicy::Excluded,
            SyncPolicy::Excluded => SyncPolicy::Mirrored,
        }
    }
}

impl std::fmt::Display for SyncPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncPolicy::Mirrored => write!(f, "mirrored"),
            SyncPolicy::RemoteOnly => write!(f, "remote_only"),
            SyncPolicy::Excluded => write!(f, "excluded"),
        }
    }
}

impl std::str::FromStr for SyncPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "mirrored" | "both" => Ok(SyncPolicy::Mirrored),
            "remote_only" | "object_storage_only" => Ok(SyncPolicy::RemoteOnly),
            "excluded" | "no_sync" => Ok(SyncPolicy::Excluded),
            other => Err(format!("无效的同步策略: {}", other)),
        }
    }
}

/// 上一次成功同步后文件所处的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecordState {
    /// 已上传，本地副本保留
    Synced,
    /// RemoteOnly：已上传，本地删除尚未完成
    AwaitingLocalDelete,
    /// RemoteOnly：已上传且本地副本已删除
    LocalRemoved,
}

/// 单个路径的同步记录
#[derive(Debug, Clone, PartialEq)]
pub struct SyncRecord {
    pub path: String,
    pub policy: SyncPolicy,
    /// 上次成功同步时的内容指纹
    pub content_hash: Option<String>,
    pub synced_at: Option<DateTime<Utc>>,
    pub state: Option<RecordState>,
}

impl SyncRecord {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            policy: SyncPolicy::default(),
            content_hash: None,
            synced_at: None,
            state: None,
        }
    }

    /// 记录一次成功上传
    pub fn mark_uploaded(&mut self, hash: String, state: RecordState) {
        self.content_hash = Some(hash);
        self.synced_at = Some(Utc::now());
        self.state = Some(state);
    }
}

/// 当前磁盘格式
#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    #[serde(default)]
    policy: SyncPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    hash: Option<String>,
    /// Unix 秒（可带小数）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timestamp: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    state: Option<RecordState>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StoredEntry {
    Legacy(SyncPolicy),
    Current(StoredRecord),
}

impl StoredEntry {
    fn into_record(self, path: String) -> SyncRecord {
        match self {
            StoredEntry::Legacy(policy) => SyncRecord {
                policy,
                ..SyncRecord::new(path)
            },
            StoredEntry::Current(stored) => SyncRecord {
                path,
                policy: stored.policy,
                content_hash: stored.hash,
                synced_at: stored
                    .timestamp
                    .and_then(|t| DateTime::from_timestamp_millis((t * 1000.0).round() as i64)),
                state: stored.state,
            },
        }
    }
}

impl From<&SyncRecord> for StoredRecord {
    fn from(record: &SyncRecord) -> Self {
        StoredRecord {
            policy: record.policy,
            hash: record.content_hash.clone(),
            timestamp: record
                .synced_at
                .map(|t| t.timestamp_millis() as f64 / 1000.0),
            state: record.state,
        }
    }
}

pub type RecordMap = BTreeMap<String, SyncRecord>;

/// 把相对路径转为记录键（统一使用 /）
pub fn record_key(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// 是否是元数据文件本身或其临时文件
pub fn is_metadata_file(name: &str) -> bool {
    name == METADATA_FILE_NAME || name.starts_with(&format!("{}.", METADATA_FILE_NAME))
}

/// 单个文件夹的元数据存储
#[derive(Debug)]
pub struct MetadataStore {
    folder: PathBuf,
    records: RecordMap,
}

impl MetadataStore {
    pub fn metadata_path(folder: &Path) -> PathBuf {
        folder.join(METADATA_FILE_NAME)
    }

    /// 读取元数据文件。文件不存在返回空表；存在但无法解析返回 `CorruptMetadata`。
    pub fn load(folder: &Path) -> Result<RecordMap> {
        let path = Self::metadata_path(folder);
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(RecordMap::new()),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                return Err(SyncError::CorruptMetadata {
                    path,
                    reason: e.to_string(),
                })
            }
            Err(e) => return Err(SyncError::from_io(&path, e)),
        };

        let entries: BTreeMap<String, StoredEntry> =
            serde_json::from_str(&content).map_err(|e| SyncError::CorruptMetadata {
                path: path.clone(),
                reason: e.to_string(),
            })?;

        Ok(entries
            .into_iter()
            .map(|(key, entry)| {
                let record = entry.into_record(key.clone());
                (key, record)
            })
            .collect())
    }

    /// 原子写入：临时文件 -> fsync -> rename
    pub fn save(folder: &Path, records: &RecordMap) -> Result<()> {
        let path = Self::metadata_path(folder);
        let stored: BTreeMap<&str, StoredRecord> = records
            .iter()
            .map(|(k, r)| (k.as_str(), StoredRecord::from(r)))
            .collect();
        let data = serde_json::to_vec_pretty(&stored)?;

        let temp_path = folder.join(format!(
            "{}.{}.tmp",
            METADATA_FILE_NAME,
            uuid::Uuid::new_v4().simple()
        ));
        // 任何一步失败都删除临时文件
        let temp_guard = scopeguard::guard(temp_path, |p| {
            let _ = fs::remove_file(p);
        });

        let mut file = fs::File::create(&*temp_guard).map_err(|e| SyncError::from_io(folder, e))?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&*temp_guard, &path).map_err(|e| SyncError::from_io(&path, e))?;
        scopeguard::ScopeGuard::into_inner(temp_guard);

        // 目录项也要落盘，rename 才算持久
        #[cfg(unix)]
        {
            if let Ok(dir) = fs::File::open(folder) {
                let _ = dir.sync_all();
            }
        }

        debug!("已保存 {} 条同步记录到 {:?}", records.len(), path);
        Ok(())
    }

    /// 打开文件夹的存储；元数据损坏时按空表处理并告警
    pub fn open(folder: &Path) -> Result<Self> {
        let records = match Self::load(folder) {
            Ok(records) => records,
            Err(SyncError::CorruptMetadata { path, reason }) => {
                warn!("元数据文件损坏，按空记录处理: {:?} ({})", path, reason);
                RecordMap::new()
            }
            Err(e) => return Err(e),
        };
        Ok(Self {
            folder: folder.to_path_buf(),
            records,
        })
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub fn records(&self) -> &RecordMap {
        &self.records
    }

    pub fn get_record(&self, path: &str) -> Option<&SyncRecord> {
        self.records.get(path)
    }

    /// 记录中的策略，没有记录时为默认的 Mirrored
    pub fn get_policy(&self, path: &str) -> SyncPolicy {
        self.records
            .get(path)
            .map(|r| r.policy)
            .unwrap_or_default()
    }

    /// 先写盘再替换内存，写盘失败时内存保持不变
    fn commit(&mut self, mutate: impl FnOnce(&mut RecordMap)) -> Result<()> {
        let mut next = self.records.clone();
        mutate(&mut next);
        Self::save(&self.folder, &next)?;
        self.records = next;
        Ok(())
    }

    pub fn set_policy(&mut self, path: &str, policy: SyncPolicy) -> Result<()> {
        self.commit(|records| {
            records
                .entry(path.to_string())
                .or_insert_with(|| SyncRecord::new(path))
                .policy = policy;
        })?;
        info!("设置同步策略: {} -> {}", path, policy);
        Ok(())
    }

    /// 切换到下一个策略并返回新策略
    pub fn cycle_policy(&mut self, path: &str) -> Result<SyncPolicy> {
        let next = self.get_policy(path).next();
        self.set_policy(path, next)?;
        Ok(next)
    }

    pub fn update_record(&mut self, record: SyncRecord) -> Result<()> {
        self.commit(|records| {
            records.insert(record.path.clone(), record);
        })
    }

    /// 首次见到的路径创建默认记录，有新增时落盘一次，返回新增数量
    pub fn observe<'a>(&mut self, paths: impl IntoIterator<Item = &'a str>) -> Result<usize> {
        let new_paths: Vec<&str> = paths
            .into_iter()
            .filter(|p| !self.records.contains_key(*p))
            .collect();
        if new_paths.is_empty() {
            return Ok(0);
        }
        let count = new_paths.len();
        self.commit(|records| {
            for path in new_paths {
                records.insert(path.to_string(), SyncRecord::new(path));
            }
        })?;
        debug!("新增 {} 条同步记录", count);
        Ok(count)
    }

    /// 清除记录。只允许清除本地已不存在的路径，返回是否删除了记录。
    pub fn clear_record(&mut self, path: &str) -> Result<bool> {
        if !self.records.contains_key(path) {
            return Ok(false);
        }
        let local = self.folder.join(path);
        if local.exists() {
            warn!("文件仍存在，拒绝清除同步记录: {}", path);
            return Ok(false);
        }
        self.commit(|records| {
            records.remove(path);
        })?;
        info!("已清除同步记录: {}", path);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_missing_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(MetadataStore::load(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_load_accepts_legacy_and_current_shapes() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            MetadataStore::metadata_path(dir.path()),
            r#"{
                "a.txt": "both",
                "b.txt": "object_storage_only",
                "photos": "no_sync",
                "c.txt": {"policy": "remote_only", "hash": "abc", "timestamp": 1700000000.5, "state": "awaitingLocalDelete"},
                "d.txt": {"policy": "mirrored"}
            }"#,
        )
        .unwrap();

        let records = MetadataStore::load(dir.path()).unwrap();
        assert_eq!(records["a.txt"].policy, SyncPolicy::Mirrored);
        assert_eq!(records["b.txt"].policy, SyncPolicy::RemoteOnly);
        assert_eq!(records["photos"].policy, SyncPolicy::Excluded);
        assert!(records["a.txt"].content_hash.is_none());

        let c = &records["c.txt"];
        assert_eq!(c.content_hash.as_deref(), Some("abc"));
        assert_eq!(c.state, Some(RecordState::AwaitingLocalDelete));
        assert_eq!(c.synced_at.unwrap().timestamp_millis(), 1_700_000_000_500);
        assert!(records["d.txt"].synced_at.is_none());
    }

    #[test]
    fn test_save_writes_current_shape_only() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            MetadataStore::metadata_path(dir.path()),
            r#"{"a.txt": "no_sync"}"#,
        )
        .unwrap();

        let mut store = MetadataStore::open(dir.path()).unwrap();
        let mut record = SyncRecord::new("b.txt");
        record.mark_uploaded("ff00".into(), RecordState::Synced);
        store.update_record(record).unwrap();

        let raw: serde_json::Value = serde_json::from_str(
            &fs::read_to_string(MetadataStore::metadata_path(dir.path())).unwrap(),
        )
        .unwrap();
        assert_eq!(raw["a.txt"], serde_json::json!({"policy": "excluded"}));
        assert_eq!(raw["b.txt"]["policy"], "mirrored");
        assert_eq!(raw["b.txt"]["hash"], "ff00");
        assert_eq!(raw["b.txt"]["state"], "synced");
        assert!(raw["b.txt"]["timestamp"].is_f64());

        // 没有遗留临时文件
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_corrupt_metadata_then_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let meta = MetadataStore::metadata_path(dir.path());
        fs::write(&meta, "{ not json").unwrap();

        assert!(matches!(
            MetadataStore::load(dir.path()),
            Err(SyncError::CorruptMetadata { .. })
        ));

        let mut store = MetadataStore::open(dir.path()).unwrap();
        assert!(store.records().is_empty());

        store.set_policy("a.txt", SyncPolicy::RemoteOnly).unwrap();
        let reloaded = MetadataStore::load(dir.path()).unwrap();
        assert_eq!(reloaded["a.txt"].policy, SyncPolicy::RemoteOnly);
    }

    #[test]
    fn test_every_mutation_persists() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = MetadataStore::open(dir.path()).unwrap();

        assert_eq!(store.get_policy("x"), SyncPolicy::Mirrored);
        assert_eq!(store.cycle_policy("x").unwrap(), SyncPolicy::RemoteOnly);
        assert_eq!(MetadataStore::load(dir.path()).unwrap()["x"].policy, SyncPolicy::RemoteOnly);
        assert_eq!(store.cycle_policy("x").unwrap(), SyncPolicy::Excluded);
        assert_eq!(store.cycle_policy("x").unwrap(), SyncPolicy::Mirrored);

        assert_eq!(store.observe(["x", "y", "z"]).unwrap(), 2);
        assert_eq!(store.observe(["x", "y"]).unwrap(), 0);
        assert_eq!(MetadataStore::load(dir.path()).unwrap().len(), 3);
    }

    #[test]
    fn test_clear_record_requires_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("kept.txt"), b"1").unwrap();
        let mut store = MetadataStore::open(dir.path()).unwrap();
        store.observe(["kept.txt", "gone.txt"]).unwrap();

        assert!(!store.clear_record("kept.txt").unwrap());
        assert!(store.clear_record("gone.txt").unwrap());
        assert!(!store.clear_record("never.txt").unwrap());

        let reloaded = MetadataStore::load(dir.path()).unwrap();
        assert!(reloaded.contains_key("kept.txt"));
        assert!(!reloaded.contains_key("gone.txt"));
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!("remote-only".parse::<SyncPolicy>().unwrap(), SyncPolicy::RemoteOnly);
        assert_eq!("no_sync".parse::<SyncPolicy>().unwrap(), SyncPolicy::Excluded);
        assert!("bogus".parse::<SyncPolicy>().is_err());
        assert!(is_metadata_file(METADATA_FILE_NAME));
        assert!(is_metadata_file(".foldersync.json.abc.tmp"));
        assert!(is_metadata_file(".foldersync.json.lock"));
        assert!(!is_metadata_file("notes.json"));
    }
}
