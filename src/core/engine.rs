use crate::config::ScanConfig;
use crate::core::detector::{Change, ChangeDetector};
use crate::core::fingerprint::fingerprint;
use crate::core::lock::{FolderGuard, FolderLocks};
use crate::core::metadata::{MetadataStore, RecordMap, RecordState, SyncPolicy, SyncRecord};
use crate::core::policy::PolicyResolver;
use crate::core::progress::{FileOutcome, ProgressEvent, ProgressReporter};
use crate::core::retry::{RetryPolicy, RetryingStore};
use crate::core::scanner::{FolderScanner, SnapshotEntry};
use crate::error::{Result, SyncError};
use crate::storage::{ObjectStore, RemoteObject};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// 一轮同步的结束方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PassOutcome {
    Completed,
    Cancelled,
    /// 连通性检查失败，未触碰任何文件
    Offline,
    /// 同一文件夹已有同步在进行，未触碰任何文件
    AlreadyRunning,
    /// 文件夹不可读或元数据无法写入
    Failed,
}

/// 路径 + 说明
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PathMessage {
    pub path: String,
    pub message: String,
}

impl PathMessage {
    fn new(path: &str, message: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            message: message.into(),
        }
    }
}

/// 同步结果，每轮结束后交给界面渲染
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub folder: PathBuf,
    pub outcome: PassOutcome,
    /// 整轮失败的原因（Offline / Failed）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// 扫描到的文件数（不含目录）
    pub scanned: u32,
    pub uploaded: u32,
    pub deleted_locally: u32,
    pub skipped_no_sync: u32,
    pub up_to_date: u32,
    pub errored: u32,
    pub errors: Vec<PathMessage>,
    pub health_issues: Vec<PathMessage>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SyncResult {
    fn new(folder: &Path) -> Self {
        let now = Utc::now();
        Self {
            folder: folder.to_path_buf(),
            outcome: PassOutcome::Completed,
            message: None,
            scanned: 0,
            uploaded: 0,
            deleted_locally: 0,
            skipped_no_sync: 0,
            up_to_date: 0,
            errored: 0,
            errors: Vec::new(),
            health_issues: Vec::new(),
            started_at: now,
            finished_at: now,
        }
    }

    fn finish(mut self, outcome: PassOutcome, message: Option<String>) -> Self {
        self.outcome = outcome;
        self.message = message;
        self.finished_at = Utc::now();
        self
    }

    fn tally(&mut self, path: &str, outcome: &FileOutcome) {
        match outcome {
            FileOutcome::Skipped => self.skipped_no_sync += 1,
            FileOutcome::UpToDate => self.up_to_date += 1,
            FileOutcome::Uploaded => self.uploaded += 1,
            FileOutcome::UploadedAndRemoved => {
                self.uploaded += 1;
                self.deleted_locally += 1;
            }
            FileOutcome::LocalRemoved => self.deleted_locally += 1,
            FileOutcome::DeleteFailed { uploaded, message } => {
                if *uploaded {
                    self.uploaded += 1;
                }
                self.errored += 1;
                self.errors.push(PathMessage::new(path, message.clone()));
            }
            FileOutcome::Vanished => {}
            FileOutcome::Errored { message } => {
                self.errored += 1;
                self.errors.push(PathMessage::new(path, message.clone()));
            }
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == PassOutcome::Completed && self.errored == 0
    }
}

/// 同步前的统计，不联网、不修改任何东西
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    pub total_files: u32,
    pub needs_sync: u32,
    pub synced: u32,
    pub excluded: u32,
}

/// 统计文件夹中各类文件的数量，不需要对象存储
pub async fn analyze_folder(folder: &Path, scan_config: &ScanConfig) -> Result<SyncStats> {
    let records = MetadataStore::open(folder)?.records().clone();
    let snapshot = FolderScanner::new(scan_config)
        .scan(folder.to_path_buf())
        .await?;
    let resolver = PolicyResolver::new(&records);

    let mut stats = SyncStats::default();
    for entry in snapshot.files() {
        stats.total_files += 1;
        if resolver.effective_policy(&entry.path) == SyncPolicy::Excluded {
            stats.excluded += 1;
            continue;
        }
        match ChangeDetector::needs_sync(&entry.abs_path, records.get(&entry.path)).await {
            Ok(true) => stats.needs_sync += 1,
            Ok(false) => stats.synced += 1,
            Err(SyncError::NotFound(_)) => stats.total_files -= 1,
            Err(e) => return Err(e),
        }
    }
    debug!("分析完成: {:?} {:?}", folder, stats);
    Ok(stats)
}

/// 只接受普通路径段，`..`、根目录、盘符都会落到文件夹之外
fn checked_relative(path: &str) -> Result<PathBuf> {
    let relative = Path::new(path);
    let valid = !path.is_empty()
        && relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if valid {
        Ok(relative.to_path_buf())
    } else {
        Err(SyncError::InvalidPath(path.to_string()))
    }
}

/// 单个文件所在的位置（第几个 / 共几个）
struct FileSlot<'a> {
    index: usize,
    total: usize,
    entry: &'a SnapshotEntry,
}

/// 同步引擎
///
/// 每个文件夹的一轮同步按深度优先顺序逐个处理文件。单个文件失败只记入结果，
/// 不会中断整轮；连通性检查失败或文件夹已被占用时在触碰任何文件之前返回。
#[derive(Clone)]
pub struct SyncEngine {
    store: RetryingStore,
    scan_config: ScanConfig,
    locks: FolderLocks,
}

impl SyncEngine {
    pub fn new(store: Arc<dyn ObjectStore>, retry: RetryPolicy, scan_config: ScanConfig) -> Self {
        Self {
            store: RetryingStore::new(store, retry),
            scan_config,
            locks: FolderLocks::new(),
        }
    }

    pub fn store_name(&self) -> &str {
        self.store.name()
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        self.store.policy()
    }

    pub fn is_running(&self, folder: &Path) -> bool {
        self.locks.is_locked(folder)
    }

    /// 进程内的表 + 文件夹里的锁文件，其他引擎或进程持有时返回 `AlreadyRunning`
    fn acquire(&self, folder: &Path) -> Result<FolderGuard> {
        self.locks.try_acquire(folder)
    }

    /// 执行一轮同步
    pub async fn run_pass(
        &self,
        folder: &Path,
        progress_tx: Option<mpsc::Sender<ProgressEvent>>,
        cancel: Arc<AtomicBool>,
    ) -> SyncResult {
        let result = SyncResult::new(folder);
        let reporter = ProgressReporter::new(progress_tx);

        let _guard = match self.acquire(folder) {
            Ok(guard) => guard,
            Err(SyncError::AlreadyRunning(_)) => {
                warn!("文件夹正在同步中，忽略本次触发: {:?}", folder);
                return result.finish(PassOutcome::AlreadyRunning, None);
            }
            Err(e) => {
                error!("无法锁定文件夹 {:?}: {}", folder, e);
                return result.finish(PassOutcome::Failed, Some(e.to_string()));
            }
        };

        info!("开始同步: {:?} -> {}", folder, self.store.name());

        if let Err(e) = self.store.ping().await {
            error!("无法连接对象存储 {}: {}", self.store.name(), e);
            let message = SyncError::Offline(e.to_string()).to_string();
            return result.finish(PassOutcome::Offline, Some(message));
        }

        let result = self.sync_folder(folder, &reporter, &cancel, result).await;

        reporter
            .emit(ProgressEvent::PassFinished {
                uploaded: result.uploaded,
                deleted_locally: result.deleted_locally,
                errored: result.errored,
            })
            .await;
        info!(
            "同步结束: {:?} {:?}, 上传 {}, 本地删除 {}, 跳过 {}, 未变化 {}, 失败 {}",
            folder,
            result.outcome,
            result.uploaded,
            result.deleted_locally,
            result.skipped_no_sync,
            result.up_to_date,
            result.errored
        );
        result
    }

    async fn sync_folder(
        &self,
        folder: &Path,
        reporter: &ProgressReporter,
        cancel: &Arc<AtomicBool>,
        mut result: SyncResult,
    ) -> SyncResult {
        let mut metadata = match MetadataStore::open(folder) {
            Ok(m) => m,
            Err(e) => {
                error!("读取同步记录失败: {}", e);
                return result.finish(PassOutcome::Failed, Some(e.to_string()));
            }
        };

        let scanner = FolderScanner::new(&self.scan_config).with_cancel(cancel.clone());
        let snapshot = match scanner.scan(folder.to_path_buf()).await {
            Ok(s) => s,
            Err(SyncError::Cancelled) => return result.finish(PassOutcome::Cancelled, None),
            Err(e) => {
                error!("扫描文件夹失败: {}", e);
                return result.finish(PassOutcome::Failed, Some(e.to_string()));
            }
        };

        if let Err(e) = metadata.observe(snapshot.entries.iter().map(|e| e.path.as_str())) {
            error!("写入同步记录失败: {}", e);
            return result.finish(PassOutcome::Failed, Some(e.to_string()));
        }

        let files: Vec<&SnapshotEntry> = snapshot.files().collect();
        let total = files.len();
        result.scanned = total as u32;
        reporter.emit(ProgressEvent::PassStarted { total }).await;

        for (index, entry) in files.into_iter().enumerate() {
            // 只在文件之间检查取消，已完成的文件都已落盘
            if cancel.load(Ordering::SeqCst) {
                info!("同步已取消: 已处理 {}/{}", index, total);
                return result.finish(PassOutcome::Cancelled, None);
            }

            let slot = FileSlot {
                index,
                total,
                entry,
            };
            reporter
                .emit(ProgressEvent::FileStarted {
                    index,
                    total,
                    path: entry.path.clone(),
                })
                .await;

            let outcome = match self.sync_file(&mut metadata, &slot, reporter, &mut result).await {
                Ok(outcome) => outcome,
                Err(SyncError::NotFound(_)) => {
                    debug!("文件已消失，跳过: {}", entry.path);
                    FileOutcome::Vanished
                }
                Err(e) => {
                    warn!("同步文件失败: {} - {}", entry.path, e);
                    FileOutcome::Errored {
                        message: e.to_string(),
                    }
                }
            };

            result.tally(&entry.path, &outcome);
            reporter
                .emit(ProgressEvent::FileFinished {
                    index,
                    path: entry.path.clone(),
                    outcome,
                })
                .await;
        }

        result.finish(PassOutcome::Completed, None)
    }

    /// 单个文件的状态转换
    async fn sync_file(
        &self,
        metadata: &mut MetadataStore,
        slot: &FileSlot<'_>,
        reporter: &ProgressReporter,
        result: &mut SyncResult,
    ) -> Result<FileOutcome> {
        let entry = slot.entry;
        let policy = PolicyResolver::new(metadata.records()).effective_policy(&entry.path);
        if policy == SyncPolicy::Excluded {
            return Ok(FileOutcome::Skipped);
        }

        let record = metadata
            .get_record(&entry.path)
            .cloned()
            .unwrap_or_else(|| SyncRecord::new(&entry.path));
        let change = ChangeDetector::inspect(&entry.abs_path, Some(&record)).await?;

        match policy {
            SyncPolicy::Mirrored => {
                if !change.dirty {
                    return Ok(FileOutcome::UpToDate);
                }
                self.upload(slot, reporter).await?;
                let mut record = record;
                record.mark_uploaded(change.current_hash.clone(), RecordState::Synced);
                metadata.update_record(record)?;
                if let Some(issue) = Self::health_check(entry, &change).await {
                    result.health_issues.push(issue);
                }
                Ok(FileOutcome::Uploaded)
            }
            SyncPolicy::RemoteOnly => self.move_to_remote(metadata, slot, reporter, record, change).await,
            SyncPolicy::Excluded => Ok(FileOutcome::Skipped),
        }
    }

    /// RemoteOnly：先上传并记下 AwaitingLocalDelete，再删本地
    ///
    /// 本地文件内容与记录一致时说明上次已上传成功，只补做删除。
    async fn move_to_remote(
        &self,
        metadata: &mut MetadataStore,
        slot: &FileSlot<'_>,
        reporter: &ProgressReporter,
        mut record: SyncRecord,
        change: Change,
    ) -> Result<FileOutcome> {
        let entry = slot.entry;
        let uploaded = change.dirty;

        if uploaded {
            self.upload(slot, reporter).await?;
            record.mark_uploaded(change.current_hash, RecordState::AwaitingLocalDelete);
            metadata.update_record(record.clone())?;
        } else {
            info!("远程副本已是最新，仅删除本地文件: {}", entry.path);
        }

        if let Err(e) = tokio::fs::remove_file(&entry.abs_path).await {
            let e = SyncError::from_io(&entry.abs_path, e);
            if matches!(e, SyncError::NotFound(_)) {
                debug!("本地文件已不存在: {}", entry.path);
            } else {
                warn!("删除本地文件失败，远程副本已保存: {} - {}", entry.path, e);
                return Ok(FileOutcome::DeleteFailed {
                    uploaded,
                    message: format!("已上传，但删除本地文件失败: {}", e),
                });
            }
        }

        record.state = Some(RecordState::LocalRemoved);
        metadata.update_record(record)?;
        debug!("已移至远程: {}", entry.path);

        Ok(if uploaded {
            FileOutcome::UploadedAndRemoved
        } else {
            FileOutcome::LocalRemoved
        })
    }

    async fn upload(&self, slot: &FileSlot<'_>, reporter: &ProgressReporter) -> Result<()> {
        let entry = slot.entry;
        let on_progress = |bytes_transferred: u64, bytes_total: u64| {
            reporter.emit_transfer(ProgressEvent::Transfer {
                index: slot.index,
                total: slot.total,
                path: entry.path.clone(),
                bytes_transferred,
                bytes_total,
            });
        };
        self.store
            .put(&entry.abs_path, &entry.path, &on_progress)
            .await?;
        debug!("上传完成: {} ({} bytes)", entry.path, entry.size);
        Ok(())
    }

    /// 上传后重新计算指纹，内容在上传期间被修改时记一条健康问题
    async fn health_check(entry: &SnapshotEntry, change: &Change) -> Option<PathMessage> {
        match fingerprint(entry.abs_path.clone()).await {
            Ok(hash) if hash == change.current_hash => None,
            Ok(_) => {
                warn!("上传期间文件被修改: {}", entry.path);
                Some(PathMessage::new(
                    &entry.path,
                    "上传期间文件被修改，下次同步将重新上传",
                ))
            }
            Err(e) => {
                warn!("上传后校验失败: {} - {}", entry.path, e);
                Some(PathMessage::new(&entry.path, format!("上传后校验失败: {}", e)))
            }
        }
    }

    /// 同步前统计各类文件数量
    pub async fn analyze(&self, folder: &Path) -> Result<SyncStats> {
        analyze_folder(folder, &self.scan_config).await
    }

    /// 从对象存储取回文件，记录回到 Synced；策略不变
    pub async fn restore(&self, folder: &Path, path: &str) -> Result<()> {
        let path = path.trim_matches('/');
        let local_path = folder.join(checked_relative(path)?);
        let _guard = self.acquire(folder)?;

        self.store.get(path, &local_path).await?;
        let hash = fingerprint(local_path).await?;

        let mut metadata = MetadataStore::open(folder)?;
        let mut record = metadata
            .get_record(path)
            .cloned()
            .unwrap_or_else(|| SyncRecord::new(path));
        record.mark_uploaded(hash, RecordState::Synced);
        let policy = record.policy;
        metadata.update_record(record)?;

        if policy == SyncPolicy::RemoteOnly {
            warn!("{} 的策略仍为 remote_only，下次同步会再次删除本地副本", path);
        }
        info!("已恢复: {}", path);
        Ok(())
    }

    pub async fn list_remote(&self, prefix: &str) -> Result<Vec<RemoteObject>> {
        self.store.list(prefix).await
    }

    /// 文件夹的全部同步记录
    pub fn records(&self, folder: &Path) -> Result<RecordMap> {
        Ok(MetadataStore::open(folder)?.records().clone())
    }

    pub fn effective_policy(&self, folder: &Path, path: &str) -> Result<SyncPolicy> {
        let records = MetadataStore::open(folder)?.records().clone();
        Ok(PolicyResolver::new(&records).effective_policy(path))
    }

    pub fn set_policy(&self, folder: &Path, path: &str, policy: SyncPolicy) -> Result<()> {
        let _guard = self.acquire(folder)?;
        MetadataStore::open(folder)?.set_policy(path.trim_matches('/'), policy)
    }

    pub fn cycle_policy(&self, folder: &Path, path: &str) -> Result<SyncPolicy> {
        let _guard = self.acquire(folder)?;
        MetadataStore::open(folder)?.cycle_policy(path.trim_matches('/'))
    }

    pub fn clear_record(&self, folder: &Path, path: &str) -> Result<bool> {
        let _guard = self.acquire(folder)?;
        MetadataStore::open(folder)?.clear_record(path.trim_matches('/'))
    }
}
