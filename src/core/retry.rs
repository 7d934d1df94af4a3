//! 重试策略 - 以数据描述：最大尝试次数、退避方式、可重试判定
//!
//! 默认对所有错误都重试（包括认证失败），这是已知的限制；
//! 需要区分时通过 `with_retryable` 传入判定函数。本地文件不存在永远不重试。

use crate::config::{BackoffKind, RetryConfig};
use crate::error::SyncError;
use crate::storage::{ObjectStore, RemoteObject, StorageError, TransferProgress};
use futures::TryStreamExt;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

/// 两次尝试之间的等待方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    /// 第 `failed_attempts` 次失败之后的等待时间
    pub fn delay(&self, failed_attempts: u32) -> Duration {
        match *self {
            Backoff::Fixed(d) => d,
            Backoff::Exponential { base, max } => {
                let factor = 2u32.saturating_pow(failed_attempts.saturating_sub(1));
                base.saturating_mul(factor).min(max)
            }
        }
    }
}

pub type RetryPredicate = Arc<dyn Fn(&StorageError) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct RetryPolicy {
    /// 含首次调用
    pub max_attempts: u32,
    pub backoff: Backoff,
    retryable: RetryPredicate,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            retryable: Arc::new(|_| true),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        let delay = Duration::from_millis(config.delay_ms);
        let backoff = match config.backoff {
            BackoffKind::Fixed => Backoff::Fixed(delay),
            BackoffKind::Exponential => Backoff::Exponential {
                base: delay,
                max: Duration::from_millis(config.max_delay_ms),
            },
        };
        Self::new(config.max_attempts, backoff)
    }

    pub fn with_retryable(
        mut self,
        predicate: impl Fn(&StorageError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.retryable = Arc::new(predicate);
        self
    }

    pub fn is_retryable(&self, err: &StorageError) -> bool {
        (self.retryable)(err)
    }

    /// 执行操作，失败时按策略重试；耗尽后返回最后一次错误
    pub async fn run<T, F, Fut>(&self, op_name: &str, target: &str, mut op: F) -> Result<T, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if attempt >= self.max_attempts
                || err.is_local_not_found()
                || !self.is_retryable(&err)
            {
                error!(
                    "{} 最终失败 (已尝试{}次): {} - {}",
                    op_name, attempt, target, err
                );
                return Err(SyncError::TransientIo {
                    attempts: attempt,
                    source: err,
                });
            }

            let delay = self.backoff.delay(attempt);
            warn!(
                "{} 失败，{}ms 后重试 ({}/{}): {} - {}",
                op_name,
                delay.as_millis(),
                attempt,
                self.max_attempts,
                target,
                err
            );
            tokio::time::sleep(delay).await;
        }
    }
}

/// 给对象存储的每个操作套上重试策略
#[derive(Clone)]
pub struct RetryingStore {
    inner: Arc<dyn ObjectStore>,
    policy: RetryPolicy,
}

impl RetryingStore {
    pub fn new(inner: Arc<dyn ObjectStore>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub async fn put(
        &self,
        local_path: &Path,
        remote_key: &str,
        on_progress: TransferProgress<'_>,
    ) -> Result<(), SyncError> {
        let inner = &self.inner;
        let result = self
            .policy
            .run("上传", remote_key, move || {
                inner.put(local_path, remote_key, on_progress)
            })
            .await;
        match result {
            // 扫描之后本地文件消失，按 NotFound 交给调用方跳过
            Err(SyncError::TransientIo { source, .. })
                if source.is_local_not_found() && !local_path.exists() =>
            {
                Err(SyncError::NotFound(local_path.to_path_buf()))
            }
            other => other,
        }
    }

    pub async fn get(&self, remote_key: &str, local_path: &Path) -> Result<(), SyncError> {
        let inner = &self.inner;
        self.policy
            .run("下载", remote_key, move || inner.get(remote_key, local_path))
            .await
    }

    pub async fn delete(&self, remote_key: &str) -> Result<(), SyncError> {
        let inner = &self.inner;
        self.policy
            .run("删除远程对象", remote_key, move || inner.delete(remote_key))
            .await
    }

    /// 列出并收集前缀下的全部对象；中途出错时整体重试
    pub async fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>, SyncError> {
        let inner = &self.inner;
        self.policy
            .run("列出远程对象", prefix, move || async move {
                let stream = inner.list_by_prefix(prefix).await?;
                stream.try_collect::<Vec<_>>().await
            })
            .await
    }

    /// 连通性检查只做一次，不重试
    pub async fn ping(&self) -> Result<(), StorageError> {
        self.inner.ping().await
    }
}
