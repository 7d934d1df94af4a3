//! 后台同步线程 - 排队执行同步请求，界面线程只负责触发和渲染
//!
//! 每个请求有自己的取消标志，`cancel()` 作用于调用时已触发但尚未结束的全部请求，
//! 之后触发的请求不受影响。

use crate::core::engine::{SyncEngine, SyncResult};
use crate::core::progress::ProgressEvent;
use anyhow::{anyhow, Result};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// 一次同步请求
struct PassRequest {
    folder: PathBuf,
    progress_tx: Option<mpsc::Sender<ProgressEvent>>,
    cancel: Arc<AtomicBool>,
    reply: oneshot::Sender<SyncResult>,
}

/// 排队中和执行中的请求的取消标志
type PendingFlags = Arc<Mutex<Vec<Arc<AtomicBool>>>>;

pub struct SyncWorker {
    tx: mpsc::UnboundedSender<PassRequest>,
    pending: PendingFlags,
    handle: JoinHandle<()>,
}

fn release(pending: &PendingFlags, flag: &Arc<AtomicBool>) {
    let mut flags = pending.lock().unwrap_or_else(|e| e.into_inner());
    flags.retain(|f| !Arc::ptr_eq(f, flag));
}

impl SyncWorker {
    /// 启动后台任务，请求按触发顺序逐个执行
    pub fn spawn(engine: SyncEngine) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<PassRequest>();
        let pending: PendingFlags = Arc::default();
        let running = pending.clone();

        let handle = tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                debug!("后台同步开始: {:?}", request.folder);
                let result = engine
                    .run_pass(&request.folder, request.progress_tx, request.cancel.clone())
                    .await;
                release(&running, &request.cancel);
                if request.reply.send(result).is_err() {
                    debug!("同步结果无人接收: {:?}", request.folder);
                }
            }
            info!("后台同步任务退出");
        });

        Self {
            tx,
            pending,
            handle,
        }
    }

    /// 排队一轮同步，返回结果接收端
    pub fn trigger(
        &self,
        folder: impl Into<PathBuf>,
        progress_tx: Option<mpsc::Sender<ProgressEvent>>,
    ) -> Result<oneshot::Receiver<SyncResult>> {
        let (reply, rx) = oneshot::channel();
        let cancel = Arc::new(AtomicBool::new(false));
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(cancel.clone());

        let request = PassRequest {
            folder: folder.into(),
            progress_tx,
            cancel: cancel.clone(),
            reply,
        };
        if self.tx.send(request).is_err() {
            release(&self.pending, &cancel);
            return Err(anyhow!("后台同步任务已停止"));
        }
        Ok(rx)
    }

    /// 取消已触发的全部请求：执行中的在下一个文件之前停止，排队中的开始即返回 Cancelled
    pub fn cancel(&self) {
        let flags = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        debug!("取消 {} 个同步请求", flags.len());
        for flag in flags.iter() {
            flag.store(true, Ordering::SeqCst);
        }
    }

    /// 不再接受新请求，等待已排队的请求执行完
    pub async fn shutdown(self) -> Result<()> {
        drop(self.tx);
        self.handle.await?;
        Ok(())
    }
}
