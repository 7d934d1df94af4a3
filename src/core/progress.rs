//! 同步进度事件
//!
//! 引擎只负责按顺序发出事件，界面层订阅后自行渲染。生命周期事件
//! （开始、结束）用 `send().await` 保证送达，接收端积压时等待；传输进度
//! 用 `try_send`，积压时直接丢弃。接收端关闭不会中断同步。

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::trace;

/// 单个文件在本轮中的结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum FileOutcome {
    /// 策略为 Excluded（含继承），未做任何 IO
    Skipped,
    UpToDate,
    /// Mirrored：已上传，本地保留
    Uploaded,
    /// RemoteOnly：已上传且本地已删除
    UploadedAndRemoved,
    /// RemoteOnly：上次已上传，本轮只补做本地删除
    LocalRemoved,
    /// RemoteOnly：远程副本有效，但本地删除失败
    #[serde(rename_all = "camelCase")]
    DeleteFailed { uploaded: bool, message: String },
    /// 扫描后文件消失
    Vanished,
    Errored { message: String },
}

/// 进度事件
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase", tag = "event")]
pub enum ProgressEvent {
    PassStarted {
        total: usize,
    },
    FileStarted {
        index: usize,
        total: usize,
        path: String,
    },
    #[serde(rename_all = "camelCase")]
    Transfer {
        index: usize,
        total: usize,
        path: String,
        bytes_transferred: u64,
        bytes_total: u64,
    },
    FileFinished {
        index: usize,
        path: String,
        outcome: FileOutcome,
    },
    #[serde(rename_all = "camelCase")]
    PassFinished {
        uploaded: u32,
        deleted_locally: u32,
        errored: u32,
    },
}

/// 进度发送端，没有订阅者时所有调用都是空操作
#[derive(Debug, Clone, Default)]
pub struct ProgressReporter {
    tx: Option<mpsc::Sender<ProgressEvent>>,
}

impl ProgressReporter {
    pub fn new(tx: Option<mpsc::Sender<ProgressEvent>>) -> Self {
        Self { tx }
    }

    /// 生命周期事件，接收端积压时等待
    pub async fn emit(&self, event: ProgressEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        if tx.send(event).await.is_err() {
            trace!("进度接收端已关闭");
        }
    }

    /// 传输进度，可丢弃
    pub fn emit_transfer(&self, event: ProgressEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        if let Err(e) = tx.try_send(event) {
            trace!("进度事件丢弃: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer(bytes_transferred: u64) -> ProgressEvent {
        ProgressEvent::Transfer {
            index: 0,
            total: 1,
            path: "a.txt".into(),
            bytes_transferred,
            bytes_total: 100,
        }
    }

    #[tokio::test]
    async fn test_transfer_dropped_when_full_but_lifecycle_delivered() {
        let (tx, mut rx) = mpsc::channel(2);
        let reporter = ProgressReporter::new(Some(tx));
        for bytes in [10, 20, 30, 40] {
            reporter.emit_transfer(transfer(bytes));
        }

        let drain = tokio::spawn(async move {
            let mut events = Vec::new();
            while let Some(event) = rx.recv().await {
                events.push(event);
            }
            events
        });

        reporter
            .emit(ProgressEvent::FileFinished {
                index: 0,
                path: "a.txt".into(),
                outcome: FileOutcome::Uploaded,
            })
            .await;
        reporter
            .emit(ProgressEvent::PassFinished {
                uploaded: 1,
                deleted_locally: 0,
                errored: 0,
            })
            .await;
        drop(reporter);

        let events = drain.await.unwrap();
        let transfers = events
            .iter()
            .filter(|e| matches!(e, ProgressEvent::Transfer { .. }))
            .count();
        assert_eq!(transfers, 2);
        assert!(matches!(
            events[events.len() - 2],
            ProgressEvent::FileFinished { .. }
        ));
        assert!(matches!(
            events[events.len() - 1],
            ProgressEvent::PassFinished { uploaded: 1, .. }
        ));
    }

    #[tokio::test]
    async fn test_closed_channel_never_fails() {
        let (tx, rx) = mpsc::channel(1);
        let reporter = ProgressReporter::new(Some(tx));
        drop(rx);
        reporter.emit(ProgressEvent::PassStarted { total: 4 }).await;
        reporter.emit_transfer(transfer(1));
        ProgressReporter::default()
            .emit(ProgressEvent::PassStarted { total: 5 })
            .await;
    }

    #[test]
    fn test_event_serialization() {
        let event = ProgressEvent::Transfer {
            index: 1,
            total: 2,
            path: "a.txt".into(),
            bytes_transferred: 10,
            bytes_total: 20,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "transfer");
        assert_eq!(json["bytesTransferred"], 10);

        let outcome = serde_json::to_value(FileOutcome::DeleteFailed {
            uploaded: true,
            message: "denied".into(),
        })
        .unwrap();
        assert_eq!(outcome["kind"], "deleteFailed");
        assert_eq!(outcome["uploaded"], true);
    }
}
