//! 传输事件
//!
//! 管理器通过 [`TransferObserver`] 上报进度和状态变更，观察者在构造时注入。

use super::types::{Transfer, TransferStatus};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// 进度事件默认节流间隔（毫秒）
pub const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 200;

/// 传输观察者
///
/// 回调在管理器内部的任务中同步调用，实现不应阻塞，也不应回调管理器。
pub trait TransferObserver: Send + Sync {
    /// 每个数据块之后调用
    fn on_progress(&self, _transfer: &Transfer) {}

    /// 状态变更（包括入队）
    fn on_status_change(&self, _transfer: &Transfer) {}
}

/// 什么都不做的观察者
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl TransferObserver for NoopObserver {}

/// 传输事件
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum TransferEvent {
    /// 进度更新
    Progress {
        transfer_id: String,
        bytes_transferred: u64,
        size: u64,
        speed: f64,
        progress: f64,
        eta_seconds: Option<f64>,
    },
    /// 状态变更
    StatusChanged {
        transfer_id: String,
        remote_path: String,
        status: TransferStatus,
        error: Option<String>,
    },
}

impl TransferEvent {
    pub fn transfer_id(&self) -> &str {
        match self {
            Self::Progress { transfer_id, .. } | Self::StatusChanged { transfer_id, .. } => {
                transfer_id
            }
        }
    }

    pub fn progress(transfer: &Transfer) -> Self {
        Self::Progress {
            transfer_id: transfer.id.clone(),
            bytes_transferred: transfer.bytes_transferred,
            size: transfer.size,
            speed: transfer.speed,
            progress: transfer.progress(),
            eta_seconds: transfer.eta_seconds(),
        }
    }

    pub fn status_changed(transfer: &Transfer) -> Self {
        Self::StatusChanged {
            transfer_id: transfer.id.clone(),
            remote_path: transfer.remote_path.clone(),
            status: transfer.status,
            error: transfer.error.clone(),
        }
    }
}

/// 把事件推送到 channel 的观察者
///
/// 进度事件按传输节流，状态变更总是发送。接收端关闭后事件被丢弃。
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<TransferEvent>,
    interval: Duration,
    last_progress: DashMap<String, Instant>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TransferEvent>) {
        Self::with_interval(Duration::from_millis(DEFAULT_PROGRESS_INTERVAL_MS))
    }

    /// 指定进度节流间隔，`Duration::ZERO` 表示不节流
    pub fn with_interval(interval: Duration) -> (Self, mpsc::UnboundedReceiver<TransferEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                interval,
                last_progress: DashMap::new(),
            },
            rx,
        )
    }

    fn should_emit_progress(&self, transfer_id: &str) -> bool {
        if self.interval.is_zero() {
            return true;
        }
        let now = Instant::now();
        if let Some(mut last) = self.last_progress.get_mut(transfer_id) {
            if now.saturating_duration_since(*last) < self.interval {
                return false;
            }
            *last = now;
            return true;
        }
        self.last_progress.insert(transfer_id.to_string(), now);
        true
    }
}

impl TransferObserver for ChannelObserver {
    fn on_progress(&self, transfer: &Transfer) {
        if self.should_emit_progress(&transfer.id) {
            let _ = self.tx.send(TransferEvent::progress(transfer));
        }
    }

    fn on_status_change(&self, transfer: &Transfer) {
        self.last_progress.remove(&transfer.id);
        let _ = self.tx.send(TransferEvent::status_changed(transfer));
    }
}
