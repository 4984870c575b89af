//! 队列快照持久化
//!
//! 每次状态变更后整体覆盖写入，已完成和失败的传输不写入快照。

use super::atomic::{read_json, write_json_atomic};
use crate::transfer::{Transfer, TransferError, TransferStatus};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// 队列快照
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueSnapshot {
    /// 保存时队列是否处于停止状态
    #[serde(default)]
    pub queue_paused: bool,
    #[serde(default)]
    pub transfers: Vec<Transfer>,
}

impl QueueSnapshot {
    /// 从当前队列构建快照（排除终态传输）
    pub fn capture(transfers: &[Transfer], globally_stopped: bool) -> Self {
        Self {
            queue_paused: globally_stopped,
            transfers: transfers
                .iter()
                .filter(|t| !t.is_terminal())
                .cloned()
                .collect(),
        }
    }

    /// 恢复：中断的传输重新排队，用户暂停的保持暂停
    pub fn recover(self) -> (Vec<Transfer>, bool) {
        let transfers = self
            .transfers
            .into_iter()
            .filter(|t| !t.is_terminal())
            .map(|mut t| {
                if t.status.is_running() || t.status == TransferStatus::Stopped {
                    debug!("恢复中断的传输: {} ({})", t.remote_path, t.status);
                    t.mark_queued();
                }
                t
            })
            .collect();
        (transfers, self.queue_paused)
    }
}

/// 队列快照存储
pub trait QueueStore: Send + Sync {
    fn save_snapshot(&self, transfers: &[Transfer], globally_stopped: bool) -> Result<(), TransferError>;

    /// 加载快照，返回 (传输列表, 保存时是否停止)
    fn load_snapshot(&self) -> (Vec<Transfer>, bool);
}

/// JSON 文件快照存储
#[derive(Debug, Clone)]
pub struct JsonQueueStore {
    path: PathBuf,
}

impl JsonQueueStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 删除快照文件
    pub fn clear(&self) -> Result<(), TransferError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl QueueStore for JsonQueueStore {
    fn save_snapshot(&self, transfers: &[Transfer], globally_stopped: bool) -> Result<(), TransferError> {
        let snapshot = QueueSnapshot::capture(transfers, globally_stopped);
        write_json_atomic(&self.path, &snapshot)
            .map_err(|e| TransferError::Persistence(format!("{}: {}", self.path.display(), e)))?;
        debug!(
            "队列快照已保存: {} 个传输, 停止={}",
            snapshot.transfers.len(),
            globally_stopped
        );
        Ok(())
    }

    fn load_snapshot(&self) -> (Vec<Transfer>, bool) {
        match read_json::<QueueSnapshot>(&self.path) {
            Ok(Some(snapshot)) => {
                let (transfers, paused) = snapshot.recover();
                info!("从 {:?} 恢复了 {} 个传输", self.path, transfers.len());
                (transfers, paused)
            }
            Ok(None) => (Vec::new(), false),
            Err(e) => {
                warn!("队列快照无法读取，忽略: {:?}, 错误: {}", self.path, e);
                (Vec::new(), false)
            }
        }
    }
}
