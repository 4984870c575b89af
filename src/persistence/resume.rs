//! 断点续传检查点
//!
//! 按 transfer_id 记录已写入本地文件的字节数。只有本地文件大小与检查点完全一致时，
//! 检查点才可用于续传。

use super::atomic::{read_json, write_json_atomic};
use crate::transfer::TransferError;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// 单个传输的检查点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeCheckpoint {
    pub remote_path: String,
    pub local_path: PathBuf,
    pub bytes_transferred: u64,
    pub total_size: u64,
    pub updated_at: DateTime<Utc>,
}

impl ResumeCheckpoint {
    pub fn matches(&self, remote_path: &str, local_path: &Path) -> bool {
        self.remote_path == remote_path && self.local_path == local_path
    }

    /// 本地文件当前大小必须等于检查点记录的字节数
    pub fn is_valid(&self) -> bool {
        match std::fs::metadata(&self.local_path) {
            Ok(meta) => meta.is_file() && meta.len() == self.bytes_transferred,
            Err(_) => false,
        }
    }
}

/// 检查点存储
pub trait ResumeStore: Send + Sync {
    fn save_checkpoint(
        &self,
        transfer_id: &str,
        remote_path: &str,
        local_path: &Path,
        bytes_transferred: u64,
        total_size: u64,
    ) -> Result<(), TransferError>;

    /// 可用的续传偏移，没有有效检查点时返回 0
    fn get_resume_offset(&self, remote_path: &str, local_path: &Path) -> u64;

    fn clear_checkpoint(&self, transfer_id: &str) -> Result<(), TransferError>;

    /// 清除某对路径的所有检查点（不论属于哪个传输）
    fn clear_by_path(&self, remote_path: &str, local_path: &Path) -> Result<(), TransferError>;
}

/// JSON 文件检查点存储
pub struct JsonResumeStore {
    path: PathBuf,
    state: DashMap<String, ResumeCheckpoint>,
    /// 串行化文件写入
    write_lock: Mutex<()>,
}

impl JsonResumeStore {
    /// 打开存储，已有文件会被加载，损坏的文件被忽略
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = DashMap::new();
        match read_json::<BTreeMap<String, ResumeCheckpoint>>(&path) {
            Ok(Some(saved)) => {
                debug!("加载了 {} 个续传检查点", saved.len());
                for (id, checkpoint) in saved {
                    state.insert(id, checkpoint);
                }
            }
            Ok(None) => {}
            Err(e) => warn!("续传检查点文件无法读取，忽略: {:?}, 错误: {}", path, e),
        }
        Self {
            path,
            state,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, transfer_id: &str) -> Option<ResumeCheckpoint> {
        self.state.get(transfer_id).map(|c| c.value().clone())
    }

    pub fn len(&self) -> usize {
        self.state.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }

    fn flush(&self) -> Result<(), TransferError> {
        let _guard = self.write_lock.lock();
        let snapshot: BTreeMap<String, ResumeCheckpoint> = self
            .state
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        write_json_atomic(&self.path, &snapshot)
            .map_err(|e| TransferError::Persistence(format!("{}: {}", self.path.display(), e)))
    }
}

impl ResumeStore for JsonResumeStore {
    fn save_checkpoint(
        &self,
        transfer_id: &str,
        remote_path: &str,
        local_path: &Path,
        bytes_transferred: u64,
        total_size: u64,
    ) -> Result<(), TransferError> {
        self.state.insert(
            transfer_id.to_string(),
            ResumeCheckpoint {
                remote_path: remote_path.to_string(),
                local_path: local_path.to_path_buf(),
                bytes_transferred,
                total_size,
                updated_at: Utc::now(),
            },
        );
        self.flush()
    }

    fn get_resume_offset(&self, remote_path: &str, local_path: &Path) -> u64 {
        self.state
            .iter()
            .filter(|entry| entry.value().matches(remote_path, local_path))
            .find(|entry| entry.value().is_valid())
            .map(|entry| entry.value().bytes_transferred)
            .unwrap_or(0)
    }

    fn clear_checkpoint(&self, transfer_id: &str) -> Result<(), TransferError> {
        if self.state.remove(transfer_id).is_some() {
            self.flush()?;
        }
        Ok(())
    }

    fn clear_by_path(&self, remote_path: &str, local_path: &Path) -> Result<(), TransferError> {
        let before = self.state.len();
        self.state.retain(|_, c| !c.matches(remote_path, local_path));
        if self.state.len() != before {
            self.flush()?;
        }
        Ok(())
    }
}
