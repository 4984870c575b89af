// 传输模块类型定义

use crate::transport::{format_size, remote_file_name, TransportError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// 传输方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Download,
    Upload,
}

/// 传输状态
///
/// 状态流转：
/// - Queued -> Transferring -> (Verifying) -> Completed / Failed
/// - Queued -> Paused，Transferring -> Paused / Stopped
/// - Paused -> Queued（单个恢复），Stopped -> Queued（队列恢复）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    /// 排队中
    Queued,
    /// 连接中（保留状态）
    Connecting,
    /// 传输中
    Transferring,
    /// 用户暂停
    Paused,
    /// 队列停止导致的中断
    Stopped,
    /// 已完成
    Completed,
    /// 失败
    Failed,
    /// 校验中
    Verifying,
}

impl TransferStatus {
    /// 是否为终态（不会再改变）
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// 是否有执行单元正在驱动
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Connecting | Self::Transferring | Self::Verifying)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Connecting => "connecting",
            Self::Transferring => "transferring",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Verifying => "verifying",
        }
    }
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单个文件传输
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transfer {
    /// 传输ID
    pub id: String,
    /// 远端路径
    pub remote_path: String,
    /// 本地路径
    pub local_path: PathBuf,
    /// 方向
    pub direction: TransferDirection,
    /// 文件大小
    pub size: u64,
    /// 所属主机（空 = 主连接）
    #[serde(default)]
    pub host_key: String,
    /// 状态
    pub status: TransferStatus,
    /// 已传输字节数
    #[serde(default)]
    pub bytes_transferred: u64,
    /// 平滑后的速度 (bytes/s)
    #[serde(skip)]
    pub speed: f64,
    /// 错误信息
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// 期望校验值
    #[serde(default)]
    pub checksum: Option<String>,
    /// 平滑后的剩余时间（秒），仅运行时
    #[serde(skip)]
    pub smoothed_eta_seconds: Option<f64>,
}

impl Transfer {
    pub fn new(
        remote_path: String,
        local_path: PathBuf,
        direction: TransferDirection,
        size: u64,
        host_key: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            remote_path,
            local_path,
            direction,
            size,
            host_key,
            status: TransferStatus::Queued,
            bytes_transferred: 0,
            speed: 0.0,
            error: None,
            started_at: None,
            completed_at: None,
            checksum: None,
            smoothed_eta_seconds: None,
        }
    }

    pub fn download(remote_path: String, local_path: PathBuf, size: u64, host_key: String) -> Self {
        Self::new(remote_path, local_path, TransferDirection::Download, size, host_key)
    }

    pub fn upload(local_path: PathBuf, remote_path: String, size: u64) -> Self {
        Self::new(remote_path, local_path, TransferDirection::Upload, size, String::new())
    }

    /// 进度百分比，空文件视为已完成
    pub fn progress(&self) -> f64 {
        if self.size == 0 {
            return 100.0;
        }
        (self.bytes_transferred as f64 / self.size as f64) * 100.0
    }

    pub fn speed_human(&self) -> String {
        if self.speed <= 0.0 {
            return "0 B/s".to_string();
        }
        const UNITS: [&str; 4] = ["B/s", "KB/s", "MB/s", "GB/s"];
        let mut speed = self.speed;
        for unit in &UNITS[..UNITS.len() - 1] {
            if speed < 1024.0 {
                return format!("{:.1} {}", speed, unit);
            }
            speed /= 1024.0;
        }
        format!("{:.1} {}", speed, UNITS[UNITS.len() - 1])
    }

    /// 剩余秒数，仅传输中有效
    pub fn eta_seconds(&self) -> Option<f64> {
        if self.status != TransferStatus::Transferring {
            return None;
        }
        let seconds = match self.smoothed_eta_seconds {
            Some(s) => s,
            None if self.speed > 0.0 => {
                self.size.saturating_sub(self.bytes_transferred) as f64 / self.speed
            }
            None => return None,
        };
        (seconds > 0.0).then_some(seconds)
    }

    /// 剩余时间显示：`42s`、`3m 5s`、`2h 10m`
    pub fn eta_display(&self) -> Option<String> {
        let seconds = self.eta_seconds()? as u64;
        Some(if seconds < 60 {
            format!("{}s", seconds)
        } else if seconds < 3600 {
            format!("{}m {}s", seconds / 60, seconds % 60)
        } else {
            format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
        })
    }

    pub fn filename(&self) -> &str {
        remote_file_name(&self.remote_path)
    }

    pub fn size_human(&self) -> String {
        format_size(self.size)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_active(&self) -> bool {
        self.status == TransferStatus::Transferring
    }

    /// 标记为传输中
    pub fn mark_transferring(&mut self) {
        self.status = TransferStatus::Transferring;
        self.error = None;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    /// 标记为校验中
    pub fn mark_verifying(&mut self) {
        self.status = TransferStatus::Verifying;
        self.speed = 0.0;
        self.smoothed_eta_seconds = None;
    }

    /// 标记为已完成
    pub fn mark_completed(&mut self) {
        self.status = TransferStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.bytes_transferred = self.size;
        self.speed = 0.0;
        self.smoothed_eta_seconds = None;
    }

    /// 标记为失败
    pub fn mark_failed(&mut self, error: String) {
        self.status = TransferStatus::Failed;
        self.error = Some(error);
        self.speed = 0.0;
        self.smoothed_eta_seconds = None;
    }

    /// 标记为暂停或停止后清理运行时字段
    pub fn mark_interrupted(&mut self, status: TransferStatus) {
        self.status = status;
        self.speed = 0.0;
        self.smoothed_eta_seconds = None;
    }

    /// 重新排队
    pub fn mark_queued(&mut self) {
        self.status = TransferStatus::Queued;
        self.error = None;
        self.speed = 0.0;
        self.smoothed_eta_seconds = None;
    }
}

// =====================================================
// 错误类型
// =====================================================

/// 传输引擎错误
#[derive(Debug, Error)]
pub enum TransferError {
    /// 非法输入（路径组件、文件名等）
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// 目标路径越出下载目录
    #[error("Path traversal attempt blocked: {0}")]
    PathTraversal(String),

    /// 上传源文件不存在
    #[error("Local file not found: {}", .0.display())]
    LocalFileNotFound(PathBuf),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// 本地文件系统错误
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// 持久化失败
    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl TransferError {
    /// 是否为取消（暂停/停止/删除），不属于失败
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Transport(TransportError::Cancelled))
    }
}
