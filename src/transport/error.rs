//! 传输层错误类型

use thiserror::Error;

/// 远端传输错误
///
/// `Connection` 覆盖认证、网络和主机密钥校验失败，`Transfer` 覆盖传输中途的失败。
/// `Cancelled` 由 [`ProgressSink`](super::ProgressSink) 返回，用于协作式中止数据流。
#[derive(Debug, Error)]
pub enum TransportError {
    /// 连接失败（主机不可达、认证失败、主机密钥不匹配）
    #[error("Connection error: {0}")]
    Connection(String),

    /// 传输中途失败
    #[error("{0}")]
    Transfer(String),

    /// 远端路径不存在
    #[error("Not found: {0}")]
    NotFound(String),

    /// 尚未连接
    #[error("Not connected")]
    NotConnected,

    /// 连接池中没有该主机的凭据
    #[error("Unknown host: {0}")]
    UnknownHost(String),

    /// 小文件读取超过上限
    #[error("File too large: {size} bytes (max {max})")]
    FileTooLarge { size: u64, max: u64 },

    /// 非法数据（例如越出根目录的路径）
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// 传输被取消（暂停、停止或删除）
    #[error("Transfer cancelled")]
    Cancelled,

    /// 本地文件系统错误
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// 是否为取消
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// 是否表示连接已断开
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::Connection(_) | Self::NotConnected => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}
