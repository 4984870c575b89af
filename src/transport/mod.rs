// 传输层模块
//
// 定义引擎依赖的远端文件操作接口，以及连接来源（单连接 / 连接池）。

pub mod error;
pub mod local;
pub mod pool;
pub mod types;

#[cfg(test)]
pub mod mock;

pub use error::TransportError;
pub use local::LocalTransport;
pub use pool::{ConnectionPool, ConnectionSource, SingleConnection, TransportFactory};
pub use types::{
    format_permissions, format_size, join_remote, remote_file_name, remote_parent, sort_listing,
    Host, RemoteFile,
};

use async_trait::async_trait;
use std::path::Path;

/// 分块传输默认大小（256 KiB）
pub const DEFAULT_CHUNK_SIZE: usize = 262_144;

/// 进度回调
///
/// 每写完一个数据块调用一次，`bytes_done` 单调不减。
/// 返回 [`TransportError::Cancelled`] 时传输实现必须立即停止并原样返回该错误。
#[async_trait]
pub trait ProgressSink: Send {
    async fn on_progress(&mut self, bytes_done: u64, total: u64) -> Result<(), TransportError>;
}

/// 远端文件传输接口
///
/// 实现需可在多个任务间共享（`&self`），连接状态由实现内部维护。
#[async_trait]
pub trait Transport: Send + Sync {
    /// 建立连接
    async fn connect(&self) -> Result<(), TransportError>;

    /// 断开连接（幂等）
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// 当前是否已连接
    fn is_connected(&self) -> bool;

    /// 列出目录，按目录优先、名称忽略大小写排序
    async fn list_directory(&self, path: &str) -> Result<Vec<RemoteFile>, TransportError>;

    /// 下载远端文件
    ///
    /// `resume_offset > 0` 时从该偏移继续写入本地文件，缺失的父目录会被创建。
    async fn stream_download(
        &self,
        remote_path: &str,
        local_path: &Path,
        resume_offset: u64,
        sink: &mut dyn ProgressSink,
    ) -> Result<(), TransportError>;

    /// 上传本地文件
    async fn stream_upload(
        &self,
        local_path: &Path,
        remote_path: &str,
        sink: &mut dyn ProgressSink,
    ) -> Result<(), TransportError>;

    /// 获取单个远端文件信息
    async fn stat_file(&self, path: &str) -> Result<RemoteFile, TransportError>;

    /// 计算远端文件 MD5（十六进制），不支持时返回 `None`
    async fn compute_remote_hash(&self, path: &str) -> Result<Option<String>, TransportError>;

    /// 读取小文件（例如校验清单），超过 `max_bytes` 返回 [`TransportError::FileTooLarge`]
    async fn read_small_file(&self, path: &str, max_bytes: u64) -> Result<Vec<u8>, TransportError>;
}
