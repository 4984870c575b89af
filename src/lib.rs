// SFTP 传输队列核心库
// 下载/上传排队、调度、断点续传与完整性校验

// 配置管理模块
pub mod config;

// 日志模块
pub mod logging;

// 持久化模块
pub mod persistence;

// 传输引擎模块
pub mod transfer;

// 传输层模块
pub mod transport;

// 导出常用类型
pub use config::AppConfig;
pub use persistence::{JsonQueueStore, JsonResumeStore, QueueStore, ResumeStore};
pub use transfer::{
    Transfer, TransferDirection, TransferError, TransferEvent, TransferManager, TransferObserver,
    TransferStatus,
};
pub use transport::{
    ConnectionPool, ConnectionSource, Host, LocalTransport, RemoteFile, SingleConnection,
    Transport, TransportError,
};
