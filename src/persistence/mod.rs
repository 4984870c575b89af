//! 持久化模块
//!
//! 引擎只依赖两类存储：
//! - 队列快照（[`QueueStore`]）：每次状态变更后整体覆盖写入
//! - 续传检查点（[`ResumeStore`]）：按 (远端路径, 本地路径) 记录已写入的字节数
//!
//! ## 文件结构
//!
//! ```text
//! <cache_dir>/
//! ├── queue.json        # 队列快照
//! └── transfers.json    # 续传检查点
//! ```

pub mod atomic;
pub mod queue_store;
pub mod resume;

pub use atomic::{read_json, write_json_atomic};
pub use queue_store::{JsonQueueStore, QueueSnapshot, QueueStore};
pub use resume::{JsonResumeStore, ResumeCheckpoint, ResumeStore};
