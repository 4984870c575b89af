// 传输模块
//
// 下载/上传队列、调度与执行引擎

pub mod bandwidth;
pub mod events;
pub mod manager;
pub mod path_guard;
pub mod queue;
pub mod speed;
pub mod types;
pub mod verify;

pub use bandwidth::{BandwidthLimiter, GlobalBandwidthLimiter};
pub use events::{ChannelObserver, NoopObserver, TransferEvent, TransferObserver};
pub use manager::{TransferManager, CHECKSUM_FAILED};
pub use path_guard::DownloadPathGuard;
pub use queue::TransferQueue;
pub use speed::SpeedTracker;
pub use types::{Transfer, TransferDirection, TransferError, TransferStatus};
pub use verify::{verify_file, VerificationOutcome};

pub use crate::transport::{Host, RemoteFile};
