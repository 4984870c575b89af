use queued_rust::{
    config::AppConfig,
    logging,
    persistence::{JsonQueueStore, JsonResumeStore},
    transfer::{ChannelObserver, TransferEvent, TransferManager},
    transport::{LocalTransport, SingleConnection, Transport},
};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

const DEFAULT_CONFIG_PATH: &str = "config/app.toml";

/// 把引擎事件转成日志
async fn forward_events(mut rx: UnboundedReceiver<TransferEvent>) {
    while let Some(event) = rx.recv().await {
        match &event {
            TransferEvent::StatusChanged {
                remote_path,
                status,
                error,
                ..
            } => match error {
                Some(error) => info!("[{}] {} ({})", status, remote_path, error),
                None => info!("[{}] {}", status, remote_path),
            },
            TransferEvent::Progress { .. } => match serde_json::to_string(&event) {
                Ok(json) => debug!("{}", json),
                Err(e) => warn!("事件序列化失败: {}", e),
            },
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let config_path = args.next().unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let remote_root = args.next().unwrap_or_else(|| ".".to_string());

    let config = AppConfig::load_or_default(&config_path).await;
    let _log_guard = logging::init_logging(&config.log);

    info!("queued-rust v{} 启动中...", env!("CARGO_PKG_VERSION"));
    info!("配置文件: {}, 远端根目录: {}", config_path, remote_root);

    let transport = Arc::new(
        LocalTransport::new(&remote_root).with_chunk_size(config.transfer.chunk_size),
    );
    transport.connect().await?;

    let (observer, events) = ChannelObserver::new();
    tokio::spawn(forward_events(events));

    let manager = TransferManager::new(
        Arc::new(SingleConnection::new(transport.clone())),
        config.transfer.clone(),
        Arc::new(observer),
        Arc::new(JsonQueueStore::new(config.persistence.queue_path())),
        Arc::new(JsonResumeStore::open(config.persistence.resume_path())),
    );
    info!("已恢复 {} 个传输", manager.transfers().len());

    let scheduler = manager.spawn();

    tokio::signal::ctrl_c().await?;
    info!("收到退出信号，正在停止...");

    let paused = manager.pause_all();
    manager.stop().await;
    if let Err(e) = scheduler.await {
        warn!("调度任务异常退出: {}", e);
    }
    manager.persist()?;
    if let Err(e) = transport.disconnect().await {
        warn!("断开连接失败: {}", e);
    }

    info!("已退出，暂停了 {} 个传输", paused);
    Ok(())
}
