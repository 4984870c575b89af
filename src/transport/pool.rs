//! 连接来源
//!
//! 引擎通过 [`ConnectionSource`] 获取传输连接：
//! - [`SingleConnection`]：所有传输共享同一个连接
//! - [`ConnectionPool`]：按 `user@host:port` 维护多主机连接，断线时自动重连

use super::{Host, Transport, TransportError};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// 为传输任务提供连接
#[async_trait]
pub trait ConnectionSource: Send + Sync {
    /// 获取主机连接，`host_key` 为空时返回主连接
    async fn connection_for(&self, host_key: &str) -> Result<Arc<dyn Transport>, TransportError>;
}

/// 打开新的传输连接（未连接状态），由连接池负责调用 `connect`
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn open(&self, host: &Host) -> Result<Arc<dyn Transport>, TransportError>;
}

// =====================================================
// 单连接
// =====================================================

/// 单一连接，忽略 host_key
pub struct SingleConnection {
    transport: Arc<dyn Transport>,
}

impl SingleConnection {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }
}

#[async_trait]
impl ConnectionSource for SingleConnection {
    async fn connection_for(&self, _host_key: &str) -> Result<Arc<dyn Transport>, TransportError> {
        if !self.transport.is_connected() {
            return Err(TransportError::NotConnected);
        }
        Ok(self.transport.clone())
    }
}

// =====================================================
// 连接池
// =====================================================

type ConnectionCell = Arc<OnceCell<Arc<dyn Transport>>>;

/// 多主机连接池
///
/// 同一主机的并发请求只会建立一个连接；已断开的连接在下次请求时被替换。
pub struct ConnectionPool {
    factory: Arc<dyn TransportFactory>,
    /// 已注册主机凭据 (host_key -> Host)
    hosts: DashMap<String, Host>,
    /// 活跃连接 (host_key -> 连接)
    connections: DashMap<String, ConnectionCell>,
    /// host_key 为空时使用的主连接
    primary: Option<Arc<dyn Transport>>,
}

impl ConnectionPool {
    pub fn new(factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            factory,
            hosts: DashMap::new(),
            connections: DashMap::new(),
            primary: None,
        }
    }

    /// 设置主连接
    pub fn with_primary(mut self, transport: Arc<dyn Transport>) -> Self {
        self.primary = Some(transport);
        self
    }

    /// 注册主机凭据，返回 host_key
    pub fn register_host(&self, host: Host) -> String {
        let key = host.host_key();
        debug!("注册主机: {}", key);
        self.hosts.insert(key.clone(), host);
        key
    }

    /// 加入一个已建立的连接
    pub fn add_connection(&self, host: Host, transport: Arc<dyn Transport>) {
        let key = self.register_host(host);
        let cell = OnceCell::new();
        let _ = cell.set(transport);
        self.connections.insert(key, Arc::new(cell));
    }

    /// 已连接的主机列表
    pub fn connected_hosts(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .connections
            .iter()
            .filter(|entry| entry.value().get().is_some_and(|t| t.is_connected()))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// 断开并移除某个主机的连接
    pub async fn disconnect(&self, host_key: &str) {
        if let Some((_, cell)) = self.connections.remove(host_key) {
            if let Some(transport) = cell.get() {
                if let Err(e) = transport.disconnect().await {
                    warn!("断开连接失败: host={}, 错误: {}", host_key, e);
                }
            }
            info!("已断开主机连接: {}", host_key);
        }
    }

    /// 断开所有连接（包括主连接）
    pub async fn disconnect_all(&self) {
        let keys: Vec<String> = self.connections.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.disconnect(&key).await;
        }
        if let Some(primary) = &self.primary {
            if let Err(e) = primary.disconnect().await {
                warn!("断开主连接失败: {}", e);
            }
        }
    }

    fn cell_for(&self, host_key: &str) -> ConnectionCell {
        self.connections
            .entry(host_key.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }
}

#[async_trait]
impl ConnectionSource for ConnectionPool {
    async fn connection_for(&self, host_key: &str) -> Result<Arc<dyn Transport>, TransportError> {
        if host_key.is_empty() {
            return match &self.primary {
                Some(primary) if primary.is_connected() => Ok(primary.clone()),
                _ => Err(TransportError::NotConnected),
            };
        }

        let host = self
            .hosts
            .get(host_key)
            .map(|h| h.value().clone())
            .ok_or_else(|| TransportError::UnknownHost(host_key.to_string()))?;

        loop {
            let cell = self.cell_for(host_key);

            if let Some(existing) = cell.get() {
                if existing.is_connected() {
                    return Ok(existing.clone());
                }
                // 连接已断开：只移除当前这个单元，避免误删其他任务刚建立的新连接
                info!("连接已断开，准备重连: {}", host_key);
                self.connections
                    .remove_if(host_key, |_, current| Arc::ptr_eq(current, &cell));
                continue;
            }

            let factory = self.factory.clone();
            let host = host.clone();
            let transport = cell
                .get_or_try_init(|| async move {
                    info!("建立新连接: {}", host.display_name());
                    let transport = factory.open(&host).await?;
                    transport.connect().await?;
                    Ok::<_, TransportError>(transport)
                })
                .await?;
            return Ok(transport.clone());
        }
    }
}
