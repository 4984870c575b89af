//! 带宽限制
//!
//! 记录上次检查以来的字节数和耗时，实际速率超过上限时睡眠到平均速率等于上限，然后重置计数。
//! 全局限速器由所有运行中的传输共享。

use dashmap::DashSet;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// 单个限速器
#[derive(Debug)]
pub struct BandwidthLimiter {
    /// 上限 (bytes/s)，None 表示不限速
    limit: Option<u64>,
    last_check: Instant,
    bytes_since_check: u64,
}

impl BandwidthLimiter {
    pub fn new(limit: Option<u64>) -> Self {
        Self {
            limit: normalize(limit),
            last_check: Instant::now(),
            bytes_since_check: 0,
        }
    }

    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    pub fn set_limit(&mut self, limit: Option<u64>) {
        self.limit = normalize(limit);
        self.bytes_since_check = 0;
        self.last_check = Instant::now();
    }

    pub fn is_unlimited(&self) -> bool {
        self.limit.is_none()
    }

    /// 记录字节数并计算需要等待的时长
    ///
    /// 超速时计数器立即重置，检查点挪到等待结束的时刻，
    /// 因此共享同一个限速器的其他任务不会重复计入这段等待。
    pub fn reserve(&mut self, bytes: u64, now: Instant) -> Option<Duration> {
        let limit = self.limit?;
        self.bytes_since_check = self.bytes_since_check.saturating_add(bytes);

        let elapsed = now.saturating_duration_since(self.last_check).as_secs_f64();
        if elapsed <= 0.0 {
            return None;
        }
        let rate = self.bytes_since_check as f64 / elapsed;
        if rate <= limit as f64 {
            return None;
        }

        let wait = (self.bytes_since_check as f64 / limit as f64 - elapsed).max(0.0);
        let wait = Duration::from_secs_f64(wait);
        self.bytes_since_check = 0;
        self.last_check = now + wait;
        Some(wait)
    }

    /// 按需睡眠；不限速时立即返回
    pub async fn throttle(&mut self, bytes: u64) {
        if let Some(wait) = self.reserve(bytes, Instant::now()) {
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
        }
    }
}

fn normalize(limit: Option<u64>) -> Option<u64> {
    limit.filter(|l| *l > 0)
}

/// 全局限速器
///
/// 计数器只在计算等待时长时加锁，睡眠在锁外进行。
#[derive(Debug)]
pub struct GlobalBandwidthLimiter {
    inner: Mutex<BandwidthLimiter>,
    active: DashSet<String>,
}

impl GlobalBandwidthLimiter {
    pub fn new(limit: Option<u64>) -> Self {
        Self {
            inner: Mutex::new(BandwidthLimiter::new(limit)),
            active: DashSet::new(),
        }
    }

    pub async fn set_limit(&self, limit: Option<u64>) {
        self.inner.lock().await.set_limit(limit);
    }

    pub async fn limit(&self) -> Option<u64> {
        self.inner.lock().await.limit()
    }

    /// 登记运行中的传输
    pub fn register(&self, transfer_id: &str) {
        self.active.insert(transfer_id.to_string());
        debug!("限速器登记: {}, 当前 {} 个", transfer_id, self.active.len());
    }

    pub fn unregister(&self, transfer_id: &str) {
        self.active.remove(transfer_id);
        debug!("限速器注销: {}, 当前 {} 个", transfer_id, self.active.len());
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn is_registered(&self, transfer_id: &str) -> bool {
        self.active.contains(transfer_id)
    }

    pub async fn throttle(&self, bytes: u64) {
        let wait = {
            let mut limiter = self.inner.lock().await;
            limiter.reserve(bytes, Instant::now())
        };
        if let Some(wait) = wait {
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
        }
    }
}
