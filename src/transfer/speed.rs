//! 传输速度统计
//!
//! 2 秒滑动窗口计算速度，剩余时间用指数移动平均平滑。

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// 滑动窗口长度
const WINDOW: Duration = Duration::from_secs(2);

/// ETA 平滑系数：新值占 15%
const ETA_ALPHA: f64 = 0.15;

/// 单个传输的速度统计器
#[derive(Debug, Clone)]
pub struct SpeedTracker {
    samples: VecDeque<(Instant, u64)>,
    last_bytes: u64,
    smoothed_eta: Option<f64>,
}

impl SpeedTracker {
    pub fn new() -> Self {
        Self::with_baseline(0)
    }

    /// 以已有字节数为起点（续传时避免把偏移量算作速度）
    pub fn with_baseline(bytes: u64) -> Self {
        Self {
            samples: VecDeque::new(),
            last_bytes: bytes,
            smoothed_eta: None,
        }
    }

    /// 记录当前累计字节数，返回速度 (bytes/s)
    pub fn update(&mut self, current_bytes: u64) -> f64 {
        self.update_at(Instant::now(), current_bytes)
    }

    pub fn update_at(&mut self, now: Instant, current_bytes: u64) -> f64 {
        let delta = current_bytes.saturating_sub(self.last_bytes);
        self.last_bytes = current_bytes;
        self.samples.push_back((now, delta));

        while let Some(&(t, _)) = self.samples.front() {
            if now.saturating_duration_since(t) >= WINDOW {
                self.samples.pop_front();
            } else {
                break;
            }
        }

        if self.samples.len() < 2 {
            return 0.0;
        }
        let (first, last) = match (self.samples.front(), self.samples.back()) {
            (Some(first), Some(last)) => (first.0, last.0),
            _ => return 0.0,
        };
        let span = last.saturating_duration_since(first).as_secs_f64();
        if span <= 0.0 {
            return 0.0;
        }
        let total: u64 = self.samples.iter().map(|(_, b)| b).sum();
        total as f64 / span
    }

    /// 平滑后的剩余时间（秒），速度为 0 时返回 None
    pub fn smoothed_eta(&mut self, remaining_bytes: u64, speed: f64) -> Option<f64> {
        if speed <= 0.0 {
            return None;
        }
        let raw = remaining_bytes as f64 / speed;
        let eta = match self.smoothed_eta {
            Some(prev) => ETA_ALPHA * raw + (1.0 - ETA_ALPHA) * prev,
            None => raw,
        };
        self.smoothed_eta = Some(eta);
        Some(eta)
    }
}

impl Default for SpeedTracker {
    fn default() -> Self {
        Self::new()
    }
}
