// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 传输配置
    #[serde(default)]
    pub transfer: TransferConfig,
    /// 持久化配置
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 传输配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// 最大同时传输数
    #[serde(default = "default_max_concurrent_transfers")]
    pub max_concurrent_transfers: usize,
    /// 全局带宽上限 (bytes/s)，不设置表示不限速
    #[serde(default)]
    pub bandwidth_limit: Option<u64>,
    /// 下载目录，支持 `~` 开头
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// 下载完成后校验
    #[serde(default = "default_true")]
    pub verify_checksums: bool,
    /// 断点续传
    #[serde(default = "default_true")]
    pub resume_transfers: bool,
    /// 调度循环间隔（毫秒）
    #[serde(default = "default_scheduler_tick_ms")]
    pub scheduler_tick_ms: u64,
    /// 分块大小（字节）
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

fn default_max_concurrent_transfers() -> usize {
    10
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("~/Downloads")
}

fn default_true() -> bool {
    true
}

fn default_scheduler_tick_ms() -> u64 {
    100
}

fn default_chunk_size() -> usize {
    262_144 // 256KB
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_concurrent_transfers: default_max_concurrent_transfers(),
            bandwidth_limit: None,
            download_dir: default_download_dir(),
            verify_checksums: true,
            resume_transfers: true,
            scheduler_tick_ms: default_scheduler_tick_ms(),
            chunk_size: default_chunk_size(),
        }
    }
}

impl TransferConfig {
    /// 展开 `~` 后的下载目录
    pub fn resolved_download_dir(&self) -> PathBuf {
        expand_home(&self.download_dir)
    }

    pub fn bandwidth_limit_enabled(&self) -> bool {
        matches!(self.bandwidth_limit, Some(limit) if limit > 0)
    }
}

/// 持久化配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// 缓存目录，支持 `~` 开头
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// 队列快照文件名
    #[serde(default = "default_queue_file")]
    pub queue_file: String,
    /// 续传检查点文件名
    #[serde(default = "default_resume_file")]
    pub resume_file: String,
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("~/.cache/queued")
}

fn default_queue_file() -> String {
    "queue.json".to_string()
}

fn default_resume_file() -> String {
    "transfers.json".to_string()
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            queue_file: default_queue_file(),
            resume_file: default_resume_file(),
        }
    }
}

impl PersistenceConfig {
    pub fn queue_path(&self) -> PathBuf {
        expand_home(&self.cache_dir).join(&self.queue_file)
    }

    pub fn resume_path(&self) -> PathBuf {
        expand_home(&self.cache_dir).join(&self.resume_file)
    }
}

/// 展开路径开头的 `~`（基于 `$HOME`，未设置时原样返回）
pub fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match std::env::var_os("HOME") {
        Some(home) if !home.is_empty() => PathBuf::from(home).join(rest),
        _ => path.to_path_buf(),
    }
}

impl AppConfig {
    /// 校验并规范化配置
    pub fn validate(&mut self) -> Result<()> {
        if self.transfer.max_concurrent_transfers == 0 {
            anyhow::bail!("max_concurrent_transfers 必须大于 0");
        }
        if self.transfer.chunk_size == 0 {
            anyhow::bail!("chunk_size 必须大于 0");
        }
        if self.transfer.bandwidth_limit == Some(0) {
            self.transfer.bandwidth_limit = None;
        }
        if self.transfer.scheduler_tick_ms == 0 {
            self.transfer.scheduler_tick_ms = default_scheduler_tick_ms();
        }
        Ok(())
    }

    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let mut config: AppConfig =
            toml::from_str(&content).context("Failed to parse config file")?;
        config.validate().context("配置文件校验失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("配置已保存: {}", path);
        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                let default_config = Self::default();

                // 只在文件不存在时写出默认配置，避免覆盖用户写错的文件
                if !Path::new(path).exists() {
                    if let Err(e) = default_config.save_to_file(path).await {
                        tracing::error!("保存默认配置失败: {}", e);
                    }
                }

                default_config
            }
        }
    }
}
