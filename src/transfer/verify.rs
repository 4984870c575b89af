//! 下载完整性校验
//!
//! 依次尝试：
//! 1. 远端同目录下的 `.sfv` / `.md5` 清单
//! 2. 远端计算的 MD5
//! 3. 仅比较文件大小
//!
//! 清单读取和远端命令的失败都视为"没有校验数据"，不会导致校验失败。

use crate::transport::{join_remote, remote_file_name, remote_parent, Transport};
use regex::Regex;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::debug;

/// 清单文件大小上限（1 MiB）
pub const MAX_MANIFEST_SIZE: u64 = 1024 * 1024;

const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// 校验结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationOutcome {
    pub success: bool,
    pub message: String,
}

impl VerificationOutcome {
    fn pass(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }

    fn from_comparison(matched: bool, kind: &str, source: &str) -> Self {
        if matched {
            Self::pass(format!("{} match ({})", kind, source))
        } else {
            Self::fail(format!("{} mismatch ({})", kind, source))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HashKind {
    Crc32,
    Md5,
}

impl HashKind {
    fn label(&self) -> &'static str {
        match self {
            Self::Crc32 => "CRC32",
            Self::Md5 => "MD5",
        }
    }
}

fn sfv_line() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(.+?)\s+([0-9a-fA-F]{8})$").ok())
        .as_ref()
}

fn md5_line() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([0-9a-fA-F]{32})\s+\*?(.+)$").ok())
        .as_ref()
}

/// 在 SFV 清单中查找文件的 CRC32（小写）
pub fn parse_sfv_entry(content: &str, filename: &str) -> Option<String> {
    let re = sfv_line()?;
    let wanted = filename.to_lowercase();
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with(';'))
        .filter_map(|line| re.captures(line))
        .find(|caps| caps[1].to_lowercase() == wanted)
        .map(|caps| caps[2].to_lowercase())
}

/// 在 MD5 清单中查找文件的 MD5（小写），支持 `HASH  name` 和 `HASH *name`
pub fn parse_md5_entry(content: &str, filename: &str) -> Option<String> {
    let re = md5_line()?;
    let wanted = filename.to_lowercase();
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| re.captures(line))
        .find(|caps| caps[2].trim().to_lowercase() == wanted)
        .map(|caps| caps[1].to_lowercase())
}

fn hash_file_sync(path: &Path, kind: HashKind) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    match kind {
        HashKind::Crc32 => {
            let mut hasher = crc32fast::Hasher::new();
            loop {
                let n = file.read(&mut buffer)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buffer[..n]);
            }
            Ok(format!("{:08x}", hasher.finalize()))
        }
        HashKind::Md5 => {
            let mut context = md5::Context::new();
            loop {
                let n = file.read(&mut buffer)?;
                if n == 0 {
                    break;
                }
                context.consume(&buffer[..n]);
            }
            Ok(format!("{:x}", context.compute()))
        }
    }
}

/// 在阻塞线程池中计算本地文件哈希
async fn hash_local_file(path: &Path, kind: HashKind) -> std::io::Result<String> {
    let path: PathBuf = path.to_path_buf();
    tokio::task::spawn_blocking(move || hash_file_sync(&path, kind))
        .await
        .map_err(std::io::Error::other)?
}

pub async fn local_md5(path: &Path) -> std::io::Result<String> {
    hash_local_file(path, HashKind::Md5).await
}

pub async fn local_crc32(path: &Path) -> std::io::Result<String> {
    hash_local_file(path, HashKind::Crc32).await
}

async fn compare_local(path: &Path, kind: HashKind, expected: &str, source: &str) -> VerificationOutcome {
    match hash_local_file(path, kind).await {
        Ok(actual) => VerificationOutcome::from_comparison(
            actual.eq_ignore_ascii_case(expected),
            kind.label(),
            source,
        ),
        Err(e) => VerificationOutcome::fail(format!("I/O error: {}", e)),
    }
}

/// 在远端目录的清单中查找期望值
async fn find_manifest_entry(
    transport: &dyn Transport,
    remote_dir: &str,
    filename: &str,
) -> Option<(HashKind, String, String)> {
    let entries = match transport.list_directory(remote_dir).await {
        Ok(entries) => entries,
        Err(e) => {
            debug!("列出校验清单失败: {}, 错误: {}", remote_dir, e);
            return None;
        }
    };

    for entry in entries.iter().filter(|e| !e.is_dir) {
        let lower = entry.name.to_lowercase();
        let kind = if lower.ends_with(".sfv") {
            HashKind::Crc32
        } else if lower.ends_with(".md5") {
            HashKind::Md5
        } else {
            continue;
        };

        let manifest_path = join_remote(remote_dir, &entry.name);
        let content = match transport
            .read_small_file(&manifest_path, MAX_MANIFEST_SIZE)
            .await
        {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                debug!("读取校验清单失败: {}, 错误: {}", manifest_path, e);
                continue;
            }
        };

        let expected = match kind {
            HashKind::Crc32 => parse_sfv_entry(&content, filename),
            HashKind::Md5 => parse_md5_entry(&content, filename),
        };
        if let Some(expected) = expected {
            return Some((kind, expected, entry.name.clone()));
        }
    }
    None
}

/// 校验已下载文件
pub async fn verify_file(
    remote_path: &str,
    local_path: &Path,
    expected_size: u64,
    transport: &dyn Transport,
) -> VerificationOutcome {
    let local_size = match tokio::fs::metadata(local_path).await {
        Ok(meta) if meta.is_file() => meta.len(),
        _ => return VerificationOutcome::fail("Local file not found"),
    };

    let remote_dir = remote_parent(remote_path);
    let filename = remote_file_name(remote_path);

    if let Some((kind, expected, manifest)) =
        find_manifest_entry(transport, remote_dir, filename).await
    {
        return compare_local(local_path, kind, &expected, &manifest).await;
    }

    match transport.compute_remote_hash(remote_path).await {
        Ok(Some(remote_hash)) => {
            return compare_local(local_path, HashKind::Md5, remote_hash.trim(), "remote").await;
        }
        Ok(None) => {}
        Err(e) => debug!("远端哈希不可用: {}, 错误: {}", remote_path, e),
    }

    if local_size == expected_size {
        VerificationOutcome::pass(format!("Size match only ({} bytes)", local_size))
    } else {
        VerificationOutcome::fail(format!(
            "Size mismatch: expected {}, got {}",
            expected_size, local_size
        ))
    }
}
