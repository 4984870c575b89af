//! 传输层数据类型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// 远端文件条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    /// 文件名
    pub name: String,
    /// 完整远端路径（POSIX 风格）
    pub path: String,
    /// 文件大小（字节）
    pub size: u64,
    /// 是否为目录
    pub is_dir: bool,
    /// 修改时间
    #[serde(default)]
    pub modified: Option<DateTime<Utc>>,
    /// 权限字符串，例如 `drwxr-xr-x`
    #[serde(default)]
    pub permissions: String,
}

impl RemoteFile {
    /// 创建普通文件条目
    pub fn file(path: impl Into<String>, size: u64) -> Self {
        let path = path.into();
        let name = remote_file_name(&path).to_string();
        Self {
            name,
            path,
            size,
            is_dir: false,
            modified: None,
            permissions: String::new(),
        }
    }

    /// 创建目录条目
    pub fn directory(path: impl Into<String>) -> Self {
        let path = path.into();
        let name = remote_file_name(&path).to_string();
        Self {
            name,
            path,
            size: 0,
            is_dir: true,
            modified: None,
            permissions: String::new(),
        }
    }

    /// 人类可读的文件大小
    pub fn size_human(&self) -> String {
        if self.is_dir {
            return "<DIR>".to_string();
        }
        format_size(self.size)
    }
}

/// 目录排序：目录在前，其余按名称忽略大小写排序
pub fn sort_listing(entries: &mut [RemoteFile]) {
    entries.sort_by(|a, b| {
        b.is_dir
            .cmp(&a.is_dir)
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
    });
}

/// 远端路径的最后一个组成部分
pub fn remote_file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// 远端路径的父目录，根目录下的文件返回 `/`
pub fn remote_parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(idx) => &path[..idx],
        None => ".",
    }
}

/// 拼接远端目录与文件名
pub fn join_remote(dir: &str, name: &str) -> String {
    if dir.is_empty() || dir == "." {
        return name.to_string();
    }
    format!("{}/{}", dir.trim_end_matches('/'), name)
}

/// 字节数格式化（B/KB/MB/GB/TB，1024 进制）
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    for unit in &UNITS[..UNITS.len() - 1] {
        if size < 1024.0 {
            return format!("{:.1} {}", size, unit);
        }
        size /= 1024.0;
    }
    format!("{:.1} {}", size, UNITS[UNITS.len() - 1])
}

/// Unix 权限位格式化为 `rwx` 字符串
pub fn format_permissions(mode: u32, is_dir: bool) -> String {
    let mut out = String::with_capacity(10);
    out.push(if is_dir { 'd' } else { '-' });
    for shift in [6u32, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}

// =====================================================
// 主机信息
// =====================================================

/// 远端主机连接信息
///
/// 密码以 base64 混淆后写入 `_pw` 字段，这不是加密。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub hostname: String,
    pub username: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    #[serde(
        rename = "_pw",
        default,
        with = "obfuscated",
        skip_serializing_if = "Option::is_none"
    )]
    pub password: Option<String>,
    #[serde(default)]
    pub last_used: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_directory: Option<String>,
}

fn default_port() -> u16 {
    22
}

impl Host {
    pub fn new(hostname: impl Into<String>, username: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            username: username.into(),
            port,
            key_path: None,
            password: None,
            last_used: None,
            last_directory: None,
        }
    }

    /// 解析 `user@host` 形式，没有 `@` 时用户名为空
    pub fn from_string(target: &str, port: u16, key_path: Option<PathBuf>) -> Self {
        let (username, hostname) = match target.split_once('@') {
            Some((user, host)) => (user, host),
            None => ("", target),
        };
        let mut host = Self::new(hostname, username, port);
        host.key_path = key_path;
        host
    }

    /// 连接池键：`user@host:port`
    pub fn host_key(&self) -> String {
        format!("{}@{}:{}", self.username, self.hostname, self.port)
    }

    pub fn display_name(&self) -> String {
        if self.port == 22 {
            format!("{}@{}", self.username, self.hostname)
        } else {
            self.host_key()
        }
    }
}

impl std::fmt::Display for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.hostname, self.port)
    }
}

mod obfuscated {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<String>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(pw) => s.serialize_str(&STANDARD.encode(pw.as_bytes())),
            None => s.serialize_none(),
        }
    }

    /// 无法解码的值视为没有密码
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        Ok(raw
            .and_then(|encoded| STANDARD.decode(encoded.as_bytes()).ok())
            .and_then(|bytes| String::from_utf8(bytes).ok()))
    }
}
