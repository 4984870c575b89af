// 下载路径守卫
//
// 计算下载文件的本地路径，并确保结果不会越出下载目录

use std::path::{Component, Path, PathBuf};

use super::types::TransferError;
use crate::transport::{remote_file_name, RemoteFile};

/// 下载目录守卫
#[derive(Debug, Clone)]
pub struct DownloadPathGuard {
    /// 规范化后的下载根目录
    root: PathBuf,
}

impl DownloadPathGuard {
    /// 创建守卫，下载目录不存在时自动创建
    pub fn new(download_dir: &Path) -> Result<Self, TransferError> {
        std::fs::create_dir_all(download_dir)?;
        let root = dunce::canonicalize(download_dir)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 计算远端文件的本地保存路径
    ///
    /// - 指定 `base_dir` 时保留相对于它的目录结构，并创建父目录
    /// - 否则只取文件名
    pub fn resolve(
        &self,
        remote: &RemoteFile,
        base_dir: Option<&str>,
    ) -> Result<PathBuf, TransferError> {
        let candidate = match base_dir.filter(|b| !b.is_empty()) {
            Some(base) => {
                let relative = relative_to(&remote.path, base)?;
                let mut path = self.root.clone();
                for part in relative.split('/') {
                    validate_component(part, "Invalid path component")?;
                    path.push(part);
                }
                self.create_parent_dirs(&path)
                    .map_err(|e| match e {
                        TransferError::PathTraversal(_) => {
                            TransferError::PathTraversal(remote.path.clone())
                        }
                        other => other,
                    })?;
                path
            }
            None => {
                let name = remote_file_name(&remote.name);
                validate_component(name, "Invalid filename")?;
                self.root.join(name)
            }
        };

        self.ensure_contained(&candidate)
            .map_err(|_| TransferError::PathTraversal(remote.path.clone()))
    }

    /// 创建缺失的父目录
    ///
    /// 先解析已存在的最深祖先目录并确认它在下载目录内，再创建其余部分，
    /// 指向外部的符号链接不会导致在下载目录之外建目录。
    fn create_parent_dirs(&self, path: &Path) -> Result<(), TransferError> {
        let Some(parent) = path.parent() else {
            return Ok(());
        };
        let blocked = || TransferError::PathTraversal(path.display().to_string());

        let mut existing = parent;
        while std::fs::symlink_metadata(existing).is_err() {
            existing = existing.parent().ok_or_else(blocked)?;
        }
        let resolved = dunce::canonicalize(existing).map_err(|_| blocked())?;
        if !resolved.starts_with(&self.root) {
            return Err(blocked());
        }

        std::fs::create_dir_all(parent)?;
        Ok(())
    }

    /// 解析符号链接后确认路径仍在下载目录内，返回解析后的路径
    pub fn ensure_contained(&self, path: &Path) -> Result<PathBuf, TransferError> {
        let (parent, name) = match (path.parent(), path.file_name()) {
            (Some(parent), Some(name)) => (parent, name),
            _ => return Err(TransferError::PathTraversal(path.display().to_string())),
        };
        let parent = dunce::canonicalize(parent)
            .map_err(|_| TransferError::PathTraversal(path.display().to_string()))?;
        let resolved = parent.join(name);
        if resolved.starts_with(&self.root) && resolved != self.root {
            Ok(resolved)
        } else {
            Err(TransferError::PathTraversal(path.display().to_string()))
        }
    }
}

/// 远端路径相对于 base 的部分（POSIX 语义，按组件边界匹配）
fn relative_to<'a>(path: &'a str, base: &str) -> Result<&'a str, TransferError> {
    let trimmed = base.trim_end_matches('/');
    let rest = if trimmed.is_empty() {
        path.strip_prefix('/')
    } else {
        path.strip_prefix(trimmed).and_then(|r| r.strip_prefix('/'))
    };
    rest.ok_or_else(|| TransferError::InvalidData(format!("{} is not under {}", path, base)))
}

/// 单个路径组件必须是普通名称
fn validate_component(part: &str, what: &str) -> Result<(), TransferError> {
    let mut components = Path::new(part).components();
    let is_plain = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    );
    if part.is_empty() || part == "." || part == ".." || !is_plain {
        return Err(TransferError::InvalidData(format!("{}: {}", what, part)));
    }
    Ok(())
}
