//! 本地目录传输
//!
//! 把一个本地目录当作远端根目录，远端路径 `/a/b` 映射为 `<root>/a/b`。

use super::{
    format_permissions, join_remote, sort_listing, ProgressSink, RemoteFile, Transport,
    TransportError, DEFAULT_CHUNK_SIZE,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info};

/// 以本地目录为远端的传输实现
pub struct LocalTransport {
    root: PathBuf,
    chunk_size: usize,
    connected: AtomicBool,
}

impl LocalTransport {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            connected: AtomicBool::new(false),
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ensure_connected(&self) -> Result<(), TransportError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }

    /// 远端路径映射到根目录下，拒绝 `..`
    fn resolve(&self, remote_path: &str) -> Result<PathBuf, TransportError> {
        let mut resolved = self.root.clone();
        for part in remote_path.split('/') {
            match part {
                "" | "." => continue,
                ".." => {
                    return Err(TransportError::InvalidData(format!(
                        "path escapes root: {}",
                        remote_path
                    )))
                }
                other => {
                    if Path::new(other)
                        .components()
                        .any(|c| !matches!(c, Component::Normal(_)))
                    {
                        return Err(TransportError::InvalidData(format!(
                            "invalid path component: {}",
                            other
                        )));
                    }
                    resolved.push(other);
                }
            }
        }
        Ok(resolved)
    }

    fn entry_from_metadata(remote_path: String, name: String, meta: &std::fs::Metadata) -> RemoteFile {
        let modified = meta.modified().ok().map(DateTime::<Utc>::from);
        RemoteFile {
            name,
            path: remote_path,
            size: if meta.is_dir() { 0 } else { meta.len() },
            is_dir: meta.is_dir(),
            modified,
            permissions: permissions_of(meta),
        }
    }
}

#[cfg(unix)]
fn permissions_of(meta: &std::fs::Metadata) -> String {
    use std::os::unix::fs::PermissionsExt;
    format_permissions(meta.permissions().mode(), meta.is_dir())
}

#[cfg(not(unix))]
fn permissions_of(meta: &std::fs::Metadata) -> String {
    let mode = if meta.permissions().readonly() { 0o444 } else { 0o644 };
    format_permissions(mode, meta.is_dir())
}

fn map_remote_io(path: &str, e: std::io::Error) -> TransportError {
    if e.kind() == std::io::ErrorKind::NotFound {
        TransportError::NotFound(path.to_string())
    } else {
        TransportError::Transfer(format!("{}: {}", path, e))
    }
}

/// 计算文件 MD5（阻塞，需在 spawn_blocking 中调用）
fn md5_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut context = md5::Context::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        context.consume(&buffer[..n]);
    }
    Ok(format!("{:x}", context.compute()))
}

#[async_trait]
impl Transport for LocalTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let meta = tokio::fs::metadata(&self.root).await.map_err(|e| {
            TransportError::Connection(format!("{}: {}", self.root.display(), e))
        })?;
        if !meta.is_dir() {
            return Err(TransportError::Connection(format!(
                "not a directory: {}",
                self.root.display()
            )));
        }
        self.connected.store(true, Ordering::SeqCst);
        info!("已连接本地根目录: {}", self.root.display());
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn list_directory(&self, path: &str) -> Result<Vec<RemoteFile>, TransportError> {
        self.ensure_connected()?;
        let dir = self.resolve(path)?;
        let mut reader = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| map_remote_io(path, e))?;

        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await.map_err(|e| map_remote_io(path, e))? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let meta = match entry.metadata().await {
                Ok(meta) => meta,
                Err(e) => {
                    debug!("跳过无法读取的条目: {}, 错误: {}", name, e);
                    continue;
                }
            };
            let remote = join_remote(path, &name);
            entries.push(Self::entry_from_metadata(remote, name, &meta));
        }
        sort_listing(&mut entries);
        Ok(entries)
    }

    async fn stream_download(
        &self,
        remote_path: &str,
        local_path: &Path,
        resume_offset: u64,
        sink: &mut dyn ProgressSink,
    ) -> Result<(), TransportError> {
        self.ensure_connected()?;
        let source_path = self.resolve(remote_path)?;
        let mut source = tokio::fs::File::open(&source_path)
            .await
            .map_err(|e| map_remote_io(remote_path, e))?;
        let total = source
            .metadata()
            .await
            .map_err(|e| map_remote_io(remote_path, e))?
            .len();

        // 远端文件变小时从头开始
        let offset = if resume_offset > total { 0 } else { resume_offset };
        if offset > 0 {
            source
                .seek(std::io::SeekFrom::Start(offset))
                .await
                .map_err(|e| map_remote_io(remote_path, e))?;
        }

        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut target = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(offset == 0)
            .open(local_path)
            .await?;
        target.seek(std::io::SeekFrom::Start(offset)).await?;

        let mut buffer = vec![0u8; self.chunk_size];
        let mut done = offset;
        loop {
            let n = source
                .read(&mut buffer)
                .await
                .map_err(|e| TransportError::Transfer(format!("Download failed: {}", e)))?;
            if n == 0 {
                break;
            }
            target.write_all(&buffer[..n]).await?;
            target.flush().await?;
            done += n as u64;
            sink.on_progress(done, total).await?;
        }

        target.sync_all().await?;
        debug!("下载完成: {} -> {}", remote_path, local_path.display());
        Ok(())
    }

    async fn stream_upload(
        &self,
        local_path: &Path,
        remote_path: &str,
        sink: &mut dyn ProgressSink,
    ) -> Result<(), TransportError> {
        self.ensure_connected()?;
        let target_path = self.resolve(remote_path)?;
        let mut source = tokio::fs::File::open(local_path).await?;
        let total = source.metadata().await?.len();

        if let Some(parent) = target_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| map_remote_io(remote_path, e))?;
        }
        let mut target = tokio::fs::File::create(&target_path)
            .await
            .map_err(|e| map_remote_io(remote_path, e))?;

        let mut buffer = vec![0u8; self.chunk_size];
        let mut done = 0u64;
        loop {
            let n = source.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            target
                .write_all(&buffer[..n])
                .await
                .map_err(|e| TransportError::Transfer(format!("Upload failed: {}", e)))?;
            done += n as u64;
            sink.on_progress(done, total).await?;
        }
        target
            .flush()
            .await
            .map_err(|e| TransportError::Transfer(format!("Upload failed: {}", e)))?;
        Ok(())
    }

    async fn stat_file(&self, path: &str) -> Result<RemoteFile, TransportError> {
        self.ensure_connected()?;
        let resolved = self.resolve(path)?;
        let meta = tokio::fs::metadata(&resolved)
            .await
            .map_err(|e| map_remote_io(path, e))?;
        let name = super::remote_file_name(path).to_string();
        Ok(Self::entry_from_metadata(path.to_string(), name, &meta))
    }

    async fn compute_remote_hash(&self, path: &str) -> Result<Option<String>, TransportError> {
        self.ensure_connected()?;
        let resolved = self.resolve(path)?;
        let hash = tokio::task::spawn_blocking(move || md5_file(&resolved))
            .await
            .map_err(|e| TransportError::Transfer(format!("hash task failed: {}", e)))?
            .map_err(|e| map_remote_io(path, e))?;
        Ok(Some(hash))
    }

    async fn read_small_file(&self, path: &str, max_bytes: u64) -> Result<Vec<u8>, TransportError> {
        self.ensure_connected()?;
        let resolved = self.resolve(path)?;
        let size = tokio::fs::metadata(&resolved)
            .await
            .map_err(|e| map_remote_io(path, e))?
            .len();
        if size > max_bytes {
            return Err(TransportError::FileTooLarge {
                size,
                max: max_bytes,
            });
        }
        tokio::fs::read(&resolved)
            .await
            .map_err(|e| map_remote_io(path, e))
    }
}
