//! 测试用内存传输

use super::{remote_parent, sort_listing, ProgressSink, RemoteFile, Transport, TransportError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

/// 内存中的远端文件系统
pub struct MockTransport {
    connected: AtomicBool,
    files: Mutex<HashMap<String, Vec<u8>>>,
    hashes: Mutex<HashMap<String, String>>,
    uploads: Mutex<HashMap<String, Vec<u8>>>,
    download_offsets: Mutex<Vec<(String, u64)>>,
    download_failure: Mutex<Option<String>>,
    chunk_size: usize,
    chunk_delay: Option<Duration>,
    fail_listing: AtomicBool,
    fail_hashing: AtomicBool,
    pub connect_calls: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            files: Mutex::new(HashMap::new()),
            hashes: Mutex::new(HashMap::new()),
            uploads: Mutex::new(HashMap::new()),
            download_offsets: Mutex::new(Vec::new()),
            download_failure: Mutex::new(None),
            chunk_size: 4,
            chunk_delay: None,
            fail_listing: AtomicBool::new(false),
            fail_hashing: AtomicBool::new(false),
            connect_calls: AtomicUsize::new(0),
        }
    }

    /// 已连接的实例
    pub fn connected() -> Self {
        let mock = Self::new();
        mock.connected.store(true, Ordering::SeqCst);
        mock
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// 每个数据块之后等待，便于观察传输中状态
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    pub fn add_file(&self, path: &str, content: &[u8]) {
        self.files.lock().insert(path.to_string(), content.to_vec());
    }

    pub fn set_remote_hash(&self, path: &str, hash: &str) {
        self.hashes.lock().insert(path.to_string(), hash.to_string());
    }

    pub fn fail_downloads(&self, message: &str) {
        *self.download_failure.lock() = Some(message.to_string());
    }

    pub fn fail_listing(&self) {
        self.fail_listing.store(true, Ordering::SeqCst);
    }

    pub fn fail_hashing(&self) {
        self.fail_hashing.store(true, Ordering::SeqCst);
    }

    pub fn uploaded(&self, path: &str) -> Option<Vec<u8>> {
        self.uploads.lock().get(path).cloned()
    }

    /// 每次下载请求使用的续传偏移
    pub fn download_offsets(&self) -> Vec<(String, u64)> {
        self.download_offsets.lock().clone()
    }

    fn ensure_connected(&self) -> Result<(), TransportError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }

    fn file(&self, path: &str) -> Result<Vec<u8>, TransportError> {
        self.files
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| TransportError::NotFound(path.to_string()))
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
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
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(TransportError::Transfer("listing failed".to_string()));
        }
        let mut entries: Vec<RemoteFile> = self
            .files
            .lock()
            .iter()
            .filter(|(key, _)| remote_parent(key) == path)
            .map(|(key, data)| RemoteFile::file(key.clone(), data.len() as u64))
            .collect();
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
        let data = self.file(remote_path)?;
        self.download_offsets
            .lock()
            .push((remote_path.to_string(), resume_offset));

        let failure = self.download_failure.lock().clone();
        if let Some(message) = failure {
            return Err(TransportError::Transfer(message));
        }

        let total = data.len() as u64;
        let offset = if resume_offset > total { 0 } else { resume_offset };

        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(offset == 0)
            .open(local_path)
            .await?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;

        let mut done = offset;
        for chunk in data[offset as usize..].chunks(self.chunk_size) {
            file.write_all(chunk).await?;
            file.flush().await?;
            done += chunk.len() as u64;
            if let Some(delay) = self.chunk_delay {
                tokio::time::sleep(delay).await;
            }
            sink.on_progress(done, total).await?;
        }
        Ok(())
    }

    async fn stream_upload(
        &self,
        local_path: &Path,
        remote_path: &str,
        sink: &mut dyn ProgressSink,
    ) -> Result<(), TransportError> {
        self.ensure_connected()?;
        let data = tokio::fs::read(local_path).await?;
        let total = data.len() as u64;
        let mut done = 0u64;
        for chunk in data.chunks(self.chunk_size) {
            done += chunk.len() as u64;
            if let Some(delay) = self.chunk_delay {
                tokio::time::sleep(delay).await;
            }
            sink.on_progress(done, total).await?;
        }
        self.uploads.lock().insert(remote_path.to_string(), data);
        Ok(())
    }

    async fn stat_file(&self, path: &str) -> Result<RemoteFile, TransportError> {
        self.ensure_connected()?;
        let data = self.file(path)?;
        Ok(RemoteFile::file(path, data.len() as u64))
    }

    async fn compute_remote_hash(&self, path: &str) -> Result<Option<String>, TransportError> {
        self.ensure_connected()?;
        if self.fail_hashing.load(Ordering::SeqCst) {
            return Err(TransportError::Transfer("md5sum not available".to_string()));
        }
        Ok(self.hashes.lock().get(path).cloned())
    }

    async fn read_small_file(&self, path: &str, max_bytes: u64) -> Result<Vec<u8>, TransportError> {
        self.ensure_connected()?;
        let data = self.file(path)?;
        if data.len() as u64 > max_bytes {
            return Err(TransportError::FileTooLarge {
                size: data.len() as u64,
                max: max_bytes,
            });
        }
        Ok(data)
    }
}
