//! 传输管理器
//!
//! 持有传输队列和连接来源，负责：
//! - 调度循环：按固定间隔（或有空位时立即）启动排队中的传输
//! - 单个传输的执行：续传、限速、校验、错误归类
//! - 暂停/恢复（单个）与停止/恢复（整个队列）
//! - 每次状态变更后持久化队列快照

use super::bandwidth::GlobalBandwidthLimiter;
use super::events::TransferObserver;
use super::path_guard::DownloadPathGuard;
use super::queue::TransferQueue;
use super::speed::SpeedTracker;
use super::types::{Transfer, TransferDirection, TransferError, TransferStatus};
use super::verify::verify_file;
use crate::config::TransferConfig;
use crate::persistence::{QueueStore, ResumeStore};
use crate::transport::{
    join_remote, ConnectionSource, Host, ProgressSink, RemoteFile, Transport, TransportError,
};
use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 校验失败时写入传输的错误信息
pub const CHECKSUM_FAILED: &str = "Checksum verification failed";

/// 运行中的执行单元
struct Execution {
    generation: u64,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

/// 受同一把锁保护的引擎状态
struct EngineState {
    queue: TransferQueue,
    /// 队列是否被整体停止
    queue_stopped: bool,
    executions: HashMap<String, Execution>,
    speed_trackers: HashMap<String, SpeedTracker>,
    /// 用户单独暂停、等待执行单元退出的传输
    pending_pause: HashSet<String>,
    next_generation: u64,
}

/// 传输管理器
///
/// 克隆开销很小，所有克隆共享同一个队列。
#[derive(Clone)]
pub struct TransferManager {
    state: Arc<Mutex<EngineState>>,
    source: Arc<dyn ConnectionSource>,
    config: Arc<TransferConfig>,
    observer: Arc<dyn TransferObserver>,
    queue_store: Arc<dyn QueueStore>,
    resume_store: Arc<dyn ResumeStore>,
    bandwidth_limiter: Arc<GlobalBandwidthLimiter>,
    /// 调度循环是否在运行
    running: Arc<AtomicBool>,
    /// 有空位或新任务时唤醒调度循环
    wake: Arc<Notify>,
    /// 保证快照按生成顺序写入
    persist_lock: Arc<Mutex<()>>,
}

impl TransferManager {
    /// 创建管理器并恢复上次保存的队列
    ///
    /// 保存时的队列停止状态不会恢复，队列总是以运行状态启动。
    pub fn new(
        source: Arc<dyn ConnectionSource>,
        config: TransferConfig,
        observer: Arc<dyn TransferObserver>,
        queue_store: Arc<dyn QueueStore>,
        resume_store: Arc<dyn ResumeStore>,
    ) -> Self {
        let (transfers, was_stopped) = queue_store.load_snapshot();
        if was_stopped {
            info!("上次退出时队列处于停止状态，本次启动后恢复运行");
        }

        let mut queue = TransferQueue::new(config.max_concurrent_transfers.max(1));
        for transfer in transfers {
            queue.enqueue(transfer);
        }

        info!(
            "创建传输管理器: 最大并发={}, 限速={:?}, 校验={}, 续传={}, 已恢复 {} 个传输",
            queue.max_concurrent(),
            config.bandwidth_limit,
            config.verify_checksums,
            config.resume_transfers,
            queue.len()
        );

        let bandwidth_limiter = Arc::new(GlobalBandwidthLimiter::new(config.bandwidth_limit));

        Self {
            state: Arc::new(Mutex::new(EngineState {
                queue,
                queue_stopped: false,
                executions: HashMap::new(),
                speed_trackers: HashMap::new(),
                pending_pause: HashSet::new(),
                next_generation: 0,
            })),
            source,
            config: Arc::new(config),
            observer,
            queue_store,
            resume_store,
            bandwidth_limiter,
            running: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
            persist_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    // =====================================================
    // 查询
    // =====================================================

    /// 队列快照（按队列顺序）
    pub fn transfers(&self) -> Vec<Transfer> {
        self.state.lock().queue.as_slice().to_vec()
    }

    pub fn get(&self, id: &str) -> Option<Transfer> {
        self.state.lock().queue.by_id(id).cloned()
    }

    pub fn is_queue_stopped(&self) -> bool {
        self.state.lock().queue_stopped
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_queued(&self, remote_path: &str, host_key: &str) -> bool {
        self.state.lock().queue.is_queued(remote_path, host_key)
    }

    pub fn has_pending_under_directory(&self, dir_path: &str, host_key: &str) -> bool {
        self.state
            .lock()
            .queue
            .has_pending_under_directory(dir_path, host_key)
    }

    /// 传输中的数量
    pub fn active_count(&self) -> usize {
        self.state.lock().queue.active_count()
    }

    /// 所有传输中任务的速度之和 (bytes/s)
    pub fn total_active_speed(&self) -> f64 {
        self.state.lock().queue.total_active_speed()
    }

    // =====================================================
    // 添加
    // =====================================================

    /// 添加下载
    ///
    /// 同一 (远端路径, 主机) 已有未结束的传输时返回 `Ok(None)`。
    /// 指定 `base_dir` 时保留相对目录结构，否则只使用文件名。
    pub fn add_download(
        &self,
        remote_file: &RemoteFile,
        host: Option<&Host>,
        local_dir: Option<&Path>,
        base_dir: Option<&str>,
    ) -> Result<Option<Transfer>, TransferError> {
        if remote_file.is_dir {
            return Err(TransferError::InvalidData(format!(
                "Cannot download a directory: {}",
                remote_file.path
            )));
        }

        let host_key = host.map(Host::host_key).unwrap_or_default();
        if self.is_queued(&remote_file.path, &host_key) {
            debug!("已在队列中，跳过: {}", remote_file.path);
            return Ok(None);
        }

        let root = match local_dir {
            Some(dir) => dir.to_path_buf(),
            None => self.config.resolved_download_dir(),
        };
        let guard = DownloadPathGuard::new(&root)?;
        let local_path = guard.resolve(remote_file, base_dir)?;

        let transfer = Transfer::download(
            remote_file.path.clone(),
            local_path,
            remote_file.size,
            host_key,
        );

        {
            let mut state = self.state.lock();
            // 加锁后再检查一次，防止并发添加
            if state
                .queue
                .is_queued(&transfer.remote_path, &transfer.host_key)
            {
                debug!("已在队列中，跳过: {}", transfer.remote_path);
                return Ok(None);
            }
            state.queue.enqueue(transfer.clone());
        }

        info!(
            "添加下载: {} -> {:?} ({} 字节)",
            transfer.remote_path, transfer.local_path, transfer.size
        );
        self.observer.on_status_change(&transfer);
        self.persist_quietly();
        self.wake.notify_one();
        Ok(Some(transfer))
    }

    /// 添加上传，远端路径为 `<remote_dir>/<本地文件名>`
    pub fn add_upload(&self, local_path: &Path, remote_dir: &str) -> Result<Transfer, TransferError> {
        let meta = match std::fs::metadata(local_path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TransferError::LocalFileNotFound(local_path.to_path_buf()))
            }
            Err(e) => return Err(e.into()),
        };
        if !meta.is_file() {
            return Err(TransferError::InvalidData(format!(
                "Not a regular file: {}",
                local_path.display()
            )));
        }
        let name = local_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                TransferError::InvalidData(format!("Invalid filename: {}", local_path.display()))
            })?;

        let transfer = Transfer::upload(
            local_path.to_path_buf(),
            join_remote(remote_dir, name),
            meta.len(),
        );
        self.state.lock().queue.enqueue(transfer.clone());

        info!("添加上传: {:?} -> {}", transfer.local_path, transfer.remote_path);
        self.observer.on_status_change(&transfer);
        self.persist_quietly();
        self.wake.notify_one();
        Ok(transfer)
    }

    // =====================================================
    // 单个传输控制
    // =====================================================

    /// 暂停传输
    ///
    /// 排队中的直接标记为暂停；传输中的先打上暂停标记再取消，由执行单元完成状态切换。
    pub fn pause_transfer(&self, id: &str) -> bool {
        let changed = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(transfer) = state.queue.by_id_mut(id) else {
                return false;
            };
            match transfer.status {
                TransferStatus::Queued => {
                    transfer.mark_interrupted(TransferStatus::Paused);
                    Some(transfer.clone())
                }
                TransferStatus::Transferring => match state.executions.get(id) {
                    Some(execution) => {
                        state.pending_pause.insert(id.to_string());
                        execution.token.cancel();
                        None
                    }
                    None => {
                        transfer.mark_interrupted(TransferStatus::Paused);
                        Some(transfer.clone())
                    }
                },
                _ => return false,
            }
        };

        info!("暂停传输: {}", id);
        if let Some(transfer) = changed {
            self.observer.on_status_change(&transfer);
            self.persist_quietly();
        }
        true
    }

    /// 恢复暂停或停止的传输
    pub fn resume_transfer(&self, id: &str) -> bool {
        let resumed = {
            let mut state = self.state.lock();
            match state.queue.by_id_mut(id) {
                Some(t) if matches!(t.status, TransferStatus::Paused | TransferStatus::Stopped) => {
                    t.mark_queued();
                    t.clone()
                }
                _ => return false,
            }
        };

        info!("恢复传输: {}", resumed.remote_path);
        self.observer.on_status_change(&resumed);
        self.persist_quietly();
        self.wake.notify_one();
        true
    }

    /// 删除传输，进行中的先取消
    pub fn remove_transfer(&self, id: &str) -> bool {
        let removed = {
            let mut state = self.state.lock();
            if let Some(execution) = state.executions.get(id) {
                execution.token.cancel();
            }
            state.pending_pause.remove(id);
            state.queue.remove(id)
        };
        let Some(removed) = removed else {
            return false;
        };

        if let Err(e) = self.resume_store.clear_checkpoint(id) {
            warn!("清除续传检查点失败: {}, 错误: {}", id, e);
        }
        info!("删除传输: {}", removed.remote_path);
        self.persist_quietly();
        self.wake.notify_one();
        true
    }

    pub fn move_up(&self, id: &str) -> bool {
        let moved = self.state.lock().queue.move_up(id);
        if moved {
            self.persist_quietly();
        }
        moved
    }

    pub fn move_down(&self, id: &str) -> bool {
        let moved = self.state.lock().queue.move_down(id);
        if moved {
            self.persist_quietly();
        }
        moved
    }

    /// 暂停所有传输中的任务，返回数量
    pub fn pause_all(&self) -> usize {
        let ids = self.ids_with_status(TransferStatus::Transferring);
        ids.iter().filter(|id| self.pause_transfer(id)).count()
    }

    /// 恢复所有暂停的任务，返回数量
    pub fn resume_all(&self) -> usize {
        let ids = self.ids_with_status(TransferStatus::Paused);
        ids.iter().filter(|id| self.resume_transfer(id)).count()
    }

    fn ids_with_status(&self, status: TransferStatus) -> Vec<String> {
        self.state
            .lock()
            .queue
            .iter()
            .filter(|t| t.status == status)
            .map(|t| t.id.clone())
            .collect()
    }

    // =====================================================
    // 队列控制
    // =====================================================

    /// 停止整个队列：取消所有传输中的任务并阻止启动新任务
    ///
    /// 被取消的任务变为 Stopped，用户单独暂停的保持 Paused。
    pub fn stop_queue(&self) -> usize {
        let cancelled = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.queue_stopped = true;
            let mut cancelled = 0;
            for transfer in state
                .queue
                .iter()
                .filter(|t| t.status == TransferStatus::Transferring)
            {
                if let Some(execution) = state.executions.get(&transfer.id) {
                    execution.token.cancel();
                    cancelled += 1;
                }
            }
            cancelled
        };

        info!("队列已停止，取消了 {} 个传输", cancelled);
        self.persist_quietly();
        cancelled
    }

    /// 恢复队列：只把 Stopped 的任务重新排队
    pub fn resume_queue(&self) -> usize {
        let resumed: Vec<Transfer> = {
            let mut state = self.state.lock();
            state.queue_stopped = false;
            state
                .queue
                .iter_mut()
                .filter(|t| t.status == TransferStatus::Stopped)
                .map(|t| {
                    t.mark_queued();
                    t.clone()
                })
                .collect()
        };

        info!("队列已恢复，重新排队 {} 个传输", resumed.len());
        for transfer in &resumed {
            self.observer.on_status_change(transfer);
        }
        self.persist_quietly();
        self.wake.notify_one();
        resumed.len()
    }

    // =====================================================
    // 调度循环
    // =====================================================

    /// 运行调度循环，直到调用 [`stop`](Self::stop)
    pub async fn run(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("调度循环已在运行");
            return;
        }
        info!("调度循环已启动");

        let tick = Duration::from_millis(self.config.scheduler_tick_ms.max(1));
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while self.running.load(Ordering::SeqCst) {
            self.schedule_pending();
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.wake.notified() => {}
            }
        }

        info!("调度循环已退出");
    }

    /// 在后台任务中运行调度循环
    pub fn spawn(&self) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move { manager.run().await })
    }

    /// 停止调度循环，取消所有执行单元并等待它们退出
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.wake.notify_one();

        loop {
            let (handles, remaining) = {
                let mut state = self.state.lock();
                for execution in state.executions.values() {
                    execution.token.cancel();
                }
                let handles: Vec<(String, u64, JoinHandle<()>)> = state
                    .executions
                    .iter_mut()
                    .filter_map(|(id, e)| e.handle.take().map(|h| (id.clone(), e.generation, h)))
                    .collect();
                (handles, state.executions.len())
            };

            if handles.is_empty() {
                if remaining == 0 {
                    break;
                }
                // 执行单元刚启动，句柄还没登记
                tokio::time::sleep(Duration::from_millis(5)).await;
                continue;
            }

            let (keys, futures): (Vec<_>, Vec<_>) = handles
                .into_iter()
                .map(|(id, generation, handle)| ((id, generation), handle))
                .unzip();
            for ((id, generation), result) in keys.into_iter().zip(join_all(futures).await) {
                if let Err(e) = result {
                    error!("执行单元异常退出: {}, 错误: {}", id, e);
                }
                let mut state = self.state.lock();
                if state
                    .executions
                    .get(&id)
                    .is_some_and(|e| e.generation == generation)
                {
                    state.executions.remove(&id);
                }
            }
        }

        info!("传输管理器已停止");
    }

    /// 启动排队中的传输，返回启动数量
    fn schedule_pending(&self) -> usize {
        let mut started = Vec::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.queue_stopped || !self.running.load(Ordering::SeqCst) {
                return 0;
            }
            while state.queue.can_start_more() {
                let Some(transfer) = state.queue.next_queued_mut() else {
                    break;
                };
                transfer.mark_transferring();
                let snapshot = transfer.clone();

                let generation = state.next_generation;
                state.next_generation += 1;
                let token = CancellationToken::new();
                state.executions.insert(
                    snapshot.id.clone(),
                    Execution {
                        generation,
                        token: token.clone(),
                        handle: None,
                    },
                );
                state.speed_trackers.insert(
                    snapshot.id.clone(),
                    SpeedTracker::with_baseline(snapshot.bytes_transferred),
                );
                started.push((snapshot, generation, token));
            }
        }

        let count = started.len();
        for (transfer, generation, token) in started {
            debug!("开始传输: {} ({:?})", transfer.remote_path, transfer.direction);
            self.observer.on_status_change(&transfer);

            let manager = self.clone();
            let id = transfer.id.clone();
            let handle = tokio::spawn(async move { manager.execute(id, generation, token).await });

            let mut state = self.state.lock();
            if let Some(execution) = state.executions.get_mut(&transfer.id) {
                if execution.generation == generation {
                    execution.handle = Some(handle);
                }
            }
        }
        if count > 0 {
            self.persist_quietly();
        }
        count
    }

    // =====================================================
    // 执行
    // =====================================================

    /// 执行单元入口，无论如何退出都会经过 [`ExecutionGuard`] 清理
    async fn execute(self, transfer_id: String, generation: u64, token: CancellationToken) {
        self.bandwidth_limiter.register(&transfer_id);
        let _guard = ExecutionGuard {
            manager: self.clone(),
            transfer_id: transfer_id.clone(),
            generation,
        };

        let result = self.run_transfer(&transfer_id, &token).await;
        match result {
            Ok(()) => {}
            Err(e) if e.is_cancelled() || token.is_cancelled() => {
                let paused = self.state.lock().pending_pause.remove(&transfer_id);
                let status = if paused {
                    TransferStatus::Paused
                } else {
                    TransferStatus::Stopped
                };
                if let Some(t) = self.update_transfer(&transfer_id, |t| t.mark_interrupted(status)) {
                    info!(
                        "传输已中断: {} -> {} ({} 字节)",
                        t.remote_path, status, t.bytes_transferred
                    );
                }
            }
            Err(e) => {
                let message = e.to_string();
                if let Some(t) = self.update_transfer(&transfer_id, |t| t.mark_failed(message.clone())) {
                    error!("传输失败: {} - {}", t.remote_path, message);
                }
            }
        }
        self.persist_quietly();
    }

    async fn run_transfer(&self, id: &str, token: &CancellationToken) -> Result<(), TransferError> {
        let Some(transfer) = self.get(id) else {
            debug!("传输已被删除，跳过: {}", id);
            return Ok(());
        };

        let transport = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(TransportError::Cancelled.into()),
            conn = self.source.connection_for(&transfer.host_key) => conn?,
        };

        match transfer.direction {
            TransferDirection::Download => {
                self.run_download(&transfer, transport.as_ref(), token).await
            }
            TransferDirection::Upload => self.run_upload(&transfer, transport.as_ref(), token).await,
        }
    }

    async fn run_download(
        &self,
        transfer: &Transfer,
        transport: &dyn Transport,
        token: &CancellationToken,
    ) -> Result<(), TransferError> {
        let resume = self.config.resume_transfers;
        let offset = if resume {
            self.resume_store
                .get_resume_offset(&transfer.remote_path, &transfer.local_path)
        } else {
            0
        };
        if offset > 0 {
            info!("断点续传: {} 从 {} 字节继续", transfer.remote_path, offset);
        }

        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if let Some(t) = state.queue.by_id_mut(&transfer.id) {
                t.bytes_transferred = offset;
            }
            state
                .speed_trackers
                .insert(transfer.id.clone(), SpeedTracker::with_baseline(offset));
        }

        let mut sink = ExecutionSink::new(self, transfer, token, resume, offset);
        transport
            .stream_download(&transfer.remote_path, &transfer.local_path, offset, &mut sink)
            .await?;
        if token.is_cancelled() {
            return Err(TransportError::Cancelled.into());
        }

        if self.config.verify_checksums {
            if let Some(t) = self.update_transfer(&transfer.id, |t| t.mark_verifying()) {
                self.observer.on_status_change(&t);
            }
            self.persist_quietly();

            let outcome = verify_file(
                &transfer.remote_path,
                &transfer.local_path,
                transfer.size,
                transport,
            )
            .await;
            if !outcome.success {
                warn!("校验失败: {} - {}", transfer.remote_path, outcome.message);
                // 本地文件已是完整大小，保留检查点会让重试直接跳过下载
                self.discard_checkpoints(transfer);
                self.update_transfer(&transfer.id, |t| t.mark_failed(CHECKSUM_FAILED.to_string()));
                return Ok(());
            }
            debug!("校验通过: {} - {}", transfer.remote_path, outcome.message);
        }

        self.update_transfer(&transfer.id, |t| t.mark_completed());
        self.discard_checkpoints(transfer);
        info!("下载完成: {} -> {:?}", transfer.remote_path, transfer.local_path);
        Ok(())
    }

    async fn run_upload(
        &self,
        transfer: &Transfer,
        transport: &dyn Transport,
        token: &CancellationToken,
    ) -> Result<(), TransferError> {
        self.update_transfer(&transfer.id, |t| t.bytes_transferred = 0);
        let mut sink = ExecutionSink::new(self, transfer, token, false, 0);
        transport
            .stream_upload(&transfer.local_path, &transfer.remote_path, &mut sink)
            .await?;
        if token.is_cancelled() {
            return Err(TransportError::Cancelled.into());
        }

        self.update_transfer(&transfer.id, |t| t.mark_completed());
        info!("上传完成: {:?} -> {}", transfer.local_path, transfer.remote_path);
        Ok(())
    }

    /// 在阻塞线程池中写入续传检查点
    async fn save_checkpoint(&self, transfer: &Transfer, bytes_done: u64, total: u64) {
        let store = self.resume_store.clone();
        let id = transfer.id.clone();
        let remote_path = transfer.remote_path.clone();
        let local_path = transfer.local_path.clone();
        let result = tokio::task::spawn_blocking(move || {
            store.save_checkpoint(&id, &remote_path, &local_path, bytes_done, total)
        })
        .await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("写入续传检查点失败: {}, 错误: {}", transfer.id, e),
            Err(e) => warn!("写入续传检查点任务异常: {}, 错误: {}", transfer.id, e),
        }
    }

    /// 清除传输自身以及同一 (远端, 本地) 路径的所有检查点
    fn discard_checkpoints(&self, transfer: &Transfer) {
        let result = self
            .resume_store
            .clear_checkpoint(&transfer.id)
            .and_then(|_| {
                self.resume_store
                    .clear_by_path(&transfer.remote_path, &transfer.local_path)
            });
        if let Err(e) = result {
            warn!("清除续传检查点失败: {}, 错误: {}", transfer.id, e);
        }
    }

    /// 更新已传输字节数、速度和剩余时间
    fn record_progress(&self, id: &str, bytes_done: u64) -> Option<Transfer> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let transfer = state.queue.by_id_mut(id)?;
        transfer.bytes_transferred = bytes_done;
        if let Some(tracker) = state.speed_trackers.get_mut(id) {
            let speed = tracker.update(bytes_done);
            transfer.speed = speed;
            transfer.smoothed_eta_seconds =
                tracker.smoothed_eta(transfer.size.saturating_sub(bytes_done), speed);
        }
        Some(transfer.clone())
    }

    /// 修改队列中的传输并返回修改后的副本，传输已被删除时返回 None
    fn update_transfer<F: FnOnce(&mut Transfer)>(&self, id: &str, f: F) -> Option<Transfer> {
        let mut state = self.state.lock();
        let transfer = state.queue.by_id_mut(id)?;
        f(transfer);
        Some(transfer.clone())
    }

    /// 执行单元退出时的清理
    fn finish_execution(&self, id: &str, generation: u64) {
        let (owned, interrupted, latest) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let owned = state
                .executions
                .get(id)
                .is_some_and(|e| e.generation == generation);
            let mut interrupted = false;
            if owned {
                state.executions.remove(id);
                state.speed_trackers.remove(id);
                let paused = state.pending_pause.remove(id);
                // 执行单元被中止（未走正常退出路径）时仍停留在运行状态
                if let Some(t) = state.queue.by_id_mut(id) {
                    if t.status.is_running() {
                        t.mark_interrupted(if paused {
                            TransferStatus::Paused
                        } else {
                            TransferStatus::Stopped
                        });
                        interrupted = true;
                    }
                }
            }
            (owned, interrupted, state.queue.by_id(id).cloned())
        };

        if owned {
            self.bandwidth_limiter.unregister(id);
        }
        if interrupted {
            self.persist_quietly();
        }
        if let Some(transfer) = latest {
            self.observer.on_status_change(&transfer);
        }
        self.wake.notify_one();
    }

    // =====================================================
    // 持久化
    // =====================================================

    /// 写入队列快照
    pub fn persist(&self) -> Result<(), TransferError> {
        let _guard = self.persist_lock.lock();
        let (transfers, stopped) = {
            let state = self.state.lock();
            (state.queue.as_slice().to_vec(), state.queue_stopped)
        };
        self.queue_store.save_snapshot(&transfers, stopped)
    }

    fn persist_quietly(&self) {
        if let Err(e) = self.persist() {
            warn!("保存队列快照失败: {}", e);
        }
    }

    #[cfg(test)]
    pub(crate) fn insert_for_test(&self, transfer: Transfer) {
        self.state.lock().queue.enqueue(transfer);
    }

    #[cfg(test)]
    pub(crate) fn limiter(&self) -> &GlobalBandwidthLimiter {
        &self.bandwidth_limiter
    }
}

/// 执行单元退出（正常返回、出错、被中止或 panic）时运行清理
struct ExecutionGuard {
    manager: TransferManager,
    transfer_id: String,
    generation: u64,
}

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        self.manager
            .finish_execution(&self.transfer_id, self.generation);
    }
}

/// 执行单元的进度回调：记录进度、写检查点、限速、检查取消
struct ExecutionSink<'a> {
    manager: &'a TransferManager,
    transfer: &'a Transfer,
    token: &'a CancellationToken,
    checkpoint: bool,
    limiter: Option<&'a GlobalBandwidthLimiter>,
    last_bytes: u64,
}

impl<'a> ExecutionSink<'a> {
    fn new(
        manager: &'a TransferManager,
        transfer: &'a Transfer,
        token: &'a CancellationToken,
        checkpoint: bool,
        start_bytes: u64,
    ) -> Self {
        let limiter = manager
            .config
            .bandwidth_limit_enabled()
            .then_some(manager.bandwidth_limiter.as_ref());
        Self {
            manager,
            transfer,
            token,
            checkpoint,
            limiter,
            last_bytes: start_bytes,
        }
    }
}

#[async_trait]
impl<'a> ProgressSink for ExecutionSink<'a> {
    async fn on_progress(&mut self, bytes_done: u64, total: u64) -> Result<(), TransportError> {
        let delta = bytes_done.saturating_sub(self.last_bytes);
        self.last_bytes = bytes_done;

        if let Some(snapshot) = self.manager.record_progress(&self.transfer.id, bytes_done) {
            self.manager.observer.on_progress(&snapshot);
            if self.checkpoint {
                self.manager
                    .save_checkpoint(self.transfer, bytes_done, total)
                    .await;
            }
        }

        if self.token.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        if let Some(limiter) = self.limiter {
            tokio::select! {
                _ = self.token.cancelled() => return Err(TransportError::Cancelled),
                _ = limiter.throttle(delta) => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{JsonQueueStore, JsonResumeStore};
    use crate::transport::mock::MockTransport;
    use crate::transport::SingleConnection;
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingObserver {
        statuses: Mutex<Vec<(String, TransferStatus)>>,
        progress: Mutex<Vec<(String, u64)>>,
    }

    impl RecordingObserver {
        fn statuses_for(&self, id: &str) -> Vec<TransferStatus> {
            self.statuses
                .lock()
                .iter()
                .filter(|(tid, _)| tid == id)
                .map(|(_, s)| *s)
                .collect()
        }

        fn progress_for(&self, id: &str) -> Vec<u64> {
            self.progress
                .lock()
                .iter()
                .filter(|(tid, _)| tid == id)
                .map(|(_, b)| *b)
                .collect()
        }
    }

    impl TransferObserver for RecordingObserver {
        fn on_progress(&self, transfer: &Transfer) {
            self.progress
                .lock()
                .push((transfer.id.clone(), transfer.bytes_transferred));
        }

        fn on_status_change(&self, transfer: &Transfer) {
            self.statuses
                .lock()
                .push((transfer.id.clone(), transfer.status));
        }
    }

    struct Harness {
        dir: TempDir,
        transport: Arc<MockTransport>,
        observer: Arc<RecordingObserver>,
        resume_store: Arc<JsonResumeStore>,
        manager: TransferManager,
    }

    impl Harness {
        fn new(transport: MockTransport, tweak: impl FnOnce(&mut TransferConfig)) -> Self {
            let dir = TempDir::new().unwrap();
            let transport = Arc::new(transport);
            Self::with_dir(dir, transport, tweak)
        }

        fn new_shared(transport: Arc<MockTransport>) -> Self {
            Self::with_dir(TempDir::new().unwrap(), transport, |_| {})
        }

        fn with_dir(
            dir: TempDir,
            transport: Arc<MockTransport>,
            tweak: impl FnOnce(&mut TransferConfig),
        ) -> Self {
            let mut config = TransferConfig {
                download_dir: dir.path().join("downloads"),
                verify_checksums: false,
                scheduler_tick_ms: 10,
                ..TransferConfig::default()
            };
            tweak(&mut config);

            let observer = Arc::new(RecordingObserver::default());
            let resume_store = Arc::new(JsonResumeStore::open(dir.path().join("cache/transfers.json")));
            let manager = TransferManager::new(
                Arc::new(SingleConnection::new(transport.clone())),
                config,
                observer.clone(),
                Arc::new(JsonQueueStore::new(dir.path().join("cache/queue.json"))),
                resume_store.clone(),
            );
            Self {
                dir,
                transport,
                observer,
                resume_store,
                manager,
            }
        }

        fn download_root(&self) -> PathBuf {
            std::fs::create_dir_all(self.dir.path().join("downloads")).unwrap();
            dunce::canonicalize(self.dir.path().join("downloads")).unwrap()
        }

        fn add(&self, path: &str, content: &[u8]) -> Transfer {
            self.transport.add_file(path, content);
            self.manager
                .add_download(&RemoteFile::file(path, content.len() as u64), None, None, None)
                .unwrap()
                .unwrap()
        }

        fn status(&self, id: &str) -> Option<TransferStatus> {
            self.manager.get(id).map(|t| t.status)
        }

        async fn wait_for_status(&self, id: &str, status: TransferStatus) -> bool {
            wait_until(|| self.status(id) == Some(status)).await
        }
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
        for _ in 0..500 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        condition()
    }

    fn slow_transport() -> MockTransport {
        MockTransport::connected()
            .with_chunk_size(4)
            .with_chunk_delay(Duration::from_millis(20))
    }

    // =====================================================
    // 添加
    // =====================================================

    #[tokio::test]
    async fn test_add_download_queues_and_persists() {
        let h = Harness::new(MockTransport::connected(), |_| {});
        let t = h.add("/media/a.bin", b"0123456789");

        assert_eq!(t.status, TransferStatus::Queued);
        assert_eq!(t.size, 10);
        assert_eq!(t.local_path, h.download_root().join("a.bin"));
        assert_eq!(h.observer.statuses_for(&t.id), vec![TransferStatus::Queued]);

        let (saved, _) = JsonQueueStore::new(h.dir.path().join("cache/queue.json")).load_snapshot();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].id, t.id);
    }

    #[tokio::test]
    async fn test_duplicate_suppressed() {
        let h = Harness::new(MockTransport::connected(), |_| {});
        let file = RemoteFile::file("/media/a.bin", 10);
        let h1 = Host::new("one", "u", 22);
        let h2 = Host::new("two", "u", 22);

        assert!(h.manager.add_download(&file, Some(&h1), None, None).unwrap().is_some());
        assert!(h.manager.add_download(&file, Some(&h1), None, None).unwrap().is_none());
        assert_eq!(h.manager.transfers().len(), 1);

        // 不同主机不算重复
        assert!(h.manager.add_download(&file, Some(&h2), None, None).unwrap().is_some());
        // 空 host_key 匹配任意主机
        assert!(h.manager.add_download(&file, None, None, None).unwrap().is_none());
        assert_eq!(h.manager.transfers().len(), 2);
        assert!(h.manager.is_queued("/media/a.bin", &h1.host_key()));
    }

    #[tokio::test]
    async fn test_traversal_name_sanitized() {
        let h = Harness::new(MockTransport::connected(), |_| {});
        let mut file = RemoteFile::file("/srv/../../etc/passwd", 5);
        file.name = "../../etc/passwd".to_string();

        let t = h.manager.add_download(&file, None, None, None).unwrap().unwrap();
        assert_eq!(t.local_path, h.download_root().join("passwd"));
        assert!(t.local_path.starts_with(h.download_root()));
    }

    #[tokio::test]
    async fn test_dotdot_name_rejected() {
        let h = Harness::new(MockTransport::connected(), |_| {});
        let mut file = RemoteFile::file("/srv/..", 5);
        file.name = "..".to_string();

        let err = h.manager.add_download(&file, None, None, None).unwrap_err();
        assert!(matches!(err, TransferError::InvalidData(_)));
        assert!(h.manager.transfers().is_empty());
    }

    #[tokio::test]
    async fn test_base_dir_and_local_dir_override() {
        let h = Harness::new(MockTransport::connected(), |_| {});
        let other = h.dir.path().join("elsewhere");
        let file = RemoteFile::file("/media/shows/s01/e01.mkv", 5);

        let t = h
            .manager
            .add_download(&file, None, Some(&other), Some("/media"))
            .unwrap()
            .unwrap();
        let root = dunce::canonicalize(&other).unwrap();
        assert_eq!(t.local_path, root.join("shows").join("s01").join("e01.mkv"));
        assert!(root.join("shows/s01").is_dir());
    }

    #[tokio::test]
    async fn test_directory_rejected() {
        let h = Harness::new(MockTransport::connected(), |_| {});
        let err = h
            .manager
            .add_download(&RemoteFile::directory("/media"), None, None, None)
            .unwrap_err();
        assert!(matches!(err, TransferError::InvalidData(_)));
    }

    #[tokio::test]
    async fn test_add_upload() {
        let h = Harness::new(MockTransport::connected(), |_| {});
        let local = h.dir.path().join("report.txt");
        std::fs::write(&local, b"hello").unwrap();

        let t = h.manager.add_upload(&local, "/incoming").unwrap();
        assert_eq!(t.remote_path, "/incoming/report.txt");
        assert_eq!(t.direction, TransferDirection::Upload);
        assert_eq!(t.size, 5);

        let missing = h.manager.add_upload(&h.dir.path().join("nope"), "/incoming");
        assert!(matches!(missing, Err(TransferError::LocalFileNotFound(_))));
    }

    // =====================================================
    // 执行
    // =====================================================

    #[tokio::test]
    async fn test_download_completes_with_verification() {
        let content = b"verified content";
        let transport = MockTransport::connected().with_chunk_size(4);
        transport.set_remote_hash("/media/a.bin", &format!("{:x}", md5::compute(content)));
        let h = Harness::new(transport, |c| c.verify_checksums = true);
        h.manager.spawn();

        let t = h.add("/media/a.bin", content);
        assert!(h.wait_for_status(&t.id, TransferStatus::Completed).await);

        assert_eq!(std::fs::read(&t.local_path).unwrap(), content);
        let done = h.manager.get(&t.id).unwrap();
        assert_eq!(done.bytes_transferred, content.len() as u64);
        assert!(done.completed_at.is_some());
        assert!(h.resume_store.get(&t.id).is_none());

        let statuses = h.observer.statuses_for(&t.id);
        assert!(statuses.contains(&TransferStatus::Transferring));
        assert!(statuses.contains(&TransferStatus::Verifying));
        assert_eq!(statuses.last(), Some(&TransferStatus::Completed));

        let progress = h.observer.progress_for(&t.id);
        assert_eq!(progress, vec![4, 8, 12, 16]);

        h.manager.stop().await;
        assert_eq!(h.manager.limiter().active_count(), 0);
    }

    #[tokio::test]
    async fn test_verification_mismatch_fails() {
        let transport = MockTransport::connected();
        transport.set_remote_hash("/media/a.bin", "different_hash_12345");
        let h = Harness::new(transport, |c| c.verify_checksums = true);
        h.manager.spawn();

        let t = h.add("/media/a.bin", b"payload");
        assert!(h.wait_for_status(&t.id, TransferStatus::Failed).await);
        assert_eq!(
            h.manager.get(&t.id).unwrap().error.as_deref(),
            Some(CHECKSUM_FAILED)
        );

        // 失败的传输不写入快照
        let (saved, _) = JsonQueueStore::new(h.dir.path().join("cache/queue.json")).load_snapshot();
        assert!(saved.is_empty());
        h.manager.stop().await;
    }

    #[tokio::test]
    async fn test_retry_after_checksum_failure_restarts_from_zero() {
        let transport = MockTransport::connected().with_chunk_size(4);
        transport.set_remote_hash("/media/a.bin", "ffffffffffffffffffffffffffffffff");
        let h = Harness::new(transport, |c| c.verify_checksums = true);
        h.manager.spawn();

        let first = h.add("/media/a.bin", b"0123456789");
        assert!(h.wait_for_status(&first.id, TransferStatus::Failed).await);
        assert_eq!(
            h.resume_store
                .get_resume_offset("/media/a.bin", &first.local_path),
            0
        );
        assert!(h.resume_store.is_empty());

        // 失败的传输不阻止重新添加
        let retry = h
            .manager
            .add_download(&RemoteFile::file("/media/a.bin", 10), None, None, None)
            .unwrap()
            .unwrap();
        assert!(h.wait_for_status(&retry.id, TransferStatus::Failed).await);

        let offsets = h.transport.download_offsets();
        assert_eq!(offsets.len(), 2);
        assert_eq!(offsets[0].1, 0);
        assert_eq!(offsets[1].1, 0);
        h.manager.stop().await;
    }

    #[tokio::test]
    async fn test_local_io_error_fails_transfer() {
        let h = Harness::new(MockTransport::connected(), |_| {});
        let t = h.add("/media/a.bin", b"payload");
        // 本地目标被目录占用，无法以文件方式打开
        std::fs::create_dir_all(&t.local_path).unwrap();

        h.manager.spawn();
        assert!(h.wait_for_status(&t.id, TransferStatus::Failed).await);
        let error = h.manager.get(&t.id).unwrap().error.unwrap_or_default();
        assert!(error.starts_with("I/O error: "), "error = {:?}", error);
        assert_eq!(h.manager.active_count(), 0);
        h.manager.stop().await;
    }

    #[tokio::test]
    async fn test_transport_error_fails_transfer() {
        let transport = MockTransport::connected();
        transport.fail_downloads("Connection reset by peer");
        let h = Harness::new(transport, |_| {});
        h.manager.spawn();

        let t = h.add("/media/a.bin", b"payload");
        assert!(h.wait_for_status(&t.id, TransferStatus::Failed).await);
        assert_eq!(
            h.manager.get(&t.id).unwrap().error.as_deref(),
            Some("Connection reset by peer")
        );

        // 调度循环继续运行，失败的任务不再占用并发位
        assert!(h.manager.is_running());
        assert_eq!(h.manager.active_count(), 0);
        h.manager.stop().await;
    }

    #[tokio::test]
    async fn test_disconnected_transport_fails() {
        let h = Harness::new(MockTransport::new(), |_| {});
        h.manager.spawn();
        h.transport.add_file("/media/a.bin", b"x");
        let t = h
            .manager
            .add_download(&RemoteFile::file("/media/a.bin", 1), None, None, None)
            .unwrap()
            .unwrap();
        assert!(h.wait_for_status(&t.id, TransferStatus::Failed).await);
        assert_eq!(h.manager.get(&t.id).unwrap().error.as_deref(), Some("Not connected"));
        h.manager.stop().await;
    }

    #[tokio::test]
    async fn test_max_concurrent_respected() {
        let h = Harness::new(slow_transport(), |c| c.max_concurrent_transfers = 2);
        h.manager.spawn();

        let data = vec![7u8; 160];
        let t1 = h.add("/media/1.bin", &data);
        let t2 = h.add("/media/2.bin", &data);
        let t3 = h.add("/media/3.bin", &data);

        assert!(wait_until(|| h.manager.active_count() == 2).await);
        for _ in 0..5 {
            assert!(h.manager.active_count() <= 2);
            assert_eq!(h.status(&t3.id), Some(TransferStatus::Queued));
            tokio::time::sleep(Duration::from_millis(15)).await;
        }
        assert_eq!(h.status(&t1.id), Some(TransferStatus::Transferring));
        assert_eq!(h.status(&t2.id), Some(TransferStatus::Transferring));

        assert!(h.manager.pause_transfer(&t1.id));
        assert!(h.wait_for_status(&t1.id, TransferStatus::Paused).await);
        assert!(h.wait_for_status(&t3.id, TransferStatus::Transferring).await);
        assert!(h.manager.active_count() <= 2);

        h.manager.stop().await;
    }

    #[tokio::test]
    async fn test_stop_queue_keeps_user_pauses() {
        let h = Harness::new(slow_transport(), |_| {});
        h.manager.spawn();

        let t1 = h.add("/media/1.bin", &[1u8; 200]);
        assert!(h.wait_for_status(&t1.id, TransferStatus::Transferring).await);

        // 添加后立即暂停，调度循环没有机会启动它
        let t2 = h.add("/media/2.bin", &[2u8; 200]);
        assert!(h.manager.pause_transfer(&t2.id));
        assert_eq!(h.status(&t2.id), Some(TransferStatus::Paused));

        assert_eq!(h.manager.stop_queue(), 1);
        assert!(h.manager.is_queue_stopped());
        assert!(h.wait_for_status(&t1.id, TransferStatus::Stopped).await);
        assert_eq!(h.status(&t2.id), Some(TransferStatus::Paused));

        // 停止期间不会启动新任务
        let t3 = h.add("/media/3.bin", b"abc");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.status(&t3.id), Some(TransferStatus::Queued));

        assert_eq!(h.manager.resume_queue(), 1);
        assert_eq!(h.status(&t1.id), Some(TransferStatus::Queued));
        assert_eq!(h.status(&t2.id), Some(TransferStatus::Paused));
        assert!(!h.manager.is_queue_stopped());

        assert!(h.wait_for_status(&t3.id, TransferStatus::Completed).await);
        h.manager.stop().await;
    }

    #[tokio::test]
    async fn test_pause_and_resume_continues_from_checkpoint() {
        let h = Harness::new(slow_transport(), |_| {});
        h.manager.spawn();

        let content: Vec<u8> = (0..200u8).collect();
        let t = h.add("/media/a.bin", &content);
        assert!(wait_until(|| h.manager.get(&t.id).unwrap().bytes_transferred >= 8).await);

        assert!(h.manager.pause_transfer(&t.id));
        assert!(h.wait_for_status(&t.id, TransferStatus::Paused).await);
        let paused = h.manager.get(&t.id).unwrap();
        assert!(paused.bytes_transferred > 0);
        assert_eq!(
            std::fs::metadata(&t.local_path).unwrap().len(),
            paused.bytes_transferred
        );

        // 检查点已落盘，重新打开存储即可读到
        let reopened = JsonResumeStore::open(h.dir.path().join("cache/transfers.json"));
        assert_eq!(
            reopened.get(&t.id).map(|c| c.bytes_transferred),
            Some(paused.bytes_transferred)
        );

        assert!(h.manager.resume_transfer(&t.id));
        assert!(!h.manager.resume_transfer(&t.id));
        assert!(h.wait_for_status(&t.id, TransferStatus::Completed).await);

        assert_eq!(std::fs::read(&t.local_path).unwrap(), content);
        let offsets = h.transport.download_offsets();
        assert_eq!(offsets.len(), 2);
        assert_eq!(offsets[0].1, 0);
        assert_eq!(offsets[1].1, paused.bytes_transferred);
        h.manager.stop().await;
    }

    #[tokio::test]
    async fn test_resume_uses_existing_valid_checkpoint() {
        let h = Harness::new(MockTransport::connected().with_chunk_size(4), |_| {});
        let local = h.download_root().join("a.bin");
        std::fs::write(&local, b"0123").unwrap();
        h.resume_store
            .save_checkpoint("previous-run", "/media/a.bin", &local, 4, 10)
            .unwrap();

        h.manager.spawn();
        let t = h.add("/media/a.bin", b"0123456789");
        assert!(h.wait_for_status(&t.id, TransferStatus::Completed).await);

        assert_eq!(h.transport.download_offsets(), vec![("/media/a.bin".to_string(), 4)]);
        assert_eq!(std::fs::read(&local).unwrap(), b"0123456789");
        h.manager.stop().await;
    }

    #[tokio::test]
    async fn test_stale_checkpoint_ignored() {
        let h = Harness::new(MockTransport::connected(), |_| {});
        let local = h.download_root().join("a.bin");
        std::fs::write(&local, b"01").unwrap();
        h.resume_store
            .save_checkpoint("previous-run", "/media/a.bin", &local, 4, 10)
            .unwrap();

        h.manager.spawn();
        let t = h.add("/media/a.bin", b"0123456789");
        assert!(h.wait_for_status(&t.id, TransferStatus::Completed).await);
        assert_eq!(h.transport.download_offsets()[0].1, 0);
        h.manager.stop().await;
    }

    #[tokio::test]
    async fn test_resume_disabled_restarts_from_zero() {
        let h = Harness::new(MockTransport::connected(), |c| c.resume_transfers = false);
        let local = h.download_root().join("a.bin");
        std::fs::write(&local, b"0123").unwrap();
        h.resume_store
            .save_checkpoint("previous-run", "/media/a.bin", &local, 4, 10)
            .unwrap();

        h.manager.spawn();
        let t = h.add("/media/a.bin", b"0123456789");
        assert!(h.wait_for_status(&t.id, TransferStatus::Completed).await);
        assert_eq!(h.transport.download_offsets()[0].1, 0);
        h.manager.stop().await;
    }

    #[tokio::test]
    async fn test_remove_in_flight() {
        let h = Harness::new(slow_transport(), |_| {});
        h.manager.spawn();

        let t = h.add("/media/a.bin", &[0u8; 400]);
        assert!(h.wait_for_status(&t.id, TransferStatus::Transferring).await);

        assert!(h.manager.remove_transfer(&t.id));
        assert!(!h.manager.remove_transfer(&t.id));
        assert!(h.manager.get(&t.id).is_none());
        assert!(wait_until(|| h.manager.limiter().active_count() == 0).await);
        assert!(h.resume_store.get(&t.id).is_none());
        h.manager.stop().await;
    }

    #[tokio::test]
    async fn test_upload_completes() {
        let h = Harness::new(MockTransport::connected(), |_| {});
        let local = h.dir.path().join("up.txt");
        std::fs::write(&local, b"upload body").unwrap();
        h.manager.spawn();

        let t = h.manager.add_upload(&local, "/incoming").unwrap();
        assert!(h.wait_for_status(&t.id, TransferStatus::Completed).await);
        assert_eq!(
            h.transport.uploaded("/incoming/up.txt").as_deref(),
            Some(&b"upload body"[..])
        );
        h.manager.stop().await;
    }

    #[tokio::test]
    async fn test_pause_all_then_stop_drains() {
        let h = Harness::new(slow_transport(), |_| {});
        h.manager.spawn();

        let t1 = h.add("/media/1.bin", &[1u8; 400]);
        let t2 = h.add("/media/2.bin", &[2u8; 400]);
        assert!(wait_until(|| h.manager.active_count() == 2).await);

        assert_eq!(h.manager.pause_all(), 2);
        h.manager.stop().await;

        assert!(!h.manager.is_running());
        assert_eq!(h.status(&t1.id), Some(TransferStatus::Paused));
        assert_eq!(h.status(&t2.id), Some(TransferStatus::Paused));
        assert_eq!(h.manager.limiter().active_count(), 0);

        assert_eq!(h.manager.resume_all(), 2);
        assert_eq!(h.status(&t1.id), Some(TransferStatus::Queued));
    }

    #[tokio::test]
    async fn test_stop_without_pause_marks_stopped() {
        let h = Harness::new(slow_transport(), |_| {});
        h.manager.spawn();
        let t = h.add("/media/1.bin", &[1u8; 400]);
        assert!(h.wait_for_status(&t.id, TransferStatus::Transferring).await);

        h.manager.stop().await;
        assert_eq!(h.status(&t.id), Some(TransferStatus::Stopped));
    }

    // =====================================================
    // 队列操作与持久化
    // =====================================================

    #[tokio::test]
    async fn test_pause_and_resume_queued() {
        let h = Harness::new(MockTransport::connected(), |_| {});
        let t = h.add("/media/a.bin", b"x");

        assert!(h.manager.pause_transfer(&t.id));
        assert_eq!(h.status(&t.id), Some(TransferStatus::Paused));
        assert!(!h.manager.pause_transfer(&t.id));
        assert!(!h.manager.pause_transfer("missing"));

        assert!(h.manager.resume_transfer(&t.id));
        assert_eq!(h.status(&t.id), Some(TransferStatus::Queued));
    }

    #[tokio::test]
    async fn test_move_boundaries() {
        let h = Harness::new(MockTransport::connected(), |_| {});
        let a = h.add("/a", b"1");
        let b = h.add("/b", b"2");
        let order = || h.manager.transfers().iter().map(|t| t.id.clone()).collect::<Vec<_>>();

        assert!(!h.manager.move_up(&a.id));
        assert!(!h.manager.move_down(&b.id));
        assert_eq!(order(), vec![a.id.clone(), b.id.clone()]);

        assert!(h.manager.move_down(&a.id));
        assert_eq!(order(), vec![b.id.clone(), a.id.clone()]);

        let (saved, _) = JsonQueueStore::new(h.dir.path().join("cache/queue.json")).load_snapshot();
        assert_eq!(saved[0].id, b.id);
    }

    #[tokio::test]
    async fn test_queue_queries() {
        let h = Harness::new(MockTransport::connected(), |_| {});
        let t = h.add("/media/sub/file.bin", b"x");
        assert!(h.manager.has_pending_under_directory("/media", ""));
        assert!(h.manager.is_queued("/media/sub/file.bin", ""));

        let mut active = Transfer::download("/x".into(), PathBuf::from("/tmp/x"), 10, String::new());
        active.mark_transferring();
        active.speed = 250.0;
        h.manager.insert_for_test(active);
        assert_eq!(h.manager.total_active_speed(), 250.0);

        assert!(h.manager.remove_transfer(&t.id));
        assert!(!h.manager.has_pending_under_directory("/media", ""));
    }

    #[tokio::test]
    async fn test_restart_restores_queue() {
        let transport = Arc::new(MockTransport::connected());
        let first = Harness::new_shared(transport.clone());
        let queued = first.add("/a", b"1");
        let paused = first.add("/b", b"2");
        assert!(first.manager.pause_transfer(&paused.id));

        let mut interrupted = Transfer::download("/c".into(), PathBuf::from("/tmp/c"), 10, String::new());
        interrupted.mark_transferring();
        let interrupted_id = interrupted.id.clone();
        first.manager.insert_for_test(interrupted);
        first.manager.stop_queue();
        first.manager.persist().unwrap();

        let Harness { dir, manager, .. } = first;
        drop(manager);
        let second = Harness::with_dir(dir, transport, |_| {});

        let restored = second.manager.transfers();
        assert_eq!(restored.len(), 3);
        assert_eq!(second.status(&queued.id), Some(TransferStatus::Queued));
        assert_eq!(second.status(&paused.id), Some(TransferStatus::Paused));
        assert_eq!(second.status(&interrupted_id), Some(TransferStatus::Queued));
        // 停止状态不跨重启保留
        assert!(!second.manager.is_queue_stopped());
    }
}
