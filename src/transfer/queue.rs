//! 传输队列
//!
//! 有序的传输列表，顺序决定显示顺序和启动顺序，只能通过上移/下移/删除改变。

use super::types::{Transfer, TransferStatus};

/// 有序传输队列
#[derive(Debug, Clone)]
pub struct TransferQueue {
    transfers: Vec<Transfer>,
    max_concurrent: usize,
}

impl TransferQueue {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            transfers: Vec::new(),
            max_concurrent,
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn set_max_concurrent(&mut self, max_concurrent: usize) {
        self.max_concurrent = max_concurrent;
    }

    /// 追加到队尾，重复检查由调用方负责
    pub fn enqueue(&mut self, transfer: Transfer) {
        self.transfers.push(transfer);
    }

    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Transfer> {
        self.transfers.iter()
    }

    pub fn as_slice(&self) -> &[Transfer] {
        &self.transfers
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Transfer> {
        self.transfers.iter_mut()
    }

    /// 传输中的数量
    pub fn active_count(&self) -> usize {
        self.transfers
            .iter()
            .filter(|t| t.status == TransferStatus::Transferring)
            .count()
    }

    pub fn can_start_more(&self) -> bool {
        self.active_count() < self.max_concurrent
    }

    /// 按队列顺序第一个排队中的传输
    pub fn next_queued(&self) -> Option<&Transfer> {
        self.transfers
            .iter()
            .find(|t| t.status == TransferStatus::Queued)
    }

    pub(crate) fn next_queued_mut(&mut self) -> Option<&mut Transfer> {
        self.transfers
            .iter_mut()
            .find(|t| t.status == TransferStatus::Queued)
    }

    pub fn by_id(&self, id: &str) -> Option<&Transfer> {
        self.transfers.iter().find(|t| t.id == id)
    }

    pub fn by_id_mut(&mut self, id: &str) -> Option<&mut Transfer> {
        self.transfers.iter_mut().find(|t| t.id == id)
    }

    /// 按远端路径查找，`host_key` 为空时匹配任意主机
    pub fn by_remote_path(&self, path: &str, host_key: &str) -> Option<&Transfer> {
        self.transfers
            .iter()
            .find(|t| t.remote_path == path && host_matches(t, host_key))
    }

    /// 是否存在未结束的同路径传输
    pub fn is_queued(&self, path: &str, host_key: &str) -> bool {
        self.transfers
            .iter()
            .any(|t| t.remote_path == path && host_matches(t, host_key) && !t.is_terminal())
    }

    pub fn remove(&mut self, id: &str) -> Option<Transfer> {
        let index = self.position(id)?;
        Some(self.transfers.remove(index))
    }

    pub fn move_up(&mut self, id: &str) -> bool {
        match self.position(id) {
            Some(index) if index > 0 => {
                self.transfers.swap(index, index - 1);
                true
            }
            _ => false,
        }
    }

    pub fn move_down(&mut self, id: &str) -> bool {
        match self.position(id) {
            Some(index) if index + 1 < self.transfers.len() => {
                self.transfers.swap(index, index + 1);
                true
            }
            _ => false,
        }
    }

    /// 目录下是否有未结束的传输
    pub fn has_pending_under_directory(&self, dir_path: &str, host_key: &str) -> bool {
        let prefix = if dir_path.ends_with('/') {
            dir_path.to_string()
        } else {
            format!("{}/", dir_path)
        };
        self.transfers.iter().any(|t| {
            t.remote_path.starts_with(&prefix) && host_matches(t, host_key) && !t.is_terminal()
        })
    }

    /// 传输中的总速度
    pub fn total_active_speed(&self) -> f64 {
        self.transfers
            .iter()
            .filter(|t| t.status == TransferStatus::Transferring)
            .map(|t| t.speed)
            .sum()
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.transfers.iter().position(|t| t.id == id)
    }
}

impl Default for TransferQueue {
    fn default() -> Self {
        Self::new(10)
    }
}

impl FromIterator<Transfer> for TransferQueue {
    fn from_iter<I: IntoIterator<Item = Transfer>>(iter: I) -> Self {
        let mut queue = Self::default();
        queue.transfers.extend(iter);
        queue
    }
}

fn host_matches(transfer: &Transfer, host_key: &str) -> bool {
    host_key.is_empty() || transfer.host_key == host_key
}
