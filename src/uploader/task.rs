// 上传状态与进度

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// 上传状态
///
/// `NotStarted → InProgress → {Completed | Failed | Cancelled}`，终态不可再变
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    /// 未开始
    NotStarted,
    /// 上传中
    InProgress,
    /// 已完成
    Completed,
    /// 失败
    Failed,
    /// 已取消
    Cancelled,
}

impl UploadStatus {
    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UploadStatus::Completed | UploadStatus::Failed | UploadStatus::Cancelled
        )
    }
}

/// 上传进度快照
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Progress {
    /// 文件总大小
    pub total_bytes: u64,
    /// 已上传字节数
    pub uploaded_bytes: u64,
}

impl Progress {
    pub fn new(total_bytes: u64) -> Self {
        Self {
            total_bytes,
            uploaded_bytes: 0,
        }
    }

    /// 计算进度百分比
    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        (self.uploaded_bytes as f64 / self.total_bytes as f64) * 100.0
    }

    pub fn is_complete(&self) -> bool {
        self.uploaded_bytes >= self.total_bytes
    }
}

/// 进度聚合器
///
/// 多个分片并发上报增量，累加与快照派发在同一把锁内完成，
/// 因此派发出去的快照序列单调不减
#[derive(Debug)]
pub struct ProgressTracker {
    inner: Mutex<Progress>,
}

impl ProgressTracker {
    pub fn new(total_bytes: u64) -> Self {
        Self {
            inner: Mutex::new(Progress::new(total_bytes)),
        }
    }

    /// 当前快照
    pub fn snapshot(&self) -> Progress {
        *self.inner.lock()
    }

    /// 累加增量（不超过总大小），并在锁内把新快照交给 `deliver`
    pub fn add<F>(&self, delta: u64, deliver: F) -> Progress
    where
        F: FnOnce(Progress),
    {
        let mut progress = self.inner.lock();
        progress.uploaded_bytes = progress
            .uploaded_bytes
            .saturating_add(delta)
            .min(progress.total_bytes);
        let snapshot = *progress;
        deliver(snapshot);
        snapshot
    }
}
