// 回调派发
//
// 进度和完成回调在调用方指定的运行时上按顺序执行，
// 与分片上传任务互不阻塞。完成回调在整个上传过程中只会触发一次

use crate::api::CompleteResponse;
use crate::uploader::{Progress, UploadError};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::debug;

/// 上传结果
pub type UploadResult = Result<CompleteResponse, UploadError>;

/// 进度回调
pub type ProgressCallback = Box<dyn Fn(Progress) + Send + Sync + 'static>;

/// 完成回调
pub type CompletionCallback = Box<dyn FnOnce(UploadResult) + Send + 'static>;

enum CallbackEvent {
    Progress(Progress),
    Completion(UploadResult),
}

/// 调用方注册的回调
#[derive(Default)]
pub struct Callbacks {
    pub on_progress: Option<ProgressCallback>,
    pub on_complete: Option<CompletionCallback>,
    /// 回调执行的运行时，未指定时使用启动上传时所在的运行时
    pub runtime: Option<Handle>,
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_progress", &self.on_progress.is_some())
            .field("on_complete", &self.on_complete.is_some())
            .field("runtime", &self.runtime.is_some())
            .finish()
    }
}

/// 回调派发器
#[derive(Debug)]
pub struct CallbackDispatcher {
    tx: mpsc::UnboundedSender<CallbackEvent>,
    completed: AtomicBool,
}

impl CallbackDispatcher {
    /// 在指定运行时上启动派发任务
    pub fn spawn(callbacks: Callbacks, fallback_runtime: &Handle) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<CallbackEvent>();
        let runtime = callbacks.runtime.unwrap_or_else(|| fallback_runtime.clone());
        let on_progress = callbacks.on_progress;
        let mut on_complete = callbacks.on_complete;

        runtime.spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    CallbackEvent::Progress(progress) => {
                        if let Some(callback) = &on_progress {
                            callback(progress);
                        }
                    }
                    CallbackEvent::Completion(result) => {
                        if let Some(callback) = on_complete.take() {
                            callback(result);
                        }
                        break;
                    }
                }
            }
            debug!("回调派发任务结束");
        });

        Self {
            tx,
            completed: AtomicBool::new(false),
        }
    }

    /// 派发进度（完成之后的进度被丢弃）
    pub fn progress(&self, progress: Progress) {
        if !self.completed.load(Ordering::SeqCst) {
            let _ = self.tx.send(CallbackEvent::Progress(progress));
        }
    }

    /// 派发完成结果，只有第一次调用生效
    pub fn complete(&self, result: UploadResult) -> bool {
        if self
            .completed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        let _ = self.tx.send(CallbackEvent::Completion(result));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_completion_fires_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let callbacks = Callbacks {
            on_complete: Some(Box::new(move |result: UploadResult| {
                let _ = tx.send(result);
            })),
            ..Default::default()
        };
        let dispatcher = CallbackDispatcher::spawn(callbacks, &Handle::current());

        assert!(dispatcher.complete(Err(UploadError::Aborted)));
        assert!(!dispatcher.complete(Ok(CompleteResponse::default())));

        assert_eq!(rx.recv().await, Some(Err(UploadError::Aborted)));
        // 派发任务结束后发送端被释放
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_progress_before_completion_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();

        let progress_seen = seen.clone();
        let callbacks = Callbacks {
            on_progress: Some(Box::new(move |p: Progress| {
                progress_seen.lock().push(p.uploaded_bytes);
            })),
            on_complete: Some(Box::new(move |_| {
                let _ = done_tx.send(());
            })),
            runtime: None,
        };
        let dispatcher = CallbackDispatcher::spawn(callbacks, &Handle::current());

        for uploaded in [10, 20, 30] {
            dispatcher.progress(Progress {
                total_bytes: 30,
                uploaded_bytes: uploaded,
            });
        }
        dispatcher.complete(Ok(CompleteResponse::default()));
        dispatcher.progress(Progress {
            total_bytes: 30,
            uploaded_bytes: 30,
        });

        done_rx.await.unwrap();
        assert_eq!(*seen.lock(), vec![10, 20, 30]);
    }
}
