// 上传协调器
//
// 一次上传分三个阶段：
// 1. start：建立上传会话，失败不重试
// 2. 分片上传：按分片大小切分文件，每个分片一个 Worker 任务，后接一个检查点任务
// 3. complete：屏障任务等待全部分片和检查点结束后，提交 complete，失败按重试策略重试
//
// 中止标志是协作式的：提交每个分片前、每个检查点中都会检查，
// 一旦置位，调度器取消所有尚未开始的任务

use crate::api::{
    ApiError, CompleteRequest, PartAck, StartOutcome, StartRequest, StartResponse, UploadApi,
    UploadSession,
};
use crate::uploader::callback::{CallbackDispatcher, Callbacks, UploadResult};
use crate::uploader::chunk::{plan_chunks, PartLedger};
use crate::uploader::retry::{RetryDecision, RetryPolicy};
use crate::uploader::scheduler::{ConcurrencyScheduler, TaskHandle, TaskKind};
use crate::uploader::source::Uploadable;
use crate::uploader::worker::{PartContext, PartError, PartWorker};
use crate::uploader::{Progress, ProgressTracker, UploadError, UploadOptions, UploadStatus};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

/// 上传协调器
///
/// 可克隆的句柄，所有克隆共享同一次上传
#[derive(Debug, Clone)]
pub struct UploadCoordinator {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    /// 上传 ID（日志用）
    id: String,
    api: Arc<dyn UploadApi>,
    source: Arc<dyn Uploadable>,
    options: Arc<UploadOptions>,
    filename: String,
    total_size: u64,

    status: Mutex<UploadStatus>,
    /// 中止标志
    aborted: AtomicBool,
    session: OnceLock<Arc<UploadSession>>,
    /// 标准模式下的分片 ETag 记录
    ledger: Mutex<PartLedger>,
    progress: ProgressTracker,
    scheduler: OnceLock<Arc<ConcurrencyScheduler>>,
    /// start 之前注册的回调
    callbacks: Mutex<Option<Callbacks>>,
    dispatcher: OnceLock<CallbackDispatcher>,
    /// 状态变化通知
    done: watch::Sender<UploadStatus>,
}

impl UploadCoordinator {
    /// 创建上传协调器
    ///
    /// 上传源大小未知、为空或没有文件名时返回 [`UploadError::InvalidSource`]，
    /// 选项无效时返回 [`UploadError::InvalidOptions`]
    pub fn new(
        api: Arc<dyn UploadApi>,
        source: Arc<dyn Uploadable>,
        options: UploadOptions,
    ) -> Result<Self, UploadError> {
        options.validate()?;

        let filename = match source.name().filter(|n| !n.is_empty()) {
            Some(name) => name.to_string(),
            None => return Err(UploadError::InvalidSource("缺少文件名".to_string())),
        };
        let total_size = match source.size() {
            Some(0) => return Err(UploadError::InvalidSource("文件为空".to_string())),
            Some(size) => size,
            None => return Err(UploadError::InvalidSource("文件大小未知".to_string())),
        };

        let (done, _) = watch::channel(UploadStatus::NotStarted);

        Ok(Self {
            inner: Arc::new(Inner {
                id: uuid::Uuid::new_v4().to_string(),
                api,
                source,
                options: Arc::new(options),
                filename,
                total_size,
                status: Mutex::new(UploadStatus::NotStarted),
                aborted: AtomicBool::new(false),
                session: OnceLock::new(),
                ledger: Mutex::new(PartLedger::new()),
                progress: ProgressTracker::new(total_size),
                scheduler: OnceLock::new(),
                callbacks: Mutex::new(Some(Callbacks::default())),
                dispatcher: OnceLock::new(),
                done,
            }),
        })
    }

    /// 注册进度回调（需在 start 之前）
    pub fn on_progress<F>(self, callback: F) -> Self
    where
        F: Fn(Progress) + Send + Sync + 'static,
    {
        if let Some(callbacks) = self.inner.callbacks.lock().as_mut() {
            callbacks.on_progress = Some(Box::new(callback));
        }
        self
    }

    /// 注册完成回调（需在 start 之前），整个上传过程只触发一次
    pub fn on_complete<F>(self, callback: F) -> Self
    where
        F: FnOnce(UploadResult) + Send + 'static,
    {
        if let Some(callbacks) = self.inner.callbacks.lock().as_mut() {
            callbacks.on_complete = Some(Box::new(callback));
        }
        self
    }

    /// 指定回调执行的运行时
    pub fn callback_runtime(self, runtime: Handle) -> Self {
        if let Some(callbacks) = self.inner.callbacks.lock().as_mut() {
            callbacks.runtime = Some(runtime);
        }
        self
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// 当前状态
    pub fn status(&self) -> UploadStatus {
        *self.inner.status.lock()
    }

    /// 当前进度快照
    pub fn progress(&self) -> Progress {
        self.inner.progress.snapshot()
    }

    /// 上传会话（start 成功后可用）
    pub fn session(&self) -> Option<Arc<UploadSession>> {
        self.inner.session.get().cloned()
    }

    /// 开始上传
    ///
    /// 只有处于 NotStarted 状态时生效，立即返回，上传在当前运行时上异步进行
    pub fn start(&self) -> bool {
        let runtime = match Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                error!("[{}] 无法开始上传，当前不在 tokio 运行时中: {}", self.inner.id, e);
                return false;
            }
        };

        let mut status = self.inner.status.lock();
        if *status != UploadStatus::NotStarted {
            warn!("[{}] 上传已开始过，忽略 start (状态: {:?})", self.inner.id, *status);
            return false;
        }

        let callbacks = self.inner.callbacks.lock().take().unwrap_or_default();
        let _ = self
            .inner
            .dispatcher
            .set(CallbackDispatcher::spawn(callbacks, &runtime));

        let scheduler = Arc::new(ConcurrencyScheduler::new(
            self.inner.options.part_concurrency,
            runtime,
        ));
        let _ = self.inner.scheduler.set(scheduler.clone());

        *status = UploadStatus::InProgress;
        self.inner.done.send_replace(UploadStatus::InProgress);
        drop(status);

        info!(
            "[{}] 开始上传: {} ({} bytes, 分片并发数: {})",
            self.inner.id, self.inner.filename, self.inner.total_size, self.inner.options.part_concurrency
        );

        let inner = self.inner.clone();
        scheduler.submit(TaskKind::Barrier, &[], async move {
            inner.drive().await;
        });
        true
    }

    /// 取消上传
    ///
    /// 只有处于 InProgress 状态时生效。已经发出的请求不保证中断，
    /// 但不会再派发新的工作，完成回调收到 [`UploadError::Aborted`]
    pub fn cancel(&self) -> bool {
        if !self.inner.transition(UploadStatus::Cancelled) {
            return false;
        }
        info!("[{}] 用户取消上传", self.inner.id);
        self.inner.abort();
        self.inner.deliver(UploadStatus::Cancelled, Err(UploadError::Aborted));
        true
    }

    /// 等待上传进入终态，并等待所有已派发的任务结束
    ///
    /// 未开始的上传直接返回当前状态
    pub async fn wait(&self) -> UploadStatus {
        let mut rx = self.inner.done.subscribe();
        let status = {
            let current = *rx.borrow_and_update();
            if current == UploadStatus::NotStarted {
                return current;
            }
            match rx.wait_for(|s| s.is_terminal()).await {
                Ok(status) => *status,
                Err(_) => self.status(),
            }
        };

        if let Some(scheduler) = self.inner.scheduler.get() {
            scheduler.drain().await;
        }
        status
    }
}

impl Inner {
    fn scheduler(&self) -> Option<Arc<ConcurrencyScheduler>> {
        self.scheduler.get().cloned()
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// 置位中止标志并取消所有尚未开始的任务
    fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        if let Some(scheduler) = self.scheduler.get() {
            scheduler.cancel_all();
        }
    }

    /// InProgress → 终态，只有第一次转换成功
    fn transition(&self, to: UploadStatus) -> bool {
        let mut status = self.status.lock();
        if *status != UploadStatus::InProgress {
            return false;
        }
        *status = to;
        true
    }

    fn deliver(&self, status: UploadStatus, result: UploadResult) {
        if let Some(dispatcher) = self.dispatcher.get() {
            dispatcher.complete(result);
        }
        self.done.send_replace(status);
    }

    /// 进入终态并触发完成回调
    fn finish(&self, status: UploadStatus, result: UploadResult) {
        if !self.transition(status) {
            debug!("[{}] 已处于终态，忽略 {:?}", self.id, status);
            return;
        }
        match &result {
            Ok(_) => info!("[{}] ✓ 上传完成: {}", self.id, self.filename),
            Err(e) => error!("[{}] 上传失败: {}", self.id, e),
        }
        self.deliver(status, result);
    }

    fn fail(&self, error: UploadError) {
        self.finish(UploadStatus::Failed, Err(error));
    }

    fn report_progress(&self, delta: u64) {
        let dispatcher = self.dispatcher.get();
        self.progress.add(delta, |progress| {
            if let Some(dispatcher) = dispatcher {
                dispatcher.progress(progress);
            }
        });
    }

    fn start_request(&self) -> StartRequest {
        StartRequest {
            filename: self.filename.clone(),
            mime_type: self.source.mime_type().to_string(),
            size: self.total_size,
            store: self.options.store.clone(),
            security: self.options.security.clone(),
            intelligent: self.options.intelligent,
        }
    }

    /// 驱动整个上传流程
    async fn drive(self: Arc<Self>) {
        let Some(scheduler) = self.scheduler() else {
            return;
        };

        // 阶段 1：start
        let (tx, rx) = oneshot::channel();
        let api = self.api.clone();
        let request = self.start_request();
        let start_task = scheduler.submit(TaskKind::Worker, &[], async move {
            let _ = tx.send(api.start(&request).await);
        });
        start_task.wait().await;

        let session = match rx.await {
            Ok(response) => match self.validate_start(response) {
                Some(session) => Arc::new(session),
                None => return,
            },
            Err(_) => {
                debug!("[{}] start 任务未执行", self.id);
                self.fail(UploadError::Aborted);
                return;
            }
        };
        let _ = self.session.set(session.clone());

        // 阶段 2：分片上传，模式在整个会话内固定
        let worker = PartWorker::for_session(&session, &self.options);
        info!(
            "[{}] 会话已建立: upload_id={}, 智能分片={}",
            self.id,
            session.upload_id,
            worker.is_intelligent()
        );

        let reporter_inner = self.clone();
        let ctx = PartContext {
            api: self.api.clone(),
            source: self.source.clone(),
            session: session.clone(),
            options: self.options.clone(),
            cancel_token: scheduler.cancel_token(),
            reporter: Arc::new(move |delta: u64| reporter_inner.report_progress(delta)),
        };

        let mut dependencies: Vec<TaskHandle> = Vec::new();
        for chunk in plan_chunks(self.total_size, self.options.chunk_size) {
            if self.is_aborted() {
                warn!("[{}] 已中止，停止提交分片 (下一个分片#{})", self.id, chunk.index);
                break;
            }

            let index = chunk.index;
            self.ledger.lock().submit(index);

            let (tx, rx) = oneshot::channel();
            let part_ctx = ctx.clone();
            let part_task = scheduler.submit(TaskKind::Worker, &[], async move {
                let _ = tx.send(worker.upload(&part_ctx, &chunk).await);
            });

            let inner = self.clone();
            let checkpoint = scheduler.submit(TaskKind::Checkpoint, &[part_task.clone()], async move {
                let outcome = rx.await.ok();
                inner.checkpoint(index, outcome, worker.is_intelligent());
            });

            dependencies.push(part_task);
            dependencies.push(checkpoint);
        }

        // 阶段 3：屏障 → complete
        let inner = self.clone();
        scheduler.submit(TaskKind::Barrier, &dependencies, async move {
            inner.after_parts(session, worker.is_intelligent());
        });
    }

    /// 校验 start 响应
    fn validate_start(&self, response: Result<StartResponse, ApiError>) -> Option<UploadSession> {
        let response = match response {
            Ok(response) => response,
            Err(e) => {
                error!("[{}] start 请求失败: {}", self.id, e);
                self.fail(UploadError::Aborted);
                return None;
            }
        };

        match response.into_session() {
            StartOutcome::Session(session) => Some(session),
            StartOutcome::Rejected(reason) => {
                error!("[{}] 服务器拒绝上传: {}", self.id, reason);
                self.fail(UploadError::ServerRejected(reason));
                None
            }
            StartOutcome::Incomplete(field) => {
                error!("[{}] start 响应缺少字段: {}", self.id, field);
                self.fail(UploadError::Aborted);
                None
            }
        }
    }

    /// 分片检查点：记录 ETag，失败时置位中止标志
    fn checkpoint(&self, index: usize, outcome: Option<Result<PartAck, PartError>>, intelligent: bool) {
        match outcome {
            Some(Ok(_)) if intelligent => {
                debug!("[{}] 分片#{} 已提交", self.id, index);
            }
            Some(Ok(PartAck { etag: Some(etag) })) => {
                if !self.ledger.lock().record(index, etag) {
                    error!("[{}] 分片#{} 重复确认", self.id, index);
                    self.abort();
                }
            }
            Some(Ok(PartAck { etag: None })) => {
                error!("[{}] 分片#{} 上传成功但没有返回 ETag", self.id, index);
                self.abort();
            }
            Some(Err(e)) => {
                error!("[{}] 分片#{} 上传失败: {}", self.id, index, e);
                self.abort();
            }
            None => {
                warn!("[{}] 分片#{} 未执行", self.id, index);
                self.abort();
            }
        }

        // 中止标志也可能由取消或其它检查点置位
        if self.is_aborted() {
            self.abort();
        }
    }

    /// 所有分片和检查点结束之后执行
    fn after_parts(self: Arc<Self>, session: Arc<UploadSession>, intelligent: bool) {
        if self.is_aborted() {
            self.fail(UploadError::Aborted);
            return;
        }

        let parts = if intelligent {
            None
        } else {
            match self.ledger.lock().complete_list() {
                Some(parts) => Some(parts),
                None => {
                    error!("[{}] 分片 ETag 不完整，放弃 complete", self.id);
                    self.abort();
                    self.fail(UploadError::Aborted);
                    return;
                }
            }
        };

        let request = CompleteRequest {
            filename: self.filename.clone(),
            mime_type: self.source.mime_type().to_string(),
            size: self.total_size,
            store: self.options.store.clone(),
            security: self.options.security.clone(),
            parts,
        };
        self.submit_finalize(session, Arc::new(request), 0);
    }

    /// 提交一次 complete 尝试（Worker 任务）
    fn submit_finalize(
        self: Arc<Self>,
        session: Arc<UploadSession>,
        request: Arc<CompleteRequest>,
        attempts: u32,
    ) {
        let Some(scheduler) = self.scheduler() else {
            return;
        };
        scheduler.submit(TaskKind::Worker, &[], async move {
            self.finalize(session, request, attempts).await;
        });
    }

    /// complete，按重试策略重试
    ///
    /// 每次尝试是一个独立的 Worker 任务；退避等待放在不占槽位的
    /// Checkpoint 任务里，等待结束后再提交下一次尝试
    async fn finalize(
        self: Arc<Self>,
        session: Arc<UploadSession>,
        request: Arc<CompleteRequest>,
        attempts: u32,
    ) {
        if self.is_aborted() {
            self.fail(UploadError::Aborted);
            return;
        }

        let error = match self.api.complete(&session, &request).await {
            Ok(response) => {
                self.finish(UploadStatus::Completed, Ok(response));
                return;
            }
            Err(e) => e,
        };

        let policy = RetryPolicy::new(self.options.max_finalize_retries, self.options.retry_base_delay);
        let attempts = attempts + 1;
        let delay = match policy.decide(attempts, &error) {
            RetryDecision::RetryAfter(delay) => delay,
            RetryDecision::GiveUp => {
                error!(
                    "[{}] complete 失败，已达最大尝试次数 {}: {}",
                    self.id,
                    policy.max_attempts(),
                    error
                );
                self.fail(UploadError::Aborted);
                return;
            }
        };

        warn!(
            "[{}] complete 失败，{:?} 后重试 ({}/{}): {}",
            self.id,
            delay,
            attempts,
            policy.max_attempts(),
            error
        );
        if delay.is_zero() {
            self.submit_finalize(session, request, attempts);
            return;
        }

        let Some(scheduler) = self.scheduler() else {
            return;
        };
        let cancel_token = scheduler.cancel_token();
        scheduler.submit(TaskKind::Checkpoint, &[], async move {
            tokio::select! {
                _ = cancel_token.cancelled() => self.fail(UploadError::Aborted),
                _ = tokio::time::sleep(delay) => self.submit_finalize(session, request, attempts),
            }
        });
    }
}
