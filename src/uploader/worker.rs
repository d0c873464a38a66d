// 分片上传
//
// 两种上传方式，由 start 响应决定，整个会话内固定不变：
// - 标准模式：整个分片一次请求上传，返回 ETag；失败不重试，由协调器中止整个上传
// - 智能分片模式：分片再切成子分片并发上传，单个子分片失败按退避策略重试，
//   网络错误时对半拆分后重试；全部成功后提交分片，不需要 ETag
//
// 取消令牌触发后，在途子分片被终止，排队或退避中的子分片不再发出

use crate::api::{
    ApiError, CommitRequest, PartAck, PartRequest, SendProgress, UploadApi, UploadSession,
};
use crate::uploader::chunk::split_range;
use crate::uploader::retry::{RetryDecision, RetryPolicy};
use crate::uploader::source::Uploadable;
use crate::uploader::{UploadChunk, UploadOptions, MIN_SUB_CHUNK_SIZE};
use std::collections::VecDeque;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 分片上传错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PartError {
    /// 服务接口错误
    #[error(transparent)]
    Api(#[from] ApiError),
    /// 上传已取消
    #[error("分片上传已取消")]
    Cancelled,
    /// 子分片任务异常
    #[error("子分片任务异常: {0}")]
    Panicked(String),
}

/// 已上传字节数上报
pub type ProgressReporter = SendProgress;

/// 分片上传所需的共享上下文
#[derive(Clone)]
pub struct PartContext {
    pub api: Arc<dyn UploadApi>,
    pub source: Arc<dyn Uploadable>,
    pub session: Arc<UploadSession>,
    pub options: Arc<UploadOptions>,
    pub cancel_token: CancellationToken,
    pub reporter: ProgressReporter,
}

impl std::fmt::Debug for PartContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartContext")
            .field("session", &self.session)
            .field("cancelled", &self.cancel_token.is_cancelled())
            .finish()
    }
}

impl PartContext {
    async fn read(&self, range: Range<u64>) -> Result<bytes::Bytes, PartError> {
        self.source
            .read_range(range)
            .await
            .map_err(|e| PartError::Api(ApiError::Io(e.to_string())))
    }

    fn part_request(
        &self,
        part: usize,
        offset: Option<u64>,
        data: bytes::Bytes,
        on_sent: Option<ProgressReporter>,
    ) -> PartRequest {
        PartRequest {
            part,
            offset,
            data,
            store: self.options.store.clone(),
            security: self.options.security.clone(),
            on_sent,
        }
    }
}

/// 分片上传方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartWorker {
    /// 标准模式
    Standard,
    /// 智能分片模式
    Intelligent {
        /// 子分片大小
        sub_chunk_size: u64,
        /// 分片内最大并发子分片数
        concurrency: usize,
        /// 子分片重试策略
        retry: RetryPolicy,
    },
}

impl PartWorker {
    /// 根据会话选择上传方式
    pub fn for_session(session: &UploadSession, options: &UploadOptions) -> Self {
        if session.intelligent {
            PartWorker::Intelligent {
                sub_chunk_size: options.sub_chunk_size,
                concurrency: options.sub_chunk_concurrency.max(1),
                retry: RetryPolicy::new(
                    options.max_sub_chunk_retries.max(1),
                    options.retry_base_delay,
                ),
            }
        } else {
            PartWorker::Standard
        }
    }

    pub fn is_intelligent(&self) -> bool {
        matches!(self, PartWorker::Intelligent { .. })
    }

    /// 上传一个分片
    pub async fn upload(&self, ctx: &PartContext, chunk: &UploadChunk) -> Result<PartAck, PartError> {
        if ctx.cancel_token.is_cancelled() {
            return Err(PartError::Cancelled);
        }
        match *self {
            PartWorker::Standard => upload_standard(ctx, chunk).await,
            PartWorker::Intelligent {
                sub_chunk_size,
                concurrency,
                retry,
            } => upload_intelligent(ctx, chunk, sub_chunk_size, concurrency, retry).await,
        }
    }
}

/// 标准模式：整个分片一次上传，数据发出时逐帧上报进度
///
/// 失败时已上报的字节不回退，失败的分片会中止整个上传
async fn upload_standard(ctx: &PartContext, chunk: &UploadChunk) -> Result<PartAck, PartError> {
    debug!(
        "[分片#{}] 开始上传 (范围: {}-{}, 大小: {} bytes)",
        chunk.index,
        chunk.range.start,
        chunk.range.end - 1,
        chunk.size()
    );

    let data = ctx.read(chunk.range.clone()).await?;
    let request = ctx.part_request(chunk.index, None, data, Some(ctx.reporter.clone()));
    let ack = ctx.api.upload_part(&ctx.session, request).await?;

    info!("[分片#{}] ✓ 上传成功, etag={:?}", chunk.index, ack.etag);
    Ok(ack)
}

/// 待上传的子分片
#[derive(Debug, Clone)]
struct PendingSubChunk {
    /// 相对分片起点的范围
    range: Range<u64>,
    /// 已失败次数
    failures: u32,
    /// 上传前等待
    delay: Duration,
}

/// 单个子分片上传
///
/// 退避等待和排队等待许可期间都响应取消；子分片成功后才计入进度，
/// 失败重试不会重复计数
async fn upload_sub_chunk(
    ctx: PartContext,
    part: usize,
    part_start: u64,
    pending: PendingSubChunk,
    semaphore: Arc<Semaphore>,
) -> Result<(), PartError> {
    if !pending.delay.is_zero() {
        tokio::select! {
            biased;
            _ = ctx.cancel_token.cancelled() => return Err(PartError::Cancelled),
            _ = tokio::time::sleep(pending.delay) => {}
        }
    }

    let _permit = tokio::select! {
        biased;
        _ = ctx.cancel_token.cancelled() => return Err(PartError::Cancelled),
        permit = semaphore.acquire_owned() => permit.map_err(|_| PartError::Cancelled)?,
    };
    if ctx.cancel_token.is_cancelled() {
        return Err(PartError::Cancelled);
    }

    let absolute = (part_start + pending.range.start)..(part_start + pending.range.end);
    let data = ctx.read(absolute).await?;

    ctx.api
        .upload_part(
            &ctx.session,
            ctx.part_request(part, Some(pending.range.start), data, None),
        )
        .await?;
    Ok(())
}

/// 终止并回收所有子分片任务
async fn abort_sub_chunks<T: 'static>(join_set: &mut JoinSet<T>) {
    join_set.abort_all();
    while join_set.join_next().await.is_some() {}
}

/// 智能分片模式：子分片并发上传，失败重试，全部成功后提交分片
async fn upload_intelligent(
    ctx: &PartContext,
    chunk: &UploadChunk,
    sub_chunk_size: u64,
    concurrency: usize,
    retry: RetryPolicy,
) -> Result<PartAck, PartError> {
    let mut pending: VecDeque<PendingSubChunk> = chunk
        .sub_chunks(sub_chunk_size)
        .into_iter()
        .map(|range| PendingSubChunk {
            range,
            failures: 0,
            delay: Duration::ZERO,
        })
        .collect();

    debug!(
        "[分片#{}] 智能分片上传: {} 个子分片, 并发数: {}",
        chunk.index,
        pending.len(),
        concurrency
    );

    let semaphore = Arc::new(Semaphore::new(concurrency));
    let mut join_set: JoinSet<(PendingSubChunk, Result<(), PartError>)> = JoinSet::new();

    loop {
        // 派发所有待上传子分片（在任务内部获取并发许可）
        while let Some(sub) = pending.pop_front() {
            if ctx.cancel_token.is_cancelled() {
                abort_sub_chunks(&mut join_set).await;
                return Err(PartError::Cancelled);
            }
            let task_ctx = ctx.clone();
            let semaphore = semaphore.clone();
            let part = chunk.index;
            let part_start = chunk.range.start;
            join_set.spawn(async move {
                let result =
                    upload_sub_chunk(task_ctx, part, part_start, sub.clone(), semaphore).await;
                (sub, result)
            });
        }

        let next = tokio::select! {
            biased;
            _ = ctx.cancel_token.cancelled() => {
                debug!("[分片#{}] 已取消，终止剩余子分片", chunk.index);
                abort_sub_chunks(&mut join_set).await;
                return Err(PartError::Cancelled);
            }
            next = join_set.join_next() => match next {
                Some(next) => next,
                None => break,
            },
        };

        match next {
            Ok((sub, Ok(()))) => {
                (ctx.reporter)(sub.range.end - sub.range.start);
            }
            Ok((sub, Err(PartError::Api(e)))) => {
                let failures = sub.failures + 1;
                match retry.decide(failures, &e) {
                    RetryDecision::RetryAfter(delay) => {
                        let len = sub.range.end - sub.range.start;
                        if e.is_network() && len / 2 >= MIN_SUB_CHUNK_SIZE {
                            // 网络错误：对半拆分后重试
                            warn!(
                                "[分片#{}] 子分片 offset={} 网络错误，拆分为两半重试 ({}/{}): {}",
                                chunk.index,
                                sub.range.start,
                                failures,
                                retry.max_attempts(),
                                e
                            );
                            for half in split_range(sub.range.clone(), len.div_ceil(2)) {
                                pending.push_back(PendingSubChunk {
                                    range: half,
                                    failures,
                                    delay,
                                });
                            }
                        } else {
                            warn!(
                                "[分片#{}] 子分片 offset={} 上传失败，等待 {:?} 后重试 ({}/{}): {}",
                                chunk.index,
                                sub.range.start,
                                delay,
                                failures,
                                retry.max_attempts(),
                                e
                            );
                            pending.push_back(PendingSubChunk {
                                range: sub.range,
                                failures,
                                delay,
                            });
                        }
                    }
                    RetryDecision::GiveUp => {
                        error!(
                            "[分片#{}] 子分片 offset={} 上传失败，已达最大重试次数: {}",
                            chunk.index, sub.range.start, e
                        );
                        abort_sub_chunks(&mut join_set).await;
                        return Err(PartError::Api(e));
                    }
                }
            }
            Ok((_, Err(e))) => {
                abort_sub_chunks(&mut join_set).await;
                return Err(e);
            }
            Err(e) => {
                error!("[分片#{}] 子分片任务异常: {}", chunk.index, e);
                abort_sub_chunks(&mut join_set).await;
                return Err(PartError::Panicked(e.to_string()));
            }
        }
    }

    if ctx.cancel_token.is_cancelled() {
        return Err(PartError::Cancelled);
    }

    // 全部子分片成功，提交分片
    let commit = CommitRequest {
        part: chunk.index,
        size: chunk.size(),
        store: ctx.options.store.clone(),
        security: ctx.options.security.clone(),
    };
    ctx.api.commit_part(&ctx.session, &commit).await?;

    info!("[分片#{}] ✓ 智能分片上传并提交成功", chunk.index);
    Ok(PartAck { etag: None })
}
