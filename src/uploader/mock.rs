// 测试用上传服务

use crate::api::{
    ApiError, CommitRequest, CompleteRequest, CompleteResponse, PartAck, PartRequest,
    StartRequest, StartResponse, UploadApi, UploadSession, INTELLIGENT_INGESTION,
};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// 一次 upload_part 调用记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadCall {
    pub part: usize,
    pub offset: Option<u64>,
    pub len: u64,
}

#[derive(Debug)]
pub struct MockApi {
    start: Mutex<Option<Result<StartResponse, ApiError>>>,
    upload_failures: Mutex<VecDeque<ApiError>>,
    complete_failures: Mutex<VecDeque<ApiError>>,
    commit_failures: Mutex<VecDeque<ApiError>>,
    /// 不返回 ETag 的分片
    missing_etag: Mutex<Vec<usize>>,
    upload_delay: Duration,

    pub start_calls: AtomicUsize,
    pub uploads: Mutex<Vec<UploadCall>>,
    pub commits: Mutex<Vec<(usize, u64)>>,
    pub completes: Mutex<Vec<CompleteRequest>>,
    pub complete_times: Mutex<Vec<Instant>>,
    running: AtomicUsize,
    pub peak: AtomicUsize,
}

impl MockApi {
    fn with_start(response: StartResponse) -> Self {
        Self {
            start: Mutex::new(Some(Ok(response))),
            upload_failures: Mutex::new(VecDeque::new()),
            complete_failures: Mutex::new(VecDeque::new()),
            commit_failures: Mutex::new(VecDeque::new()),
            missing_etag: Mutex::new(Vec::new()),
            upload_delay: Duration::ZERO,
            start_calls: AtomicUsize::new(0),
            uploads: Mutex::new(Vec::new()),
            commits: Mutex::new(Vec::new()),
            completes: Mutex::new(Vec::new()),
            complete_times: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// 标准模式会话
    pub fn standard() -> Self {
        Self::with_start(StartResponse {
            uri: Some("/bucket/key".to_string()),
            region: Some("us-east-1".to_string()),
            upload_id: Some("upload-1".to_string()),
            ..Default::default()
        })
    }

    /// 智能分片模式会话
    pub fn intelligent() -> Self {
        Self::with_start(StartResponse {
            uri: Some("/bucket/key".to_string()),
            region: Some("us-east-1".to_string()),
            upload_id: Some("upload-1".to_string()),
            upload_type: Some(INTELLIGENT_INGESTION.to_string()),
            ..Default::default()
        })
    }

    pub fn with_start_response(self, response: Result<StartResponse, ApiError>) -> Self {
        *self.start.lock() = Some(response);
        self
    }

    pub fn with_upload_delay(mut self, delay: Duration) -> Self {
        self.upload_delay = delay;
        self
    }

    pub fn fail_uploads(self, errors: impl IntoIterator<Item = ApiError>) -> Self {
        self.upload_failures.lock().extend(errors);
        self
    }

    pub fn fail_completes(self, errors: impl IntoIterator<Item = ApiError>) -> Self {
        self.complete_failures.lock().extend(errors);
        self
    }

    pub fn fail_commits(self, errors: impl IntoIterator<Item = ApiError>) -> Self {
        self.commit_failures.lock().extend(errors);
        self
    }

    pub fn without_etag_for(self, part: usize) -> Self {
        self.missing_etag.lock().push(part);
        self
    }

    pub fn upload_calls(&self) -> Vec<UploadCall> {
        self.uploads.lock().clone()
    }

    pub fn complete_count(&self) -> usize {
        self.completes.lock().len()
    }
}

#[async_trait]
impl UploadApi for MockApi {
    async fn start(&self, _request: &StartRequest) -> Result<StartResponse, ApiError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        self.start
            .lock()
            .clone()
            .unwrap_or_else(|| Err(ApiError::Network("no start response".to_string())))
    }

    async fn upload_part(
        &self,
        _session: &UploadSession,
        request: PartRequest,
    ) -> Result<PartAck, ApiError> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.upload_delay.is_zero() {
            tokio::time::sleep(self.upload_delay).await;
        }
        self.running.fetch_sub(1, Ordering::SeqCst);

        self.uploads.lock().push(UploadCall {
            part: request.part,
            offset: request.offset,
            len: request.data.len() as u64,
        });

        if let Some(error) = self.upload_failures.lock().pop_front() {
            return Err(error);
        }
        // 与 HTTP 客户端一样逐帧取走负载
        request.body_stream().for_each(|_| async {}).await;

        if self.missing_etag.lock().contains(&request.part) {
            return Ok(PartAck { etag: None });
        }
        Ok(PartAck {
            etag: Some(format!("etag-{}", request.part)),
        })
    }

    async fn commit_part(
        &self,
        _session: &UploadSession,
        request: &CommitRequest,
    ) -> Result<(), ApiError> {
        if let Some(error) = self.commit_failures.lock().pop_front() {
            return Err(error);
        }
        self.commits.lock().push((request.part, request.size));
        Ok(())
    }

    async fn complete(
        &self,
        _session: &UploadSession,
        request: &CompleteRequest,
    ) -> Result<CompleteResponse, ApiError> {
        self.completes.lock().push(request.clone());
        self.complete_times.lock().push(Instant::now());
        if let Some(error) = self.complete_failures.lock().pop_front() {
            return Err(error);
        }
        Ok(CompleteResponse::from_body(format!(
            r#"{{"handle":"handle-1","size":{}}}"#,
            request.size
        )))
    }
}
