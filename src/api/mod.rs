// 上传服务 API 模块

pub mod client;
pub mod types;

pub use client::UploadClient;
pub use types::*;

use async_trait::async_trait;

/// 上传服务的三段式协议（start → upload/commit → complete）
///
/// 协调器只依赖这个 trait，HTTP 实现见 [`UploadClient`]
#[async_trait]
pub trait UploadApi: Send + Sync + std::fmt::Debug {
    /// 开始上传，服务器返回上传会话
    ///
    /// 服务器显式拒绝（带 `error` 字段）时返回 `Ok`，由调用方校验
    async fn start(&self, request: &StartRequest) -> Result<StartResponse, ApiError>;

    /// 上传一个分片（标准模式）或一个子分片（智能分片模式）
    ///
    /// 负载按 [`PartRequest::body_stream`] 分帧发送，`on_sent` 随之逐帧回调
    async fn upload_part(
        &self,
        session: &UploadSession,
        request: PartRequest,
    ) -> Result<PartAck, ApiError>;

    /// 提交一个分片（仅智能分片模式）
    async fn commit_part(
        &self,
        session: &UploadSession,
        request: &CommitRequest,
    ) -> Result<(), ApiError>;

    /// 完成上传
    ///
    /// 只有 200 状态码视为成功，其它状态码返回 [`ApiError::Status`]
    async fn complete(
        &self,
        session: &UploadSession,
        request: &CompleteRequest,
    ) -> Result<CompleteResponse, ApiError>;
}
