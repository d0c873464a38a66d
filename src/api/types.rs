// 上传服务 API 数据类型

use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// 智能分片（intelligent ingestion）模式标记
pub const INTELLIGENT_INGESTION: &str = "intelligent_ingestion";

/// 请求体发送帧大小: 64KB
pub const BODY_FRAME_SIZE: usize = 64 * 1024;

/// 发送进度回调，参数为本帧字节数
pub type SendProgress = Arc<dyn Fn(u64) + Send + Sync>;

/// API 调用错误
///
/// 用于区分「请求根本没有到达服务器」与「服务器返回了非成功状态码」，
/// 重试策略依赖这一分类
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    /// 网络错误（未收到任何响应）
    #[error("网络错误: {0}")]
    Network(String),
    /// 服务器返回非成功状态码
    #[error("服务器返回状态码 {status}: {body}")]
    Status { status: u16, body: String },
    /// 响应格式错误（无法解析或缺少必需字段）
    #[error("响应格式错误: {0}")]
    Malformed(String),
    /// 读取上传源失败
    #[error("读取上传源失败: {0}")]
    Io(String),
}

impl ApiError {
    /// 是否为网络层错误
    pub fn is_network(&self) -> bool {
        matches!(self, ApiError::Network(_))
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => ApiError::Status {
                status: status.as_u16(),
                body: e.to_string(),
            },
            None if e.is_decode() => ApiError::Malformed(e.to_string()),
            None => ApiError::Network(e.to_string()),
        }
    }
}

/// 存储目标选项
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreOptions {
    /// 存储位置（如 s3）
    #[serde(default = "default_store_location")]
    pub location: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub container: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    /// 访问权限（public / private）
    #[serde(default)]
    pub access: Option<String>,
}

fn default_store_location() -> String {
    "s3".to_string()
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            location: default_store_location(),
            region: None,
            container: None,
            path: None,
            access: None,
        }
    }
}

impl StoreOptions {
    /// 转换为表单字段
    pub fn form_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![("store_location", self.location.clone())];
        let optional = [
            ("store_region", &self.region),
            ("store_container", &self.container),
            ("store_path", &self.path),
            ("store_access", &self.access),
        ];
        for (key, value) in optional {
            if let Some(v) = value.as_ref().filter(|v| !v.is_empty()) {
                fields.push((key, v.clone()));
            }
        }
        fields
    }
}

/// 签名访问策略
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Security {
    pub policy: String,
    pub signature: String,
}

impl Security {
    pub fn form_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("policy", self.policy.clone()),
            ("signature", self.signature.clone()),
        ]
    }
}

/// start 请求
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
    pub store: StoreOptions,
    pub security: Option<Security>,
    /// 是否请求智能分片模式
    pub intelligent: bool,
}

/// start 响应（原始 JSON）
///
/// 所有字段都是可选的，由 [`StartResponse::into_session`] 校验
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartResponse {
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub upload_id: Option<String>,
    #[serde(default)]
    pub upload_type: Option<String>,
    #[serde(default)]
    pub location_url: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// start 响应校验结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// 会话已建立
    Session(UploadSession),
    /// 服务器显式拒绝
    Rejected(String),
    /// 缺少必需字段
    Incomplete(&'static str),
}

impl StartResponse {
    /// 校验并转换为上传会话
    pub fn into_session(self) -> StartOutcome {
        if let Some(error) = self.error {
            return StartOutcome::Rejected(error);
        }
        let uri = match self.uri.filter(|s| !s.is_empty()) {
            Some(v) => v,
            None => return StartOutcome::Incomplete("uri"),
        };
        let region = match self.region.filter(|s| !s.is_empty()) {
            Some(v) => v,
            None => return StartOutcome::Incomplete("region"),
        };
        let upload_id = match self.upload_id.filter(|s| !s.is_empty()) {
            Some(v) => v,
            None => return StartOutcome::Incomplete("upload_id"),
        };
        let intelligent = self.upload_type.as_deref() == Some(INTELLIGENT_INGESTION);

        StartOutcome::Session(UploadSession {
            uri,
            region,
            upload_id,
            location_url: self.location_url.filter(|s| !s.is_empty()),
            intelligent,
        })
    }
}

/// 上传会话（start 调用返回的服务器标识，建立后不可变）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSession {
    pub uri: String,
    pub region: String,
    pub upload_id: String,
    /// 区域路由地址，存在时后续请求发往该主机
    pub location_url: Option<String>,
    /// 服务器是否授予智能分片模式
    pub intelligent: bool,
}

impl UploadSession {
    pub fn form_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("uri", self.uri.clone()),
            ("region", self.region.clone()),
            ("upload_id", self.upload_id.clone()),
        ]
    }
}

/// 单次分片（或子分片）上传请求
#[derive(Clone)]
pub struct PartRequest {
    /// 分片序号（从 1 开始）
    pub part: usize,
    /// 子分片在分片内的偏移（仅智能分片模式）
    pub offset: Option<u64>,
    pub data: Bytes,
    pub store: StoreOptions,
    pub security: Option<Security>,
    /// 负载每发出一帧回调一次
    pub on_sent: Option<SendProgress>,
}

impl std::fmt::Debug for PartRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartRequest")
            .field("part", &self.part)
            .field("offset", &self.offset)
            .field("size", &self.data.len())
            .field("on_sent", &self.on_sent.is_some())
            .finish()
    }
}

impl PartRequest {
    /// 负载的 base64 MD5
    pub fn md5_base64(&self) -> String {
        use base64::Engine;
        let digest = md5::compute(&self.data);
        base64::engine::general_purpose::STANDARD.encode(digest.0)
    }

    /// 按 [`BODY_FRAME_SIZE`] 切帧的请求体
    ///
    /// 每一帧被取走发送时触发 `on_sent`
    pub fn body_stream(
        &self,
    ) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send + Sync + 'static {
        let data = self.data.clone();
        let frames: Vec<Bytes> = (0..data.len())
            .step_by(BODY_FRAME_SIZE)
            .map(|start| data.slice(start..(start + BODY_FRAME_SIZE).min(data.len())))
            .collect();
        let on_sent = self.on_sent.clone();

        stream::iter(frames).map(move |frame| {
            if let Some(on_sent) = &on_sent {
                on_sent(frame.len() as u64);
            }
            Ok::<_, std::io::Error>(frame)
        })
    }
}

/// commit 请求（智能分片模式下，一个分片的全部子分片上传完成后调用）
#[derive(Debug, Clone)]
pub struct CommitRequest {
    pub part: usize,
    /// 分片总大小
    pub size: u64,
    pub store: StoreOptions,
    pub security: Option<Security>,
}

/// upload 接口返回的预签名上传地址
#[derive(Debug, Clone, Deserialize)]
pub struct UploadUrlResponse {
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub location_url: Option<String>,
}

/// 分片上传确认
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartAck {
    /// 服务器返回的 ETag（标准模式必需）
    pub etag: Option<String>,
}

/// complete 请求
#[derive(Debug, Clone)]
pub struct CompleteRequest {
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
    pub store: StoreOptions,
    pub security: Option<Security>,
    /// 分片序号 -> ETag（仅标准模式，按序号升序）
    pub parts: Option<Vec<(usize, String)>>,
}

impl CompleteRequest {
    /// `parts` 字段格式：`1:etag1;2:etag2`
    pub fn parts_field(&self) -> Option<String> {
        self.parts.as_ref().map(|parts| {
            parts
                .iter()
                .map(|(index, etag)| format!("{}:{}", index, etag))
                .collect::<Vec<_>>()
                .join(";")
        })
    }
}

/// complete 响应
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompleteResponse {
    #[serde(default)]
    pub handle: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub mimetype: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    /// 原始响应体
    #[serde(skip)]
    pub raw: String,
}

impl CompleteResponse {
    /// 从响应体解析；非 JSON 响应体只保留原文
    pub fn from_body(body: String) -> Self {
        let mut response: CompleteResponse = serde_json::from_str(&body).unwrap_or_default();
        response.raw = body;
        response
    }
}
