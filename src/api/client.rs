// 上传服务 HTTP 客户端实现

use crate::api::{
    ApiError, CommitRequest, CompleteRequest, CompleteResponse, PartAck, PartRequest,
    StartRequest, StartResponse, UploadApi, UploadSession, UploadUrlResponse,
};
use crate::config::ApiConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, ETAG};
use reqwest::{Body, Client, StatusCode};
use std::time::Duration;
use tracing::{debug, info, warn};

/// 上传服务客户端
#[derive(Debug, Clone)]
pub struct UploadClient {
    /// HTTP客户端
    client: Client,
    /// 服务根地址（不带结尾斜杠）
    base_url: String,
    /// API Key
    api_key: String,
}

impl UploadClient {
    /// 创建新的上传客户端
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        info!("初始化上传客户端: base_url={}", config.base_url);

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    /// 会话内请求使用的根地址
    ///
    /// start 响应携带 `location_url` 时，后续请求都发往该区域主机
    fn session_base(&self, session: &UploadSession) -> String {
        match session.location_url.as_deref() {
            Some(location) if location.contains("://") => location.trim_end_matches('/').to_string(),
            Some(location) => format!("https://{}", location.trim_end_matches('/')),
            None => self.base_url.clone(),
        }
    }

    fn endpoint(base: &str, name: &str) -> String {
        format!("{}/multipart/{}", base, name)
    }

    /// 发送表单请求，返回状态码和响应体
    async fn post_form(
        &self,
        url: &str,
        fields: &[(&'static str, String)],
    ) -> Result<(StatusCode, String), ApiError> {
        let response = self.client.post(url).form(fields).send().await?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ApiError::Network(format!("读取响应失败: {}", e)))?;
        Ok((status, body))
    }

    /// 把预签名地址返回的头部转换为 HeaderMap
    fn signed_headers(headers: &std::collections::HashMap<String, String>) -> Result<HeaderMap, ApiError> {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ApiError::Malformed(format!("非法头部名 {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| ApiError::Malformed(format!("非法头部值: {}", e)))?;
            map.insert(name, value);
        }
        Ok(map)
    }
}

#[async_trait]
impl UploadApi for UploadClient {
    async fn start(&self, request: &StartRequest) -> Result<StartResponse, ApiError> {
        info!(
            "开始上传: filename={}, size={}, intelligent={}",
            request.filename, request.size, request.intelligent
        );

        let mut fields = vec![
            ("apikey", self.api_key.clone()),
            ("filename", request.filename.clone()),
            ("mimetype", request.mime_type.clone()),
            ("size", request.size.to_string()),
        ];
        fields.extend(request.store.form_fields());
        if let Some(security) = &request.security {
            fields.extend(security.form_fields());
        }
        if request.intelligent {
            fields.push(("multipart", "true".to_string()));
        }

        let url = Self::endpoint(&self.base_url, "start");
        let (status, body) = self.post_form(&url, &fields).await?;

        debug!("start 响应: status={}, body={}", status, body);

        // 拒绝类错误（4xx + error 字段）也交给调用方校验
        let parsed = serde_json::from_str::<StartResponse>(&body);
        match parsed {
            Ok(parsed) if status.is_success() || parsed.error.is_some() => Ok(parsed),
            Err(e) if status.is_success() => {
                Err(ApiError::Malformed(format!("解析 start 响应失败: {}", e)))
            }
            _ => Err(ApiError::Status {
                status: status.as_u16(),
                body,
            }),
        }
    }

    async fn upload_part(
        &self,
        session: &UploadSession,
        request: PartRequest,
    ) -> Result<PartAck, ApiError> {
        let size = request.data.len();

        let mut fields = vec![("apikey", self.api_key.clone())];
        fields.extend(session.form_fields());
        fields.push(("part", request.part.to_string()));
        fields.push(("size", size.to_string()));
        fields.push(("md5", request.md5_base64()));
        fields.extend(request.store.form_fields());
        if let Some(security) = &request.security {
            fields.extend(security.form_fields());
        }
        if let Some(offset) = request.offset {
            fields.push(("offset", offset.to_string()));
            fields.push(("multipart", "true".to_string()));
        }

        // 1. 获取预签名上传地址
        let url = Self::endpoint(&self.session_base(session), "upload");
        let (status, body) = self.post_form(&url, &fields).await?;
        if !status.is_success() {
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let signed: UploadUrlResponse = serde_json::from_str(&body)
            .map_err(|e| ApiError::Malformed(format!("解析 upload 响应失败: {}", e)))?;

        // 2. 上传数据到预签名地址（分帧发送，逐帧上报进度）
        let headers = Self::signed_headers(&signed.headers)?;
        let response = self
            .client
            .put(&signed.url)
            .headers(headers)
            .header(CONTENT_LENGTH, size)
            .body(Body::wrap_stream(request.body_stream()))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(
                "分片数据上传失败: part={}, offset={:?}, status={}",
                request.part, request.offset, status
            );
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());

        debug!(
            "分片数据上传成功: part={}, offset={:?}, size={}, etag={:?}",
            request.part, request.offset, size, etag
        );

        Ok(PartAck { etag })
    }

    async fn commit_part(
        &self,
        session: &UploadSession,
        request: &CommitRequest,
    ) -> Result<(), ApiError> {
        let mut fields = vec![("apikey", self.api_key.clone())];
        fields.extend(session.form_fields());
        fields.push(("part", request.part.to_string()));
        fields.push(("size", request.size.to_string()));
        fields.extend(request.store.form_fields());
        if let Some(security) = &request.security {
            fields.extend(security.form_fields());
        }

        let url = Self::endpoint(&self.session_base(session), "commit");
        let (status, body) = self.post_form(&url, &fields).await?;
        if !status.is_success() {
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }

        debug!("提交分片成功: part={}, size={}", request.part, request.size);
        Ok(())
    }

    async fn complete(
        &self,
        session: &UploadSession,
        request: &CompleteRequest,
    ) -> Result<CompleteResponse, ApiError> {
        let mut fields = vec![("apikey", self.api_key.clone())];
        fields.extend(session.form_fields());
        fields.push(("filename", request.filename.clone()));
        fields.push(("mimetype", request.mime_type.clone()));
        fields.push(("size", request.size.to_string()));
        fields.extend(request.store.form_fields());
        if let Some(security) = &request.security {
            fields.extend(security.form_fields());
        }
        match request.parts_field() {
            Some(parts) => fields.push(("parts", parts)),
            None => fields.push(("multipart", "true".to_string())),
        }

        let url = Self::endpoint(&self.session_base(session), "complete");
        let (status, body) = self.post_form(&url, &fields).await?;

        info!("complete 响应: status={}, body={}", status, body);

        if status != StatusCode::OK {
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(CompleteResponse::from_body(body))
    }
}
