// 配置管理模块

use crate::api::{Security, StoreOptions};
use crate::uploader::{UploadError, UploadOptions};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

/// 默认配置文件路径
pub const DEFAULT_CONFIG_PATH: &str = "config/app.toml";

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 服务接口配置
    #[serde(default)]
    pub api: ApiConfig,
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 服务接口配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// 服务根地址
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// API Key
    #[serde(default)]
    pub api_key: String,
    /// 请求超时（秒）
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// 签名访问策略（可选，需与 signature 同时配置）
    #[serde(default)]
    pub policy: Option<String>,
    #[serde(default)]
    pub signature: Option<String>,
}

fn default_base_url() -> String {
    "https://upload.example.com".to_string()
}

fn default_timeout_secs() -> u64 {
    120
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: String::new(),
            timeout_secs: default_timeout_secs(),
            policy: None,
            signature: None,
        }
    }
}

impl ApiConfig {
    /// policy 和 signature 都配置时才生效
    pub fn security(&self) -> Option<Security> {
        match (&self.policy, &self.signature) {
            (Some(policy), Some(signature)) if !policy.is_empty() && !signature.is_empty() => {
                Some(Security {
                    policy: policy.clone(),
                    signature: signature.clone(),
                })
            }
            _ => None,
        }
    }
}

/// 上传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 分片大小 (MB)
    #[serde(default = "default_chunk_size_mb")]
    pub chunk_size_mb: u64,
    /// 智能分片模式下的子分片大小 (KB)
    #[serde(default = "default_sub_chunk_size_kb")]
    pub sub_chunk_size_kb: u64,
    /// 最大并发分片数
    #[serde(default = "default_part_concurrency")]
    pub part_concurrency: usize,
    /// 单个分片内的最大并发子分片数
    #[serde(default = "default_sub_chunk_concurrency")]
    pub sub_chunk_concurrency: usize,
    /// 服务器支持时是否使用智能分片模式
    #[serde(default = "default_intelligent")]
    pub intelligent: bool,
    /// complete 最大尝试次数
    #[serde(default = "default_max_finalize_retries")]
    pub max_finalize_retries: u32,
    /// 退避时间单位（毫秒）
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// 子分片最大重试次数
    #[serde(default = "default_max_sub_chunk_retries")]
    pub max_sub_chunk_retries: u32,
    /// 存储目标
    #[serde(default)]
    pub store: StoreOptions,
}

fn default_chunk_size_mb() -> u64 {
    8
}
fn default_sub_chunk_size_kb() -> u64 {
    1024
}
fn default_part_concurrency() -> usize {
    5
}
fn default_sub_chunk_concurrency() -> usize {
    8
}
fn default_intelligent() -> bool {
    true
}
fn default_max_finalize_retries() -> u32 {
    5
}
fn default_retry_base_delay_ms() -> u64 {
    1000
}
fn default_max_sub_chunk_retries() -> u32 {
    5
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size_mb: default_chunk_size_mb(),
            sub_chunk_size_kb: default_sub_chunk_size_kb(),
            part_concurrency: default_part_concurrency(),
            sub_chunk_concurrency: default_sub_chunk_concurrency(),
            intelligent: default_intelligent(),
            max_finalize_retries: default_max_finalize_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            max_sub_chunk_retries: default_max_sub_chunk_retries(),
            store: StoreOptions::default(),
        }
    }
}

impl UploadConfig {
    /// 转换为上传选项（带校验）
    pub fn to_options(&self, security: Option<Security>) -> Result<UploadOptions, UploadError> {
        let chunk_size = self.chunk_size_mb.checked_mul(1024 * 1024).ok_or_else(|| {
            UploadError::InvalidOptions(format!("分片大小过大: {} MB", self.chunk_size_mb))
        })?;
        let sub_chunk_size = self.sub_chunk_size_kb.checked_mul(1024).ok_or_else(|| {
            UploadError::InvalidOptions(format!("子分片大小过大: {} KB", self.sub_chunk_size_kb))
        })?;

        let options = UploadOptions {
            chunk_size,
            sub_chunk_size,
            part_concurrency: self.part_concurrency,
            sub_chunk_concurrency: self.sub_chunk_concurrency,
            intelligent: self.intelligent,
            max_finalize_retries: self.max_finalize_retries,
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_sub_chunk_retries: self.max_sub_chunk_retries,
            store: self.store.clone(),
            security,
        };
        options.validate()?;
        Ok(options)
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        config
            .upload
            .to_options(config.api.security())
            .context("配置文件中的上传参数无效")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        Ok(())
    }

    /// 加载配置，失败时使用默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                Self::default()
            }
        }
    }

    /// 构建上传选项
    pub fn upload_options(&self) -> Result<UploadOptions, UploadError> {
        self.upload.to_options(self.api.security())
    }
}
