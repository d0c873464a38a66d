// 上传选项

use crate::api::{Security, StoreOptions};
use crate::uploader::UploadError;
use std::time::Duration;

/// 默认分片大小: 8MB
pub const DEFAULT_CHUNK_SIZE: u64 = 8 * 1024 * 1024;

/// 默认子分片大小: 1MB
pub const DEFAULT_SUB_CHUNK_SIZE: u64 = 1024 * 1024;

/// 子分片最小大小: 32KB（网络错误时对半拆分的下限）
pub const MIN_SUB_CHUNK_SIZE: u64 = 32 * 1024;

/// 上传选项
///
/// 上传期间只读，由调用方提供
#[derive(Debug, Clone)]
pub struct UploadOptions {
    /// 分片大小（字节）
    pub chunk_size: u64,
    /// 子分片大小（字节，仅智能分片模式）
    pub sub_chunk_size: u64,
    /// 最大并发分片数
    pub part_concurrency: usize,
    /// 单个分片内最大并发子分片数
    pub sub_chunk_concurrency: usize,
    /// 服务器支持时是否使用智能分片模式
    pub intelligent: bool,
    /// complete 最大尝试次数
    pub max_finalize_retries: u32,
    /// 退避时间单位
    pub retry_base_delay: Duration,
    /// 子分片最大重试次数
    pub max_sub_chunk_retries: u32,
    /// 存储目标
    pub store: StoreOptions,
    /// 签名访问策略
    pub security: Option<Security>,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            sub_chunk_size: DEFAULT_SUB_CHUNK_SIZE,
            part_concurrency: 5,
            sub_chunk_concurrency: 8,
            intelligent: true,
            max_finalize_retries: 5,
            retry_base_delay: Duration::from_secs(1),
            max_sub_chunk_retries: 5,
            store: StoreOptions::default(),
            security: None,
        }
    }
}

impl UploadOptions {
    /// 校验选项
    pub fn validate(&self) -> Result<(), UploadError> {
        if self.chunk_size == 0 {
            return Err(UploadError::InvalidOptions("分片大小必须大于 0".to_string()));
        }
        if self.sub_chunk_size == 0 {
            return Err(UploadError::InvalidOptions(
                "子分片大小必须大于 0".to_string(),
            ));
        }
        if self.part_concurrency == 0 || self.sub_chunk_concurrency == 0 {
            return Err(UploadError::InvalidOptions("并发数必须至少为 1".to_string()));
        }
        if self.max_finalize_retries == 0 {
            return Err(UploadError::InvalidOptions(
                "complete 尝试次数必须至少为 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options_valid() {
        assert!(UploadOptions::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_options() {
        let cases = [
            UploadOptions {
                chunk_size: 0,
                ..Default::default()
            },
            UploadOptions {
                sub_chunk_concurrency: 0,
                ..Default::default()
            },
            UploadOptions {
                max_finalize_retries: 0,
                ..Default::default()
            },
        ];
        for options in cases {
            assert!(matches!(
                options.validate(),
                Err(UploadError::InvalidOptions(_))
            ));
        }
    }
}
