// 上传错误定义

use thiserror::Error;

/// 上传操作对调用方可见的错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UploadError {
    /// 上传源无效（大小未知、为空或缺少文件名），不重试
    #[error("上传源无效: {0}")]
    InvalidSource(String),
    /// 上传选项无效（并发数或分片大小为 0）
    #[error("上传选项无效: {0}")]
    InvalidOptions(String),
    /// 已中止（用户取消、分片失败或 complete 重试耗尽）
    #[error("上传已中止")]
    Aborted,
    /// 服务器在 start 阶段显式拒绝
    #[error("服务器拒绝上传: {0}")]
    ServerRejected(String),
}
