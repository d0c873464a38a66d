// Cloud Upload Rust Library
// 云存储分片上传客户端核心库

// 配置管理模块
pub mod config;

// 日志模块
pub mod logging;

// 上传服务 API 模块
pub mod api;

// 分片上传模块
pub mod uploader;

// 导出常用类型
pub use api::{ApiError, CompleteResponse, UploadApi, UploadClient};
pub use config::AppConfig;
pub use uploader::{
    BytesSource, FileSource, Progress, UploadCoordinator, UploadError, UploadOptions,
    UploadStatus, Uploadable,
};
