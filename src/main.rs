use anyhow::Context;
use clap::Parser;
use cloud_upload_rust::{
    config::DEFAULT_CONFIG_PATH, logging, AppConfig, FileSource, UploadClient, UploadCoordinator,
    UploadStatus,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// 分片上传文件到云存储
#[derive(Parser, Debug)]
#[command(name = "cloud-upload")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 要上传的文件
    file: PathBuf,

    /// 配置文件路径
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// 上传时使用的文件名（默认取本地文件名）
    #[arg(short, long)]
    name: Option<String>,

    /// MIME 类型
    #[arg(short, long)]
    mime_type: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = AppConfig::load_or_default(&args.config).await;

    // 必须保持 _log_guard 存活
    let _log_guard = logging::init_logging(&config.log);

    info!("Cloud Upload v{} 启动", env!("CARGO_PKG_VERSION"));

    let options = config.upload_options().context("上传参数无效")?;
    let client = UploadClient::new(&config.api)?;

    let mut source = FileSource::open(&args.file)
        .await
        .with_context(|| format!("无法打开文件: {:?}", args.file))?;
    if let Some(name) = args.name {
        source = source.with_name(name);
    }
    if let Some(mime_type) = args.mime_type {
        source = source.with_mime_type(mime_type);
    }

    let coordinator = UploadCoordinator::new(Arc::new(client), Arc::new(source), options)?
        .on_progress(|progress| {
            info!(
                "上传进度: {:.1}% ({}/{} bytes)",
                progress.percent(),
                progress.uploaded_bytes,
                progress.total_bytes
            );
        })
        .on_complete(|result| match result {
            Ok(response) => info!(
                "✓ 上传完成: handle={:?}, url={:?}",
                response.handle, response.url
            ),
            Err(e) => error!("上传失败: {}", e),
        });

    if !coordinator.start() {
        anyhow::bail!("上传启动失败");
    }

    let status = tokio::select! {
        status = coordinator.wait() => status,
        _ = tokio::signal::ctrl_c() => {
            warn!("收到中断信号，取消上传");
            coordinator.cancel();
            coordinator.wait().await
        }
    };

    match status {
        UploadStatus::Completed => Ok(()),
        other => anyhow::bail!("上传未完成: {:?}", other),
    }
}
