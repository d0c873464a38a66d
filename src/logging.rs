//! 日志系统
//!
//! 控制台输出 + 文件持久化。日志文件按启动时间命名、按大小滚动，
//! 启动时清理超过保留天数的旧文件

use crate::config::LogConfig;
use chrono::Local;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    Layer,
    EnvFilter,
};

/// 日志文件名前缀
pub const LOG_FILE_PREFIX: &str = "cloud-upload.";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// 日志文件名
///
/// - index = 0: `cloud-upload.<启动时间>.log`
/// - index > 0: `cloud-upload.<启动时间>_<index>.log`
fn log_file_name(start_timestamp: &str, index: u32) -> String {
    if index == 0 {
        format!("{}{}.log", LOG_FILE_PREFIX, start_timestamp)
    } else {
        format!("{}{}_{}.log", LOG_FILE_PREFIX, start_timestamp, index)
    }
}

struct RotatingFile {
    log_dir: PathBuf,
    start_timestamp: String,
    index: u32,
    max_file_size: u64,
    written: u64,
    file: File,
}

impl RotatingFile {
    fn open(log_dir: PathBuf, start_timestamp: String, max_file_size: u64) -> io::Result<Self> {
        let file = Self::open_index(&log_dir, &start_timestamp, 0)?;
        Ok(Self {
            log_dir,
            start_timestamp,
            index: 0,
            max_file_size,
            written: 0,
            file,
        })
    }

    fn open_index(log_dir: &Path, start_timestamp: &str, index: u32) -> io::Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_dir.join(log_file_name(start_timestamp, index)))
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // 当前文件非空且写入后超过上限时滚动
        if self.written > 0 && self.written + buf.len() as u64 > self.max_file_size {
            self.file.flush()?;
            self.index += 1;
            self.file = Self::open_index(&self.log_dir, &self.start_timestamp, self.index)?;
            self.written = 0;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }
}

/// 按大小滚动的日志文件写入器
#[derive(Clone)]
pub struct RollingLogWriter {
    inner: Arc<Mutex<RotatingFile>>,
}

impl RollingLogWriter {
    pub fn new(log_dir: PathBuf, max_file_size: u64) -> io::Result<Self> {
        let start_timestamp = Local::now().format("%Y-%m-%d-%H%M%S").to_string();
        Self::with_timestamp(log_dir, start_timestamp, max_file_size)
    }

    fn with_timestamp(
        log_dir: PathBuf,
        start_timestamp: String,
        max_file_size: u64,
    ) -> io::Result<Self> {
        let file = RotatingFile::open(log_dir, start_timestamp, max_file_size.max(1))?;
        Ok(Self {
            inner: Arc::new(Mutex::new(file)),
        })
    }
}

impl Write for RollingLogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.lock().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.lock().file.flush()
    }
}

/// 日志守卫，需保持存活直到程序结束，否则文件写入线程会退出
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

fn console_layer<S>() -> impl Layer<S> + Send + Sync
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_timer(ChronoLocal::new(TIMESTAMP_FORMAT.to_string()))
        .with_ansi(true)
}

fn init_console_only(env_filter: EnvFilter) -> LogGuard {
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer())
        .try_init();
    LogGuard { _file_guard: None }
}

/// 初始化日志系统
///
/// RUST_LOG 环境变量优先于配置中的日志级别
pub fn init_logging(config: &LogConfig) -> LogGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    if !config.enabled {
        let guard = init_console_only(env_filter);
        info!("日志系统初始化完成（仅控制台输出）");
        return guard;
    }

    if let Err(e) = fs::create_dir_all(&config.log_dir) {
        eprintln!("创建日志目录失败: {:?}, 错误: {}，仅输出到控制台", config.log_dir, e);
        return init_console_only(env_filter);
    }

    let writer = match RollingLogWriter::new(config.log_dir.clone(), config.max_file_size) {
        Ok(writer) => writer,
        Err(e) => {
            eprintln!("创建日志文件失败: {}，仅输出到控制台", e);
            return init_console_only(env_filter);
        }
    };

    let (non_blocking, file_guard) = tracing_appender::non_blocking(writer);
    let file_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_timer(ChronoLocal::new(TIMESTAMP_FORMAT.to_string()))
        .with_ansi(false)
        .with_writer(non_blocking);

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer())
        .with(file_layer)
        .try_init();

    info!(
        "日志系统初始化完成: 目录={:?}, 保留天数={}, 级别={}, 单文件最大={:.1}MB",
        config.log_dir,
        config.retention_days,
        config.level,
        config.max_file_size as f64 / 1024.0 / 1024.0
    );

    let removed = cleanup_old_logs(&config.log_dir, config.retention_days);
    if removed > 0 {
        info!("已清理 {} 个过期日志文件", removed);
    }

    LogGuard {
        _file_guard: Some(file_guard),
    }
}

/// 从日志文件名中取出日期（YYYY-MM-DD）
fn log_file_date(filename: &str) -> Option<chrono::NaiveDate> {
    let stamp = filename.strip_prefix(LOG_FILE_PREFIX)?.strip_suffix(".log")?;
    let date = stamp.get(..10)?;
    chrono::NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

/// 文件修改时间是否超过保留天数
fn expired_by_mtime(path: &Path, retention: chrono::Duration) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .map(|modified| {
            let modified: chrono::DateTime<chrono::Utc> = modified.into();
            chrono::Utc::now().signed_duration_since(modified) > retention
        })
        .unwrap_or(false)
}

/// 清理过期日志文件，返回删除的文件数
///
/// 优先按文件名里的日期判断，解析失败时按修改时间判断
pub fn cleanup_old_logs(log_dir: &Path, retention_days: u32) -> usize {
    let today = Local::now().date_naive();
    let retention = chrono::Duration::days(retention_days as i64);

    let entries = match fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("读取日志目录失败: {:?}, 错误: {}", log_dir, e);
            return 0;
        }
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(filename) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        if !path.is_file() || !filename.starts_with(LOG_FILE_PREFIX) || !filename.ends_with(".log")
        {
            continue;
        }

        let expired = match log_file_date(filename) {
            Some(date) => today.signed_duration_since(date) > retention,
            None => expired_by_mtime(&path, retention),
        };
        if !expired {
            continue;
        }

        match fs::remove_file(&path) {
            Ok(()) => {
                removed += 1;
                debug!("已删除过期日志文件: {:?}", path);
            }
            Err(e) => warn!("删除过期日志文件失败: {:?}, 错误: {}", path, e),
        }
    }
    removed
}
