// 上传源
//
// 上传源需要在开始前知道总大小，并且支持按字节范围读取，
// 以便多个分片并发读取互不干扰

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::ops::Range;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

/// 默认 MIME 类型
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// 可上传的数据源
#[async_trait]
pub trait Uploadable: Send + Sync + std::fmt::Debug {
    /// 文件名（上传到服务器时使用）
    fn name(&self) -> Option<&str>;

    /// 总大小，未知时返回 None
    fn size(&self) -> Option<u64>;

    /// MIME 类型
    fn mime_type(&self) -> &str {
        DEFAULT_MIME_TYPE
    }

    /// 读取指定字节范围
    async fn read_range(&self, range: Range<u64>) -> io::Result<Bytes>;
}

/// 本地文件上传源
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    name: Option<String>,
    size: u64,
    mime_type: String,
}

impl FileSource {
    /// 打开本地文件，读取文件大小
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let metadata = tokio::fs::metadata(&path)
            .await
            .with_context(|| format!("无法读取文件信息: {:?}", path))?;
        if !metadata.is_file() {
            anyhow::bail!("不是普通文件: {:?}", path);
        }

        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.to_string());

        Ok(Self {
            path,
            name,
            size: metadata.len(),
            mime_type: DEFAULT_MIME_TYPE.to_string(),
        })
    }

    /// 指定 MIME 类型
    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = mime_type.into();
        self
    }

    /// 指定上传文件名（默认使用本地文件名）
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Uploadable for FileSource {
    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn size(&self) -> Option<u64> {
        Some(self.size)
    }

    fn mime_type(&self) -> &str {
        &self.mime_type
    }

    async fn read_range(&self, range: Range<u64>) -> io::Result<Bytes> {
        let mut file = File::open(&self.path).await?;

        // 定位到分片起始位置
        file.seek(io::SeekFrom::Start(range.start)).await?;

        let mut buffer = vec![0u8; (range.end - range.start) as usize];
        file.read_exact(&mut buffer).await?;

        debug!(
            "读取数据: bytes={}-{}, 大小={} bytes",
            range.start,
            range.end.saturating_sub(1),
            buffer.len()
        );

        Ok(Bytes::from(buffer))
    }
}

/// 内存数据上传源
#[derive(Debug, Clone)]
pub struct BytesSource {
    name: Option<String>,
    data: Bytes,
    mime_type: String,
}

impl BytesSource {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: Some(name.into()),
            data: data.into(),
            mime_type: DEFAULT_MIME_TYPE.to_string(),
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = mime_type.into();
        self
    }
}

#[async_trait]
impl Uploadable for BytesSource {
    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn size(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }

    fn mime_type(&self) -> &str {
        &self.mime_type
    }

    async fn read_range(&self, range: Range<u64>) -> io::Result<Bytes> {
        let len = self.data.len() as u64;
        if range.start > range.end || range.end > len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("范围越界: {:?}, 数据大小 {}", range, len),
            ));
        }
        Ok(self.data.slice(range.start as usize..range.end as usize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_file_source_reads_ranges() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"0123456789abcdef").unwrap();

        let source = FileSource::open(temp_file.path()).await.unwrap();
        assert_eq!(source.size(), Some(16));
        assert!(source.name().is_some());
        assert_eq!(source.mime_type(), DEFAULT_MIME_TYPE);

        let data = source.read_range(4..10).await.unwrap();
        assert_eq!(&data[..], b"456789");

        let tail = source.read_range(12..16).await.unwrap();
        assert_eq!(&tail[..], b"cdef");
    }

    #[tokio::test]
    async fn test_file_source_read_past_end_fails() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"short").unwrap();

        let source = FileSource::open(temp_file.path()).await.unwrap();
        assert!(source.read_range(2..10).await.is_err());
    }

    #[tokio::test]
    async fn test_file_source_missing_file() {
        assert!(FileSource::open("/nonexistent/definitely/missing.bin")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_bytes_source() {
        let source = BytesSource::new("a.txt", b"hello world".to_vec()).with_mime_type("text/plain");
        assert_eq!(source.name(), Some("a.txt"));
        assert_eq!(source.size(), Some(11));
        assert_eq!(source.mime_type(), "text/plain");
        assert_eq!(&source.read_range(6..11).await.unwrap()[..], b"world");
        assert!(source.read_range(6..12).await.is_err());
    }
}
