// 上传分片规划
//
// 分片规则：
// - 文件按固定分片大小顺序切分为互不重叠的字节范围，最后一片截断到剩余大小
// - 分片序号从 1 开始，按提交顺序严格递增
// - 智能分片模式下，每个分片再切分为子分片，偏移量相对分片起点

use std::collections::BTreeMap;
use std::ops::Range;
use tracing::{debug, info};

/// 上传分片信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadChunk {
    /// 分片序号（从 1 开始）
    pub index: usize,
    /// 字节范围
    pub range: Range<u64>,
}

impl UploadChunk {
    pub fn new(index: usize, range: Range<u64>) -> Self {
        Self { index, range }
    }

    /// 分片大小
    pub fn size(&self) -> u64 {
        self.range.end - self.range.start
    }

    /// 切分子分片
    ///
    /// 返回的范围是相对分片起点的偏移
    pub fn sub_chunks(&self, sub_chunk_size: u64) -> Vec<Range<u64>> {
        split_range(0..self.size(), sub_chunk_size)
    }
}

/// 把 `range` 按 `piece_size` 切分为连续、不重叠的子范围
pub fn split_range(range: Range<u64>, piece_size: u64) -> Vec<Range<u64>> {
    let piece_size = piece_size.max(1);
    let mut pieces = Vec::new();
    let mut offset = range.start;

    while offset < range.end {
        let end = std::cmp::min(offset + piece_size, range.end);
        pieces.push(offset..end);
        offset = end;
    }

    pieces
}

/// 计算分片
///
/// # 参数
/// * `total_size` - 文件总大小
/// * `chunk_size` - 分片大小
pub fn plan_chunks(total_size: u64, chunk_size: u64) -> Vec<UploadChunk> {
    let chunks: Vec<UploadChunk> = split_range(0..total_size, chunk_size)
        .into_iter()
        .enumerate()
        .map(|(i, range)| UploadChunk::new(i + 1, range))
        .collect();

    info!(
        "分片规划: 文件大小={} bytes, 分片大小={} bytes, 分片数量={}",
        total_size,
        chunk_size,
        chunks.len()
    );

    chunks
}

/// 分片确认记录（分片序号 -> ETag）
///
/// 只在标准模式下使用。complete 前必须每个已提交的分片都有记录
#[derive(Debug, Default)]
pub struct PartLedger {
    /// 已提交的分片序号
    submitted: Vec<usize>,
    /// 已确认的分片
    etags: BTreeMap<usize, String>,
}

impl PartLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记已提交的分片
    pub fn submit(&mut self, index: usize) {
        self.submitted.push(index);
    }

    /// 记录分片 ETag
    ///
    /// 同一序号重复记录返回 false，不覆盖已有记录
    pub fn record(&mut self, index: usize, etag: String) -> bool {
        if self.etags.contains_key(&index) {
            return false;
        }
        debug!("记录分片确认: part={}, etag={}", index, etag);
        self.etags.insert(index, etag);
        true
    }

    /// 按序号升序返回完整的分片列表
    ///
    /// 任何已提交的分片缺少 ETag 时返回 None，绝不返回不完整的列表
    pub fn complete_list(&self) -> Option<Vec<(usize, String)>> {
        if self.submitted.is_empty() || self.etags.len() != self.submitted.len() {
            return None;
        }
        self.submitted
            .iter()
            .all(|index| self.etags.contains_key(index))
            .then(|| {
                self.etags
                    .iter()
                    .map(|(index, etag)| (*index, etag.clone()))
                    .collect()
            })
    }
}
