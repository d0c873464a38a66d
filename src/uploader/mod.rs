// 分片上传模块
//
// 上传流程：start → 分片并发上传 → complete
// - 有界并发调度，分片之后是检查点，全部结束后由屏障任务触发 complete
// - 协作式中止：任何分片失败都会中止整个上传
// - 智能分片模式下分片内再切分子分片，子分片失败单独重试

pub mod callback;
pub mod chunk;
pub mod coordinator;
pub mod error;
pub mod options;
pub mod retry;
pub mod scheduler;
pub mod source;
pub mod task;
pub mod worker;

#[cfg(test)]
pub(crate) mod mock;

pub use callback::{Callbacks, CompletionCallback, ProgressCallback, UploadResult};
pub use chunk::{plan_chunks, split_range, PartLedger, UploadChunk};
pub use coordinator::UploadCoordinator;
pub use error::UploadError;
pub use options::{UploadOptions, DEFAULT_CHUNK_SIZE, DEFAULT_SUB_CHUNK_SIZE, MIN_SUB_CHUNK_SIZE};
pub use retry::{RetryDecision, RetryPolicy, DEFAULT_MAX_ATTEMPTS};
pub use scheduler::{ConcurrencyScheduler, TaskHandle, TaskKind, TaskOutcome};
pub use source::{BytesSource, FileSource, Uploadable, DEFAULT_MIME_TYPE};
pub use task::{Progress, ProgressTracker, UploadStatus};
pub use worker::{PartContext, PartError, PartWorker};
