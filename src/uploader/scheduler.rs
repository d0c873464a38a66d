// 并发调度器
//
// 功能：
// - 有界并发：Worker 任务需要先获取槽位（Semaphore）才能执行
// - 任务依赖：任务在声明的全部依赖结束（完成或取消）之后才有资格执行
// - 取消：cancel_all 之后，尚未开始执行的任务直接标记为取消，
//   已经在执行的任务运行到结束（不中途丢弃）
// - 屏障：Barrier 任务不占用槽位、不受取消影响，依赖结束后一定执行
// - 排空：drain 等待所有已派发的任务结束，不遗留后台任务

use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// 任务结束方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// 执行完成
    Finished,
    /// 未执行即被取消（或任务异常退出）
    Cancelled,
}

/// 任务类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// 占用并发槽位，可被取消
    Worker,
    /// 不占用槽位，可被取消
    Checkpoint,
    /// 不占用槽位，不可取消
    Barrier,
}

/// 正在执行的任务计数，任务异常退出时同样会归还
struct ActiveGuard<'a>(&'a AtomicUsize);

impl<'a> ActiveGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// 任务句柄，用于声明依赖或等待任务结束
#[derive(Debug, Clone)]
pub struct TaskHandle {
    done: watch::Receiver<Option<TaskOutcome>>,
}

impl TaskHandle {
    /// 等待任务结束
    pub async fn wait(&self) -> TaskOutcome {
        let mut done = self.done.clone();
        loop {
            if let Some(outcome) = *done.borrow_and_update() {
                return outcome;
            }
            // 发送端被丢弃却没有写入结果：任务异常退出
            if done.changed().await.is_err() {
                return (*done.borrow()).unwrap_or(TaskOutcome::Cancelled);
            }
        }
    }

    /// 是否已结束（不等待）
    pub fn is_done(&self) -> bool {
        self.done.borrow().is_some()
    }
}

/// 并发调度器
#[derive(Debug)]
pub struct ConcurrencyScheduler {
    /// 执行任务的运行时
    runtime: Handle,
    /// 槽位
    semaphore: Arc<Semaphore>,
    /// 取消令牌
    cancel_token: CancellationToken,
    /// 已派发的任务
    tasks: Mutex<JoinSet<()>>,
    /// 同一时刻只允许一个 drain 取走任务集合
    drain_lock: tokio::sync::Mutex<()>,
    /// 任务 ID 生成
    next_id: AtomicU64,
    /// 当前正在执行的 Worker 任务数
    active: Arc<AtomicUsize>,
}

impl ConcurrencyScheduler {
    /// 创建调度器
    ///
    /// # 参数
    /// * `max_concurrency` - 最大并发 Worker 任务数（至少为 1）
    /// * `runtime` - 执行任务的运行时
    pub fn new(max_concurrency: usize, runtime: Handle) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self {
            runtime,
            semaphore: Arc::new(Semaphore::new(max_concurrency)),
            cancel_token: CancellationToken::new(),
            tasks: Mutex::new(JoinSet::new()),
            drain_lock: tokio::sync::Mutex::new(()),
            next_id: AtomicU64::new(1),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// 当前正在执行的 Worker 任务数
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// 取消令牌（供任务内部协作检查）
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// 取消所有尚未开始执行的任务
    pub fn cancel_all(&self) {
        if !self.cancel_token.is_cancelled() {
            debug!("调度器取消所有待执行任务");
            self.cancel_token.cancel();
        }
    }

    /// 提交任务
    ///
    /// # 参数
    /// * `kind` - 任务类型
    /// * `dependencies` - 依赖的任务，全部结束后才会执行
    /// * `task` - 任务内容
    pub fn submit<F>(&self, kind: TaskKind, dependencies: &[TaskHandle], task: F) -> TaskHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (done_tx, done_rx) = watch::channel(None);

        let dependencies = dependencies.to_vec();
        let semaphore = self.semaphore.clone();
        let cancel_token = self.cancel_token.clone();
        let active = self.active.clone();

        let wrapped = async move {
            for dependency in &dependencies {
                dependency.wait().await;
            }

            let outcome = match kind {
                TaskKind::Barrier => {
                    task.await;
                    TaskOutcome::Finished
                }
                TaskKind::Checkpoint => {
                    if cancel_token.is_cancelled() {
                        TaskOutcome::Cancelled
                    } else {
                        task.await;
                        TaskOutcome::Finished
                    }
                }
                TaskKind::Worker => {
                    let permit = tokio::select! {
                        biased;
                        _ = cancel_token.cancelled() => None,
                        permit = semaphore.acquire_owned() => permit.ok(),
                    };

                    match permit {
                        Some(permit) if !cancel_token.is_cancelled() => {
                            let _active = ActiveGuard::enter(&active);
                            task.await;
                            drop(permit);
                            TaskOutcome::Finished
                        }
                        _ => TaskOutcome::Cancelled,
                    }
                }
            };

            debug!("任务 #{} 结束: {:?} ({:?})", id, outcome, kind);
            let _ = done_tx.send(Some(outcome));
        };

        self.tasks.lock().spawn_on(wrapped, &self.runtime);

        TaskHandle { done: done_rx }
    }

    /// 等待所有已派发的任务结束
    ///
    /// 排空期间新派发的任务同样会被等待。多个调用方同时排空时依次进行，
    /// 每个调用方返回时所有任务都已结束
    pub async fn drain(&self) {
        let _drain = self.drain_lock.lock().await;
        loop {
            let mut tasks = std::mem::take(&mut *self.tasks.lock());
            if tasks.is_empty() {
                break;
            }
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    if e.is_panic() {
                        error!("调度任务异常退出: {}", e);
                    }
                }
            }
        }
    }
}
