//! 任务调度：全局并发上限 + 按目标（标签页）并发上限
//!
//! 等待队列按 priority 降序、同优先级按提交顺序排列。每次有任务提交或结算都会重新评估准入：
//! 全局运行数低于 `max_global`，且任务的 target_key 下运行数低于 `max_per_target` 才能启动。
//!
//! 默认采用队头阻塞（HeadOfLine）：队头不满足条件时本轮停止评估；`AdmissionPolicy::Scan` 会跳过
//! 不满足条件的任务继续向后找。调度器从不重试 operation，也不给 operation 加超时。

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::oneshot;

use crate::core::SchedulerError;

/// 准入策略
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionPolicy {
    /// 队头不可运行时停止本轮评估
    #[default]
    HeadOfLine,
    /// 跳过不可运行的任务，按顺序准入任何可运行的任务
    Scan,
}

/// 调度器配置
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub max_global: usize,
    pub max_per_target: usize,
    pub admission: AdmissionPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_global: 3,
            max_per_target: 1,
            admission: AdmissionPolicy::HeadOfLine,
        }
    }
}

/// 提交任务时的选项
#[derive(Clone, Debug, Default)]
pub struct TaskOptions {
    /// 分组键（如标签页 ID）
    pub target_key: Option<String>,
    /// 越大越先运行
    pub priority: i32,
}

impl TaskOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn target(mut self, key: impl Into<String>) -> Self {
        self.target_key = Some(key.into());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// 任务 ID
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct TaskId(u64);

type Job = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

struct QueuedTask {
    id: TaskId,
    target_key: Option<String>,
    enqueued_at: Instant,
    job: Job,
}

struct SchedulerState {
    /// (Reverse(priority), 提交序号) 升序即准入顺序
    waiting: BTreeMap<(Reverse<i32>, u64), QueuedTask>,
    running: HashMap<TaskId, Option<String>>,
    per_target: HashMap<String, usize>,
    config: SchedulerConfig,
}

impl SchedulerState {
    fn target_has_room(&self, key: Option<&str>) -> bool {
        match key {
            Some(key) => self.per_target.get(key).copied().unwrap_or(0) < self.config.max_per_target,
            None => true,
        }
    }

    fn admit(&mut self, task: &QueuedTask) {
        self.running.insert(task.id, task.target_key.clone());
        if let Some(key) = &task.target_key {
            *self.per_target.entry(key.clone()).or_insert(0) += 1;
        }
    }

    fn release(&mut self, id: TaskId) {
        if let Some(Some(key)) = self.running.remove(&id) {
            if let Some(count) = self.per_target.get_mut(&key) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.per_target.remove(&key);
                }
            }
        }
    }

    /// 按策略取出本轮可以启动的任务（已计入运行数）
    fn take_admissible(&mut self) -> Vec<QueuedTask> {
        let mut admitted = Vec::new();
        let keys: Vec<(Reverse<i32>, u64)> = self.waiting.keys().copied().collect();

        for key in keys {
            if self.running.len() >= self.config.max_global {
                break;
            }
            let eligible = self
                .waiting
                .get(&key)
                .map(|task| self.target_has_room(task.target_key.as_deref()))
                .unwrap_or(false);
            if !eligible {
                match self.config.admission {
                    AdmissionPolicy::HeadOfLine => break,
                    AdmissionPolicy::Scan => continue,
                }
            }
            if let Some(task) = self.waiting.remove(&key) {
                self.admit(&task);
                admitted.push(task);
            }
        }
        admitted
    }
}

/// 任务调度器；Clone 共享同一状态
///
/// 准入的任务通过 `tokio::spawn` 运行，须在 tokio 运行时内调用 `schedule()`；
/// 运行时外提交的任务只入队，直到运行时内的下一次准入评估。
#[derive(Clone)]
pub struct TaskScheduler {
    state: Arc<Mutex<SchedulerState>>,
    next_seq: Arc<AtomicU64>,
}

impl TaskScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let config = SchedulerConfig {
            max_global: config.max_global.max(1),
            max_per_target: config.max_per_target.max(1),
            ..config
        };
        Self {
            state: Arc::new(Mutex::new(SchedulerState {
                waiting: BTreeMap::new(),
                running: HashMap::new(),
                per_target: HashMap::new(),
                config,
            })),
            next_seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// 提交任务：调用时立即入队（并可能立即启动），返回的 future 等待结算结果
    pub fn schedule<F, Fut, T>(
        &self,
        options: TaskOptions,
        operation: F,
    ) -> impl Future<Output = Result<T, SchedulerError>> + Send + 'static
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            async move {
                let outcome = AssertUnwindSafe(async move { operation().await })
                    .catch_unwind()
                    .await
                    .map_err(|_| SchedulerError::Panicked);
                let _ = tx.send(outcome);
            }
            .boxed()
        });
        self.enqueue(options, job);

        // 发送端未发送即被丢弃，只可能是排队期间被 clear()
        async move { rx.await.unwrap_or(Err(SchedulerError::Cleared)) }
    }

    fn enqueue(&self, options: TaskOptions, job: Job) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let task = QueuedTask {
            id: TaskId(seq),
            target_key: options.target_key,
            enqueued_at: Instant::now(),
            job,
        };
        self.state
            .lock()
            .waiting
            .insert((Reverse(options.priority), seq), task);
        self.pump();
    }

    /// 重新评估准入并启动可运行的任务
    fn pump(&self) {
        if tokio::runtime::Handle::try_current().is_err() {
            tracing::warn!(queued = self.queued(), "No tokio runtime, queued tasks wait until the next schedule() inside one");
            return;
        }
        let admitted = self.state.lock().take_admissible();
        for task in admitted {
            tracing::debug!(
                task = task.id.0,
                target = ?task.target_key,
                wait_ms = task.enqueued_at.elapsed().as_millis() as u64,
                "Task admitted"
            );
            let guard = SettleGuard {
                scheduler: self.clone(),
                id: task.id,
            };
            let job = task.job;
            tokio::spawn(async move {
                let _guard = guard;
                job().await;
            });
        }
    }

    /// 拒绝所有排队中的任务（返回 Cleared），不影响运行中的任务
    pub fn clear(&self) -> usize {
        let drained = std::mem::take(&mut self.state.lock().waiting);
        let count = drained.len();
        drop(drained);
        if count > 0 {
            tracing::info!(count, "Cleared queued tasks");
        }
        count
    }

    /// 运行时调整并发上限，从下一次准入评估开始生效
    pub fn set_limits(&self, max_global: usize, max_per_target: usize) {
        {
            let mut state = self.state.lock();
            state.config.max_global = max_global.max(1);
            state.config.max_per_target = max_per_target.max(1);
        }
        tracing::info!(max_global, max_per_target, "Scheduler limits updated");
        self.pump();
    }

    pub fn set_admission(&self, admission: AdmissionPolicy) {
        self.state.lock().config.admission = admission;
        self.pump();
    }

    pub fn config(&self) -> SchedulerConfig {
        self.state.lock().config.clone()
    }

    /// (max_global, max_per_target)
    pub fn limits(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.config.max_global, state.config.max_per_target)
    }

    pub fn running(&self) -> usize {
        self.state.lock().running.len()
    }

    pub fn running_for(&self, target_key: &str) -> usize {
        self.state.lock().per_target.get(target_key).copied().unwrap_or(0)
    }

    pub fn queued(&self) -> usize {
        self.state.lock().waiting.len()
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

/// 任务结算（含 panic 展开）时释放槽位并重新评估
struct SettleGuard {
    scheduler: TaskScheduler,
    id: TaskId,
}

impl Drop for SettleGuard {
    fn drop(&mut self) {
        self.scheduler.state.lock().release(self.id);
        self.scheduler.pump();
    }
}
