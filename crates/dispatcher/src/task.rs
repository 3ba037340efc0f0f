use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use darkstar_core::{
    current_time_millis, Identity, KernelRunnable, Priority, SchedulerError, SchedulerResult,
    TaskFailure,
};
use tokio::sync::watch;
use uuid::Uuid;

use crate::lock;
use crate::recurring::RecurrenceControl;
use crate::task_queue::TaskQueue;

/// 非周期任务的周期标记
pub const NON_RECURRING: i64 = -1;

/// 任务默认事务超时（毫秒）
pub const DEFAULT_TIMEOUT_MS: u64 = 100;

/// 任务生命周期
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskLifecycle {
    Pending,
    Running,
    Done,
    Cancelled,
}

/// 任务的最终结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Succeeded,
    Failed(TaskFailure),
    Cancelled,
}

impl Completion {
    pub fn into_result(self) -> SchedulerResult<()> {
        match self {
            Completion::Succeeded => Ok(()),
            Completion::Failed(failure) => Err(SchedulerError::TaskFailed(failure)),
            Completion::Cancelled => Err(SchedulerError::illegal_state("任务已取消")),
        }
    }
}

struct TaskState {
    lifecycle: TaskLifecycle,
    last_failure: Option<TaskFailure>,
}

/// 调度器中的一个工作单元
///
/// 调度器修改尝试次数与超时，所有者可以取消。周期任务的每次执行都是一个新的
/// `ScheduledTask`，它们共享同一个 [`RecurrenceControl`]。
pub struct ScheduledTask {
    id: Uuid,
    runnable: Arc<dyn KernelRunnable>,
    owner: Identity,
    priority: Priority,
    start_time: AtomicI64,
    period: i64,
    base_timeout_ms: u64,
    timeout_ms: AtomicU64,
    try_count: AtomicU32,
    state: Mutex<TaskState>,
    completion: watch::Sender<Option<Completion>>,
    recurrence: OnceLock<Arc<RecurrenceControl>>,
    task_queue: OnceLock<Arc<TaskQueue>>,
}

impl ScheduledTask {
    /// 创建一次性任务
    pub fn new(runnable: Arc<dyn KernelRunnable>, owner: Identity, start_time: i64) -> Self {
        Self::build(runnable, owner, start_time, NON_RECURRING)
    }

    /// 创建周期任务，`period` 为毫秒
    pub fn recurring(
        runnable: Arc<dyn KernelRunnable>,
        owner: Identity,
        start_time: i64,
        period: i64,
    ) -> Self {
        Self::build(runnable, owner, start_time, period)
    }

    fn build(runnable: Arc<dyn KernelRunnable>, owner: Identity, start_time: i64, period: i64) -> Self {
        let (completion, _) = watch::channel(None);
        Self {
            id: Uuid::new_v4(),
            runnable,
            owner,
            priority: Priority::default(),
            start_time: AtomicI64::new(start_time),
            period,
            base_timeout_ms: DEFAULT_TIMEOUT_MS,
            timeout_ms: AtomicU64::new(DEFAULT_TIMEOUT_MS),
            try_count: AtomicU32::new(0),
            state: Mutex::new(TaskState {
                lifecycle: TaskLifecycle::Pending,
                last_failure: None,
            }),
            completion,
            recurrence: OnceLock::new(),
            task_queue: OnceLock::new(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.base_timeout_ms = timeout_ms;
        self.timeout_ms = AtomicU64::new(timeout_ms);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn runnable(&self) -> &Arc<dyn KernelRunnable> {
        &self.runnable
    }

    pub fn owner(&self) -> &Identity {
        &self.owner
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn start_time(&self) -> i64 {
        self.start_time.load(Ordering::SeqCst)
    }

    pub(crate) fn reset_start_time(&self, start_time: i64) {
        self.start_time.store(start_time, Ordering::SeqCst);
    }

    pub fn period(&self) -> i64 {
        self.period
    }

    pub fn is_recurring(&self) -> bool {
        self.period != NON_RECURRING
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms.load(Ordering::SeqCst)
    }

    pub fn set_timeout_ms(&self, timeout_ms: u64) {
        self.timeout_ms.store(timeout_ms, Ordering::SeqCst);
    }

    pub fn try_count(&self) -> u32 {
        self.try_count.load(Ordering::SeqCst)
    }

    /// 开始一次新的执行尝试，返回新的尝试次数
    pub fn increment_try_count(&self) -> u32 {
        self.try_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn last_failure(&self) -> Option<TaskFailure> {
        lock(&self.state).last_failure.clone()
    }

    pub fn set_last_failure(&self, failure: TaskFailure) {
        lock(&self.state).last_failure = Some(failure);
    }

    pub fn lifecycle(&self) -> TaskLifecycle {
        lock(&self.state).lifecycle
    }

    pub fn is_cancelled(&self) -> bool {
        self.lifecycle() == TaskLifecycle::Cancelled
    }

    pub fn is_done(&self) -> bool {
        matches!(
            self.lifecycle(),
            TaskLifecycle::Done | TaskLifecycle::Cancelled
        )
    }

    /// 取消尚未开始执行的任务
    ///
    /// 只有处于 Pending 状态时才能取消，正在执行的任务不受影响。
    pub fn cancel(&self) -> bool {
        {
            let mut state = lock(&self.state);
            if state.lifecycle != TaskLifecycle::Pending {
                return false;
            }
            state.lifecycle = TaskLifecycle::Cancelled;
        }
        self.completion.send_replace(Some(Completion::Cancelled));
        true
    }

    /// Pending -> Running，任务已取消或已结束时返回 false
    pub fn set_running(&self) -> bool {
        let mut state = lock(&self.state);
        if state.lifecycle != TaskLifecycle::Pending {
            return false;
        }
        state.lifecycle = TaskLifecycle::Running;
        true
    }

    /// 稍后重试时回到 Pending
    pub fn set_pending(&self) {
        let mut state = lock(&self.state);
        if state.lifecycle == TaskLifecycle::Running {
            state.lifecycle = TaskLifecycle::Pending;
        }
    }

    pub fn set_done(&self, completion: Completion) {
        {
            let mut state = lock(&self.state);
            if matches!(
                state.lifecycle,
                TaskLifecycle::Done | TaskLifecycle::Cancelled
            ) {
                return;
            }
            state.lifecycle = if completion == Completion::Cancelled {
                TaskLifecycle::Cancelled
            } else {
                TaskLifecycle::Done
            };
        }
        self.completion.send_replace(Some(completion));
    }

    /// 等待任务结束
    pub async fn wait_for_completion(&self) -> Completion {
        let mut rx = self.completion.subscribe();
        let completion = match rx.wait_for(|completion| completion.is_some()).await {
            Ok(completion) => completion.clone().unwrap_or(Completion::Cancelled),
            // 发送端随任务一起存在，不会提前关闭
            Err(_) => Completion::Cancelled,
        };
        completion
    }

    pub fn recurrence(&self) -> Option<&Arc<RecurrenceControl>> {
        self.recurrence.get()
    }

    pub(crate) fn attach_recurrence(&self, control: Arc<RecurrenceControl>) -> SchedulerResult<()> {
        self.recurrence
            .set(control)
            .map_err(|_| SchedulerError::illegal_state("周期任务已关联句柄"))
    }

    /// 所属的周期句柄是否已取消
    pub fn is_recurrence_cancelled(&self) -> bool {
        self.recurrence
            .get()
            .map(|control| control.is_cancelled())
            .unwrap_or(false)
    }

    pub(crate) fn task_queue(&self) -> Option<&Arc<TaskQueue>> {
        self.task_queue.get()
    }

    pub(crate) fn attach_task_queue(&self, queue: Arc<TaskQueue>) {
        let _ = self.task_queue.set(queue);
    }

    /// 周期任务的下一次执行，开始时间为本次开始时间加一个周期
    pub fn next_occurrence(&self) -> Option<Arc<ScheduledTask>> {
        if !self.is_recurring() {
            return None;
        }

        let next = ScheduledTask::recurring(
            self.runnable.clone(),
            self.owner.clone(),
            self.start_time() + self.period,
            self.period,
        )
        .with_priority(self.priority)
        .with_timeout(self.base_timeout_ms);

        if let Some(control) = self.recurrence.get() {
            let _ = next.recurrence.set(control.clone());
        }

        Some(Arc::new(next))
    }

    /// 距离开始时间还有多少毫秒，已到期时为负数
    pub fn millis_until_start(&self) -> i64 {
        self.start_time() - current_time_millis()
    }
}

impl fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("id", &self.id)
            .field("type", &self.runnable.base_task_type())
            .field("owner", &self.owner)
            .field("start_time", &self.start_time())
            .field("period", &self.period)
            .field("try_count", &self.try_count())
            .finish()
    }
}
