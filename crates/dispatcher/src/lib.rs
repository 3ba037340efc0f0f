pub mod queue;
pub mod recurring;
pub mod reservation;
pub mod retry_policy;
pub mod scheduler;
pub mod task;
pub mod task_queue;
pub mod timed_task_handler;
pub mod timer;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use queue::{
    create_scheduler_queue, create_scheduler_queue_with_timer, FifoSchedulerQueue,
    SchedulerQueue, WindowSchedulerQueue,
};
pub use recurring::{RecurrenceControl, RecurringTaskHandle};
pub use reservation::TaskReservation;
pub use retry_policy::{
    create_retry_policy, ImmediateRetryPolicy, NowOrLaterRetryPolicy, RequeueRetryPolicy,
    RetryAction, RetryPolicyConfig, SchedulerRetryPolicy,
};
pub use scheduler::TransactionScheduler;
pub use task::{Completion, ScheduledTask, TaskLifecycle, DEFAULT_TIMEOUT_MS, NON_RECURRING};
pub use task_queue::TaskQueue;
pub use timed_task_handler::{TimedTaskConsumer, TimedTaskHandler, FUTURE_THRESHOLD_MS};
pub use timer::{DeadlineTimer, TimerEntry};

/// 获取互斥锁，锁中毒时继续使用内部数据
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
