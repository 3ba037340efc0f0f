use std::sync::{Arc, Mutex};

use darkstar_core::{SchedulerError, SchedulerResult};
use tracing::debug;

use crate::lock;
use crate::queue::SchedulerQueue;
use crate::task::ScheduledTask;
use crate::timer::TimerEntry;

#[derive(Default)]
struct RecurrenceState {
    started: bool,
    cancelled: bool,
    timer_entry: Option<TimerEntry>,
}

/// 周期任务所有执行共享的控制状态
#[derive(Default)]
pub struct RecurrenceControl {
    state: Mutex<RecurrenceState>,
}

impl RecurrenceControl {
    pub fn is_cancelled(&self) -> bool {
        lock(&self.state).cancelled
    }

    pub fn is_started(&self) -> bool {
        lock(&self.state).started
    }

    /// 记录下一次执行的延迟定时器，句柄已取消时立即取消该定时器
    pub fn set_timer_entry(&self, entry: TimerEntry) {
        let mut state = lock(&self.state);
        if state.cancelled {
            entry.cancel();
        } else {
            state.timer_entry = Some(entry);
        }
    }
}

/// 周期任务句柄
///
/// `start()` 只能在取消之前调用一次；`cancel()` 只能调用一次，并会取消
/// 正在等待的延迟定时器。
pub struct RecurringTaskHandle {
    queue: Arc<dyn SchedulerQueue>,
    task: Arc<ScheduledTask>,
    control: Arc<RecurrenceControl>,
}

impl RecurringTaskHandle {
    pub(crate) fn new(
        queue: Arc<dyn SchedulerQueue>,
        task: Arc<ScheduledTask>,
    ) -> SchedulerResult<Self> {
        if !task.is_recurring() {
            return Err(SchedulerError::InvalidArgument(
                "只能为周期任务创建周期句柄".to_string(),
            ));
        }

        let control = Arc::new(RecurrenceControl::default());
        task.attach_recurrence(control.clone())?;

        Ok(Self {
            queue,
            task,
            control,
        })
    }

    pub fn task(&self) -> &Arc<ScheduledTask> {
        &self.task
    }

    pub fn is_cancelled(&self) -> bool {
        self.control.is_cancelled()
    }

    /// 开始周期执行
    pub fn start(&self) -> SchedulerResult<()> {
        {
            let mut state = lock(&self.control.state);
            if state.cancelled {
                return Err(SchedulerError::illegal_state("周期任务已取消"));
            }
            if state.started {
                return Err(SchedulerError::illegal_state("周期任务已启动"));
            }
            state.started = true;
        }

        self.queue.add_task(self.task.clone())
    }

    /// 取消周期执行，正在运行的那一次不受影响
    pub fn cancel(&self) -> SchedulerResult<()> {
        let entry = {
            let mut state = lock(&self.control.state);
            if state.cancelled {
                return Err(SchedulerError::illegal_state("周期任务已取消"));
            }
            state.cancelled = true;
            state.timer_entry.take()
        };

        if let Some(entry) = entry {
            if entry.cancel() {
                debug!(task_id = %self.task.id(), "取消周期任务的延迟定时器");
            }
        }

        self.queue.notify_cancelled(&self.task);
        Ok(())
    }
}
