use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, Weak};

use darkstar_core::{
    current_time_millis, Identity, KernelRunnable, SchedulerError, SchedulerResult,
};
use tracing::warn;

use crate::lock;
use crate::scheduler::SchedulerInner;
use crate::task::{Completion, ScheduledTask};

#[derive(Default)]
struct TaskQueueState {
    waiting: VecDeque<Arc<ScheduledTask>>,
    head_in_flight: bool,
}

/// 依赖任务队列
///
/// 加入同一队列的任务严格依次执行：只有队首任务在调度队列中，其余任务等待前驱结束，
/// 被释放时开始时间重置为当前时间。
pub struct TaskQueue {
    scheduler: Arc<SchedulerInner>,
    state: Mutex<TaskQueueState>,
    self_ref: Weak<TaskQueue>,
}

impl TaskQueue {
    pub(crate) fn new(scheduler: Arc<SchedulerInner>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            scheduler,
            state: Mutex::new(TaskQueueState::default()),
            self_ref: weak.clone(),
        })
    }

    /// 加入一个依赖前驱任务的任务
    pub fn add_task(
        &self,
        runnable: Arc<dyn KernelRunnable>,
        owner: Identity,
    ) -> SchedulerResult<Arc<ScheduledTask>> {
        let this = self
            .self_ref
            .upgrade()
            .ok_or_else(|| SchedulerError::illegal_state("依赖队列已释放"))?;

        let task = self
            .scheduler
            .new_task(runnable, owner, current_time_millis());
        task.attach_task_queue(this);

        let mut state = lock(&self.state);
        if state.head_in_flight {
            state.waiting.push_back(task.clone());
            self.scheduler
                .waiting_dependents
                .fetch_add(1, Ordering::SeqCst);
            return Ok(task);
        }

        self.scheduler.queue.add_task(task.clone())?;
        state.head_in_flight = true;
        Ok(task)
    }

    /// 等待中的任务数
    pub fn waiting(&self) -> usize {
        lock(&self.state).waiting.len()
    }

    /// 前驱任务结束后释放下一个任务
    pub(crate) fn schedule_next_task(&self) {
        loop {
            let next = {
                let mut state = lock(&self.state);
                match state.waiting.pop_front() {
                    Some(task) => task,
                    None => {
                        state.head_in_flight = false;
                        return;
                    }
                }
            };

            self.scheduler
                .waiting_dependents
                .fetch_sub(1, Ordering::SeqCst);
            next.reset_start_time(current_time_millis());

            match self.scheduler.queue.add_task(next.clone()) {
                Ok(()) => return,
                Err(e) => {
                    warn!(task_id = %next.id(), "依赖任务无法加入调度队列: {e}");
                    next.set_done(Completion::Cancelled);
                }
            }
        }
    }
}
