use std::sync::{Arc, Weak};
use std::time::Duration;

use darkstar_core::current_time_millis;
use tracing::debug;

use crate::task::ScheduledTask;
use crate::timer::DeadlineTimer;

/// 开始时间至少要晚于当前时间这么多毫秒才会延迟执行
pub const FUTURE_THRESHOLD_MS: i64 = 15;

/// 延迟任务到期时的接收方
pub trait TimedTaskConsumer: Send + Sync {
    fn timed_task_ready(&self, task: Arc<ScheduledTask>);
}

/// 持有开始时间在未来的任务，到期后交给 [`TimedTaskConsumer`]
pub struct TimedTaskHandler {
    consumer: Weak<dyn TimedTaskConsumer>,
    timer: DeadlineTimer,
}

impl TimedTaskHandler {
    pub fn new(consumer: Weak<dyn TimedTaskConsumer>, timer: DeadlineTimer) -> Self {
        Self { consumer, timer }
    }

    /// 尝试延迟执行任务
    ///
    /// 开始时间不足 `FUTURE_THRESHOLD_MS` 时返回 false，由调用方立即执行。
    /// 周期句柄已取消时吞掉这次执行并返回 true。
    pub fn run_delayed_task(&self, task: Arc<ScheduledTask>) -> bool {
        let now = current_time_millis();
        let start = task.start_time();
        if start < now + FUTURE_THRESHOLD_MS {
            return false;
        }

        if task.is_recurrence_cancelled() {
            debug!(task_id = %task.id(), "周期任务已取消，丢弃本次执行");
            return true;
        }

        let delay = Duration::from_millis((start - now) as u64);
        let control = task.recurrence().cloned();
        let consumer = self.consumer.clone();
        let entry = self.timer.schedule(delay, move || {
            if let Some(consumer) = consumer.upgrade() {
                consumer.timed_task_ready(task);
            }
        });

        if let Some(control) = control {
            control.set_timer_entry(entry);
        }

        true
    }

    pub fn shutdown(&self) {
        self.timer.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use darkstar_core::{Identity, KernelTask};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collector {
        ready: Mutex<Vec<(i64, Arc<ScheduledTask>)>>,
    }

    impl TimedTaskConsumer for Collector {
        fn timed_task_ready(&self, task: Arc<ScheduledTask>) {
            self.ready
                .lock()
                .unwrap()
                .push((current_time_millis(), task));
        }
    }

    fn task_at(start: i64) -> Arc<ScheduledTask> {
        let runnable = KernelTask::new("noop", || async { Ok(()) }).into_runnable();
        Arc::new(ScheduledTask::new(runnable, Identity::system(), start))
    }

    fn handler(collector: &Arc<Collector>) -> TimedTaskHandler {
        let consumer: Arc<dyn TimedTaskConsumer> = collector.clone();
        TimedTaskHandler::new(Arc::downgrade(&consumer), DeadlineTimer::new())
    }

    #[tokio::test]
    async fn test_rejects_task_inside_threshold() {
        let collector = Arc::new(Collector::default());
        let handler = handler(&collector);

        assert!(!handler.run_delayed_task(task_at(current_time_millis() + 10)));
        assert!(!handler.run_delayed_task(task_at(current_time_millis() - 100)));
    }

    #[tokio::test]
    async fn test_never_fires_early() {
        let collector = Arc::new(Collector::default());
        let handler = handler(&collector);

        let start = current_time_millis() + 100;
        assert!(handler.run_delayed_task(task_at(start)));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(collector.ready.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(150)).await;
        let ready = collector.ready.lock().unwrap();
        assert_eq!(ready.len(), 1);
        assert!(ready[0].0 >= start);
    }
}
