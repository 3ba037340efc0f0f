//! 事务调度器
//!
//! 一组消费者从调度队列取任务执行。每次执行都在任务自身的超时内完成，
//! 失败后由重试策略决定立即重试、放回队列或丢弃。

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use darkstar_core::{
    current_time_millis, Identity, KernelRunnable, SchedulerConfig, SchedulerError,
    SchedulerResult, TaskFailure,
};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::queue::{create_scheduler_queue, SchedulerQueue};
use crate::recurring::RecurringTaskHandle;
use crate::reservation::TaskReservation;
use crate::retry_policy::{create_retry_policy, RetryAction, SchedulerRetryPolicy};
use crate::task::{Completion, ScheduledTask};
use crate::task_queue::TaskQueue;

pub(crate) struct SchedulerInner {
    pub(crate) queue: Arc<dyn SchedulerQueue>,
    retry_policy: Arc<dyn SchedulerRetryPolicy>,
    config: SchedulerConfig,
    shutdown: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    pub(crate) waiting_dependents: AtomicUsize,
}

/// 事务调度器
pub struct TransactionScheduler {
    inner: Arc<SchedulerInner>,
    consumers: Mutex<Vec<JoinHandle<()>>>,
}

impl TransactionScheduler {
    /// 按配置创建队列与重试策略并启动消费者
    pub fn from_config(config: SchedulerConfig) -> Self {
        let queue = create_scheduler_queue(&config);
        let retry_policy = create_retry_policy(&config);
        Self::new(queue, retry_policy, Some(config))
    }

    /// 创建调度器并启动消费者，必须在 tokio 运行时内调用
    pub fn new(
        queue: Arc<dyn SchedulerQueue>,
        retry_policy: Arc<dyn SchedulerRetryPolicy>,
        config: Option<SchedulerConfig>,
    ) -> Self {
        let config = config.unwrap_or_default();
        let (shutdown_tx, _) = watch::channel(false);
        let inner = Arc::new(SchedulerInner {
            queue,
            retry_policy,
            config,
            shutdown: AtomicBool::new(false),
            shutdown_tx,
            waiting_dependents: AtomicUsize::new(0),
        });

        let consumer_count = inner.config.consumer_threads.max(1);
        let consumers = (0..consumer_count)
            .map(|index| tokio::spawn(consumer_loop(inner.clone(), index)))
            .collect();

        info!(
            "事务调度器已启动，队列: {}，重试策略: {}，消费者: {}",
            inner.queue.name(),
            inner.retry_policy.name(),
            consumer_count
        );

        Self {
            inner,
            consumers: Mutex::new(consumers),
        }
    }

    pub fn queue(&self) -> &Arc<dyn SchedulerQueue> {
        &self.inner.queue
    }

    pub fn retry_policy(&self) -> &Arc<dyn SchedulerRetryPolicy> {
        &self.inner.retry_policy
    }

    /// 立即调度一次性任务
    pub fn schedule_task(
        &self,
        runnable: Arc<dyn KernelRunnable>,
        owner: Identity,
    ) -> SchedulerResult<Arc<ScheduledTask>> {
        self.schedule_task_at(runnable, owner, current_time_millis())
    }

    /// 在指定时间（毫秒时间戳）调度一次性任务
    pub fn schedule_task_at(
        &self,
        runnable: Arc<dyn KernelRunnable>,
        owner: Identity,
        start_time: i64,
    ) -> SchedulerResult<Arc<ScheduledTask>> {
        self.inner.ensure_running()?;
        let task = self.inner.new_task(runnable, owner, start_time);
        self.inner.queue.add_task(task.clone())?;
        Ok(task)
    }

    pub fn reserve_task(
        &self,
        runnable: Arc<dyn KernelRunnable>,
        owner: Identity,
    ) -> SchedulerResult<TaskReservation> {
        self.reserve_task_at(runnable, owner, current_time_millis())
    }

    pub fn reserve_task_at(
        &self,
        runnable: Arc<dyn KernelRunnable>,
        owner: Identity,
        start_time: i64,
    ) -> SchedulerResult<TaskReservation> {
        self.inner.ensure_running()?;
        let task = self.inner.new_task(runnable, owner, start_time);
        self.inner.queue.reserve_task(task)
    }

    /// 创建周期任务，调用返回句柄的 `start()` 后开始执行
    pub fn schedule_recurring_task(
        &self,
        runnable: Arc<dyn KernelRunnable>,
        owner: Identity,
        start_time: i64,
        period_ms: i64,
    ) -> SchedulerResult<RecurringTaskHandle> {
        self.inner.ensure_running()?;
        if period_ms <= 0 {
            return Err(SchedulerError::InvalidArgument(format!(
                "周期必须大于0: {period_ms}"
            )));
        }

        let task = Arc::new(
            ScheduledTask::recurring(runnable, owner, start_time, period_ms)
                .with_timeout(self.inner.config.transaction_timeout_ms),
        );
        self.inner.queue.create_recurring_task_handle(task)
    }

    /// 在调用方执行任务并等待结果
    ///
    /// 重试策略要求稍后重试时任务会放回队列，调用方继续等待直到任务结束。
    pub async fn run_task(
        &self,
        runnable: Arc<dyn KernelRunnable>,
        owner: Identity,
    ) -> SchedulerResult<()> {
        self.inner.ensure_running()?;
        let task = self
            .inner
            .new_task(runnable, owner, current_time_millis());
        self.inner.execute_task(task.clone()).await;
        task.wait_for_completion().await.into_result()
    }

    /// 创建依赖队列，加入其中的任务依次执行
    pub fn create_task_queue(&self) -> SchedulerResult<Arc<TaskQueue>> {
        self.inner.ensure_running()?;
        Ok(TaskQueue::new(self.inner.clone()))
    }

    pub fn ready_count(&self) -> usize {
        self.inner.queue.get_ready_count()
    }

    /// 依赖队列中等待前驱任务完成的任务数
    pub fn waiting_dependents(&self) -> usize {
        self.inner.waiting_dependents.load(Ordering::SeqCst)
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    /// 停止所有消费者并关闭队列，重复调用返回错误
    pub async fn shutdown(&self) -> SchedulerResult<()> {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::illegal_state("事务调度器已关闭"));
        }

        info!("正在关闭事务调度器");
        let _ = self.inner.shutdown_tx.send(true);
        self.inner.queue.shutdown();

        let consumers: Vec<JoinHandle<()>> = self.consumers.lock().await.drain(..).collect();
        for consumer in consumers {
            if let Err(e) = consumer.await {
                error!("消费者任务异常退出: {e}");
            }
        }

        info!("事务调度器已关闭");
        Ok(())
    }
}

impl SchedulerInner {
    fn ensure_running(&self) -> SchedulerResult<()> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(SchedulerError::illegal_state("事务调度器已关闭"));
        }
        Ok(())
    }

    pub(crate) fn new_task(
        &self,
        runnable: Arc<dyn KernelRunnable>,
        owner: Identity,
        start_time: i64,
    ) -> Arc<ScheduledTask> {
        Arc::new(
            ScheduledTask::new(runnable, owner, start_time)
                .with_timeout(self.config.transaction_timeout_ms),
        )
    }

    /// 执行任务直到成功、被丢弃或交回队列
    async fn execute_task(&self, task: Arc<ScheduledTask>) {
        loop {
            if task.is_recurrence_cancelled() {
                task.cancel();
            }
            if !task.set_running() {
                debug!(task_id = %task.id(), "任务已取消，跳过执行");
                self.after_completion(&task);
                return;
            }

            let try_count = task.increment_try_count();
            let timeout_ms = task.timeout_ms();
            let outcome = tokio::time::timeout(
                Duration::from_millis(timeout_ms),
                task.runnable().run(),
            )
            .await
            .unwrap_or_else(|_| Err(TaskFailure::transaction_timeout(timeout_ms)));

            let failure = match outcome {
                Ok(()) => {
                    task.set_done(Completion::Succeeded);
                    self.after_completion(&task);
                    return;
                }
                Err(failure) => failure,
            };

            task.set_last_failure(failure.clone());
            let action = self.retry_policy.get_retry_action(&task).unwrap_or_else(|e| {
                error!(task_id = %task.id(), "重试策略无法处理任务: {e}");
                RetryAction::Drop
            });

            match action {
                RetryAction::RetryNow => {
                    task.set_pending();
                    debug!(task_id = %task.id(), try_count, "立即重试任务: {failure}");
                }
                RetryAction::RetryLater => {
                    task.set_pending();
                    debug!(task_id = %task.id(), try_count, "任务放回队列稍后重试: {failure}");
                    if let Err(e) = self.queue.add_task(task.clone()) {
                        warn!(task_id = %task.id(), "任务无法放回队列: {e}");
                        task.set_done(Completion::Failed(failure));
                        self.after_completion(&task);
                    }
                    return;
                }
                RetryAction::Drop => {
                    if task.is_recurring() {
                        debug!(
                            task_id = %task.id(),
                            task_type = task.runnable().base_task_type(),
                            try_count,
                            "跳过周期任务的本次执行: {failure}"
                        );
                    } else {
                        debug!(
                            task_id = %task.id(),
                            task_type = task.runnable().base_task_type(),
                            try_count,
                            "丢弃任务: {failure}"
                        );
                    }
                    task.set_done(Completion::Failed(failure));
                    self.after_completion(&task);
                    return;
                }
            }
        }
    }

    /// 任务结束后调度周期任务的下一次执行并释放依赖队列中的后继任务
    fn after_completion(&self, task: &Arc<ScheduledTask>) {
        if task.is_recurring() && !task.is_recurrence_cancelled() {
            if let Some(next) = task.next_occurrence() {
                if let Err(e) = self.queue.add_task(next) {
                    debug!(task_id = %task.id(), "无法调度周期任务的下一次执行: {e}");
                }
            }
        }

        if let Some(task_queue) = task.task_queue() {
            task_queue.schedule_next_task();
        }
    }
}

async fn consumer_loop(inner: Arc<SchedulerInner>, index: usize) {
    let mut shutdown_rx = inner.shutdown_tx.subscribe();
    debug!("消费者 {} 已启动", index);

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                break;
            }
            next = inner.queue.get_next_task(true) => {
                match next {
                    Some(task) => inner.execute_task(task).await,
                    None => break,
                }
            }
        }
    }

    debug!("消费者 {} 已停止", index);
}
