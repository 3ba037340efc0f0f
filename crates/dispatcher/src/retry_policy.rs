//! 失败任务的重试策略
//!
//! 不可重试的失败一律丢弃；可重试的失败由具体策略决定立即重试还是稍后重试。

use std::sync::Arc;

use darkstar_core::{RetryPolicyKind, SchedulerConfig, SchedulerError, SchedulerResult, TaskFailure};
use tracing::{debug, warn};

use crate::task::ScheduledTask;

/// 重试决定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    /// 在当前消费者上立即重试
    RetryNow,
    /// 重新放回队列
    RetryLater,
    /// 放弃任务
    Drop,
}

/// 重试策略配置
#[derive(Debug, Clone)]
pub struct RetryPolicyConfig {
    /// 每重试多少次输出一次警告
    pub retry_warning_threshold: u32,
    /// 超过该尝试次数后改为稍后重试
    pub retry_backoff_threshold: u32,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            retry_warning_threshold: 25,
            retry_backoff_threshold: 10,
        }
    }
}

impl From<&SchedulerConfig> for RetryPolicyConfig {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            retry_warning_threshold: config.retry_warning_threshold.max(1),
            retry_backoff_threshold: config.retry_backoff_threshold.max(1),
        }
    }
}

/// 重试策略接口
pub trait SchedulerRetryPolicy: Send + Sync {
    /// 根据任务最近一次失败决定后续处理，任务没有失败记录时返回错误
    fn get_retry_action(&self, task: &ScheduledTask) -> SchedulerResult<RetryAction>;

    fn name(&self) -> &str;
}

fn last_failure(task: &ScheduledTask) -> SchedulerResult<TaskFailure> {
    task.last_failure().ok_or_else(|| {
        SchedulerError::InvalidArgument(format!("任务 {} 没有失败记录", task.id()))
    })
}

/// 总是立即重试
pub struct ImmediateRetryPolicy {
    retry_warning_threshold: u32,
}

impl ImmediateRetryPolicy {
    pub fn new(config: Option<RetryPolicyConfig>) -> Self {
        let config = config.unwrap_or_default();
        Self {
            retry_warning_threshold: config.retry_warning_threshold.max(1),
        }
    }
}

impl SchedulerRetryPolicy for ImmediateRetryPolicy {
    fn get_retry_action(&self, task: &ScheduledTask) -> SchedulerResult<RetryAction> {
        let failure = last_failure(task)?;
        if !failure.retryable {
            return Ok(RetryAction::Drop);
        }

        let try_count = task.try_count();
        if try_count % self.retry_warning_threshold == 0 {
            warn!(
                task_id = %task.id(),
                task_type = task.runnable().base_task_type(),
                try_count,
                "任务已重试 {} 次: {}",
                try_count,
                failure
            );
        }

        Ok(RetryAction::RetryNow)
    }

    fn name(&self) -> &str {
        "Immediate"
    }
}

/// 总是放回队列稍后重试
#[derive(Default)]
pub struct RequeueRetryPolicy;

impl RequeueRetryPolicy {
    pub fn new() -> Self {
        Self
    }
}

impl SchedulerRetryPolicy for RequeueRetryPolicy {
    fn get_retry_action(&self, task: &ScheduledTask) -> SchedulerResult<RetryAction> {
        let failure = last_failure(task)?;
        if !failure.retryable {
            return Ok(RetryAction::Drop);
        }
        Ok(RetryAction::RetryLater)
    }

    fn name(&self) -> &str {
        "Requeue"
    }
}

/// 前若干次立即重试，之后稍后重试
///
/// 超过退避阈值后，若失败原因是事务超时，任务超时时间翻倍（溢出时保持最大值）。
pub struct NowOrLaterRetryPolicy {
    retry_backoff_threshold: u32,
}

impl NowOrLaterRetryPolicy {
    pub fn new(config: Option<RetryPolicyConfig>) -> Self {
        let config = config.unwrap_or_default();
        Self {
            retry_backoff_threshold: config.retry_backoff_threshold.max(1),
        }
    }
}

impl SchedulerRetryPolicy for NowOrLaterRetryPolicy {
    fn get_retry_action(&self, task: &ScheduledTask) -> SchedulerResult<RetryAction> {
        let failure = last_failure(task)?;
        if !failure.retryable {
            return Ok(RetryAction::Drop);
        }

        if task.try_count() <= self.retry_backoff_threshold {
            return Ok(RetryAction::RetryNow);
        }

        if failure.is_timeout() {
            let timeout = task.timeout_ms();
            let doubled = timeout.saturating_mul(2);
            task.set_timeout_ms(doubled);
            debug!(
                task_id = %task.id(),
                try_count = task.try_count(),
                "事务超时，超时时间从 {}ms 调整为 {}ms",
                timeout,
                doubled
            );
        }

        Ok(RetryAction::RetryLater)
    }

    fn name(&self) -> &str {
        "NowOrLater"
    }
}

/// 按配置创建重试策略
pub fn create_retry_policy(config: &SchedulerConfig) -> Arc<dyn SchedulerRetryPolicy> {
    let policy_config = RetryPolicyConfig::from(config);
    match config.retry_policy {
        RetryPolicyKind::Immediate => Arc::new(ImmediateRetryPolicy::new(Some(policy_config))),
        RetryPolicyKind::Requeue => Arc::new(RequeueRetryPolicy::new()),
        RetryPolicyKind::NowOrLater => Arc::new(NowOrLaterRetryPolicy::new(Some(policy_config))),
    }
}
