use serde::{Deserialize, Serialize};

/// 就绪队列的排序策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    /// 严格按到达顺序
    #[default]
    Fifo,
    /// 按所有者窗口交错
    Window,
}

/// 失败任务的重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicyKind {
    Immediate,
    Requeue,
    #[default]
    NowOrLater,
}

/// 调度器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub queue: QueueKind,
    /// 消费者任务数量
    pub consumer_threads: usize,
    pub retry_policy: RetryPolicyKind,
    /// 每重试多少次输出一次警告
    pub retry_warning_threshold: u32,
    /// 超过该尝试次数后改为稍后重试
    pub retry_backoff_threshold: u32,
    /// 单个任务的默认事务超时
    pub transaction_timeout_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue: QueueKind::Fifo,
            consumer_threads: 4,
            retry_policy: RetryPolicyKind::NowOrLater,
            retry_warning_threshold: 25,
            retry_backoff_threshold: 10,
            transaction_timeout_ms: 100,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.consumer_threads == 0 {
            return Err(anyhow::anyhow!("消费者线程数必须大于0"));
        }

        if self.retry_warning_threshold == 0 {
            return Err(anyhow::anyhow!("重试警告阈值必须大于0"));
        }

        if self.retry_backoff_threshold == 0 {
            return Err(anyhow::anyhow!("重试退避阈值必须大于0"));
        }

        if self.transaction_timeout_ms == 0 {
            return Err(anyhow::anyhow!("事务超时时间必须大于0"));
        }

        Ok(())
    }
}
