use std::fmt;

use thiserror::Error;

/// 任务执行失败的类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// 事务超时
    TransactionTimeout,
    /// 事务冲突
    TransactionConflict,
    /// 执行被中断
    Interrupted,
    /// 其他失败
    Other,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::TransactionTimeout => "transaction_timeout",
            FailureKind::TransactionConflict => "transaction_conflict",
            FailureKind::Interrupted => "interrupted",
            FailureKind::Other => "other",
        };
        f.write_str(name)
    }
}

/// 任务一次执行尝试的失败原因
///
/// `retryable` 标记该失败是否为瞬时失败，由重试策略决定后续处理。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("任务执行失败({kind}, retryable={retryable}): {message}")]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub retryable: bool,
    pub message: String,
}

impl TaskFailure {
    pub fn new(kind: FailureKind, retryable: bool, message: impl Into<String>) -> Self {
        Self {
            kind,
            retryable,
            message: message.into(),
        }
    }

    /// 可重试的普通失败
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Other, true, message)
    }

    /// 不可重试的永久失败
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Other, false, message)
    }

    /// 事务超时总是可重试的
    pub fn transaction_timeout(timeout_ms: u64) -> Self {
        Self::new(
            FailureKind::TransactionTimeout,
            true,
            format!("事务超过 {timeout_ms}ms 未完成"),
        )
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(FailureKind::TransactionConflict, true, message)
    }

    pub fn interrupted(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Interrupted, false, message)
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == FailureKind::TransactionTimeout
    }
}

/// 调度器错误类型定义
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("任务被拒绝: {0}")]
    TaskRejected(String),

    #[error("非法状态: {0}")]
    IllegalState(String),

    #[error("无效参数: {0}")]
    InvalidArgument(String),

    #[error("节点已注册: {id}")]
    NodeAlreadyRegistered { id: u64 },

    #[error("节点注册失败: {id} - {message}")]
    NodeRegistrationFailed { id: u64, message: String },

    #[error("数据存储错误: {message}")]
    DataStore { message: String, retryable: bool },

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("网络错误: {0}")]
    Network(String),

    #[error(transparent)]
    TaskFailed(#[from] TaskFailure),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl SchedulerError {
    pub fn data_store(message: impl Into<String>, retryable: bool) -> Self {
        SchedulerError::DataStore {
            message: message.into(),
            retryable,
        }
    }

    pub fn illegal_state(message: impl Into<String>) -> Self {
        SchedulerError::IllegalState(message.into())
    }

    /// 判断错误是否为瞬时错误
    pub fn is_retryable(&self) -> bool {
        match self {
            SchedulerError::DataStore { retryable, .. } => *retryable,
            SchedulerError::TaskFailed(failure) => failure.retryable,
            SchedulerError::Network(_) => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        SchedulerError::Serialization(err.to_string())
    }
}

impl From<SchedulerError> for TaskFailure {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::TaskFailed(failure) => failure,
            SchedulerError::DataStore { message, retryable } => {
                TaskFailure::new(FailureKind::TransactionConflict, retryable, message)
            }
            other => TaskFailure::permanent(other.to_string()),
        }
    }
}
