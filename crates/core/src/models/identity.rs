use std::fmt;

use serde::{Deserialize, Serialize};

/// 任务的所有者身份
///
/// 窗口公平队列按身份分配窗口号，同一身份的任务共享一个窗口计数器。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity(String);

impl Identity {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// 系统内部任务使用的身份
    pub fn system() -> Self {
        Self("system".to_string())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}
