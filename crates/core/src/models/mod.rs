pub mod identity;
pub mod priority;

pub use identity::*;
pub use priority::*;

/// 当前时间（毫秒时间戳）
pub fn current_time_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
