//! 重试策略：pure / idempotent 工具有限次重试（线性退避），non_idempotent 只调用一次

use std::time::Duration;

use crate::tools::SideEffectClass;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 首次调用之后最多再试几次
    pub max_retries: u32,
    /// 第 n 次重试前等待 n * backoff
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Duration) -> Self {
        Self { max_retries, backoff }
    }

    /// 总调用次数上限
    pub fn attempts_for(&self, class: SideEffectClass) -> u32 {
        if class.is_retryable() {
            1 + self.max_retries
        } else {
            1
        }
    }

    /// 第 attempt 次调用失败后的等待时间
    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(attempt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_idempotent_never_retried() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10));
        assert_eq!(policy.attempts_for(SideEffectClass::NonIdempotent), 1);
        assert_eq!(policy.attempts_for(SideEffectClass::Idempotent), 4);
        assert_eq!(policy.attempts_for(SideEffectClass::Pure), 4);
    }

    #[test]
    fn test_linear_backoff() {
        let policy = RetryPolicy::new(2, Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
    }
}
