//! Retry policies applied after a handler failure.
//!
//! The dispatcher only asks the policy what to do; swapping policies never
//! changes the dispatcher contract.

use chrono::{DateTime, Duration, Utc};
use nudgeclaw_core::config::{RetryStrategy, SchedulerConfig};

use crate::tasks::ScheduledTask;

/// What to do with a task whose handler just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Unlock and leave the schedule alone: eligible again right away.
    ReleaseNow,
    /// Unlock and move the due time.
    RetryAt(DateTime<Utc>),
}

pub trait RetryPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// `task.failure_count` is the count before this failure.
    fn on_failure(&self, task: &ScheduledTask, now: DateTime<Utc>) -> RetryDecision;
}

/// Retry on the next cycle, forever, with no backoff.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImmediateRetryPolicy;

impl RetryPolicy for ImmediateRetryPolicy {
    fn name(&self) -> &'static str {
        "immediate"
    }

    fn on_failure(&self, _task: &ScheduledTask, _now: DateTime<Utc>) -> RetryDecision {
        RetryDecision::ReleaseNow
    }
}

/// `base_ms * 2^failures`, capped at `max_ms`.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoffPolicy {
    pub base_ms: u64,
    pub max_ms: u64,
}

impl ExponentialBackoffPolicy {
    pub fn delay_ms(&self, failure_count: u32) -> u64 {
        let factor = 1u64.checked_shl(failure_count.min(63)).unwrap_or(u64::MAX);
        self.base_ms.saturating_mul(factor).min(self.max_ms)
    }
}

impl RetryPolicy for ExponentialBackoffPolicy {
    fn name(&self) -> &'static str {
        "backoff"
    }

    fn on_failure(&self, task: &ScheduledTask, now: DateTime<Utc>) -> RetryDecision {
        let delay = self.delay_ms(task.failure_count);
        RetryDecision::RetryAt(now + Duration::milliseconds(delay as i64))
    }
}

/// Build the policy selected in config.
pub fn policy_from_config(config: &SchedulerConfig) -> std::sync::Arc<dyn RetryPolicy> {
    match config.retry {
        RetryStrategy::Immediate => std::sync::Arc::new(ImmediateRetryPolicy),
        RetryStrategy::Backoff => std::sync::Arc::new(ExponentialBackoffPolicy {
            base_ms: config.backoff_base_ms,
            max_ms: config.backoff_max_ms,
        }),
    }
}
