//! Scheduler configuration.

use std::time::Duration;

use crate::{JobOptions, SchedulerError};

/// Default number of delivery attempts before a job is abandoned.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default exponential backoff base in milliseconds.
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 2000;

/// Default delay before the first notification in milliseconds.
pub const DEFAULT_FIRST_DELAY_MS: u64 = 120_000;

/// Default local hour at which the notification window opens.
pub const DEFAULT_WINDOW_START_HOUR: u32 = 19;

/// Default local hour at which the notification window closes.
pub const DEFAULT_WINDOW_END_HOUR: u32 = 21;

/// Default notification request timeout in milliseconds.
pub const DEFAULT_EXECUTOR_TIMEOUT_MS: u64 = 1000;

/// Default tolerance for delivering a notification after its scheduled date.
pub const DEFAULT_STALE_GRACE_MS: u64 = 300_000;

/// Default upper bound on the dispatcher's idle sleep in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// Default number of jobs claimed per poll.
pub const DEFAULT_BATCH_SIZE: usize = 16;

/// Default visibility timeout for claimed jobs in milliseconds.
pub const DEFAULT_VISIBILITY_TIMEOUT_MS: u64 = 30_000;

/// Configuration shared by the store, dispatcher, executor and planner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub priority: i64,
    pub remove_on_complete: bool,
    pub first_delay_ms: u64,
    pub window_start_hour: u32,
    pub window_end_hour: u32,
    pub executor_timeout_ms: u64,
    pub stale_grace_ms: u64,
    pub poll_interval_ms: u64,
    pub batch_size: usize,
    pub visibility_timeout_ms: u64,
    /// Number of concurrent dispatcher loops in this process.
    pub workers: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            priority: 0,
            remove_on_complete: true,
            first_delay_ms: DEFAULT_FIRST_DELAY_MS,
            window_start_hour: DEFAULT_WINDOW_START_HOUR,
            window_end_hour: DEFAULT_WINDOW_END_HOUR,
            executor_timeout_ms: DEFAULT_EXECUTOR_TIMEOUT_MS,
            stale_grace_ms: DEFAULT_STALE_GRACE_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            batch_size: DEFAULT_BATCH_SIZE,
            visibility_timeout_ms: DEFAULT_VISIBILITY_TIMEOUT_MS,
            workers: 1,
        }
    }
}

impl SchedulerConfig {
    /// Reject combinations the scheduler cannot honor.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        let invalid = |msg: String| Err(SchedulerError::InvalidConfig(msg));

        if self.max_attempts == 0 {
            return invalid("max_attempts must be at least 1".into());
        }
        if self.window_start_hour > 23 || self.window_end_hour > 23 {
            return invalid(format!(
                "window hours out of range: {}-{}",
                self.window_start_hour, self.window_end_hour
            ));
        }
        if self.window_end_hour <= self.window_start_hour {
            return invalid(format!(
                "window end ({}) must be after window start ({})",
                self.window_end_hour, self.window_start_hour
            ));
        }
        let batch_budget_ms = (self.batch_size as u64).saturating_mul(self.executor_timeout_ms);
        if self.visibility_timeout_ms <= batch_budget_ms {
            return invalid(format!(
                "visibility timeout ({}ms) must exceed batch_size ({}) times executor timeout ({}ms)",
                self.visibility_timeout_ms, self.batch_size, self.executor_timeout_ms
            ));
        }
        if self.workers == 0 {
            return invalid("workers must be at least 1".into());
        }
        if self.batch_size == 0 {
            return invalid("batch_size must be at least 1".into());
        }
        Ok(())
    }

    /// Options stamped on every enqueued job.
    pub fn job_options(&self) -> JobOptions {
        JobOptions {
            priority: self.priority,
            max_attempts: self.max_attempts,
            backoff_base_ms: self.backoff_base_ms,
            remove_on_complete: self.remove_on_complete,
        }
    }

    pub fn executor_timeout(&self) -> Duration {
        Duration::from_millis(self.executor_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.visibility_timeout_ms)
    }
}
