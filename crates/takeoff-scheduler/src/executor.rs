//! Notification delivery.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use reqwest::Client;
use tracing::{debug, info};

use crate::time::{Clock, SystemClock, has_passed_at};
use crate::{ExecutionError, JobRecord, SchedulerError};

/// Header carrying the job key so the receiver can drop duplicate deliveries.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// What a successful execution did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// The endpoint accepted the notification.
    Delivered,
    /// The notification was too old to send and was dropped.
    SkippedStale,
}

/// Performs the side effect of a job.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, job: &JobRecord) -> Result<ExecutionOutcome, ExecutionError>;
}

/// Posts notification payloads to an HTTP endpoint.
pub struct HttpNotifier {
    http: Client,
    url: String,
    stale_grace: ChronoDuration,
    clock: Arc<dyn Clock>,
}

impl HttpNotifier {
    /// Create a notifier posting to `url` with a per-request `timeout`.
    pub fn new(
        url: impl Into<String>,
        timeout: Duration,
        stale_grace: Duration,
    ) -> Result<Self, SchedulerError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SchedulerError::InvalidConfig(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            url: url.into(),
            stale_grace: ChronoDuration::from_std(stale_grace).unwrap_or(ChronoDuration::MAX),
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Whether the notification is too far past its scheduled date to send.
    pub fn is_stale(&self, job: &JobRecord) -> bool {
        let deadline = job
            .payload
            .scheduled_date
            .checked_add_signed(self.stale_grace)
            .unwrap_or(job.payload.scheduled_date);
        has_passed_at(deadline, self.clock.now())
    }
}

#[async_trait]
impl Executor for HttpNotifier {
    async fn execute(&self, job: &JobRecord) -> Result<ExecutionOutcome, ExecutionError> {
        if self.is_stale(job) {
            info!(
                job_id = %job.id,
                key = %job.key,
                scheduled_date = %job.payload.scheduled_date,
                "skipping stale notification"
            );
            return Ok(ExecutionOutcome::SkippedStale);
        }

        let response = self
            .http
            .post(&self.url)
            .header(IDEMPOTENCY_HEADER, &job.key)
            .json(&job.payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ExecutionError::Status(status.as_u16()));
        }

        debug!(job_id = %job.id, status = status.as_u16(), "notification delivered");
        Ok(ExecutionOutcome::Delivered)
    }
}
