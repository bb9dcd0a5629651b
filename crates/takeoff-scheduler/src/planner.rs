//! Turns a user sign-up into notification jobs.
//!
//! Each user gets a first notification shortly after sign-up, and a second
//! one at a random moment inside today's local evening window, unless that
//! window has already opened.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use crate::store::JobStore;
use crate::time::{
    Clock, SystemClock, has_passed_at, local_time_on, parse_time_zone, random_instant_between,
    truncate_millis,
};
use crate::{
    JobId, JobOptions, NewJob, NotificationPayload, NotificationSlot, SchedulerConfig,
    SchedulerError,
};

/// A job created for a scheduling request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedJob {
    pub slot: NotificationSlot,
    pub id: JobId,
    pub key: String,
    pub scheduled_at: DateTime<Utc>,
}

/// Everything a scheduling request enqueued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulePlan {
    pub jobs: Vec<PlannedJob>,
    /// The evening window had already opened, so no window job was created.
    pub window_skipped: bool,
}

impl SchedulePlan {
    pub fn job(&self, slot: NotificationSlot) -> Option<&PlannedJob> {
        self.jobs.iter().find(|job| job.slot == slot)
    }
}

/// Computes delivery times for a user and enqueues them.
pub struct NotificationPlanner {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    options: JobOptions,
    first_delay: Duration,
    window_start_hour: u32,
    window_end_hour: u32,
}

impl NotificationPlanner {
    pub fn new(store: Arc<dyn JobStore>, config: &SchedulerConfig) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            options: config.job_options(),
            first_delay: Duration::milliseconds(config.first_delay_ms as i64),
            window_start_hour: config.window_start_hour,
            window_end_hour: config.window_end_hour,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Schedule the notifications for `uid` in `time_zone`.
    ///
    /// Any earlier job for the same user slot is superseded. Nothing is
    /// enqueued if the request is invalid.
    #[tracing::instrument(skip(self))]
    pub fn schedule_user(&self, uid: &str, time_zone: &str) -> Result<SchedulePlan, SchedulerError> {
        if uid.is_empty() {
            return Err(SchedulerError::InvalidRequest("uid must not be empty".into()));
        }
        if uid.trim() != uid {
            return Err(SchedulerError::InvalidRequest(format!(
                "uid must not have surrounding whitespace: {uid:?}"
            )));
        }
        let tz = parse_time_zone(time_zone)?;

        let now = truncate_millis(self.clock.now());
        let window_start = local_time_on(now, tz, self.window_start_hour, 0)?;
        let window_end = local_time_on(now, tz, self.window_end_hour, 0)?;

        let mut jobs = Vec::with_capacity(2);
        jobs.push(self.enqueue(uid, time_zone, NotificationSlot::First, now + self.first_delay)?);

        let window_skipped = has_passed_at(window_start, now);
        if window_skipped {
            debug!(%window_start, "notification window already open, skipping window job");
        } else {
            let at = random_instant_between(window_start, window_end);
            jobs.push(self.enqueue(uid, time_zone, NotificationSlot::Window, at)?);
        }

        info!(jobs = jobs.len(), window_skipped, "scheduled user notifications");
        Ok(SchedulePlan {
            jobs,
            window_skipped,
        })
    }

    fn enqueue(
        &self,
        uid: &str,
        time_zone: &str,
        slot: NotificationSlot,
        at: DateTime<Utc>,
    ) -> Result<PlannedJob, SchedulerError> {
        let at = truncate_millis(at);
        let key = slot.key(uid);
        let payload = NotificationPayload {
            uid: uid.to_string(),
            time_zone: time_zone.to_string(),
            scheduled_date: at,
        };

        let id = self
            .store
            .enqueue(NewJob::new(key.clone(), payload, at).with_options(self.options.clone()))?;

        Ok(PlannedJob {
            slot,
            id,
            key,
            scheduled_at: at,
        })
    }
}
