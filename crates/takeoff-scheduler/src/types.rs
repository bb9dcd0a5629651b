//! Scheduler types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Largest exponent applied to the backoff base, keeps the delay finite.
const MAX_BACKOFF_EXPONENT: u32 = 30;

/// Store-assigned identity of a job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a job record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for `scheduled_at`.
    #[default]
    Pending,
    /// Claimed by a worker.
    InFlight,
    /// Delivered (or skipped as stale).
    Completed,
    /// Stored record could not be decoded; never retried.
    Failed,
    /// Attempts exhausted; kept for inspection.
    Abandoned,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Pending,
        JobState::InFlight,
        JobState::Completed,
        JobState::Failed,
        JobState::Abandoned,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::InFlight => "in_flight",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Abandoned => "abandoned",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown job state '{s}'"))
    }
}

/// Which daily notification a job delivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationSlot {
    /// Shortly after sign-up.
    First,
    /// Randomly inside the user's evening window.
    Window,
}

impl NotificationSlot {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationSlot::First => "first",
            NotificationSlot::Window => "window",
        }
    }

    /// Dedup key for this slot of `uid`.
    pub fn key(&self, uid: &str) -> String {
        format!("{}:{}", uid, self.as_str())
    }
}

/// Data forwarded to the notification endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
    pub uid: String,
    pub time_zone: String,
    #[serde(with = "iso_millis")]
    pub scheduled_date: DateTime<Utc>,
}

/// Per-job retry and retention options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOptions {
    pub priority: i64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub remove_on_complete: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            max_attempts: 5,
            backoff_base_ms: 2000,
            remove_on_complete: true,
        }
    }
}

/// A job about to be enqueued.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub key: String,
    pub payload: NotificationPayload,
    pub scheduled_at: DateTime<Utc>,
    pub options: JobOptions,
}

impl NewJob {
    pub fn new(key: impl Into<String>, payload: NotificationPayload, scheduled_at: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            payload,
            scheduled_at,
            options: JobOptions::default(),
        }
    }

    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }
}

/// A durable unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    /// Dedup and idempotency key, unique per user slot among active records.
    pub key: String,
    pub payload: NotificationPayload,
    /// When the job becomes eligible to run.
    pub scheduled_at: DateTime<Utc>,
    /// Tie-break among equal `scheduled_at`, lower first.
    pub priority: i64,
    /// Failed attempts so far.
    pub attempt: u32,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub state: JobState,
    pub remove_on_complete: bool,
    pub created_at: DateTime<Utc>,
    /// Token of the current claim, set while in flight.
    pub claim_id: Option<String>,
    /// End of the visibility timeout for an in-flight record.
    pub claimed_until: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl JobRecord {
    /// Whether the claim on this record has lapsed at `now`.
    ///
    /// Once it has, another worker may reclaim the job, so the holder must
    /// not start executing it.
    pub fn claim_expired(&self, now: DateTime<Utc>) -> bool {
        self.claimed_until.is_some_and(|until| until <= now)
    }
}

/// Retry delay after the `attempt`-th failure: `base * 2^(attempt-1)`.
pub fn backoff_delay(backoff_base_ms: u64, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
    let ms = backoff_base_ms.saturating_mul(1u64 << exponent);
    Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX / 1_000_000))
}

/// Result of recording a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Back to pending, due again at `next_run`.
    Retrying {
        attempt: u32,
        next_run: DateTime<Utc>,
    },
    /// No attempts left.
    Abandoned { attempt: u32 },
}

/// Record counts per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub pending: usize,
    pub in_flight: usize,
    pub completed: usize,
    pub failed: usize,
    pub abandoned: usize,
}

impl StoreStats {
    pub fn add(&mut self, state: JobState, count: usize) {
        match state {
            JobState::Pending => self.pending += count,
            JobState::InFlight => self.in_flight += count,
            JobState::Completed => self.completed += count,
            JobState::Failed => self.failed += count,
            JobState::Abandoned => self.abandoned += count,
        }
    }
}

/// Serde adapter for millisecond-precision ISO-8601 UTC strings.
mod iso_millis {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&crate::time::to_iso_string(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let s = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}
