//! Durable job store.
//!
//! Jobs live in a single SQLite table. Every mutation runs inside an
//! `IMMEDIATE` transaction, so several worker processes may share one
//! database file: SQLite serializes writers and each claim is a
//! compare-and-swap on the row state.
//!
//! A partial unique index on `key` restricted to active states backs the
//! dedup invariant: at most one pending or in-flight record per key.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, Transaction, TransactionBehavior, params};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::DEFAULT_VISIBILITY_TIMEOUT_MS;
use crate::time::{Clock, SystemClock};
use crate::types::backoff_delay;
use crate::{
    FailureOutcome, JobId, JobRecord, JobState, NewJob, NotificationPayload, SchedulerError,
    StoreStats,
};

/// How long a connection waits on a lock held by another process.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SELECT_COLUMNS: &str = "id, key, payload, scheduled_at_ms, priority, attempt, max_attempts, \
     backoff_base_ms, state, remove_on_complete, created_at_ms, claim_id, claimed_until_ms, last_error";

/// Storage operations the dispatcher and the planner rely on.
pub trait JobStore: Send + Sync {
    /// Insert a job, superseding any active job with the same key.
    fn enqueue(&self, job: NewJob) -> Result<JobId, SchedulerError>;

    /// Claim up to `limit` due jobs, ordered by `scheduled_at` then `priority`.
    fn claim_due(&self, limit: usize) -> Result<Vec<JobRecord>, SchedulerError>;

    /// Record a successful execution. Returns `false` if the claim was lost.
    fn mark_completed(&self, job: &JobRecord) -> Result<bool, SchedulerError>;

    /// Record a failed execution. Returns `None` if the claim was lost.
    fn mark_failed(
        &self,
        job: &JobRecord,
        reason: &str,
    ) -> Result<Option<FailureOutcome>, SchedulerError>;

    /// Remove any active job with `key`. Returns the number removed.
    fn cancel(&self, key: &str) -> Result<usize, SchedulerError>;

    /// Earliest instant at which some job becomes claimable.
    fn next_due_at(&self) -> Result<Option<DateTime<Utc>>, SchedulerError>;

    /// Record counts per state.
    fn stats(&self) -> Result<StoreStats, SchedulerError>;
}

/// SQLite-backed job store.
pub struct SqliteJobStore {
    conn: Mutex<Connection>,
    clock: Arc<dyn Clock>,
    visibility_timeout: Duration,
}

/// Raw column values, before the payload is decoded.
struct JobRow {
    id: i64,
    key: String,
    payload: String,
    scheduled_at_ms: i64,
    priority: i64,
    attempt: u32,
    max_attempts: u32,
    backoff_base_ms: i64,
    state: String,
    remove_on_complete: bool,
    created_at_ms: i64,
    claim_id: Option<String>,
    claimed_until_ms: Option<i64>,
    last_error: Option<String>,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            key: row.get(1)?,
            payload: row.get(2)?,
            scheduled_at_ms: row.get(3)?,
            priority: row.get(4)?,
            attempt: row.get(5)?,
            max_attempts: row.get(6)?,
            backoff_base_ms: row.get(7)?,
            state: row.get(8)?,
            remove_on_complete: row.get(9)?,
            created_at_ms: row.get(10)?,
            claim_id: row.get(11)?,
            claimed_until_ms: row.get(12)?,
            last_error: row.get(13)?,
        })
    }

    fn into_record(self) -> Result<JobRecord, SchedulerError> {
        let payload: NotificationPayload = serde_json::from_str(&self.payload)?;
        let state = self
            .state
            .parse::<JobState>()
            .map_err(SchedulerError::StoreUnavailable)?;

        Ok(JobRecord {
            id: JobId(self.id),
            key: self.key,
            payload,
            scheduled_at: ms_to_dt(self.scheduled_at_ms)?,
            priority: self.priority,
            attempt: self.attempt,
            max_attempts: self.max_attempts,
            backoff_base_ms: u64::try_from(self.backoff_base_ms).unwrap_or(0),
            state,
            remove_on_complete: self.remove_on_complete,
            created_at: ms_to_dt(self.created_at_ms)?,
            claim_id: self.claim_id,
            claimed_until: self.claimed_until_ms.map(ms_to_dt).transpose()?,
            last_error: self.last_error,
        })
    }
}

fn ms_to_dt(ms: i64) -> Result<DateTime<Utc>, SchedulerError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| SchedulerError::StoreUnavailable(format!("invalid stored timestamp {ms}")))
}

fn dt_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

impl SqliteJobStore {
    /// Open or create the job database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SchedulerError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;

        // WAL lets readers proceed while a worker holds the write lock
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self::init(conn)?;
        info!(path = %path.display(), "job store opened");
        Ok(store)
    }

    /// Open a private in-memory store.
    pub fn open_in_memory() -> Result<Self, SchedulerError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, SchedulerError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                key TEXT NOT NULL,
                payload TEXT NOT NULL,
                scheduled_at_ms INTEGER NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                attempt INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL,
                backoff_base_ms INTEGER NOT NULL,
                state TEXT NOT NULL DEFAULT 'pending',
                remove_on_complete INTEGER NOT NULL DEFAULT 1,
                created_at_ms INTEGER NOT NULL,
                updated_at_ms INTEGER NOT NULL,
                claim_id TEXT,
                claimed_until_ms INTEGER,
                last_error TEXT
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_active_key
                ON jobs(key) WHERE state IN ('pending', 'in_flight');
            CREATE INDEX IF NOT EXISTS idx_jobs_due
                ON jobs(state, scheduled_at_ms, priority);
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            clock: Arc::new(SystemClock),
            visibility_timeout: Duration::from_millis(DEFAULT_VISIBILITY_TIMEOUT_MS),
        })
    }

    /// Use `clock` for every "now" the store computes.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// How long a claim stays valid before the job can be reclaimed.
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, SchedulerError> {
        self.conn
            .lock()
            .map_err(|_| SchedulerError::StoreUnavailable("connection lock poisoned".into()))
    }

    fn now_ms(&self) -> i64 {
        dt_to_ms(self.clock.now())
    }

    /// Get a job by identity.
    pub fn get(&self, id: JobId) -> Result<Option<JobRecord>, SchedulerError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id.0],
                JobRow::from_row,
            )
            .optional()?;
        row.map(JobRow::into_record).transpose()
    }

    /// The pending or in-flight job holding `key`, if any.
    pub fn active_for_key(&self, key: &str) -> Result<Option<JobRecord>, SchedulerError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {SELECT_COLUMNS} FROM jobs
                     WHERE key = ?1 AND state IN ('pending', 'in_flight')"
                ),
                params![key],
                JobRow::from_row,
            )
            .optional()?;
        row.map(JobRow::into_record).transpose()
    }

    /// List jobs in `state`, oldest schedule first.
    ///
    /// Records whose payload cannot be decoded are skipped.
    pub fn list(&self, state: JobState, limit: usize) -> Result<Vec<JobRecord>, SchedulerError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM jobs WHERE state = ?1
             ORDER BY scheduled_at_ms ASC, priority ASC, id ASC LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(params![state.as_str(), limit as i64], JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.id;
            match row.into_record() {
                Ok(job) => jobs.push(job),
                Err(e) => warn!(job_id = id, error = %e, "skipping undecodable job"),
            }
        }
        Ok(jobs)
    }

    /// Return in-flight jobs whose claim expired to pending.
    ///
    /// Called on startup; `claim_due` performs the same recovery on every poll.
    pub fn recover_expired(&self) -> Result<usize, SchedulerError> {
        let now = self.now_ms();
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let recovered = requeue_expired(&tx, now)?;
        tx.commit()?;

        if recovered > 0 {
            info!(count = recovered, "recovered expired in-flight jobs");
        }
        Ok(recovered)
    }

    /// Put an abandoned or failed job back in the queue, due now, with its
    /// attempt counter reset.
    ///
    /// Returns `false` if the job is in any other state.
    #[tracing::instrument(skip(self))]
    pub fn requeue(&self, id: JobId) -> Result<bool, SchedulerError> {
        let now = self.now_ms();
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let found: Option<(String, String)> = tx
            .query_row(
                "SELECT key, state FROM jobs WHERE id = ?1",
                params![id.0],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((key, state)) = found else {
            return Err(SchedulerError::JobNotFound(id.to_string()));
        };

        if state != JobState::Abandoned.as_str() && state != JobState::Failed.as_str() {
            return Ok(false);
        }

        let active: i64 = tx.query_row(
            "SELECT COUNT(*) FROM jobs WHERE key = ?1 AND state IN ('pending', 'in_flight')",
            params![key],
            |row| row.get(0),
        )?;
        if active > 0 {
            return Err(SchedulerError::JobExists(key));
        }

        tx.execute(
            "UPDATE jobs SET state = 'pending', attempt = 0, scheduled_at_ms = ?2,
                 claim_id = NULL, claimed_until_ms = NULL, last_error = NULL, updated_at_ms = ?2
             WHERE id = ?1",
            params![id.0, now],
        )?;
        tx.commit()?;

        info!(job_id = %id, key = %key, "requeued job");
        Ok(true)
    }
}

/// Move expired claims back to pending inside an open transaction.
fn requeue_expired(tx: &Transaction<'_>, now: i64) -> Result<usize, SchedulerError> {
    let count = tx.execute(
        "UPDATE jobs SET state = 'pending', claim_id = NULL, claimed_until_ms = NULL,
             updated_at_ms = ?1
         WHERE state = 'in_flight' AND claimed_until_ms <= ?1",
        params![now],
    )?;
    Ok(count)
}

impl JobStore for SqliteJobStore {
    #[tracing::instrument(skip(self, job), fields(key = %job.key))]
    fn enqueue(&self, job: NewJob) -> Result<JobId, SchedulerError> {
        let payload = serde_json::to_string(&job.payload)?;
        let now = self.now_ms();
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let superseded = tx.execute(
            "DELETE FROM jobs WHERE key = ?1 AND state IN ('pending', 'in_flight')",
            params![job.key],
        )?;

        tx.execute(
            "INSERT INTO jobs
             (key, payload, scheduled_at_ms, priority, attempt, max_attempts, backoff_base_ms,
              state, remove_on_complete, created_at_ms, updated_at_ms)
             VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, 'pending', ?7, ?8, ?8)",
            params![
                job.key,
                payload,
                dt_to_ms(job.scheduled_at),
                job.options.priority,
                job.options.max_attempts,
                job.options.backoff_base_ms as i64,
                job.options.remove_on_complete,
                now,
            ],
        )?;
        let id = JobId(tx.last_insert_rowid());
        tx.commit()?;

        if superseded > 0 {
            info!(job_id = %id, superseded, "superseded active job with same key");
        }
        debug!(job_id = %id, scheduled_at = %job.scheduled_at, "enqueued job");
        Ok(id)
    }

    fn claim_due(&self, limit: usize) -> Result<Vec<JobRecord>, SchedulerError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let now = self.now_ms();
        let claimed_until = now.saturating_add(self.visibility_timeout.as_millis() as i64);
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let recovered = requeue_expired(&tx, now)?;
        if recovered > 0 {
            warn!(count = recovered, "reclaiming jobs whose claim expired");
        }

        let rows = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM jobs
                 WHERE state = 'pending' AND scheduled_at_ms <= ?1
                 ORDER BY scheduled_at_ms ASC, priority ASC, id ASC
                 LIMIT ?2"
            ))?;
            stmt.query_map(params![now, limit as i64], JobRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?
        };

        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.id;
            let mut job = match row.into_record() {
                Ok(job) => job,
                Err(e) => {
                    warn!(job_id = id, error = %e, "marking undecodable job as failed");
                    tx.execute(
                        "UPDATE jobs SET state = 'failed', last_error = ?2, updated_at_ms = ?3
                         WHERE id = ?1",
                        params![id, e.to_string(), now],
                    )?;
                    continue;
                }
            };

            let claim_id = Uuid::new_v4().to_string();
            let updated = tx.execute(
                "UPDATE jobs SET state = 'in_flight', claim_id = ?2, claimed_until_ms = ?3,
                     updated_at_ms = ?4
                 WHERE id = ?1 AND state = 'pending'",
                params![id, claim_id, claimed_until, now],
            )?;
            if updated != 1 {
                continue;
            }

            job.state = JobState::InFlight;
            job.claim_id = Some(claim_id);
            job.claimed_until = Some(ms_to_dt(claimed_until)?);
            claimed.push(job);
        }
        tx.commit()?;

        if !claimed.is_empty() {
            debug!(count = claimed.len(), "claimed due jobs");
        }
        Ok(claimed)
    }

    fn mark_completed(&self, job: &JobRecord) -> Result<bool, SchedulerError> {
        let now = self.now_ms();
        let conn = self.lock()?;

        let updated = if job.remove_on_complete {
            conn.execute(
                "DELETE FROM jobs WHERE id = ?1 AND state = 'in_flight' AND claim_id = ?2",
                params![job.id.0, job.claim_id],
            )?
        } else {
            conn.execute(
                "UPDATE jobs SET state = 'completed', claim_id = NULL, claimed_until_ms = NULL,
                     updated_at_ms = ?3
                 WHERE id = ?1 AND state = 'in_flight' AND claim_id = ?2",
                params![job.id.0, job.claim_id, now],
            )?
        };

        if updated == 0 {
            warn!(job_id = %job.id, key = %job.key, "completion ignored, claim no longer held");
        }
        Ok(updated > 0)
    }

    fn mark_failed(
        &self,
        job: &JobRecord,
        reason: &str,
    ) -> Result<Option<FailureOutcome>, SchedulerError> {
        let now = self.clock.now();
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current: Option<(u32, u32, i64)> = tx
            .query_row(
                "SELECT attempt, max_attempts, backoff_base_ms FROM jobs
                 WHERE id = ?1 AND state = 'in_flight' AND claim_id = ?2",
                params![job.id.0, job.claim_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let Some((attempt, max_attempts, backoff_base_ms)) = current else {
            warn!(job_id = %job.id, key = %job.key, "failure ignored, claim no longer held");
            return Ok(None);
        };

        let attempt = attempt + 1;
        let outcome = if attempt >= max_attempts {
            tx.execute(
                "UPDATE jobs SET state = 'abandoned', attempt = ?2, last_error = ?3,
                     claim_id = NULL, claimed_until_ms = NULL, updated_at_ms = ?4
                 WHERE id = ?1",
                params![job.id.0, attempt, reason, dt_to_ms(now)],
            )?;
            FailureOutcome::Abandoned { attempt }
        } else {
            let base = u64::try_from(backoff_base_ms).unwrap_or(0);
            let next_run = now + backoff_delay(base, attempt);
            tx.execute(
                "UPDATE jobs SET state = 'pending', attempt = ?2, scheduled_at_ms = ?3,
                     last_error = ?4, claim_id = NULL, claimed_until_ms = NULL, updated_at_ms = ?5
                 WHERE id = ?1",
                params![job.id.0, attempt, dt_to_ms(next_run), reason, dt_to_ms(now)],
            )?;
            FailureOutcome::Retrying { attempt, next_run }
        };
        tx.commit()?;

        Ok(Some(outcome))
    }

    fn cancel(&self, key: &str) -> Result<usize, SchedulerError> {
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM jobs WHERE key = ?1 AND state IN ('pending', 'in_flight')",
            params![key],
        )?;

        if removed > 0 {
            info!(key, removed, "cancelled job");
        }
        Ok(removed)
    }

    fn next_due_at(&self) -> Result<Option<DateTime<Utc>>, SchedulerError> {
        let conn = self.lock()?;
        let next: Option<i64> = conn.query_row(
            "SELECT MIN(due) FROM (
                 SELECT MIN(scheduled_at_ms) AS due FROM jobs WHERE state = 'pending'
                 UNION ALL
                 SELECT MIN(claimed_until_ms) AS due FROM jobs WHERE state = 'in_flight'
             )",
            [],
            |row| row.get(0),
        )?;
        next.map(ms_to_dt).transpose()
    }

    fn stats(&self) -> Result<StoreStats, SchedulerError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM jobs GROUP BY state")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stats = StoreStats::default();
        for (state, count) in rows {
            match state.parse::<JobState>() {
                Ok(state) => stats.add(state, count as usize),
                Err(e) => warn!(error = %e, "ignoring unknown state in stats"),
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;
    use crate::{JobOptions, NotificationPayload};
    use chrono::Duration as ChronoDuration;
    use pretty_assertions::assert_eq;

    fn start() -> DateTime<Utc> {
        DateTime::from_timestamp_millis(1_704_067_200_000).unwrap()
    }

    fn setup() -> (SqliteJobStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start()));
        let store = SqliteJobStore::open_in_memory()
            .unwrap()
            .with_clock(clock.clone());
        (store, clock)
    }

    fn new_job(key: &str, at: DateTime<Utc>) -> NewJob {
        NewJob::new(
            key,
            NotificationPayload {
                uid: key.split(':').next().unwrap().to_string(),
                time_zone: "UTC".to_string(),
                scheduled_date: at,
            },
            at,
        )
    }

    #[test]
    fn test_enqueue_and_get() {
        let (store, _) = setup();
        let at = start() + ChronoDuration::minutes(2);
        let id = store.enqueue(new_job("u1:first", at)).unwrap();

        let job = store.get(id).unwrap().unwrap();
        assert_eq!(job.key, "u1:first");
        assert_eq!(job.scheduled_at, at);
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempt, 0);
        assert_eq!(job.max_attempts, 5);
        assert_eq!(job.backoff_base_ms, 2000);
        assert_eq!(job.created_at, start());
        assert!(job.claim_id.is_none());
    }

    #[test]
    fn test_enqueue_supersedes_same_key() {
        let (store, _) = setup();
        let first = store
            .enqueue(new_job("u1:first", start() + ChronoDuration::minutes(2)))
            .unwrap();
        let second = store
            .enqueue(new_job("u1:first", start() + ChronoDuration::minutes(5)))
            .unwrap();

        assert_ne!(first, second);
        assert!(store.get(first).unwrap().is_none());
        let active = store.active_for_key("u1:first").unwrap().unwrap();
        assert_eq!(active.id, second);
        assert_eq!(store.stats().unwrap().pending, 1);
    }

    #[test]
    fn test_claim_due_skips_future_jobs() {
        let (store, _) = setup();
        store
            .enqueue(new_job("u1:first", start() + ChronoDuration::seconds(1)))
            .unwrap();

        assert!(store.claim_due(10).unwrap().is_empty());
    }

    #[test]
    fn test_claim_due_orders_by_time_then_priority() {
        let (store, clock) = setup();
        let at = start();
        let late = store
            .enqueue(new_job("late:first", at + ChronoDuration::seconds(2)))
            .unwrap();
        let low = store
            .enqueue(new_job("low:first", at).with_options(JobOptions {
                priority: 5,
                ..Default::default()
            }))
            .unwrap();
        let high = store
            .enqueue(new_job("high:first", at).with_options(JobOptions {
                priority: -1,
                ..Default::default()
            }))
            .unwrap();

        clock.advance(ChronoDuration::seconds(10));
        let ids: Vec<JobId> = store.claim_due(10).unwrap().iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![high, low, late]);
    }

    #[test]
    fn test_claim_is_exclusive() {
        let (store, _) = setup();
        store.enqueue(new_job("u1:first", start())).unwrap();

        let claimed = store.claim_due(10).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].state, JobState::InFlight);
        assert!(claimed[0].claim_id.is_some());
        assert_eq!(
            claimed[0].claimed_until,
            Some(start() + ChronoDuration::seconds(30))
        );

        assert!(store.claim_due(10).unwrap().is_empty());
    }

    #[test]
    fn test_claim_respects_limit() {
        let (store, _) = setup();
        for i in 0..5 {
            store.enqueue(new_job(&format!("u{i}:first"), start())).unwrap();
        }
        assert_eq!(store.claim_due(2).unwrap().len(), 2);
        assert_eq!(store.claim_due(10).unwrap().len(), 3);
        assert!(store.claim_due(0).unwrap().is_empty());
    }

    #[test]
    fn test_mark_completed_removes_record() {
        let (store, _) = setup();
        let id = store.enqueue(new_job("u1:first", start())).unwrap();
        let job = store.claim_due(1).unwrap().remove(0);

        assert!(store.mark_completed(&job).unwrap());
        assert!(store.get(id).unwrap().is_none());
    }

    #[test]
    fn test_mark_completed_keeps_record_when_asked() {
        let (store, _) = setup();
        let id = store
            .enqueue(new_job("u1:first", start()).with_options(JobOptions {
                remove_on_complete: false,
                ..Default::default()
            }))
            .unwrap();
        let job = store.claim_due(1).unwrap().remove(0);

        assert!(store.mark_completed(&job).unwrap());
        let stored = store.get(id).unwrap().unwrap();
        assert_eq!(stored.state, JobState::Completed);
        assert!(stored.claim_id.is_none());

        // A completed record does not block a new job for the same key
        store.enqueue(new_job("u1:first", start())).unwrap();
        assert_eq!(store.stats().unwrap().completed, 1);
        assert_eq!(store.stats().unwrap().pending, 1);
    }

    #[test]
    fn test_mark_failed_reschedules_with_backoff() {
        let (store, clock) = setup();
        let id = store.enqueue(new_job("u1:first", start())).unwrap();
        let job = store.claim_due(1).unwrap().remove(0);

        let outcome = store.mark_failed(&job, "timeout").unwrap().unwrap();
        let expected_next = clock.now() + ChronoDuration::milliseconds(2000);
        assert_eq!(
            outcome,
            FailureOutcome::Retrying {
                attempt: 1,
                next_run: expected_next
            }
        );

        let stored = store.get(id).unwrap().unwrap();
        assert_eq!(stored.state, JobState::Pending);
        assert_eq!(stored.attempt, 1);
        assert_eq!(stored.scheduled_at, expected_next);
        assert_eq!(stored.last_error.as_deref(), Some("timeout"));
    }

    #[test]
    fn test_failures_abandon_after_max_attempts() {
        let (store, clock) = setup();
        let id = store.enqueue(new_job("u1:first", start())).unwrap();

        let mut delays = Vec::new();
        for expected_attempt in 1..=5u32 {
            let before = clock.now();
            let job = store.claim_due(1).unwrap().remove(0);
            match store.mark_failed(&job, "boom").unwrap().unwrap() {
                FailureOutcome::Retrying { attempt, next_run } => {
                    assert_eq!(attempt, expected_attempt);
                    delays.push((next_run - before).num_milliseconds());
                    clock.set(next_run);
                }
                FailureOutcome::Abandoned { attempt } => {
                    assert_eq!(attempt, 5);
                    assert_eq!(expected_attempt, 5);
                }
            }
        }

        assert_eq!(delays, vec![2000, 4000, 8000, 16000]);
        let stored = store.get(id).unwrap().unwrap();
        assert_eq!(stored.state, JobState::Abandoned);
        assert_eq!(stored.attempt, 5);

        clock.advance(ChronoDuration::hours(1));
        assert!(store.claim_due(10).unwrap().is_empty());
        assert_eq!(store.list(JobState::Abandoned, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_superseded_claim_cannot_touch_replacement() {
        let (store, _) = setup();
        store.enqueue(new_job("u1:first", start())).unwrap();
        let stale = store.claim_due(1).unwrap().remove(0);

        let replacement = store.enqueue(new_job("u1:first", start())).unwrap();
        assert!(!store.mark_completed(&stale).unwrap());
        assert!(store.mark_failed(&stale, "late").unwrap().is_none());

        let active = store.active_for_key("u1:first").unwrap().unwrap();
        assert_eq!(active.id, replacement);
        assert_eq!(active.state, JobState::Pending);
    }

    #[test]
    fn test_expired_claim_is_reclaimed() {
        let (store, clock) = setup();
        let id = store.enqueue(new_job("u1:first", start())).unwrap();
        let first = store.claim_due(1).unwrap().remove(0);

        clock.advance(ChronoDuration::seconds(29));
        assert!(store.claim_due(1).unwrap().is_empty());

        clock.advance(ChronoDuration::seconds(1));
        let second = store.claim_due(1).unwrap().remove(0);
        assert_eq!(second.id, id);
        assert_eq!(second.attempt, 0, "recovery does not count as an attempt");
        assert_ne!(second.claim_id, first.claim_id);

        // The crashed worker's late completion is ignored
        assert!(!store.mark_completed(&first).unwrap());
        assert!(store.mark_completed(&second).unwrap());
    }

    #[test]
    fn test_recover_expired() {
        let (store, clock) = setup();
        store.enqueue(new_job("u1:first", start())).unwrap();
        store.claim_due(1).unwrap();

        assert_eq!(store.recover_expired().unwrap(), 0);
        clock.advance(ChronoDuration::minutes(1));
        assert_eq!(store.recover_expired().unwrap(), 1);
        assert_eq!(store.stats().unwrap().pending, 1);
    }

    #[test]
    fn test_cancel() {
        let (store, _) = setup();
        store.enqueue(new_job("u1:first", start())).unwrap();
        store.enqueue(new_job("u1:window", start())).unwrap();

        assert_eq!(store.cancel("u1:first").unwrap(), 1);
        assert_eq!(store.cancel("u1:first").unwrap(), 0);
        assert!(store.active_for_key("u1:window").unwrap().is_some());
    }

    #[test]
    fn test_next_due_at() {
        let (store, _) = setup();
        assert_eq!(store.next_due_at().unwrap(), None);

        let soon = start() + ChronoDuration::seconds(5);
        store.enqueue(new_job("a:first", soon)).unwrap();
        store
            .enqueue(new_job("b:first", start() + ChronoDuration::minutes(5)))
            .unwrap();
        assert_eq!(store.next_due_at().unwrap(), Some(soon));
    }

    #[test]
    fn test_requeue_abandoned() {
        let (store, _) = setup();
        let id = store
            .enqueue(new_job("u1:first", start()).with_options(JobOptions {
                max_attempts: 1,
                ..Default::default()
            }))
            .unwrap();
        let job = store.claim_due(1).unwrap().remove(0);
        assert_eq!(
            store.mark_failed(&job, "down").unwrap(),
            Some(FailureOutcome::Abandoned { attempt: 1 })
        );

        assert!(store.requeue(id).unwrap());
        let stored = store.get(id).unwrap().unwrap();
        assert_eq!(stored.state, JobState::Pending);
        assert_eq!(stored.attempt, 0);
        assert!(stored.last_error.is_none());

        // Already pending, nothing to do
        assert!(!store.requeue(id).unwrap());
        assert!(matches!(
            store.requeue(JobId(999)),
            Err(SchedulerError::JobNotFound(_))
        ));
    }

    #[test]
    fn test_requeue_refuses_when_key_is_active() {
        let (store, _) = setup();
        let id = store
            .enqueue(new_job("u1:first", start()).with_options(JobOptions {
                max_attempts: 1,
                ..Default::default()
            }))
            .unwrap();
        let job = store.claim_due(1).unwrap().remove(0);
        store.mark_failed(&job, "down").unwrap();
        store.enqueue(new_job("u1:first", start())).unwrap();

        assert!(matches!(
            store.requeue(id),
            Err(SchedulerError::JobExists(key)) if key == "u1:first"
        ));
    }

    #[test]
    fn test_undecodable_payload_marked_failed() {
        let (store, _) = setup();
        let id = store.enqueue(new_job("u1:first", start())).unwrap();
        store.enqueue(new_job("u2:first", start())).unwrap();
        store
            .lock()
            .unwrap()
            .execute(
                "UPDATE jobs SET payload = 'not json' WHERE id = ?1",
                params![id.0],
            )
            .unwrap();

        let claimed = store.claim_due(10).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].key, "u2:first");
        assert_eq!(store.stats().unwrap().failed, 1);
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        let clock = Arc::new(ManualClock::new(start()));

        let id = {
            let store = SqliteJobStore::open(&path).unwrap().with_clock(clock.clone());
            let id = store.enqueue(new_job("u1:first", start())).unwrap();
            store.claim_due(1).unwrap();
            id
        };

        // Simulated crash while in flight: the claim expires and the job is recovered
        clock.advance(ChronoDuration::minutes(1));
        let store = SqliteJobStore::open(&path).unwrap().with_clock(clock);
        assert_eq!(store.recover_expired().unwrap(), 1);
        let job = store.claim_due(1).unwrap().remove(0);
        assert_eq!(job.id, id);
    }
}
