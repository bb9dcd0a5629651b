//! Dispatcher loop: claims due jobs, executes them and records the outcome.

use std::sync::Arc;
use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::executor::{ExecutionOutcome, Executor};
use crate::store::JobStore;
use crate::time::{Clock, SystemClock};
use crate::{ExecutionError, FailureOutcome, JobRecord, SchedulerConfig, SchedulerError};

/// Minimum sleep between polls.
const MIN_SLEEP_MS: i64 = 10;

/// Initial wait after the store becomes unavailable.
const STORE_RETRY_INITIAL: Duration = Duration::from_secs(1);

/// Longest wait between attempts to reach an unavailable store.
const STORE_RETRY_MAX: Duration = Duration::from_secs(60);

/// What happened to a single claimed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobReport {
    /// Executed successfully and recorded.
    Completed(ExecutionOutcome),
    /// Execution failed and the failure was recorded.
    Failed(FailureOutcome),
    /// The job was superseded or reclaimed while running.
    ClaimLost,
    /// The store could not record the outcome; the claim will expire and the
    /// job will be picked up again.
    Unrecorded,
}

/// Polls the store for due jobs and runs them.
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    executor: Arc<dyn Executor>,
    clock: Arc<dyn Clock>,
    batch_size: usize,
    poll_interval: Duration,
    execution_timeout: Duration,
    /// Upper bound on retrying a completion/failure write.
    record_deadline: Duration,
    store_retry_initial: Duration,
    store_retry_max: Duration,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        executor: Arc<dyn Executor>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            store,
            executor,
            clock: Arc::new(SystemClock),
            batch_size: config.batch_size,
            poll_interval: config.poll_interval(),
            execution_timeout: config.executor_timeout(),
            record_deadline: config.visibility_timeout(),
            store_retry_initial: STORE_RETRY_INITIAL,
            store_retry_max: STORE_RETRY_MAX,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Override the backoff used while the store is unavailable.
    pub fn with_store_retry(mut self, initial: Duration, max: Duration) -> Self {
        self.store_retry_initial = initial;
        self.store_retry_max = max;
        self
    }

    fn store_backoff(&self, max_elapsed: Option<Duration>) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.store_retry_initial,
            max_interval: self.store_retry_max,
            max_elapsed_time: max_elapsed,
            ..Default::default()
        }
    }

    /// Run the dispatcher loop until shutdown is signalled.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        info!("dispatcher starting");
        let mut store_backoff = self.store_backoff(None);

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let wait = match self.run_once().await {
                Ok(processed) => {
                    store_backoff.reset();
                    if processed >= self.batch_size {
                        // More may be due right now
                        continue;
                    }
                    self.calculate_sleep_duration()
                }
                Err(e) => {
                    let wait = store_backoff.next_backoff().unwrap_or(self.store_retry_max);
                    error!(error = %e, retry_in_ms = wait.as_millis() as u64, "failed to claim jobs");
                    wait
                }
            };

            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("dispatcher received shutdown signal");
                    }
                }
                _ = sleep(wait) => {}
            }
        }

        info!("dispatcher shut down gracefully");
    }

    /// Claim one batch of due jobs and execute them in order.
    ///
    /// Returns the number of jobs claimed.
    pub async fn run_once(&self) -> Result<usize, SchedulerError> {
        let jobs = self.store.claim_due(self.batch_size)?;
        let claimed = jobs.len();

        for job in jobs {
            self.execute_job(job).await;
        }

        Ok(claimed)
    }

    /// Execute a claimed job and record the outcome.
    #[tracing::instrument(skip(self, job), fields(job_id = %job.id, key = %job.key, attempt = job.attempt))]
    pub async fn execute_job(&self, job: JobRecord) -> JobReport {
        // Jobs later in a batch may outlive their claim; another worker owns them now
        if job.claim_expired(self.clock.now()) {
            warn!(claimed_until = ?job.claimed_until, "claim expired before execution, skipping");
            return JobReport::ClaimLost;
        }

        debug!("executing job");

        let result = match timeout(self.execution_timeout, self.executor.execute(&job)).await {
            Ok(result) => result,
            Err(_) => Err(ExecutionError::Timeout),
        };

        match result {
            Ok(outcome) => match self.record(|store| store.mark_completed(&job)).await {
                Some(true) => {
                    info!(?outcome, "job completed");
                    JobReport::Completed(outcome)
                }
                Some(false) => JobReport::ClaimLost,
                None => JobReport::Unrecorded,
            },
            Err(failure) => {
                let reason = failure.to_string();
                match self.record(|store| store.mark_failed(&job, &reason)).await {
                    Some(Some(outcome)) => {
                        match &outcome {
                            FailureOutcome::Retrying { attempt, next_run } => warn!(
                                attempt,
                                next_run = %next_run,
                                error = %failure,
                                "job failed, scheduled retry"
                            ),
                            FailureOutcome::Abandoned { attempt } => error!(
                                attempt,
                                error = %failure,
                                "job abandoned after exhausting attempts"
                            ),
                        }
                        JobReport::Failed(outcome)
                    }
                    Some(None) => JobReport::ClaimLost,
                    None => JobReport::Unrecorded,
                }
            }
        }
    }

    /// Run a store write, retrying while the store is unavailable.
    ///
    /// Gives up after the visibility timeout, at which point the claim has
    /// expired anyway.
    async fn record<T, F>(&self, op: F) -> Option<T>
    where
        F: Fn(&dyn JobStore) -> Result<T, SchedulerError>,
    {
        let store = self.store.as_ref();
        let op = &op;
        let result = backoff::future::retry(self.store_backoff(Some(self.record_deadline)), || async move {
            op(store).map_err(|e| {
                if e.is_retryable() {
                    warn!(error = %e, "store write failed, retrying");
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        })
        .await;

        match result {
            Ok(value) => Some(value),
            Err(e) => {
                error!(error = %e, "failed to record job outcome");
                None
            }
        }
    }

    /// How long to sleep before the next poll.
    pub fn calculate_sleep_duration(&self) -> Duration {
        let max_ms = self.poll_interval.as_millis() as i64;
        let next_due = match self.store.next_due_at() {
            Ok(next) => next,
            Err(e) => {
                warn!(error = %e, "failed to read next due time");
                None
            }
        };

        let ms = match next_due {
            Some(next) => (next - self.clock.now())
                .num_milliseconds()
                .clamp(MIN_SLEEP_MS, max_ms.max(MIN_SLEEP_MS)),
            None => max_ms,
        };

        Duration::from_millis(ms as u64)
    }
}

/// Spawn `workers` dispatcher loops sharing one dispatcher.
pub fn spawn_workers(
    dispatcher: Arc<Dispatcher>,
    workers: usize,
    shutdown_rx: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    (0..workers)
        .map(|worker| {
            let dispatcher = Arc::clone(&dispatcher);
            let shutdown_rx = shutdown_rx.clone();
            tokio::spawn(async move {
                debug!(worker, "dispatcher worker started");
                dispatcher.run(shutdown_rx).await;
            })
        })
        .collect()
}
