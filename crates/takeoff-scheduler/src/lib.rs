//! Durable delayed-notification scheduler for Takeoff.
//!
//! This crate provides:
//! - A SQLite job store with per-key dedup and atomic claims
//! - A dispatcher loop with exponential backoff for failures
//! - An HTTP notifier that skips notifications gone stale during downtime
//! - A planner that turns a user sign-up into notification jobs
//!
//! Delivery is at-least-once: a job claimed by a worker that dies is
//! reclaimed once its visibility timeout elapses.

pub mod config;
pub mod dispatcher;
mod error;
pub mod executor;
pub mod planner;
pub mod store;
pub mod time;
mod types;

pub use config::SchedulerConfig;
pub use dispatcher::{Dispatcher, JobReport, spawn_workers};
pub use error::{ExecutionError, SchedulerError};
pub use executor::{ExecutionOutcome, Executor, HttpNotifier};
pub use planner::{NotificationPlanner, PlannedJob, SchedulePlan};
pub use store::{JobStore, SqliteJobStore};
pub use types::{
    FailureOutcome, JobId, JobOptions, JobRecord, JobState, NewJob, NotificationPayload,
    NotificationSlot, StoreStats, backoff_delay,
};
