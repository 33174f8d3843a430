//! Cleanup policy engine.
//!
//! Every top-level group may own one [`CleanupPolicy`](crate::database::models::CleanupPolicy).
//! A policy cycles through `scheduled → running → {scheduled, failed}`:
//!
//! * [`CleanupScheduler`] periodically checks whether any policy is due and requests
//!   execution capacity.
//! * [`CleanupWorker`] claims due policies one by one and runs them through a
//!   [`PolicyExecutor`], bounded by `max_running` concurrent executions.
//! * [`CacheEntryDestroyer`] physically removes tombstoned entries and their blobs.
//!
//! # Example
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use vreg::database::Database;
//! # use vreg::object_storage::FileSystemStorage;
//! # async fn run(db: Database, storage: FileSystemStorage) {
//! use vreg::cleanup::{CleanupScheduler, CleanupWorker, RetentionExecutor};
//! use vreg::config::CleanupConfig;
//! use vreg::notify::{LogNotifier, StaticOwners};
//!
//! let config = CleanupConfig::default();
//! let executor = RetentionExecutor::new(db.clone(), config.batch_size);
//! let worker = CleanupWorker::new(
//!     db.clone(),
//!     Arc::new(executor),
//!     Arc::new(LogNotifier),
//!     Arc::new(StaticOwners::new()),
//!     config.clone(),
//! );
//! let scheduler = CleanupScheduler::new(Arc::new(worker));
//! scheduler.run_every(config.enqueue_period()).await;
//! # }
//! ```

use chrono::{DateTime, TimeDelta, Utc};

mod destroyer;
mod executor;
mod policy;
mod scheduler;
mod worker;

pub use destroyer::{CacheEntryDestroyer, DestroyStats};
pub use executor::{CleanupRunStats, KindStats, PolicyExecutor, RetentionExecutor};
pub use policy::{CleanupPolicyService, CleanupSettings, CADENCES, MAX_KEEP_DAYS};
pub use scheduler::{CleanupScheduler, SchedulerTick};
pub use worker::CleanupWorker;

/// Next run of a policy with the given cadence.
///
/// Counted from the last run, or from `now` for a policy which never ran.
pub fn next_run_at(
    cadence_days: i32,
    last_run_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    last_run_at.unwrap_or(now) + TimeDelta::days(cadence_days as i64)
}

/// Cut `message` to at most `max_length` characters.
pub fn truncate_message(message: &str, max_length: usize) -> String {
    message.chars().take(max_length).collect()
}
