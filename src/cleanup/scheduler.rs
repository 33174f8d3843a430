use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info};

use super::worker::CleanupWorker;
use crate::errors::CleanupError;

/// Outcome of one scheduler tick.
#[derive(Debug)]
pub struct SchedulerTick {
    /// Due policies seen by the tick.
    pub pending: i64,

    /// Execution requested by the tick, if anything was due.
    pub execution: Option<JoinHandle<Result<usize, CleanupError>>>,
}

/// Periodic check for due cleanup policies.
///
/// Checking is cheap and decoupled from the deletion work, which runs on the worker pool.
/// Redundant ticks are harmless: policy claims are exclusive.
pub struct CleanupScheduler {
    worker: Arc<CleanupWorker>,
}

impl CleanupScheduler {
    pub fn new(worker: Arc<CleanupWorker>) -> Self {
        Self { worker }
    }

    /// Check once, requesting execution capacity when work is due.
    pub async fn run_once(&self) -> Result<SchedulerTick, CleanupError> {
        let pending = self.worker.pending_count().await?;
        info!(pending_policies = pending, "cleanup policies pending");
        let execution = (self.worker.capped(pending) > 0).then(|| {
            let worker = Arc::clone(&self.worker);
            tokio::spawn(async move { worker.perform_with_capacity().await })
        });
        Ok(SchedulerTick { pending, execution })
    }

    /// Check every `period`.
    ///
    /// This function never returns.
    pub async fn run_every(&self, period: Duration) {
        loop {
            tokio::time::sleep(period).await;
            if let Err(err) = self.run_once().await {
                error!("cleanup scheduling failed: {}", err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleanup::RetentionExecutor;
    use crate::config::CleanupConfig;
    use crate::database::api;
    use crate::database::fixtures::{database, DatabaseFixture};
    use crate::database::models::{
        CacheEntryStatus, CleanupPolicy, CleanupPolicyStatus, NewCleanupPolicy, RegistryKind,
    };
    use crate::notify::{LogNotifier, StaticOwners};
    use chrono::{TimeDelta, Utc};
    use rstest::rstest;
    use tracing_test::traced_test;

    fn scheduler(database: &DatabaseFixture) -> CleanupScheduler {
        let config = CleanupConfig::default();
        let worker = CleanupWorker::new(
            database.db.clone(),
            Arc::new(RetentionExecutor::new(database.db.clone(), config.batch_size)),
            Arc::new(LogNotifier),
            Arc::new(StaticOwners::new()),
            config,
        );
        CleanupScheduler::new(Arc::new(worker))
    }

    async fn policy(
        database: &DatabaseFixture,
        group_id: i32,
        keep_n_days_after_download: i32,
    ) -> CleanupPolicy {
        let now = Utc::now();
        let mut conn = database.conn().await;
        api::cleanup_policies::insert(
            &mut conn,
            NewCleanupPolicy {
                group_id,
                enabled: true,
                cadence_days: 1,
                keep_n_days_after_download,
                next_run_at: Some(now - TimeDelta::minutes(1)),
                status: CleanupPolicyStatus::Scheduled,
                notify_on_success: true,
                notify_on_failure: true,
                created_at: now,
                updated_at: now,
            },
        )
        .await
        .unwrap()
    }

    #[rstest]
    #[tokio::test]
    #[traced_test]
    #[awt]
    async fn test_nothing_due(#[future] database: DatabaseFixture) {
        let tick = scheduler(&database).run_once().await.unwrap();
        assert_eq!(tick.pending, 0);
        assert!(tick.execution.is_none());
        assert!(logs_contain("pending_policies=0"));
    }

    #[rstest]
    #[tokio::test]
    #[traced_test]
    #[awt]
    async fn test_due_policy_executed(#[future] database: DatabaseFixture) {
        let now = Utc::now();
        let group = database.group("gitlab-org", None).await;
        let registry = database.registry(&group, RegistryKind::Maven).await;
        let upstream = database.upstream(&registry, 24).await;
        let entry = database
            .entry_downloaded_at(&upstream, "foo.jar", now - TimeDelta::days(10), 42)
            .await;
        let policy = policy(&database, group.id, 7).await;

        let tick = scheduler(&database).run_once().await.unwrap();
        assert_eq!(tick.pending, 1);
        let performed = tick.execution.unwrap().await.unwrap().unwrap();
        assert_eq!(performed, 1);

        let mut conn = database.conn().await;
        let policy = api::cleanup_policies::get(&mut conn, policy.id).await.unwrap();
        assert_eq!(policy.status, CleanupPolicyStatus::Scheduled);
        assert_eq!(policy.last_run_deleted_entries_count, 1);
        assert_eq!(policy.last_run_deleted_size, 42);
        let entry = api::cache_entries::get(&mut conn, entry.id).await.unwrap();
        assert_eq!(entry.status, CacheEntryStatus::PendingDestruction);
    }

    #[rstest]
    #[tokio::test]
    #[traced_test]
    #[awt]
    async fn test_pending_count_not_capped(#[future] database: DatabaseFixture) {
        for i in 0..6 {
            let group = database.group(&format!("group-{}", i), None).await;
            policy(&database, group.id, 7).await;
        }
        let scheduler = scheduler(&database);
        assert_eq!(scheduler.worker.max_running(), 2);

        let tick = scheduler.run_once().await.unwrap();
        assert_eq!(tick.pending, 6);
        assert!(logs_contain("pending_policies=6"));
        let performed = tick.execution.unwrap().await.unwrap().unwrap();
        assert_eq!(performed, 6);
    }
}
