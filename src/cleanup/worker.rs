use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::executor::{CleanupRunStats, PolicyExecutor};
use super::{next_run_at, truncate_message};
use crate::config::CleanupConfig;
use crate::database::models::{CleanupPolicy, CleanupPolicyStatus, CleanupRunChangeset};
use crate::database::{api, Database};
use crate::errors::CleanupError;
use crate::notify::{CleanupOutcome, Notifier, OwnerDirectory};

/// Bounded pool executing due cleanup policies.
///
/// Every unit of work claims exactly one policy, so two slots never run the same policy.
/// A failing policy ends up `failed` and never stops the other slots.
pub struct CleanupWorker {
    db: Database,
    executor: Arc<dyn PolicyExecutor>,
    notifier: Arc<dyn Notifier>,
    owners: Arc<dyn OwnerDirectory>,
    config: CleanupConfig,
    slots: Semaphore,
}

impl CleanupWorker {
    pub fn new(
        db: Database,
        executor: Arc<dyn PolicyExecutor>,
        notifier: Arc<dyn Notifier>,
        owners: Arc<dyn OwnerDirectory>,
        config: CleanupConfig,
    ) -> Self {
        let max_running = config.max_running.max(1);
        Self {
            db,
            executor,
            notifier,
            owners,
            config,
            slots: Semaphore::new(max_running),
        }
    }

    pub fn max_running(&self) -> usize {
        self.config.max_running.max(1)
    }

    /// Number of due policies not running yet.
    pub async fn pending_count(&self) -> Result<i64, CleanupError> {
        let now = Utc::now();
        let mut conn = self.db.get().await?;
        Ok(api::cleanup_policies::count_runnable(&mut conn, now, self.stale_before(now)).await?)
    }

    /// Number of due policies, capped at `max_running + 1`.
    pub async fn remaining_work_count(&self) -> Result<i64, CleanupError> {
        Ok(self.capped(self.pending_count().await?))
    }

    pub fn capped(&self, pending: i64) -> i64 {
        pending.min(self.max_running() as i64 + 1)
    }

    /// Policies running since before this instant are abandoned.
    fn stale_before(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        TimeDelta::from_std(self.config.running_timeout())
            .ok()
            .and_then(|timeout| now.checked_sub_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Claim one due policy and execute it.
    ///
    /// Returns the policy with its recorded outcome, or `None` if nothing was due.
    /// Execution errors are stored on the policy, only storage errors are returned.
    pub async fn perform_work(&self) -> Result<Option<CleanupPolicy>, CleanupError> {
        let claimed = {
            let now = Utc::now();
            let mut conn = self.db.get().await?;
            api::cleanup_policies::claim_next_runnable(&mut conn, now, self.stale_before(now))
                .await?
        };
        let Some(policy) = claimed else {
            debug!("no cleanup policy is due");
            return Ok(None);
        };
        info!(
            policy_id = policy.id,
            group_id = policy.group_id,
            "cleanup policy claimed"
        );

        let result = self.executor.execute(&policy).await;
        let (changeset, outcome) = self.changeset_for(&policy, result);
        let completed = {
            let mut conn = self.db.get().await?;
            api::cleanup_policies::complete(&mut conn, policy.id, &changeset).await?
        };

        let notify = match outcome {
            CleanupOutcome::Succeeded { .. } => completed.notify_on_success,
            CleanupOutcome::Failed { .. } => completed.notify_on_failure,
        };
        if notify {
            self.notify_owners(&completed, &outcome).await;
        }
        Ok(Some(completed))
    }

    fn changeset_for(
        &self,
        policy: &CleanupPolicy,
        result: Result<CleanupRunStats, CleanupError>,
    ) -> (CleanupRunChangeset, CleanupOutcome) {
        let now = Utc::now();
        let next = Some(next_run_at(policy.cadence_days, Some(now), now));
        match result {
            Ok(stats) => {
                let metrics = match stats.detailed_metrics() {
                    Ok(metrics) => Some(metrics),
                    Err(err) => {
                        warn!(policy_id = policy.id, "failed to serialize metrics: {}", err);
                        None
                    }
                };
                (
                    CleanupRunChangeset {
                        status: CleanupPolicyStatus::Scheduled,
                        last_run_at: Some(now),
                        next_run_at: next,
                        last_run_deleted_entries_count: stats.deleted_entries_count,
                        last_run_deleted_size: stats.deleted_size,
                        last_run_detailed_metrics: metrics,
                        failure_message: None,
                        updated_at: now,
                    },
                    CleanupOutcome::Succeeded {
                        deleted_entries_count: stats.deleted_entries_count,
                        deleted_size: stats.deleted_size,
                    },
                )
            }
            Err(err) => {
                error!(policy_id = policy.id, "cleanup policy failed: {}", err);
                let message =
                    truncate_message(&err.to_string(), self.config.failure_message_max_length);
                (
                    CleanupRunChangeset {
                        status: CleanupPolicyStatus::Failed,
                        last_run_at: Some(now),
                        next_run_at: next,
                        last_run_deleted_entries_count: policy.last_run_deleted_entries_count,
                        last_run_deleted_size: policy.last_run_deleted_size,
                        last_run_detailed_metrics: policy.last_run_detailed_metrics.clone(),
                        failure_message: Some(message.clone()),
                        updated_at: now,
                    },
                    CleanupOutcome::Failed { message },
                )
            }
        }
    }

    /// Fire-and-forget: failures are logged.
    async fn notify_owners(&self, policy: &CleanupPolicy, outcome: &CleanupOutcome) {
        let owners = match self.owners.owners_of(policy.group_id).await {
            Ok(owners) => owners,
            Err(err) => {
                warn!(policy_id = policy.id, "failed to list group owners: {:#}", err);
                return;
            }
        };
        for owner in owners {
            if let Err(err) = self.notifier.notify(policy, outcome, &owner).await {
                warn!(
                    policy_id = policy.id,
                    owner = %owner.email,
                    "failed to notify owner: {:#}",
                    err
                );
            }
        }
    }

    /// Run up to `max_running` slots, each performing work until nothing is due.
    ///
    /// Slots are shared between concurrent calls. Returns number of executed policies.
    pub async fn perform_with_capacity(self: &Arc<Self>) -> Result<usize, CleanupError> {
        let mut slots = JoinSet::new();
        for _ in 0..self.max_running() {
            let worker = Arc::clone(self);
            slots.spawn(async move {
                let Ok(_permit) = worker.slots.acquire().await else {
                    return 0;
                };
                let mut performed = 0;
                loop {
                    match worker.perform_work().await {
                        Ok(Some(_)) => performed += 1,
                        Ok(None) => break,
                        Err(err) => {
                            error!("cleanup slot stopped: {}", err);
                            break;
                        }
                    }
                }
                performed
            });
        }

        let mut performed = 0;
        while let Some(result) = slots.join_next().await {
            performed += result?;
        }
        debug!("{} cleanup policies performed", performed);
        Ok(performed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::fixtures::{database, DatabaseFixture};
    use crate::database::models::NewCleanupPolicy;
    use crate::notify::fixtures::RecordingNotifier;
    use crate::notify::{Owner, StaticOwners};
    use async_trait::async_trait;
    use rstest::rstest;
    use tracing_test::traced_test;

    /// Fails for one group, deletes nothing elsewhere.
    struct FailingFor(i32);

    #[async_trait]
    impl PolicyExecutor for FailingFor {
        async fn execute(&self, policy: &CleanupPolicy) -> Result<CleanupRunStats, CleanupError> {
            if policy.group_id == self.0 {
                Err(CleanupError::CustomError("boom ".repeat(100)))
            } else {
                Ok(CleanupRunStats {
                    deleted_entries_count: 3,
                    deleted_size: 300,
                    ..CleanupRunStats::default()
                })
            }
        }
    }

    async fn due_policy(
        database: &DatabaseFixture,
        path: &str,
        next_run_at: DateTime<Utc>,
    ) -> CleanupPolicy {
        let group = database.group(path, None).await;
        let now = Utc::now();
        let mut conn = database.conn().await;
        api::cleanup_policies::insert(
            &mut conn,
            NewCleanupPolicy {
                group_id: group.id,
                enabled: true,
                cadence_days: 7,
                keep_n_days_after_download: 30,
                next_run_at: Some(next_run_at),
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

    fn worker(
        database: &DatabaseFixture,
        executor: impl PolicyExecutor + 'static,
        notifier: Arc<RecordingNotifier>,
        owners: StaticOwners,
    ) -> Arc<CleanupWorker> {
        let config = CleanupConfig::builder()
            .failure_message_max_length(16usize)
            .build()
            .unwrap();
        Arc::new(CleanupWorker::new(
            database.db.clone(),
            Arc::new(executor),
            notifier,
            Arc::new(owners),
            config,
        ))
    }

    async fn reload(database: &DatabaseFixture, policy: &CleanupPolicy) -> CleanupPolicy {
        let mut conn = database.conn().await;
        api::cleanup_policies::get(&mut conn, policy.id).await.unwrap()
    }

    #[rstest]
    #[tokio::test]
    #[traced_test]
    #[awt]
    async fn test_failure_isolation(#[future] database: DatabaseFixture) {
        let now = Utc::now();
        let first = due_policy(&database, "first", now - TimeDelta::hours(3)).await;
        let second = due_policy(&database, "second", now - TimeDelta::hours(2)).await;
        let third = due_policy(&database, "third", now - TimeDelta::hours(1)).await;
        let owner = Owner {
            id: 1,
            email: "owner@example.com".to_string(),
        };
        let owners = StaticOwners::new()
            .with_owner(first.group_id, owner.clone())
            .with_owner(second.group_id, owner.clone());
        let notifier = Arc::new(RecordingNotifier::default());
        let worker = worker(&database, FailingFor(second.group_id), notifier.clone(), owners);

        assert_eq!(worker.remaining_work_count().await.unwrap(), 3);
        let performed = worker.perform_with_capacity().await.unwrap();
        assert_eq!(performed, 3);
        assert_eq!(worker.remaining_work_count().await.unwrap(), 0);

        for policy in [&first, &third] {
            let policy = reload(&database, policy).await;
            assert_eq!(policy.status, CleanupPolicyStatus::Scheduled);
            assert!(policy.last_run_at.unwrap() >= now);
            assert!(policy.next_run_at.unwrap() > now + TimeDelta::days(6));
            assert_eq!(policy.last_run_deleted_entries_count, 3);
            assert_eq!(policy.last_run_deleted_size, 300);
            assert_eq!(policy.failure_message, None);
        }

        let failed = reload(&database, &second).await;
        assert_eq!(failed.status, CleanupPolicyStatus::Failed);
        assert!(failed.last_run_at.unwrap() >= now);
        assert_eq!(failed.failure_message.as_deref(), Some("boom boom boom b"));
        assert!(logs_contain("cleanup policy failed"));

        let mut sent = notifier.sent.lock().await.clone();
        sent.sort_by_key(|(policy_id, _, _)| *policy_id);
        assert_eq!(
            sent,
            vec![
                (
                    first.id,
                    CleanupOutcome::Succeeded {
                        deleted_entries_count: 3,
                        deleted_size: 300
                    },
                    owner.clone()
                ),
                (
                    second.id,
                    CleanupOutcome::Failed {
                        message: "boom boom boom b".to_string()
                    },
                    owner
                ),
            ]
        );
    }

    #[rstest]
    #[tokio::test]
    #[traced_test]
    #[awt]
    async fn test_remaining_work_is_capped(#[future] database: DatabaseFixture) {
        let now = Utc::now();
        for i in 0..5 {
            due_policy(&database, &format!("group-{}", i), now - TimeDelta::hours(1)).await;
        }
        let worker = worker(
            &database,
            FailingFor(0),
            Arc::new(RecordingNotifier::default()),
            StaticOwners::new(),
        );
        assert_eq!(worker.remaining_work_count().await.unwrap(), 3);
    }

    #[rstest]
    #[tokio::test]
    #[traced_test]
    #[awt]
    async fn test_single_policy_performed_once(#[future] database: DatabaseFixture) {
        let policy = due_policy(&database, "group", Utc::now() - TimeDelta::hours(1)).await;
        let worker = worker(
            &database,
            FailingFor(0),
            Arc::new(RecordingNotifier::default()),
            StaticOwners::new(),
        );

        let (a, b) = tokio::join!(worker.perform_work(), worker.perform_work());
        let performed: Vec<_> = [a.unwrap(), b.unwrap()].into_iter().flatten().collect();
        assert_eq!(performed.len(), 1);
        assert_eq!(performed[0].id, policy.id);
        assert!(worker.perform_work().await.unwrap().is_none());
    }

    #[rstest]
    #[tokio::test]
    #[traced_test]
    #[awt]
    async fn test_abandoned_policy_reclaimed(#[future] database: DatabaseFixture) {
        let now = Utc::now();
        let policy = due_policy(&database, "group", now - TimeDelta::days(2)).await;
        let worker = worker(
            &database,
            FailingFor(0),
            Arc::new(RecordingNotifier::default()),
            StaticOwners::new(),
        );

        // Claimed by a worker that never recorded the outcome
        {
            let mut conn = database.conn().await;
            let claimed_at = now - TimeDelta::days(1);
            let claimed = api::cleanup_policies::claim_next_runnable(
                &mut conn,
                claimed_at,
                claimed_at - TimeDelta::hours(6),
            )
            .await
            .unwrap()
            .unwrap();
            assert_eq!(claimed.status, CleanupPolicyStatus::Running);
        }

        assert_eq!(worker.pending_count().await.unwrap(), 1);
        let performed = worker.perform_work().await.unwrap().unwrap();
        assert_eq!(performed.id, policy.id);
        assert_eq!(performed.status, CleanupPolicyStatus::Scheduled);
        assert!(performed.last_run_at.unwrap() >= now);
        assert_eq!(worker.pending_count().await.unwrap(), 0);
    }

    #[rstest]
    #[tokio::test]
    #[traced_test]
    #[awt]
    async fn test_recent_running_policy_left_alone(#[future] database: DatabaseFixture) {
        due_policy(&database, "group", Utc::now() - TimeDelta::hours(1)).await;
        let worker = worker(
            &database,
            FailingFor(0),
            Arc::new(RecordingNotifier::default()),
            StaticOwners::new(),
        );
        {
            let now = Utc::now();
            let mut conn = database.conn().await;
            api::cleanup_policies::claim_next_runnable(&mut conn, now, now - TimeDelta::hours(6))
                .await
                .unwrap()
                .unwrap();
        }
        assert_eq!(worker.pending_count().await.unwrap(), 0);
        assert!(worker.perform_work().await.unwrap().is_none());
    }
}
