use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cache::CacheEntryStore;
use crate::database::models::{CacheEntry, CleanupPolicy};
use crate::database::{api, Database};
use crate::errors::CleanupError;

/// Key of the breakdown bucket for entries whose upstream is gone.
const ORPHANED: &str = "orphaned";

/// Deletions of one kind of registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindStats {
    pub deleted_entries_count: i32,
    pub deleted_size: i64,
}

/// Result of one policy execution, summed across every upstream of the group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupRunStats {
    pub deleted_entries_count: i32,
    pub deleted_size: i64,

    /// Per registry kind, plus an `orphaned` bucket.
    pub per_kind: BTreeMap<String, KindStats>,
}

impl CleanupRunStats {
    fn record(&mut self, bucket: &str, entry: &CacheEntry) {
        self.deleted_entries_count += 1;
        self.deleted_size += entry.size;
        let stats = self.per_kind.entry(bucket.to_string()).or_default();
        stats.deleted_entries_count += 1;
        stats.deleted_size += entry.size;
    }

    /// Breakdown stored alongside the policy.
    pub fn detailed_metrics(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.per_kind)
    }
}

/// Executes a claimed cleanup policy.
#[async_trait]
pub trait PolicyExecutor: Send + Sync {
    async fn execute(&self, policy: &CleanupPolicy) -> Result<CleanupRunStats, CleanupError>;
}

/// Tombstones entries not downloaded for `keep_n_days_after_download` days.
///
/// Entries are only tombstoned here. [`CacheEntryDestroyer`](super::CacheEntryDestroyer)
/// removes them for good.
#[derive(Debug, Clone)]
pub struct RetentionExecutor {
    db: Database,
    store: CacheEntryStore,
    batch_size: i64,
}

impl RetentionExecutor {
    pub fn new(db: Database, batch_size: i64) -> Self {
        Self {
            store: CacheEntryStore::new(db.clone()),
            db,
            batch_size: batch_size.max(1),
        }
    }

    async fn tombstone_batch(
        &self,
        bucket: &str,
        entries: Vec<CacheEntry>,
        stats: &mut CleanupRunStats,
    ) -> Result<(), CleanupError> {
        for entry in entries {
            if self.store.mark_as_pending_destruction(&entry).await? {
                stats.record(bucket, &entry);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PolicyExecutor for RetentionExecutor {
    async fn execute(&self, policy: &CleanupPolicy) -> Result<CleanupRunStats, CleanupError> {
        let cutoff = Utc::now() - TimeDelta::days(policy.keep_n_days_after_download as i64);
        let upstreams = {
            let mut conn = self.db.get().await?;
            api::upstreams::list_for_group(&mut conn, policy.group_id).await?
        };
        debug!(
            policy_id = policy.id,
            "cleaning {} upstreams, cutoff {}",
            upstreams.len(),
            cutoff
        );

        let mut stats = CleanupRunStats::default();
        for upstream in &upstreams {
            loop {
                let batch = self
                    .store
                    .requiring_cleanup(&[upstream.id], cutoff, self.batch_size)
                    .await?;
                if batch.is_empty() {
                    break;
                }
                self.tombstone_batch(upstream.kind.as_str(), batch, &mut stats)
                    .await?;
            }
        }

        loop {
            let batch = {
                let mut conn = self.db.get().await?;
                api::cache_entries::orphaned(&mut conn, policy.group_id, self.batch_size).await?
            };
            if batch.is_empty() {
                break;
            }
            self.tombstone_batch(ORPHANED, batch, &mut stats).await?;
        }

        info!(
            policy_id = policy.id,
            group_id = policy.group_id,
            deleted_entries_count = stats.deleted_entries_count,
            deleted_size = stats.deleted_size,
            "cleanup policy executed"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::fixtures::{database, DatabaseFixture};
    use crate::database::models::{
        CacheEntryStatus, CleanupPolicyStatus, NewCleanupPolicy, RegistryKind,
    };
    use rstest::rstest;
    use tracing_test::traced_test;

    async fn policy(database: &DatabaseFixture, group_id: i32, keep_days: i32) -> CleanupPolicy {
        let now = Utc::now();
        let mut conn = database.conn().await;
        api::cleanup_policies::insert(
            &mut conn,
            NewCleanupPolicy {
                group_id,
                enabled: true,
                cadence_days: 1,
                keep_n_days_after_download: keep_days,
                next_run_at: Some(now),
                status: CleanupPolicyStatus::Scheduled,
                notify_on_success: false,
                notify_on_failure: false,
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
    async fn test_retention(#[future] database: DatabaseFixture) {
        let now = Utc::now();
        let group = database.group("gitlab-org", None).await;
        let other = database.group("other", None).await;
        let maven = database.registry(&group, RegistryKind::Maven).await;
        let container = database.registry(&group, RegistryKind::Container).await;
        let maven_upstream = database.upstream(&maven, 24).await;
        let container_upstream = database.upstream(&container, 24).await;
        let other_upstream = database
            .upstream(&database.registry(&other, RegistryKind::Maven).await, 24)
            .await;

        let old = now - TimeDelta::days(31);
        let mut expired = vec![];
        for i in 0..5 {
            expired.push(
                database
                    .entry_downloaded_at(&maven_upstream, &format!("old/{}.jar", i), old, 10)
                    .await,
            );
        }
        expired.push(
            database
                .entry_downloaded_at(&container_upstream, "v2/app/manifests/1", old, 100)
                .await,
        );
        let recent = database
            .entry_downloaded_at(&maven_upstream, "recent.jar", now - TimeDelta::days(29), 10)
            .await;
        let foreign = database
            .entry_downloaded_at(&other_upstream, "old.jar", old, 10)
            .await;

        let policy = policy(&database, group.id, 30).await;
        // Small batches exercise the batching loop
        let stats = RetentionExecutor::new(database.db.clone(), 2)
            .execute(&policy)
            .await
            .unwrap();

        assert_eq!(stats.deleted_entries_count, 6);
        assert_eq!(stats.deleted_size, 150);
        assert_eq!(
            stats.per_kind.get("maven"),
            Some(&KindStats {
                deleted_entries_count: 5,
                deleted_size: 50
            })
        );
        assert_eq!(
            stats.per_kind.get("container"),
            Some(&KindStats {
                deleted_entries_count: 1,
                deleted_size: 100
            })
        );

        let mut conn = database.conn().await;
        for entry in expired {
            let entry = api::cache_entries::get(&mut conn, entry.id).await.unwrap();
            assert_eq!(entry.status, CacheEntryStatus::PendingDestruction);
        }
        for entry in [recent, foreign] {
            let entry = api::cache_entries::get(&mut conn, entry.id).await.unwrap();
            assert_eq!(entry.status, CacheEntryStatus::Default);
        }
    }

    #[rstest]
    #[tokio::test]
    #[traced_test]
    #[awt]
    async fn test_orphans(#[future] database: DatabaseFixture) {
        let group = database.group("gitlab-org", None).await;
        let registry = database.registry(&group, RegistryKind::Maven).await;
        let upstream = database.upstream(&registry, 24).await;
        let entry = database.entry(&upstream, "foo.jar").await;
        {
            let mut conn = database.conn().await;
            api::upstreams::delete(&mut conn, upstream.id).await.unwrap();
        }

        let policy = policy(&database, group.id, 30).await;
        let stats = RetentionExecutor::new(database.db.clone(), 100)
            .execute(&policy)
            .await
            .unwrap();
        assert_eq!(stats.deleted_entries_count, 1);
        assert_eq!(stats.per_kind.get(ORPHANED).unwrap().deleted_size, entry.size);
        assert_eq!(
            stats.detailed_metrics().unwrap(),
            r#"{"orphaned":{"deleted_entries_count":1,"deleted_size":42}}"#
        );
    }
}
