use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::database::models::{CacheEntry, CacheEntryStatus};
use crate::database::{api, Database};
use crate::errors::CleanupError;
use crate::object_storage::ObjectStorage;

/// Outcome of a destroyer pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DestroyStats {
    pub destroyed: usize,
    pub failed: usize,
}

/// Physically removes tombstoned cache entries: the blob first, then the row.
pub struct CacheEntryDestroyer {
    db: Database,
    storage: Arc<dyn ObjectStorage>,
    batch_size: i64,
}

impl CacheEntryDestroyer {
    pub fn new(db: Database, storage: Arc<dyn ObjectStorage>, batch_size: i64) -> Self {
        Self {
            db,
            storage,
            batch_size: batch_size.max(1),
        }
    }

    /// Remove every `pending_destruction` entry, batch by batch.
    ///
    /// An entry whose blob cannot be deleted is moved to `error` and left in place.
    pub async fn run_once(&self) -> Result<DestroyStats, CleanupError> {
        let mut stats = DestroyStats::default();
        loop {
            let batch = {
                let mut conn = self.db.get().await?;
                api::cache_entries::with_status(
                    &mut conn,
                    CacheEntryStatus::PendingDestruction,
                    self.batch_size,
                )
                .await?
            };
            if batch.is_empty() {
                break;
            }
            for entry in batch {
                if self.destroy(&entry).await? {
                    stats.destroyed += 1;
                } else {
                    stats.failed += 1;
                }
            }
        }
        info!(
            destroyed = stats.destroyed,
            failed = stats.failed,
            "tombstoned cache entries destroyed"
        );
        Ok(stats)
    }

    /// Run a pass every `period`, logging failed passes.
    ///
    /// This function never returns.
    pub async fn run_every(&self, period: Duration) {
        loop {
            tokio::time::sleep(period).await;
            if let Err(err) = self.run_once().await {
                error!("cache entry destruction failed: {}", err);
            }
        }
    }

    async fn destroy(&self, entry: &CacheEntry) -> Result<bool, CleanupError> {
        let mut conn = self.db.get().await?;
        match self.storage.delete(&entry.object_storage_key).await {
            Ok(existed) => {
                if !existed {
                    debug!(entry_id = entry.id, "blob {} already gone", entry.object_storage_key);
                }
                api::cache_entries::delete(&mut conn, entry.id).await?;
                Ok(true)
            }
            Err(err) => {
                warn!(
                    entry_id = entry.id,
                    "failed to delete blob {}: {}",
                    entry.object_storage_key,
                    err
                );
                api::cache_entries::update_status(
                    &mut conn,
                    entry.id,
                    CacheEntryStatus::Error,
                    Utc::now(),
                )
                .await?;
                Ok(false)
            }
        }
    }
}
