//! Notification collaborator.
//!
//! Owners of a group hear about cleanup runs when the policy asks for it.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::database::models::CleanupPolicy;

/// Owner of a group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Owner {
    pub id: i32,
    pub email: String,
}

/// Outcome of a cleanup run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupOutcome {
    Succeeded {
        deleted_entries_count: i32,
        deleted_size: i64,
    },
    Failed {
        message: String,
    },
}

/// Fire-and-forget notification sink.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        policy: &CleanupPolicy,
        outcome: &CleanupOutcome,
        owner: &Owner,
    ) -> anyhow::Result<()>;
}

/// Lookup of group owners.
#[async_trait]
pub trait OwnerDirectory: Send + Sync {
    async fn owners_of(&self, group_id: i32) -> anyhow::Result<Vec<Owner>>;
}

/// Writes notifications to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(
        &self,
        policy: &CleanupPolicy,
        outcome: &CleanupOutcome,
        owner: &Owner,
    ) -> anyhow::Result<()> {
        match outcome {
            CleanupOutcome::Succeeded {
                deleted_entries_count,
                deleted_size,
            } => info!(
                policy_id = policy.id,
                group_id = policy.group_id,
                owner = %owner.email,
                "cleanup succeeded: {} entries, {} bytes deleted",
                deleted_entries_count,
                deleted_size
            ),
            CleanupOutcome::Failed { message } => info!(
                policy_id = policy.id,
                group_id = policy.group_id,
                owner = %owner.email,
                "cleanup failed: {}",
                message
            ),
        }
        Ok(())
    }
}

/// Fixed owners per group.
#[derive(Debug, Clone, Default)]
pub struct StaticOwners {
    owners: HashMap<i32, Vec<Owner>>,
}

impl StaticOwners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_owner(mut self, group_id: i32, owner: Owner) -> Self {
        self.owners.entry(group_id).or_default().push(owner);
        self
    }
}

#[async_trait]
impl OwnerDirectory for StaticOwners {
    async fn owners_of(&self, group_id: i32) -> anyhow::Result<Vec<Owner>> {
        Ok(self.owners.get(&group_id).cloned().unwrap_or_default())
    }
}
