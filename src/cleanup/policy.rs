use std::sync::Arc;

use chrono::Utc;
use diesel_async::scoped_futures::ScopedFutureExt;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::next_run_at;
use crate::auth::{Action, Actor, Authorizer, Scope};
use crate::database::models::{
    CleanupPolicy, CleanupPolicySettingsChangeset, CleanupPolicyStatus, NewCleanupPolicy,
};
use crate::database::{api, Database};
use crate::errors::LifecycleError;

/// Allowed cadences in days.
pub const CADENCES: [i32; 5] = [1, 7, 14, 30, 90];

/// Upper bound of `keep_n_days_after_download`.
pub const MAX_KEEP_DAYS: i32 = 365;

/// User-provided cleanup policy settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupSettings {
    pub enabled: bool,
    pub cadence_days: i32,
    pub keep_n_days_after_download: i32,
    pub notify_on_success: bool,
    pub notify_on_failure: bool,
}

impl Default for CleanupSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            cadence_days: 7,
            keep_n_days_after_download: 30,
            notify_on_success: false,
            notify_on_failure: false,
        }
    }
}

impl CleanupSettings {
    fn validate(&self) -> Result<(), LifecycleError> {
        let mut errors = Vec::new();
        if !CADENCES.contains(&self.cadence_days) {
            errors.push(format!(
                "cadence must be one of {:?} days",
                CADENCES
            ));
        }
        if !(1..=MAX_KEEP_DAYS).contains(&self.keep_n_days_after_download) {
            errors.push(format!(
                "keep n days after download must be between 1 and {}",
                MAX_KEEP_DAYS
            ));
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(LifecycleError::Validation(errors.join(", ")))
        }
    }
}

/// Management of group cleanup policies.
#[derive(Clone)]
pub struct CleanupPolicyService {
    db: Database,
    authorizer: Arc<dyn Authorizer>,
}

impl CleanupPolicyService {
    pub fn new(db: Database, authorizer: Arc<dyn Authorizer>) -> Self {
        Self { db, authorizer }
    }

    async fn authorize(
        &self,
        actor: &Actor,
        group_id: i32,
        action: Action,
    ) -> Result<(), LifecycleError> {
        if self
            .authorizer
            .is_action_available(actor, Scope::Group(group_id), action)
            .await
        {
            Ok(())
        } else {
            warn!(actor = %actor.username, group_id, "{} is not available", action);
            Err(LifecycleError::Unauthorized)
        }
    }

    /// Create or update the policy of a top-level group.
    ///
    /// Enabling a policy schedules its next run. A disabled policy has no next run.
    pub async fn upsert(
        &self,
        actor: &Actor,
        group_id: i32,
        settings: CleanupSettings,
    ) -> Result<CleanupPolicy, LifecycleError> {
        self.authorize(actor, group_id, Action::UpdateVirtualRegistry)
            .await?;
        settings.validate()?;

        let mut connection = self.db.get().await?;
        let policy = connection
            .immediate_transaction(|conn| {
                async move {
                    let namespace = api::namespaces::get(conn, group_id).await.map_err(|err| {
                        if err.is_not_found() {
                            LifecycleError::NotFound {
                                entity: "group",
                                id: group_id,
                            }
                        } else {
                            err.into()
                        }
                    })?;
                    if namespace.parent_id.is_some() {
                        return Err(LifecycleError::Validation(
                            "cleanup policies can only be set on top-level groups".to_string(),
                        ));
                    }

                    let now = Utc::now();
                    let policy = match api::cleanup_policies::find_by_group(conn, group_id).await? {
                        Some(policy) => {
                            let next = settings.enabled.then(|| {
                                next_run_at(settings.cadence_days, policy.last_run_at, now)
                            });
                            api::cleanup_policies::update_settings(
                                conn,
                                policy.id,
                                &CleanupPolicySettingsChangeset {
                                    enabled: settings.enabled,
                                    cadence_days: settings.cadence_days,
                                    keep_n_days_after_download: settings
                                        .keep_n_days_after_download,
                                    next_run_at: Some(next),
                                    notify_on_success: settings.notify_on_success,
                                    notify_on_failure: settings.notify_on_failure,
                                    updated_at: now,
                                },
                            )
                            .await?
                        }
                        None => {
                            api::cleanup_policies::insert(
                                conn,
                                NewCleanupPolicy {
                                    group_id,
                                    enabled: settings.enabled,
                                    cadence_days: settings.cadence_days,
                                    keep_n_days_after_download: settings
                                        .keep_n_days_after_download,
                                    next_run_at: settings
                                        .enabled
                                        .then(|| next_run_at(settings.cadence_days, None, now)),
                                    status: CleanupPolicyStatus::Scheduled,
                                    notify_on_success: settings.notify_on_success,
                                    notify_on_failure: settings.notify_on_failure,
                                    created_at: now,
                                    updated_at: now,
                                },
                            )
                            .await?
                        }
                    };
                    Ok(policy)
                }
                .scope_boxed()
            })
            .await?;
        info!(
            policy_id = policy.id,
            group_id,
            enabled = policy.enabled,
            "cleanup policy saved, next run at {:?}",
            policy.next_run_at
        );
        Ok(policy)
    }

    pub async fn get(
        &self,
        actor: &Actor,
        group_id: i32,
    ) -> Result<Option<CleanupPolicy>, LifecycleError> {
        self.authorize(actor, group_id, Action::ReadVirtualRegistry)
            .await?;
        let mut conn = self.db.get().await?;
        Ok(api::cleanup_policies::find_by_group(&mut conn, group_id).await?)
    }
}
