use chrono::{DateTime, Utc};
use diesel::sql_types::Bool;
use diesel::sqlite::Sqlite;
use diesel::{
    BoolExpressionMethods, BoxableExpression, ExpressionMethods, NullableExpressionMethods,
    OptionalExtension, QueryDsl, SelectableHelper,
};
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::RunQueryDsl;
use tracing::trace;

use crate::database::models::{
    CleanupPolicy, CleanupPolicySettingsChangeset, CleanupPolicyStatus, CleanupRunChangeset,
    NewCleanupPolicy,
};
use crate::database::schema::cleanup_policies;
use crate::database::{Connection, DatabaseResult};
use crate::errors::DatabaseError;

/// Statuses a policy may be claimed from.
const CLAIMABLE: [CleanupPolicyStatus; 2] =
    [CleanupPolicyStatus::Scheduled, CleanupPolicyStatus::Failed];

pub async fn insert(
    connection: &mut Connection,
    new_policy: NewCleanupPolicy,
) -> DatabaseResult<CleanupPolicy> {
    trace!("INSERT {:?}", new_policy);
    Ok(diesel::insert_into(cleanup_policies::table)
        .values(&new_policy)
        .returning(CleanupPolicy::as_returning())
        .get_result(connection)
        .await?)
}

pub async fn get(connection: &mut Connection, id: i32) -> DatabaseResult<CleanupPolicy> {
    trace!("SELECT cleanup_policy id={}", id);
    Ok(cleanup_policies::table
        .find(id)
        .select(CleanupPolicy::as_select())
        .first(connection)
        .await?)
}

pub async fn find_by_group(
    connection: &mut Connection,
    group_id: i32,
) -> DatabaseResult<Option<CleanupPolicy>> {
    trace!("SELECT cleanup_policy group_id={}", group_id);
    Ok(cleanup_policies::table
        .filter(cleanup_policies::group_id.eq(group_id))
        .select(CleanupPolicy::as_select())
        .first(connection)
        .await
        .optional()?)
}

pub async fn update_settings(
    connection: &mut Connection,
    id: i32,
    changeset: &CleanupPolicySettingsChangeset,
) -> DatabaseResult<CleanupPolicy> {
    trace!("UPDATE cleanup_policy id={}, {:?}", id, changeset);
    Ok(diesel::update(cleanup_policies::table.find(id))
        .set(changeset)
        .returning(CleanupPolicy::as_returning())
        .get_result(connection)
        .await?)
}

/// Due filter: enabled, `next_run_at` reached and either claimable or running since before
/// `stale_before`.
fn runnable(
    now: DateTime<Utc>,
    stale_before: DateTime<Utc>,
) -> Box<dyn BoxableExpression<cleanup_policies::table, Sqlite, SqlType = Bool>> {
    Box::new(
        cleanup_policies::enabled
            .eq(true)
            .and(cleanup_policies::next_run_at.assume_not_null().le(now))
            .and(
                cleanup_policies::status.eq_any(CLAIMABLE).or(cleanup_policies::status
                    .eq(CleanupPolicyStatus::Running)
                    .and(cleanup_policies::updated_at.le(stale_before))),
            ),
    )
}

/// Number of enabled policies due at `now` and not running.
///
/// Policies running since before `stale_before` are counted as abandoned.
pub async fn count_runnable(
    connection: &mut Connection,
    now: DateTime<Utc>,
    stale_before: DateTime<Utc>,
) -> DatabaseResult<i64> {
    trace!("SELECT COUNT(*) runnable cleanup_policies, now={}", now);
    Ok(cleanup_policies::table
        .filter(runnable(now, stale_before))
        .count()
        .get_result(connection)
        .await?)
}

/// Claim the most overdue runnable policy, flipping it to `running`.
///
/// The candidate is selected and conditionally updated inside one immediate transaction,
/// so a policy is handed to at most one caller. A policy left `running` since before
/// `stale_before` is claimed again. Returns `None` when nothing is due.
pub async fn claim_next_runnable(
    connection: &mut Connection,
    now: DateTime<Utc>,
    stale_before: DateTime<Utc>,
) -> DatabaseResult<Option<CleanupPolicy>> {
    let claimed = connection
        .immediate_transaction(|conn| {
            async move {
                let next: Option<i32> = cleanup_policies::table
                    .select(cleanup_policies::id)
                    .filter(runnable(now, stale_before))
                    .order((cleanup_policies::next_run_at.asc(), cleanup_policies::id.asc()))
                    .first(conn)
                    .await
                    .optional()?;
                let Some(id) = next else {
                    return Ok(None);
                };
                let claimed = diesel::update(cleanup_policies::table.find(id))
                    .filter(runnable(now, stale_before))
                    .set((
                        cleanup_policies::status.eq(CleanupPolicyStatus::Running),
                        cleanup_policies::updated_at.eq(now),
                    ))
                    .returning(CleanupPolicy::as_returning())
                    .get_result(conn)
                    .await
                    .optional()?;
                Ok::<_, DatabaseError>(claimed)
            }
            .scope_boxed()
        })
        .await?;
    trace!(
        "UPDATE cleanup_policy status = running, claimed={:?}",
        claimed.as_ref().map(|policy| policy.id)
    );
    Ok(claimed)
}

/// Record the outcome of a run.
pub async fn complete(
    connection: &mut Connection,
    id: i32,
    changeset: &CleanupRunChangeset,
) -> DatabaseResult<CleanupPolicy> {
    trace!("UPDATE cleanup_policy id={}, {:?}", id, changeset);
    Ok(diesel::update(cleanup_policies::table.find(id))
        .set(changeset)
        .returning(CleanupPolicy::as_returning())
        .get_result(connection)
        .await?)
}
