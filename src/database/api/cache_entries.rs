use chrono::{DateTime, Utc};
use diesel::expression_methods::EscapeExpressionMethods;
use diesel::{
    ExpressionMethods, OptionalExtension, QueryDsl, SelectableHelper, TextExpressionMethods,
};
use diesel_async::RunQueryDsl;
use tracing::trace;

use crate::database::models::{CacheEntry, CacheEntryChangeset, CacheEntryStatus, NewCacheEntry};
use crate::database::schema::cache_entries;
use crate::database::{Connection, DatabaseResult};

/// Raw insert. Consider [`crate::cache::CacheEntryStore::create_or_update`] instead.
pub async fn insert(
    connection: &mut Connection,
    new_entry: NewCacheEntry,
) -> DatabaseResult<CacheEntry> {
    trace!("INSERT {:?}", new_entry);
    Ok(diesel::insert_into(cache_entries::table)
        .values(&new_entry)
        .returning(CacheEntry::as_returning())
        .get_result(connection)
        .await?)
}

pub async fn get(connection: &mut Connection, id: i32) -> DatabaseResult<CacheEntry> {
    trace!("SELECT cache_entry id={}", id);
    Ok(cache_entries::table
        .find(id)
        .select(CacheEntry::as_select())
        .first(connection)
        .await?)
}

/// The live (`default`) entry for `(upstream_id, relative_path)`.
pub async fn find_live(
    connection: &mut Connection,
    upstream_id: i32,
    relative_path: &str,
) -> DatabaseResult<Option<CacheEntry>> {
    trace!(
        "SELECT cache_entry upstream_id={}, relative_path={}",
        upstream_id,
        relative_path
    );
    Ok(cache_entries::table
        .filter(cache_entries::upstream_id.eq(upstream_id))
        .filter(cache_entries::relative_path.eq(relative_path))
        .filter(cache_entries::status.eq(CacheEntryStatus::Default))
        .select(CacheEntry::as_select())
        .first(connection)
        .await
        .optional()?)
}

pub async fn update(
    connection: &mut Connection,
    id: i32,
    changeset: &CacheEntryChangeset,
) -> DatabaseResult<CacheEntry> {
    trace!("UPDATE cache_entry id={}, {:?}", id, changeset);
    Ok(diesel::update(cache_entries::table.find(id))
        .set(changeset)
        .returning(CacheEntry::as_returning())
        .get_result(connection)
        .await?)
}

/// Tombstone the entry in one statement: flip status and append `suffix` to the path.
///
/// Only live and processing entries are affected. Returns number of updated rows.
pub async fn mark_pending_destruction(
    connection: &mut Connection,
    id: i32,
    suffix: &str,
    now: DateTime<Utc>,
) -> DatabaseResult<usize> {
    use cache_entries::{relative_path, status, updated_at};
    trace!(
        "UPDATE cache_entry id={}, status = pending_destruction, relative_path += {}",
        id,
        suffix
    );
    Ok(diesel::update(
        cache_entries::table
            .find(id)
            .filter(status.eq_any([CacheEntryStatus::Default, CacheEntryStatus::Processing])),
    )
    .set((
        status.eq(CacheEntryStatus::PendingDestruction),
        relative_path.eq(relative_path.concat(suffix.to_string())),
        updated_at.eq(now),
    ))
    .execute(connection)
    .await?)
}

/// Atomic `downloads_count += 1` touching `downloaded_at`.
pub async fn bump_downloads_count(
    connection: &mut Connection,
    id: i32,
    now: DateTime<Utc>,
) -> DatabaseResult<CacheEntry> {
    use cache_entries::{downloaded_at, downloads_count};
    let entry: CacheEntry = diesel::update(cache_entries::table.find(id))
        .set((
            downloads_count.eq(downloads_count + 1),
            downloaded_at.eq(now),
        ))
        .returning(CacheEntry::as_returning())
        .get_result(connection)
        .await?;
    trace!(
        "UPDATE cache_entry id={}, downloads count = {}",
        id,
        entry.downloads_count
    );
    Ok(entry)
}

/// Live entries of the upstreams not downloaded since `older_than`.
pub async fn requiring_cleanup(
    connection: &mut Connection,
    upstream_ids: &[i32],
    older_than: DateTime<Utc>,
    limit: i64,
) -> DatabaseResult<Vec<CacheEntry>> {
    trace!(
        "SELECT cache_entries upstream_id IN {:?}, downloaded_at < {}",
        upstream_ids,
        older_than
    );
    Ok(cache_entries::table
        .filter(cache_entries::upstream_id.eq_any(upstream_ids.to_vec()))
        .filter(cache_entries::status.eq(CacheEntryStatus::Default))
        .filter(cache_entries::downloaded_at.lt(older_than))
        .order(cache_entries::id.asc())
        .limit(limit)
        .select(CacheEntry::as_select())
        .load(connection)
        .await?)
}

/// Live entries of the group whose upstream is gone.
pub async fn orphaned(
    connection: &mut Connection,
    group_id: i32,
    limit: i64,
) -> DatabaseResult<Vec<CacheEntry>> {
    trace!("SELECT cache_entries group_id={}, upstream_id IS NULL", group_id);
    Ok(cache_entries::table
        .filter(cache_entries::group_id.eq(group_id))
        .filter(cache_entries::upstream_id.is_null())
        .filter(cache_entries::status.eq(CacheEntryStatus::Default))
        .order(cache_entries::id.asc())
        .limit(limit)
        .select(CacheEntry::as_select())
        .load(connection)
        .await?)
}

/// Live entries of the upstream, ordered by path.
pub async fn live_for_upstream(
    connection: &mut Connection,
    upstream_id: i32,
    limit: i64,
    offset: i64,
) -> DatabaseResult<Vec<CacheEntry>> {
    trace!(
        "SELECT cache_entries upstream_id={}, LIMIT {} OFFSET {}",
        upstream_id,
        limit,
        offset
    );
    Ok(cache_entries::table
        .filter(cache_entries::upstream_id.eq(upstream_id))
        .filter(cache_entries::status.eq(CacheEntryStatus::Default))
        .order(cache_entries::relative_path.asc())
        .limit(limit)
        .offset(offset)
        .select(CacheEntry::as_select())
        .load(connection)
        .await?)
}

/// Live entries of the upstream whose path contains `fragment`.
pub async fn search(
    connection: &mut Connection,
    upstream_id: i32,
    fragment: &str,
    limit: i64,
) -> DatabaseResult<Vec<CacheEntry>> {
    let pattern = format!("%{}%", escape_like(fragment));
    trace!(
        "SELECT cache_entries upstream_id={}, relative_path LIKE {}",
        upstream_id,
        pattern
    );
    Ok(cache_entries::table
        .filter(cache_entries::upstream_id.eq(upstream_id))
        .filter(cache_entries::status.eq(CacheEntryStatus::Default))
        .filter(cache_entries::relative_path.like(pattern).escape('\\'))
        .order(cache_entries::relative_path.asc())
        .limit(limit)
        .select(CacheEntry::as_select())
        .load(connection)
        .await?)
}

/// Entries with the given status, oldest first.
pub async fn with_status(
    connection: &mut Connection,
    status: CacheEntryStatus,
    limit: i64,
) -> DatabaseResult<Vec<CacheEntry>> {
    trace!("SELECT cache_entries status={}", status);
    Ok(cache_entries::table
        .filter(cache_entries::status.eq(status))
        .order(cache_entries::id.asc())
        .limit(limit)
        .select(CacheEntry::as_select())
        .load(connection)
        .await?)
}

pub async fn update_status(
    connection: &mut Connection,
    id: i32,
    status: CacheEntryStatus,
    now: DateTime<Utc>,
) -> DatabaseResult<CacheEntry> {
    trace!("UPDATE cache_entry id={}, status = {}", id, status);
    Ok(diesel::update(cache_entries::table.find(id))
        .set((
            cache_entries::status.eq(status),
            cache_entries::updated_at.eq(now),
        ))
        .returning(CacheEntry::as_returning())
        .get_result(connection)
        .await?)
}

pub async fn delete(connection: &mut Connection, id: i32) -> DatabaseResult<usize> {
    trace!("DELETE cache_entry id={}", id);
    Ok(diesel::delete(cache_entries::table.find(id))
        .execute(connection)
        .await?)
}

/// Escape `LIKE` wildcards with `\`.
fn escape_like(fragment: &str) -> String {
    let mut escaped = String::with_capacity(fragment.len());
    for c in fragment.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
