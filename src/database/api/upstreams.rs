use diesel::{ExpressionMethods, QueryDsl, SelectableHelper};
use diesel_async::RunQueryDsl;
use tracing::trace;

use crate::database::models::{NewUpstream, Upstream};
use crate::database::schema::{registry_upstreams, upstreams};
use crate::database::{Connection, DatabaseResult};

pub async fn insert(
    connection: &mut Connection,
    new_upstream: NewUpstream,
) -> DatabaseResult<Upstream> {
    trace!("INSERT upstream {} ({})", new_upstream.name, new_upstream.url);
    Ok(diesel::insert_into(upstreams::table)
        .values(&new_upstream)
        .returning(Upstream::as_returning())
        .get_result(connection)
        .await?)
}

pub async fn get(connection: &mut Connection, id: i32) -> DatabaseResult<Upstream> {
    trace!("SELECT upstream id={}", id);
    Ok(upstreams::table
        .find(id)
        .select(Upstream::as_select())
        .first(connection)
        .await?)
}

/// Upstreams owned by the top-level group.
pub async fn list_for_group(
    connection: &mut Connection,
    group_id: i32,
) -> DatabaseResult<Vec<Upstream>> {
    trace!("SELECT upstreams group_id={}", group_id);
    Ok(upstreams::table
        .filter(upstreams::group_id.eq(group_id))
        .order(upstreams::id.asc())
        .select(Upstream::as_select())
        .load(connection)
        .await?)
}

/// Resolution chain of the registry: upstreams ordered by position.
pub async fn ordered_for_registry(
    connection: &mut Connection,
    registry_id: i32,
) -> DatabaseResult<Vec<Upstream>> {
    trace!("SELECT upstreams registry_id={} ORDER BY position", registry_id);
    Ok(upstreams::table
        .inner_join(registry_upstreams::table)
        .filter(registry_upstreams::registry_id.eq(registry_id))
        .order(registry_upstreams::position.asc())
        .select(Upstream::as_select())
        .load(connection)
        .await?)
}

/// Cached entries keep their rows, `upstream_id` becomes `NULL`.
pub async fn delete(connection: &mut Connection, id: i32) -> DatabaseResult<usize> {
    trace!("DELETE upstream id={}", id);
    Ok(diesel::delete(upstreams::table.find(id))
        .execute(connection)
        .await?)
}
