use diesel::{ExpressionMethods, QueryDsl, SelectableHelper};
use diesel_async::RunQueryDsl;
use tracing::trace;

use crate::database::models::{NewRegistry, Registry, RegistryKind};
use crate::database::schema::registries;
use crate::database::{Connection, DatabaseResult};

pub async fn insert(
    connection: &mut Connection,
    new_registry: NewRegistry,
) -> DatabaseResult<Registry> {
    trace!("INSERT {:?}", new_registry);
    Ok(diesel::insert_into(registries::table)
        .values(&new_registry)
        .returning(Registry::as_returning())
        .get_result(connection)
        .await?)
}

pub async fn get(connection: &mut Connection, id: i32) -> DatabaseResult<Registry> {
    trace!("SELECT registry id={}", id);
    Ok(registries::table
        .find(id)
        .select(Registry::as_select())
        .first(connection)
        .await?)
}

/// Number of registries of `kind` under the top-level group.
pub async fn count_in_top_level_group(
    connection: &mut Connection,
    top_level_group_id: i32,
    kind: RegistryKind,
) -> DatabaseResult<i64> {
    trace!(
        "SELECT COUNT(*) top_level_group_id={}, kind={}",
        top_level_group_id,
        kind
    );
    Ok(registries::table
        .filter(registries::top_level_group_id.eq(top_level_group_id))
        .filter(registries::kind.eq(kind))
        .count()
        .get_result(connection)
        .await?)
}

/// Registries owned directly by the namespace, oldest first.
pub async fn list_for_namespace(
    connection: &mut Connection,
    group_id: i32,
    kind: Option<RegistryKind>,
) -> DatabaseResult<Vec<Registry>> {
    trace!("SELECT registries group_id={}, kind={:?}", group_id, kind);
    let mut query = registries::table
        .filter(registries::group_id.eq(group_id))
        .select(Registry::as_select())
        .order(registries::id.asc())
        .into_boxed();
    if let Some(kind) = kind {
        query = query.filter(registries::kind.eq(kind));
    }
    Ok(query.load(connection).await?)
}

/// Returns number of deleted rows. Chain links go with the registry.
pub async fn delete(connection: &mut Connection, id: i32) -> DatabaseResult<usize> {
    trace!("DELETE registry id={}", id);
    Ok(diesel::delete(registries::table.find(id))
        .execute(connection)
        .await?)
}
