use diesel::{ExpressionMethods, OptionalExtension, QueryDsl, SelectableHelper};
use diesel_async::RunQueryDsl;
use tracing::trace;

use crate::database::models::{NewRegistryUpstream, RegistryUpstream, Upstream};
use crate::database::schema::{registry_upstreams, upstreams};
use crate::database::{Connection, DatabaseResult};

pub async fn insert(
    connection: &mut Connection,
    new_link: NewRegistryUpstream,
) -> DatabaseResult<RegistryUpstream> {
    trace!("INSERT {:?}", new_link);
    Ok(diesel::insert_into(registry_upstreams::table)
        .values(&new_link)
        .returning(RegistryUpstream::as_returning())
        .get_result(connection)
        .await?)
}

pub async fn get(connection: &mut Connection, id: i32) -> DatabaseResult<RegistryUpstream> {
    trace!("SELECT registry_upstream id={}", id);
    Ok(registry_upstreams::table
        .find(id)
        .select(RegistryUpstream::as_select())
        .first(connection)
        .await?)
}

pub async fn find(
    connection: &mut Connection,
    registry_id: i32,
    upstream_id: i32,
) -> DatabaseResult<Option<RegistryUpstream>> {
    trace!(
        "SELECT registry_upstream registry_id={}, upstream_id={}",
        registry_id,
        upstream_id
    );
    Ok(registry_upstreams::table
        .filter(registry_upstreams::registry_id.eq(registry_id))
        .filter(registry_upstreams::upstream_id.eq(upstream_id))
        .select(RegistryUpstream::as_select())
        .first(connection)
        .await
        .optional()?)
}

/// Highest position in the chain, `0` for an empty chain.
pub async fn max_position(connection: &mut Connection, registry_id: i32) -> DatabaseResult<i32> {
    trace!("SELECT MAX(position) registry_id={}", registry_id);
    let position: Option<i32> = registry_upstreams::table
        .filter(registry_upstreams::registry_id.eq(registry_id))
        .select(diesel::dsl::max(registry_upstreams::position))
        .first(connection)
        .await?;
    Ok(position.unwrap_or(0))
}

pub async fn count_for_registry(
    connection: &mut Connection,
    registry_id: i32,
) -> DatabaseResult<i64> {
    trace!("SELECT COUNT(*) registry_id={}", registry_id);
    Ok(registry_upstreams::table
        .filter(registry_upstreams::registry_id.eq(registry_id))
        .count()
        .get_result(connection)
        .await?)
}

/// Links of the registry ordered by position.
pub async fn list_for_registry(
    connection: &mut Connection,
    registry_id: i32,
) -> DatabaseResult<Vec<RegistryUpstream>> {
    trace!("SELECT registry_upstreams registry_id={}", registry_id);
    Ok(registry_upstreams::table
        .filter(registry_upstreams::registry_id.eq(registry_id))
        .order(registry_upstreams::position.asc())
        .select(RegistryUpstream::as_select())
        .load(connection)
        .await?)
}

/// Links of the registry joined with their upstreams, ordered by position.
pub async fn chain_for_registry(
    connection: &mut Connection,
    registry_id: i32,
) -> DatabaseResult<Vec<(RegistryUpstream, Upstream)>> {
    trace!("SELECT registry_upstreams JOIN upstreams registry_id={}", registry_id);
    Ok(registry_upstreams::table
        .inner_join(upstreams::table)
        .filter(registry_upstreams::registry_id.eq(registry_id))
        .order((registry_upstreams::position.asc(), registry_upstreams::id.asc()))
        .select((RegistryUpstream::as_select(), Upstream::as_select()))
        .load(connection)
        .await?)
}

/// Every chain link pointing at the upstream.
pub async fn list_for_upstream(
    connection: &mut Connection,
    upstream_id: i32,
) -> DatabaseResult<Vec<RegistryUpstream>> {
    trace!("SELECT registry_upstreams upstream_id={}", upstream_id);
    Ok(registry_upstreams::table
        .filter(registry_upstreams::upstream_id.eq(upstream_id))
        .order(registry_upstreams::id.asc())
        .select(RegistryUpstream::as_select())
        .load(connection)
        .await?)
}

/// Add `delta` to every position of the chain within `from..=to`.
pub async fn shift_positions(
    connection: &mut Connection,
    registry_id: i32,
    from: i32,
    to: i32,
    delta: i32,
) -> DatabaseResult<usize> {
    trace!(
        "UPDATE registry_id={}, position in {}..={}, position += {}",
        registry_id,
        from,
        to,
        delta
    );
    use registry_upstreams::position;
    Ok(diesel::update(
        registry_upstreams::table
            .filter(registry_upstreams::registry_id.eq(registry_id))
            .filter(position.ge(from))
            .filter(position.le(to)),
    )
    .set(position.eq(position + delta))
    .execute(connection)
    .await?)
}

pub async fn set_position(
    connection: &mut Connection,
    id: i32,
    position: i32,
) -> DatabaseResult<RegistryUpstream> {
    trace!("UPDATE registry_upstream id={}, position = {}", id, position);
    Ok(diesel::update(registry_upstreams::table.find(id))
        .set(registry_upstreams::position.eq(position))
        .returning(RegistryUpstream::as_returning())
        .get_result(connection)
        .await?)
}

pub async fn delete(connection: &mut Connection, id: i32) -> DatabaseResult<usize> {
    trace!("DELETE registry_upstream id={}", id);
    Ok(diesel::delete(registry_upstreams::table.find(id))
        .execute(connection)
        .await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::fixtures::{database, DatabaseFixture};
    use crate::database::models::RegistryKind;
    use rstest::rstest;
    use tracing_test::traced_test;

    #[rstest]
    #[tokio::test]
    #[traced_test]
    #[awt]
    async fn test_max_position(#[future] database: DatabaseFixture) {
        let root = database.group("gitlab-org", None).await;
        let registry = database.registry(&root, RegistryKind::Maven).await;

        let mut conn = database.conn().await;
        assert_eq!(max_position(&mut conn, registry.id).await.unwrap(), 0);
        drop(conn);

        database.upstream(&registry, 24).await;
        database.upstream(&registry, 24).await;
        let mut conn = database.conn().await;
        assert_eq!(max_position(&mut conn, registry.id).await.unwrap(), 2);
        assert_eq!(count_for_registry(&mut conn, registry.id).await.unwrap(), 2);
    }

    #[rstest]
    #[tokio::test]
    #[traced_test]
    #[awt]
    async fn test_shift_positions(#[future] database: DatabaseFixture) {
        let root = database.group("gitlab-org", None).await;
        let registry = database.registry(&root, RegistryKind::Maven).await;
        for _ in 0..4 {
            database.upstream(&registry, 24).await;
        }

        let mut conn = database.conn().await;
        let shifted = shift_positions(&mut conn, registry.id, 3, 4, -1)
            .await
            .unwrap();
        assert_eq!(shifted, 2);
        let positions: Vec<_> = list_for_registry(&mut conn, registry.id)
            .await
            .unwrap()
            .iter()
            .map(|link| link.position)
            .collect();
        assert_eq!(positions, vec![1, 2, 2, 3]);
    }

    #[rstest]
    #[tokio::test]
    #[traced_test]
    #[awt]
    async fn test_link_is_unique(#[future] database: DatabaseFixture) {
        let root = database.group("gitlab-org", None).await;
        let registry = database.registry(&root, RegistryKind::Maven).await;
        let upstream = database.upstream(&registry, 24).await;

        let mut conn = database.conn().await;
        let result = insert(
            &mut conn,
            NewRegistryUpstream {
                registry_id: registry.id,
                upstream_id: upstream.id,
                position: 2,
            },
        )
        .await;
        assert!(result.unwrap_err().is_unique_violation());
    }

    #[rstest]
    #[tokio::test]
    #[traced_test]
    #[awt]
    async fn test_chain_pairs_links_with_upstreams(#[future] database: DatabaseFixture) {
        let root = database.group("gitlab-org", None).await;
        let registry = database.registry(&root, RegistryKind::Maven).await;
        let first = database.upstream(&registry, 24).await;
        let second = database.upstream(&registry, 24).await;
        let third = database.upstream(&registry, 24).await;

        // Insertion order and position order disagree
        let mut conn = database.conn().await;
        let link = find(&mut conn, registry.id, first.id).await.unwrap().unwrap();
        set_position(&mut conn, link.id, 4).await.unwrap();

        let chain = chain_for_registry(&mut conn, registry.id).await.unwrap();
        let pairs: Vec<_> = chain
            .iter()
            .map(|(link, upstream)| (link.upstream_id, upstream.id, link.position))
            .collect();
        assert_eq!(
            pairs,
            vec![
                (second.id, second.id, 2),
                (third.id, third.id, 3),
                (first.id, first.id, 4)
            ]
        );
    }
}
