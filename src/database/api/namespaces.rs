use diesel::{QueryDsl, SelectableHelper};
use diesel_async::RunQueryDsl;
use tracing::trace;

use crate::database::models::{Namespace, NamespaceKind, NewNamespace};
use crate::database::schema::namespaces;
use crate::database::{Connection, DatabaseResult};

/// Namespace hierarchies deeper than this are cut.
pub const MAX_DEPTH: usize = 20;

pub async fn insert(
    connection: &mut Connection,
    new_namespace: NewNamespace,
) -> DatabaseResult<Namespace> {
    trace!("INSERT {:?}", new_namespace);
    Ok(diesel::insert_into(namespaces::table)
        .values(&new_namespace)
        .returning(Namespace::as_returning())
        .get_result(connection)
        .await?)
}

pub async fn get(connection: &mut Connection, id: i32) -> DatabaseResult<Namespace> {
    trace!("SELECT namespace id={}", id);
    Ok(namespaces::table
        .find(id)
        .select(Namespace::as_select())
        .first(connection)
        .await?)
}

/// Namespace itself followed by its parents, top-level group last.
pub async fn ancestors(connection: &mut Connection, id: i32) -> DatabaseResult<Vec<Namespace>> {
    let mut chain = Vec::new();
    let mut next = Some(id);
    while let Some(id) = next {
        if chain.len() >= MAX_DEPTH {
            trace!("namespace hierarchy deeper than {}, stop walking", MAX_DEPTH);
            break;
        }
        let namespace = get(connection, id).await?;
        next = namespace.parent_id;
        chain.push(namespace);
    }
    Ok(chain)
}

/// Id of the top-level group of the namespace.
pub async fn top_level_group_id(connection: &mut Connection, id: i32) -> DatabaseResult<i32> {
    let chain = ancestors(connection, id).await?;
    Ok(chain
        .iter()
        .rev()
        .find(|namespace| namespace.kind == NamespaceKind::Group)
        .map_or(id, |namespace| namespace.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::fixtures::{database, DatabaseFixture};
    use rstest::rstest;
    use tracing_test::traced_test;

    #[rstest]
    #[tokio::test]
    #[traced_test]
    #[awt]
    async fn test_ancestors_start_with_self(#[future] database: DatabaseFixture) {
        let root = database.group("gitlab-org", None).await;
        let subgroup = database.group("gitlab-org/build", Some(root.id)).await;
        let project = database.project("gitlab-org/build/runner", subgroup.id).await;

        let mut conn = database.conn().await;
        let chain = ancestors(&mut conn, project.id).await.unwrap();
        let ids: Vec<_> = chain.iter().map(|namespace| namespace.id).collect();
        assert_eq!(ids, vec![project.id, subgroup.id, root.id]);

        let top_level = top_level_group_id(&mut conn, project.id).await.unwrap();
        assert_eq!(top_level, root.id);
        let top_level = top_level_group_id(&mut conn, root.id).await.unwrap();
        assert_eq!(top_level, root.id);
    }

    #[rstest]
    #[tokio::test]
    #[traced_test]
    #[awt]
    async fn test_get_missing_namespace(#[future] database: DatabaseFixture) {
        let mut conn = database.conn().await;
        let result = get(&mut conn, 404).await;
        assert!(result.unwrap_err().is_not_found());
    }

    #[rstest]
    #[tokio::test]
    #[traced_test]
    #[awt]
    async fn test_path_is_unique(#[future] database: DatabaseFixture) {
        database.group("gitlab-org", None).await;
        let mut conn = database.conn().await;
        let result = insert(&mut conn, NewNamespace::group("gitlab-org", None)).await;
        assert!(result.unwrap_err().is_unique_violation());
    }
}
