//! Registry and upstream lifecycle.
//!
//! Creation and removal of registries, upstreams and the ordered chains linking them.
//! Every mutation asks the [`Authorizer`] first.

use std::sync::Arc;

use chrono::Utc;
use diesel_async::scoped_futures::ScopedFutureExt;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use url::Url;

use crate::auth::{Action, Actor, Authorizer, Scope};
use crate::cache::tombstone_suffix;
use crate::config::Config;
use crate::database::models::{
    CacheEntry, NamespaceKind, NewRegistry, NewRegistryUpstream, NewUpstream, Registry,
    RegistryKind, RegistryUpstream, Upstream,
};
use crate::database::{api, Connection, Database, PooledConnection};
use crate::errors::{DatabaseError, LifecycleError};
use crate::wire::CacheEntryId;

const MAX_NAME_LENGTH: usize = 255;
const MAX_DESCRIPTION_LENGTH: usize = 1024;

/// Attributes of a new registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryParams {
    pub group_id: i32,
    pub kind: RegistryKind,
    pub name: String,
    pub description: Option<String>,
}

/// Attributes of a new upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamParams {
    pub name: String,
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub cache_validity_hours: i32,
}

impl UpstreamParams {
    fn validate(&self) -> Result<(), LifecycleError> {
        let mut errors = Vec::new();
        validate_name(&self.name, &mut errors);
        match Url::parse(&self.url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") && url.has_host() => {}
            _ => errors.push("url must be a valid http or https URL".to_string()),
        }
        if self.cache_validity_hours < 0 {
            errors.push("cache validity hours must be greater than or equal to 0".to_string());
        }
        if self.username.is_some() != self.password.is_some() {
            errors.push("username and password must be set together".to_string());
        }
        into_result(errors)
    }
}

fn validate_name(name: &str, errors: &mut Vec<String>) {
    if name.trim().is_empty() {
        errors.push("name can't be blank".to_string());
    } else if name.chars().count() > MAX_NAME_LENGTH {
        errors.push(format!(
            "name is too long (maximum is {} characters)",
            MAX_NAME_LENGTH
        ));
    }
}

fn into_result(errors: Vec<String>) -> Result<(), LifecycleError> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(LifecycleError::Validation(errors.join(", ")))
    }
}

fn not_found(entity: &'static str, id: i32) -> impl FnOnce(DatabaseError) -> LifecycleError {
    move |err| {
        if err.is_not_found() {
            LifecycleError::NotFound { entity, id }
        } else {
            err.into()
        }
    }
}

/// Remove the link and close the gap it leaves in the chain.
async fn unlink(
    connection: &mut Connection,
    link: &RegistryUpstream,
) -> Result<(), LifecycleError> {
    api::registry_upstreams::delete(connection, link.id).await?;
    api::registry_upstreams::shift_positions(
        connection,
        link.registry_id,
        link.position + 1,
        i32::MAX,
        -1,
    )
    .await?;
    Ok(())
}

/// Registry and upstream lifecycle service.
#[derive(Clone)]
pub struct RegistryService {
    db: Database,
    authorizer: Arc<dyn Authorizer>,
    max_registries_per_group: i64,
    max_upstreams_per_registry: i64,
}

impl RegistryService {
    pub fn new(db: Database, authorizer: Arc<dyn Authorizer>, config: &Config) -> Self {
        Self {
            db,
            authorizer,
            max_registries_per_group: config.max_registries_per_group,
            max_upstreams_per_registry: config.max_upstreams_per_registry,
        }
    }

    async fn authorize(
        &self,
        actor: &Actor,
        scope: Scope,
        action: Action,
    ) -> Result<(), LifecycleError> {
        if self
            .authorizer
            .is_action_available(actor, scope, action)
            .await
        {
            Ok(())
        } else {
            warn!(
                actor = %actor.username,
                "{} is not available in {:?}",
                action,
                scope
            );
            Err(LifecycleError::Unauthorized)
        }
    }

    async fn connection(&self) -> Result<PooledConnection, LifecycleError> {
        Ok(self.db.get().await?)
    }

    async fn registry(&self, registry_id: i32) -> Result<Registry, LifecycleError> {
        let mut conn = self.connection().await?;
        api::registries::get(&mut conn, registry_id)
            .await
            .map_err(not_found("registry", registry_id))
    }

    async fn upstream(&self, upstream_id: i32) -> Result<Upstream, LifecycleError> {
        let mut conn = self.connection().await?;
        api::upstreams::get(&mut conn, upstream_id)
            .await
            .map_err(not_found("upstream", upstream_id))
    }

    /// Create a registry, unless the top-level group already has the maximum of its kind.
    pub async fn create_registry(
        &self,
        actor: &Actor,
        params: RegistryParams,
    ) -> Result<Registry, LifecycleError> {
        self.authorize(actor, Scope::Group(params.group_id), Action::CreateVirtualRegistry)
            .await?;

        let mut errors = Vec::new();
        validate_name(&params.name, &mut errors);
        if params
            .description
            .as_ref()
            .is_some_and(|description| description.chars().count() > MAX_DESCRIPTION_LENGTH)
        {
            errors.push(format!(
                "description is too long (maximum is {} characters)",
                MAX_DESCRIPTION_LENGTH
            ));
        }
        into_result(errors)?;

        let max = self.max_registries_per_group;
        let mut connection = self.connection().await?;
        let registry = connection
            .immediate_transaction(|conn| {
                async move {
                    let namespace = api::namespaces::get(conn, params.group_id)
                        .await
                        .map_err(not_found("group", params.group_id))?;
                    if namespace.kind != NamespaceKind::Group {
                        return Err(LifecycleError::Validation(
                            "registries can only be created for groups".to_string(),
                        ));
                    }
                    let top_level_group_id =
                        api::namespaces::top_level_group_id(conn, params.group_id).await?;
                    let count = api::registries::count_in_top_level_group(
                        conn,
                        top_level_group_id,
                        params.kind,
                    )
                    .await?;
                    if count >= max {
                        return Err(LifecycleError::Validation(format!(
                            "{} registries is the maximum allowed per top-level group",
                            max
                        )));
                    }
                    let now = Utc::now();
                    Ok(api::registries::insert(
                        conn,
                        NewRegistry {
                            group_id: params.group_id,
                            top_level_group_id,
                            kind: params.kind,
                            name: params.name,
                            description: params.description,
                            created_at: now,
                            updated_at: now,
                        },
                    )
                    .await?)
                }
                .scope_boxed()
            })
            .await?;
        info!(
            registry_id = registry.id,
            group_id = registry.group_id,
            kind = %registry.kind,
            "registry created"
        );
        Ok(registry)
    }

    /// Delete the registry together with its chain. Upstreams stay.
    pub async fn destroy_registry(
        &self,
        actor: &Actor,
        registry_id: i32,
    ) -> Result<Registry, LifecycleError> {
        let registry = self.registry(registry_id).await?;
        self.authorize(actor, Scope::Group(registry.group_id), Action::DestroyVirtualRegistry)
            .await?;
        let mut conn = self.connection().await?;
        api::registries::delete(&mut conn, registry.id).await?;
        info!(registry_id = registry.id, "registry destroyed");
        Ok(registry)
    }

    /// Create an upstream at the end of the registry chain.
    pub async fn create_upstream(
        &self,
        actor: &Actor,
        registry_id: i32,
        params: UpstreamParams,
    ) -> Result<(Upstream, RegistryUpstream), LifecycleError> {
        let registry = self.registry(registry_id).await?;
        self.authorize(actor, Scope::Group(registry.group_id), Action::CreateVirtualRegistry)
            .await?;
        params.validate()?;

        let max = self.max_upstreams_per_registry;
        let mut connection = self.connection().await?;
        let (upstream, link) = connection
            .immediate_transaction(|conn| {
                async move {
                    let count =
                        api::registry_upstreams::count_for_registry(conn, registry.id).await?;
                    if count >= max {
                        return Err(LifecycleError::Validation(format!(
                            "{} upstreams is the maximum allowed per registry",
                            max
                        )));
                    }
                    let now = Utc::now();
                    let upstream = api::upstreams::insert(
                        conn,
                        NewUpstream {
                            group_id: registry.top_level_group_id,
                            kind: registry.kind,
                            name: params.name,
                            url: params.url,
                            username: params.username,
                            password: params.password,
                            cache_validity_hours: params.cache_validity_hours,
                            created_at: now,
                            updated_at: now,
                        },
                    )
                    .await?;
                    let position =
                        api::registry_upstreams::max_position(conn, registry.id).await? + 1;
                    let link = api::registry_upstreams::insert(
                        conn,
                        NewRegistryUpstream {
                            registry_id: registry.id,
                            upstream_id: upstream.id,
                            position,
                        },
                    )
                    .await?;
                    Ok::<_, LifecycleError>((upstream, link))
                }
                .scope_boxed()
            })
            .await?;
        info!(
            registry_id,
            upstream_id = upstream.id,
            position = link.position,
            "upstream created"
        );
        Ok((upstream, link))
    }

    /// Share an existing upstream with another registry, at the end of its chain.
    pub async fn associate_upstream(
        &self,
        actor: &Actor,
        registry_id: i32,
        upstream_id: i32,
    ) -> Result<RegistryUpstream, LifecycleError> {
        let registry = self.registry(registry_id).await?;
        self.authorize(actor, Scope::Group(registry.group_id), Action::UpdateVirtualRegistry)
            .await?;
        let upstream = self.upstream(upstream_id).await?;
        if upstream.group_id != registry.top_level_group_id {
            return Err(LifecycleError::Validation(
                "upstream must belong to the same top-level group as the registry".to_string(),
            ));
        }
        if upstream.kind != registry.kind {
            return Err(LifecycleError::Validation(format!(
                "{} upstream can't be used by a {} registry",
                upstream.kind, registry.kind
            )));
        }

        let max = self.max_upstreams_per_registry;
        let mut connection = self.connection().await?;
        let link = connection
            .immediate_transaction(|conn| {
                async move {
                    if api::registry_upstreams::find(conn, registry.id, upstream.id)
                        .await?
                        .is_some()
                    {
                        return Err(LifecycleError::Validation(
                            "upstream is already part of the registry".to_string(),
                        ));
                    }
                    let count =
                        api::registry_upstreams::count_for_registry(conn, registry.id).await?;
                    if count >= max {
                        return Err(LifecycleError::Validation(format!(
                            "{} upstreams is the maximum allowed per registry",
                            max
                        )));
                    }
                    let position =
                        api::registry_upstreams::max_position(conn, registry.id).await? + 1;
                    Ok(api::registry_upstreams::insert(
                        conn,
                        NewRegistryUpstream {
                            registry_id: registry.id,
                            upstream_id: upstream.id,
                            position,
                        },
                    )
                    .await?)
                }
                .scope_boxed()
            })
            .await?;
        info!(
            registry_id,
            upstream_id,
            position = link.position,
            "upstream associated"
        );
        Ok(link)
    }

    /// Move a chain link to `position`, shifting the links in between.
    pub async fn update_position(
        &self,
        actor: &Actor,
        link_id: i32,
        position: i32,
    ) -> Result<RegistryUpstream, LifecycleError> {
        let link = {
            let mut conn = self.connection().await?;
            api::registry_upstreams::get(&mut conn, link_id)
                .await
                .map_err(not_found("registry upstream", link_id))?
        };
        let registry = self.registry(link.registry_id).await?;
        self.authorize(actor, Scope::Group(registry.group_id), Action::UpdateVirtualRegistry)
            .await?;

        let mut connection = self.connection().await?;
        connection
            .immediate_transaction(|conn| {
                async move {
                    // Re-read inside the transaction, the chain may have moved
                    let link = api::registry_upstreams::get(conn, link.id).await?;
                    let max = api::registry_upstreams::max_position(conn, link.registry_id).await?;
                    if position < 1 || position > max {
                        return Err(LifecycleError::Validation(format!(
                            "position must be between 1 and {}",
                            max
                        )));
                    }
                    if position < link.position {
                        api::registry_upstreams::shift_positions(
                            conn,
                            link.registry_id,
                            position,
                            link.position - 1,
                            1,
                        )
                        .await?;
                    } else if position > link.position {
                        api::registry_upstreams::shift_positions(
                            conn,
                            link.registry_id,
                            link.position + 1,
                            position,
                            -1,
                        )
                        .await?;
                    }
                    Ok(api::registry_upstreams::set_position(conn, link.id, position).await?)
                }
                .scope_boxed()
            })
            .await
    }

    /// Remove the upstream from every chain, closing the gaps, and tombstone its cache entries.
    ///
    /// Returns number of tombstoned entries.
    pub async fn destroy_upstream(
        &self,
        actor: &Actor,
        upstream_id: i32,
    ) -> Result<usize, LifecycleError> {
        let upstream = self.upstream(upstream_id).await?;
        self.authorize(actor, Scope::Group(upstream.group_id), Action::DestroyVirtualRegistry)
            .await?;

        let mut connection = self.connection().await?;
        let tombstoned = connection
            .immediate_transaction(|conn| {
                async move {
                    let links =
                        api::registry_upstreams::list_for_upstream(conn, upstream.id).await?;
                    for link in links {
                        unlink(conn, &link).await?;
                    }
                    let now = Utc::now();
                    let mut tombstoned = 0;
                    for entry in
                        api::cache_entries::live_for_upstream(conn, upstream.id, i64::MAX, 0).await?
                    {
                        tombstoned += api::cache_entries::mark_pending_destruction(
                            conn,
                            entry.id,
                            &tombstone_suffix(),
                            now,
                        )
                        .await?;
                    }
                    api::upstreams::delete(conn, upstream.id).await?;
                    Ok::<_, LifecycleError>(tombstoned)
                }
                .scope_boxed()
            })
            .await?;
        info!(upstream_id, tombstoned, "upstream destroyed");
        Ok(tombstoned)
    }

    /// Tombstone the live cache entry identified by a wire id.
    pub async fn destroy_cache_entry(
        &self,
        actor: &Actor,
        wire_id: &str,
    ) -> Result<CacheEntry, LifecycleError> {
        let id = CacheEntryId::decode(wire_id)?;
        let upstream = self.upstream(id.upstream_id).await?;
        self.authorize(actor, Scope::Group(upstream.group_id), Action::DestroyVirtualRegistry)
            .await?;

        let mut conn = self.connection().await?;
        let entry = api::cache_entries::find_live(&mut conn, upstream.id, &id.relative_path)
            .await?
            .ok_or(LifecycleError::NotFound {
                entity: "cache entry",
                id: upstream.id,
            })?;
        api::cache_entries::mark_pending_destruction(
            &mut conn,
            entry.id,
            &tombstone_suffix(),
            Utc::now(),
        )
        .await?;
        info!(
            upstream_id = upstream.id,
            entry_id = entry.id,
            "cache entry {} destroyed",
            id.relative_path
        );
        Ok(api::cache_entries::get(&mut conn, entry.id).await?)
    }

    /// Registries of the group.
    pub async fn list_registries(
        &self,
        actor: &Actor,
        group_id: i32,
    ) -> Result<Vec<Registry>, LifecycleError> {
        self.authorize(actor, Scope::Group(group_id), Action::ReadVirtualRegistry)
            .await?;
        let mut conn = self.connection().await?;
        Ok(api::registries::list_for_namespace(&mut conn, group_id, None).await?)
    }

    /// Chain of the registry with positions.
    pub async fn list_upstreams(
        &self,
        actor: &Actor,
        registry_id: i32,
    ) -> Result<Vec<(RegistryUpstream, Upstream)>, LifecycleError> {
        let registry = self.registry(registry_id).await?;
        self.authorize(actor, Scope::Group(registry.group_id), Action::ReadVirtualRegistry)
            .await?;
        let mut conn = self.connection().await?;
        Ok(api::registry_upstreams::chain_for_registry(&mut conn, registry.id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AllowAll;
    use crate::database::fixtures::{database, DatabaseFixture};
    use crate::database::models::{CacheEntryStatus, Namespace};
    use async_trait::async_trait;
    use rstest::rstest;
    use tracing_test::traced_test;

    struct DenyAll;

    #[async_trait]
    impl Authorizer for DenyAll {
        async fn is_action_available(
            &self,
            _actor: &Actor,
            _scope: Scope,
            _action: Action,
        ) -> bool {
            false
        }
    }

    fn service(database: &DatabaseFixture) -> RegistryService {
        RegistryService::new(database.db.clone(), Arc::new(AllowAll), &Config::default())
    }

    fn actor() -> Actor {
        Actor::new(1, "root")
    }

    fn registry_params(group: &Namespace, kind: RegistryKind) -> RegistryParams {
        RegistryParams {
            group_id: group.id,
            kind,
            name: "maven central".to_string(),
            description: None,
        }
    }

    fn upstream_params() -> UpstreamParams {
        UpstreamParams {
            name: "central".to_string(),
            url: "https://repo.maven.apache.org/maven2".to_string(),
            username: None,
            password: None,
            cache_validity_hours: 24,
        }
    }

    async fn positions(service: &RegistryService, registry_id: i32) -> Vec<(i32, i32)> {
        service
            .list_upstreams(&actor(), registry_id)
            .await
            .unwrap()
            .into_iter()
            .map(|(link, upstream)| (upstream.id, link.position))
            .collect()
    }

    #[rstest]
    #[tokio::test]
    #[traced_test]
    #[awt]
    async fn test_max_registries(#[future] database: DatabaseFixture) {
        let root = database.group("gitlab-org", None).await;
        let subgroup = database.group("gitlab-org/build", Some(root.id)).await;
        let service = service(&database);

        for i in 0..20 {
            let group = if i % 2 == 0 { &root } else { &subgroup };
            service
                .create_registry(&actor(), registry_params(group, RegistryKind::Maven))
                .await
                .expect("create registry");
        }

        let err = service
            .create_registry(&actor(), registry_params(&subgroup, RegistryKind::Maven))
            .await
            .unwrap_err();
        assert!(err
            .to_string()
            .contains("20 registries is the maximum allowed per top-level group"));

        let mut conn = database.conn().await;
        let count =
            api::registries::count_in_top_level_group(&mut conn, root.id, RegistryKind::Maven)
                .await
                .unwrap();
        assert_eq!(count, 20);

        // The limit is per kind
        drop(conn);
        service
            .create_registry(&actor(), registry_params(&root, RegistryKind::Container))
            .await
            .expect("create container registry");
    }

    #[rstest]
    #[tokio::test]
    #[traced_test]
    #[awt]
    async fn test_unauthorized(#[future] database: DatabaseFixture) {
        let root = database.group("gitlab-org", None).await;
        let service =
            RegistryService::new(database.db.clone(), Arc::new(DenyAll), &Config::default());
        let result = service
            .create_registry(&actor(), registry_params(&root, RegistryKind::Maven))
            .await;
        assert!(matches!(result, Err(LifecycleError::Unauthorized)));
        assert!(logs_contain("create_virtual_registry is not available"));

        let mut conn = database.conn().await;
        let registries = api::registries::list_for_namespace(&mut conn, root.id, None)
            .await
            .unwrap();
        assert!(registries.is_empty());
    }

    #[rstest]
    #[tokio::test]
    #[traced_test]
    #[awt]
    async fn test_registry_requires_group(#[future] database: DatabaseFixture) {
        let root = database.group("gitlab-org", None).await;
        let project = database.project("gitlab-org/gitlab", root.id).await;
        let service = service(&database);

        let result = service
            .create_registry(&actor(), registry_params(&project, RegistryKind::Maven))
            .await;
        let Err(LifecycleError::Validation(message)) = result else {
            panic!("expected validation error");
        };
        assert!(message.contains("only be created for groups"));

        let mut conn = database.conn().await;
        let registries = api::registries::list_for_namespace(&mut conn, project.id, None)
            .await
            .unwrap();
        assert!(registries.is_empty());
    }

    #[rstest]
    #[tokio::test]
    #[traced_test]
    #[awt]
    async fn test_upstream_validation(#[future] database: DatabaseFixture) {
        let root = database.group("gitlab-org", None).await;
        let service = service(&database);
        let registry = service
            .create_registry(&actor(), registry_params(&root, RegistryKind::Maven))
            .await
            .unwrap();

        let result = service
            .create_upstream(
                &actor(),
                registry.id,
                UpstreamParams {
                    url: "ftp://example.com".to_string(),
                    username: Some("user".to_string()),
                    cache_validity_hours: -1,
                    ..upstream_params()
                },
            )
            .await;
        let Err(LifecycleError::Validation(message)) = result else {
            panic!("expected validation error");
        };
        assert!(message.contains("url must be a valid http or https URL"));
        assert!(message.contains("cache validity hours"));
        assert!(message.contains("username and password"));
    }

    #[rstest]
    #[tokio::test]
    #[traced_test]
    #[awt]
    async fn test_destroy_upstream_recompacts_positions(#[future] database: DatabaseFixture) {
        let root = database.group("gitlab-org", None).await;
        let service = service(&database);
        let registry = service
            .create_registry(&actor(), registry_params(&root, RegistryKind::Maven))
            .await
            .unwrap();
        let mut upstreams = Vec::new();
        for _ in 0..4 {
            let (upstream, _) = service
                .create_upstream(&actor(), registry.id, upstream_params())
                .await
                .unwrap();
            upstreams.push(upstream);
        }
        assert_eq!(
            positions(&service, registry.id).await,
            vec![
                (upstreams[0].id, 1),
                (upstreams[1].id, 2),
                (upstreams[2].id, 3),
                (upstreams[3].id, 4)
            ]
        );

        let entry = database.entry(&upstreams[1], "foo.jar").await;
        let tombstoned = service
            .destroy_upstream(&actor(), upstreams[1].id)
            .await
            .unwrap();
        assert_eq!(tombstoned, 1);

        assert_eq!(
            positions(&service, registry.id).await,
            vec![
                (upstreams[0].id, 1),
                (upstreams[2].id, 2),
                (upstreams[3].id, 3)
            ]
        );
        let mut conn = database.conn().await;
        let entry = api::cache_entries::get(&mut conn, entry.id).await.unwrap();
        assert_eq!(entry.status, CacheEntryStatus::PendingDestruction);
        assert_eq!(entry.upstream_id, None);
    }

    #[rstest]
    #[tokio::test]
    #[traced_test]
    #[awt]
    async fn test_destroy_shared_upstream(#[future] database: DatabaseFixture) {
        let root = database.group("gitlab-org", None).await;
        let service = service(&database);
        let one = service
            .create_registry(&actor(), registry_params(&root, RegistryKind::Maven))
            .await
            .unwrap();
        let two = service
            .create_registry(&actor(), registry_params(&root, RegistryKind::Maven))
            .await
            .unwrap();
        let (shared, _) = service
            .create_upstream(&actor(), one.id, upstream_params())
            .await
            .unwrap();
        let (own, _) = service
            .create_upstream(&actor(), two.id, upstream_params())
            .await
            .unwrap();
        let (last, _) = service
            .create_upstream(&actor(), two.id, upstream_params())
            .await
            .unwrap();
        let link = service
            .associate_upstream(&actor(), two.id, shared.id)
            .await
            .unwrap();
        assert_eq!(link.position, 3);
        service.update_position(&actor(), link.id, 1).await.unwrap();
        assert_eq!(
            positions(&service, two.id).await,
            vec![(shared.id, 1), (own.id, 2), (last.id, 3)]
        );

        service.destroy_upstream(&actor(), shared.id).await.unwrap();
        assert!(positions(&service, one.id).await.is_empty());
        assert_eq!(
            positions(&service, two.id).await,
            vec![(own.id, 1), (last.id, 2)]
        );
    }

    #[rstest]
    #[tokio::test]
    #[traced_test]
    #[awt]
    async fn test_update_position(#[future] database: DatabaseFixture) {
        let root = database.group("gitlab-org", None).await;
        let service = service(&database);
        let registry = service
            .create_registry(&actor(), registry_params(&root, RegistryKind::Maven))
            .await
            .unwrap();
        let mut links = Vec::new();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let (upstream, link) = service
                .create_upstream(&actor(), registry.id, upstream_params())
                .await
                .unwrap();
            ids.push(upstream.id);
            links.push(link);
        }

        service.update_position(&actor(), links[0].id, 3).await.unwrap();
        assert_eq!(
            positions(&service, registry.id).await,
            vec![(ids[1], 1), (ids[2], 2), (ids[0], 3)]
        );

        let result = service.update_position(&actor(), links[0].id, 4).await;
        assert!(matches!(result, Err(LifecycleError::Validation(_))));
    }

    #[rstest]
    #[tokio::test]
    #[traced_test]
    #[awt]
    async fn test_associate_requires_same_kind(#[future] database: DatabaseFixture) {
        let root = database.group("gitlab-org", None).await;
        let service = service(&database);
        let maven = service
            .create_registry(&actor(), registry_params(&root, RegistryKind::Maven))
            .await
            .unwrap();
        let container = service
            .create_registry(&actor(), registry_params(&root, RegistryKind::Container))
            .await
            .unwrap();
        let (upstream, _) = service
            .create_upstream(&actor(), maven.id, upstream_params())
            .await
            .unwrap();

        let result = service
            .associate_upstream(&actor(), container.id, upstream.id)
            .await;
        assert!(matches!(result, Err(LifecycleError::Validation(_))));
        let result = service.associate_upstream(&actor(), maven.id, upstream.id).await;
        assert!(matches!(result, Err(LifecycleError::Validation(_))));
    }

    #[rstest]
    #[tokio::test]
    #[traced_test]
    #[awt]
    async fn test_destroy_cache_entry(#[future] database: DatabaseFixture) {
        let root = database.group("gitlab-org", None).await;
        let registry = database.registry(&root, RegistryKind::Maven).await;
        let upstream = database.upstream(&registry, 24).await;
        database.entry(&upstream, "foo/1.0/foo.jar").await;
        let service = service(&database);

        let wire_id = CacheEntryId::new(upstream.id, "foo/1.0/foo.jar").encode();
        let entry = service.destroy_cache_entry(&actor(), &wire_id).await.unwrap();
        assert_eq!(entry.status, CacheEntryStatus::PendingDestruction);

        let result = service.destroy_cache_entry(&actor(), &wire_id).await;
        assert!(matches!(result, Err(LifecycleError::NotFound { .. })));
        let result = service.destroy_cache_entry(&actor(), "%%%").await;
        assert!(matches!(result, Err(LifecycleError::InvalidEntryId(_))));
    }
}
