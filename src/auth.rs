//! Authorization collaborator.
//!
//! Whether an action on virtual registries is available for an actor is decided
//! elsewhere. Answers may be memoised by [`CachedAuthorizer`] for a time configured
//! per feature and scope kind.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::trace;

use crate::config::FeatureTtl;

/// Who performs the action.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Actor {
    pub id: i32,
    pub username: String,
}

impl Actor {
    pub fn new(id: i32, username: &str) -> Self {
        Self {
            id,
            username: username.to_string(),
        }
    }

    /// Actor of background jobs.
    pub fn system() -> Self {
        Self::new(0, "system")
    }
}

/// Where the action is performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Project(i32),
    Group(i32),
    Instance,
}

/// Actions guarded by authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    ReadVirtualRegistry,
    CreateVirtualRegistry,
    UpdateVirtualRegistry,
    DestroyVirtualRegistry,
}

impl Action {
    /// Name of the feature the action belongs to.
    pub fn feature(&self) -> &'static str {
        match self {
            Self::ReadVirtualRegistry => "virtual_registry",
            Self::CreateVirtualRegistry
            | Self::UpdateVirtualRegistry
            | Self::DestroyVirtualRegistry => "virtual_registry_management",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::ReadVirtualRegistry => "read_virtual_registry",
                Self::CreateVirtualRegistry => "create_virtual_registry",
                Self::UpdateVirtualRegistry => "update_virtual_registry",
                Self::DestroyVirtualRegistry => "destroy_virtual_registry",
            }
        )
    }
}

#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn is_action_available(&self, actor: &Actor, scope: Scope, action: Action) -> bool;
}

/// Allows everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    async fn is_action_available(&self, _actor: &Actor, _scope: Scope, _action: Action) -> bool {
        true
    }
}

type CacheKey = (i32, Scope, Action);

/// Memoises answers of another [`Authorizer`].
///
/// Lifetime of an answer comes from the lookup table keyed by [`Action::feature`],
/// picking the TTL of the scope kind. Features missing from the table are not memoised.
pub struct CachedAuthorizer<A> {
    inner: A,
    ttls: HashMap<String, FeatureTtl>,
    /// Expired answers are pruned whenever a new one is stored.
    answers: Mutex<HashMap<CacheKey, (bool, Instant)>>,
}

impl<A: Authorizer> CachedAuthorizer<A> {
    pub fn new(inner: A, ttls: HashMap<String, FeatureTtl>) -> Self {
        Self {
            inner,
            ttls,
            answers: Mutex::new(HashMap::new()),
        }
    }

    /// How long an answer for `action` in `scope` stays valid.
    pub fn ttl(&self, scope: Scope, action: Action) -> Duration {
        let secs = self
            .ttls
            .get(action.feature())
            .map(|ttl| match scope {
                Scope::Project(_) => ttl.project_ttl_secs,
                Scope::Group(_) => ttl.group_ttl_secs,
                Scope::Instance => ttl.global_ttl_secs,
            })
            .unwrap_or(0);
        Duration::from_secs(secs)
    }
}

#[async_trait]
impl<A: Authorizer> Authorizer for CachedAuthorizer<A> {
    async fn is_action_available(&self, actor: &Actor, scope: Scope, action: Action) -> bool {
        let ttl = self.ttl(scope, action);
        if ttl.is_zero() {
            return self.inner.is_action_available(actor, scope, action).await;
        }

        let key = (actor.id, scope, action);
        let now = Instant::now();
        if let Some((allowed, expires_at)) = self.answers.lock().await.get(&key) {
            if *expires_at > now {
                trace!("memoised answer for {} in {:?}: {}", action, scope, allowed);
                return *allowed;
            }
        }

        let allowed = self.inner.is_action_available(actor, scope, action).await;
        self.remember(key, allowed, now + ttl).await;
        allowed
    }
}

impl<A> CachedAuthorizer<A> {
    /// Store an answer, dropping the expired ones.
    async fn remember(&self, key: CacheKey, allowed: bool, expires_at: Instant) {
        let now = Instant::now();
        let mut answers = self.answers.lock().await;
        answers.retain(|_, (_, expiry)| *expiry > now);
        answers.insert(key, (allowed, expires_at));
    }
}
