//! Upstream resolution.
//!
//! Turns a requested path into an ordered list of candidate upstreams and short-circuits
//! to the first live cache entry found along that list.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::database::models::{CacheEntry, Registry, RegistryKind, Upstream};
use crate::database::{api, Database, PooledConnection};
use crate::errors::{DatabaseError, ResolveError};

/// Registry format specific path handling.
pub trait EntryFinder: Send + Sync {
    /// Registry format handled by the finder.
    fn kind(&self) -> RegistryKind;

    /// Normalize a requested path into the relative path of a cache entry.
    fn lookup_path(&self, path: &str) -> Result<String, ResolveError>;
}

/// Maven repository layout: plain `/`-separated segments.
#[derive(Debug, Clone, Copy, Default)]
pub struct MavenFinder;

impl EntryFinder for MavenFinder {
    fn kind(&self) -> RegistryKind {
        RegistryKind::Maven
    }

    fn lookup_path(&self, path: &str) -> Result<String, ResolveError> {
        let path = path.trim().trim_start_matches('/');
        if path.is_empty() {
            return Err(ResolveError::BlankPath);
        }
        if path
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..")
        {
            return Err(ResolveError::InvalidPath(path.to_string()));
        }
        Ok(path.to_string())
    }
}

/// Container registry layout: `<image>/manifests/<reference>` or `<image>/blobs/sha256:<digest>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContainerFinder;

impl EntryFinder for ContainerFinder {
    fn kind(&self) -> RegistryKind {
        RegistryKind::Container
    }

    fn lookup_path(&self, path: &str) -> Result<String, ResolveError> {
        let path = path.trim().trim_start_matches('/');
        if path.is_empty() {
            return Err(ResolveError::BlankPath);
        }
        let invalid = || ResolveError::InvalidPath(path.to_string());

        let segments: Vec<_> = path.split('/').collect();
        let malformed = segments
            .iter()
            .any(|segment| segment.is_empty() || *segment == "..");
        if segments.len() < 3 || malformed {
            return Err(invalid());
        }
        let reference = segments[segments.len() - 1];
        match segments[segments.len() - 2] {
            "manifests" => Ok(path.to_string()),
            "blobs" => {
                let digest = reference.strip_prefix("sha256:").ok_or_else(invalid)?;
                if digest.len() == 64 && digest.chars().all(|c| c.is_ascii_hexdigit()) {
                    Ok(path.to_string())
                } else {
                    Err(invalid())
                }
            }
            _ => Err(invalid()),
        }
    }
}

/// Cached file found on one of the candidate upstreams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheHit {
    pub upstream: Upstream,
    pub entry: CacheEntry,
}

/// Resolves requested paths against upstream chains.
#[derive(Clone)]
pub struct UpstreamResolver {
    db: Database,
    finders: HashMap<RegistryKind, Arc<dyn EntryFinder>>,
}

impl UpstreamResolver {
    /// Resolver without any finder strategy.
    pub fn new(db: Database) -> Self {
        Self {
            db,
            finders: HashMap::new(),
        }
    }

    /// Resolver with finders for every [`RegistryKind`].
    pub fn with_default_finders(db: Database) -> Self {
        let mut resolver = Self::new(db);
        resolver.register_finder(Arc::new(MavenFinder));
        resolver.register_finder(Arc::new(ContainerFinder));
        resolver
    }

    pub fn register_finder(&mut self, finder: Arc<dyn EntryFinder>) {
        self.finders.insert(finder.kind(), finder);
    }

    pub fn finder(&self, kind: RegistryKind) -> Result<&dyn EntryFinder, ResolveError> {
        self.finders
            .get(&kind)
            .map(|finder| finder.as_ref())
            .ok_or(ResolveError::NoFinderStrategy(kind))
    }

    async fn connection(&self) -> Result<PooledConnection, ResolveError> {
        Ok(self.db.get().await?)
    }

    /// Registry and its upstreams ordered by position.
    pub async fn candidates_for_registry(
        &self,
        registry_id: i32,
    ) -> Result<(Registry, Vec<Upstream>), ResolveError> {
        let mut conn = self.connection().await?;
        let registry = api::registries::get(&mut conn, registry_id)
            .await
            .map_err(|err| registry_not_found(err, registry_id))?;
        let upstreams = api::upstreams::ordered_for_registry(&mut conn, registry_id).await?;
        Ok((registry, upstreams))
    }

    /// Upstreams reachable from a project or group.
    ///
    /// Walks from the scope up to its top-level group. Registries of each namespace are taken
    /// oldest first, their upstreams by position. An upstream shared by several registries
    /// keeps its first place.
    pub async fn candidates_for_scope(
        &self,
        scope_id: i32,
        kind: RegistryKind,
    ) -> Result<Vec<Upstream>, ResolveError> {
        let mut conn = self.connection().await?;
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        for namespace in api::namespaces::ancestors(&mut conn, scope_id).await? {
            let registries =
                api::registries::list_for_namespace(&mut conn, namespace.id, Some(kind)).await?;
            for registry in registries {
                let chain = api::upstreams::ordered_for_registry(&mut conn, registry.id).await?;
                for upstream in chain {
                    if seen.insert(upstream.id) {
                        candidates.push(upstream);
                    }
                }
            }
        }
        trace!(
            "scope {} has {} {} upstream candidates",
            scope_id,
            candidates.len(),
            kind
        );
        Ok(candidates)
    }

    /// Find a cached file for `path` requested from the registry.
    pub async fn resolve_for_registry(
        &self,
        registry_id: i32,
        path: &str,
    ) -> Result<CacheHit, ResolveError> {
        ensure_present(path)?;
        let (registry, candidates) = self.candidates_for_registry(registry_id).await?;
        self.resolve(registry.kind, candidates, path).await
    }

    /// Find a cached file for `path` requested from a project or group.
    pub async fn resolve_for_scope(
        &self,
        scope_id: i32,
        kind: RegistryKind,
        path: &str,
    ) -> Result<CacheHit, ResolveError> {
        ensure_present(path)?;
        let candidates = self.candidates_for_scope(scope_id, kind).await?;
        self.resolve(kind, candidates, path).await
    }

    /// First live entry for `path` along `candidates`.
    pub async fn resolve(
        &self,
        kind: RegistryKind,
        candidates: Vec<Upstream>,
        path: &str,
    ) -> Result<CacheHit, ResolveError> {
        ensure_present(path)?;
        let finder = self.finder(kind)?;
        if candidates.is_empty() {
            return Err(ResolveError::NoUpstreams);
        }
        let relative_path = finder.lookup_path(path)?;

        let mut conn = self.connection().await?;
        for upstream in &candidates {
            if let Some(entry) =
                api::cache_entries::find_live(&mut conn, upstream.id, &relative_path).await?
            {
                debug!(
                    upstream_id = upstream.id,
                    entry_id = entry.id,
                    "cache hit for {}",
                    relative_path
                );
                return Ok(CacheHit {
                    upstream: upstream.clone(),
                    entry,
                });
            }
        }
        debug!(
            "{} not cached on any of {} upstreams",
            relative_path,
            candidates.len()
        );
        Err(ResolveError::FileNotFound {
            path: relative_path,
            candidates,
        })
    }
}

fn ensure_present(path: &str) -> Result<(), ResolveError> {
    if path.trim().is_empty() {
        Err(ResolveError::BlankPath)
    } else {
        Ok(())
    }
}

fn registry_not_found(err: DatabaseError, registry_id: i32) -> ResolveError {
    if err.is_not_found() {
        ResolveError::RegistryNotFound(registry_id)
    } else {
        err.into()
    }
}
