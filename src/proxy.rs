//! Serving files through a registry.
//!
//! A request is resolved against the registry chain first. Fresh cache hits are served as
//! is, stale ones are revalidated against their upstream, and misses are fetched from the
//! first upstream that has the file.

use std::fmt;
use std::io;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use reqwest::header::{CONTENT_TYPE, ETAG, IF_NONE_MATCH};
use reqwest::{Client as ReqwestClient, Response, StatusCode};
use tokio::time;
use tokio_stream::StreamExt;
use tracing::{debug, info, trace, warn};

use crate::auth::{Action, Actor, Authorizer, Scope};
use crate::cache::{object_storage_key_for, CacheEntryStore, EntryAttributes};
use crate::config::{Config, RetryPolicy};
use crate::database::models::{CacheEntry, Registry, Upstream};
use crate::database::Database;
use crate::errors::{ProxyError, ResolveError};
use crate::object_storage::{ByteStream, ObjectStorage, StoredObject};
use crate::resolver::{CacheHit, UpstreamResolver};

/// Where a served file came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServedFrom {
    /// Fresh cache hit.
    Cache,

    /// Stale hit confirmed unchanged by the upstream.
    Revalidated,

    /// Stale hit downloaded again.
    Refreshed,

    /// Stale hit served because the upstream could not be reached.
    Stale,

    /// Cache miss fetched from an upstream.
    Upstream,
}

/// File served through a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Served {
    pub entry: CacheEntry,
    pub upstream: Upstream,
    pub source: ServedFrom,
}

/// Upstream answer.
enum Fetched {
    Body(Response),
    NotModified,
    NotFound,
}

/// Caching proxy in front of registry upstreams.
pub struct RegistryProxy {
    resolver: UpstreamResolver,
    store: CacheEntryStore,
    storage: Arc<dyn ObjectStorage>,
    authorizer: Arc<dyn Authorizer>,
    reqwest_client: ReqwestClient,
    download_retry_policy: RetryPolicy,
}

impl RegistryProxy {
    pub fn new(
        db: Database,
        storage: Arc<dyn ObjectStorage>,
        authorizer: Arc<dyn Authorizer>,
        config: &Config,
    ) -> Result<Self, ProxyError> {
        let reqwest_client = ReqwestClient::builder()
            .build()
            .map_err(ProxyError::ReqwestClientBuildError)?;
        Ok(Self {
            resolver: UpstreamResolver::with_default_finders(db.clone()),
            store: CacheEntryStore::new(db),
            storage,
            authorizer,
            reqwest_client,
            download_retry_policy: config.download_retry,
        })
    }

    /// Set [`reqwest::Client`] to use for downloading.
    pub fn with_reqwest_client(mut self, reqwest_client: ReqwestClient) -> Self {
        self.reqwest_client = reqwest_client;
        self
    }

    /// Serve `path` through the registry.
    pub async fn serve(
        &self,
        actor: &Actor,
        registry_id: i32,
        path: &str,
    ) -> Result<Served, ProxyError> {
        let (registry, candidates) = self.resolver.candidates_for_registry(registry_id).await?;
        let readable = self
            .authorizer
            .is_action_available(
                actor,
                Scope::Group(registry.group_id),
                Action::ReadVirtualRegistry,
            )
            .await;
        if !readable {
            warn!(actor = %actor.username, registry_id, "registry is not readable");
            return Err(ProxyError::Unauthorized);
        }

        match self.resolver.resolve(registry.kind, candidates, path).await {
            Ok(hit) => self.serve_hit(hit).await,
            Err(ResolveError::FileNotFound { path, candidates }) => {
                self.fetch_from_candidates(&registry, &path, &candidates).await
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Content of a served entry.
    pub async fn read(&self, entry: &CacheEntry) -> Result<Bytes, ProxyError> {
        Ok(self.storage.read(&entry.object_storage_key).await?)
    }

    async fn serve_hit(&self, hit: CacheHit) -> Result<Served, ProxyError> {
        let CacheHit { upstream, entry } = hit;
        if !self.store.is_stale(&entry, Some(&upstream)) {
            let entry = self.store.bump_downloads_count(&entry).await?;
            return Ok(Served {
                entry,
                upstream,
                source: ServedFrom::Cache,
            });
        }

        debug!(entry_id = entry.id, "revalidating stale {}", entry.relative_path);
        let fetched = self
            .fetch_with_retry(&upstream, &entry.relative_path, entry.upstream_etag.as_deref())
            .await;
        let (entry, source) = match fetched {
            Ok(Fetched::NotModified) => {
                let attributes = EntryAttributes {
                    upstream_checked_at: Some(Utc::now()),
                    ..EntryAttributes::default()
                };
                let entry = self
                    .store
                    .create_or_update(&upstream, entry.group_id, &entry.relative_path, attributes)
                    .await?;
                (entry, ServedFrom::Revalidated)
            }
            Ok(Fetched::Body(response)) => {
                let entry = self.refresh(&upstream, &entry, response).await?;
                (entry, ServedFrom::Refreshed)
            }
            Ok(Fetched::NotFound) => {
                warn!(
                    upstream_id = upstream.id,
                    "{} is gone from upstream, serving stale copy",
                    entry.relative_path
                );
                (entry, ServedFrom::Stale)
            }
            Err(err) => {
                warn!(
                    upstream_id = upstream.id,
                    "failed to revalidate {}, serving stale copy: {}",
                    entry.relative_path,
                    err
                );
                (entry, ServedFrom::Stale)
            }
        };
        let entry = self.store.bump_downloads_count(&entry).await?;
        Ok(Served {
            entry,
            upstream,
            source,
        })
    }

    /// Fetch a missing file from the first upstream having it.
    ///
    /// Unreachable upstreams are skipped. If no upstream has the file, the last upstream error
    /// is returned, or [`ProxyError::NotFound`] when every upstream answered.
    async fn fetch_from_candidates(
        &self,
        registry: &Registry,
        relative_path: &str,
        candidates: &[Upstream],
    ) -> Result<Served, ProxyError> {
        let mut last_error = None;
        for upstream in candidates {
            match self.fetch_with_retry(upstream, relative_path, None).await {
                Ok(Fetched::Body(response)) => {
                    let entry = self.populate(upstream, relative_path, response).await?;
                    info!(
                        registry_id = registry.id,
                        upstream_id = upstream.id,
                        entry_id = entry.id,
                        "cached {}",
                        relative_path
                    );
                    return Ok(Served {
                        entry,
                        upstream: upstream.clone(),
                        source: ServedFrom::Upstream,
                    });
                }
                Ok(Fetched::NotFound) | Ok(Fetched::NotModified) => {
                    trace!(upstream_id = upstream.id, "{} not found", relative_path);
                }
                Err(err) => {
                    warn!(upstream_id = upstream.id, "failed to fetch {}: {}", relative_path, err);
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| ProxyError::NotFound(relative_path.to_string())))
    }

    /// Stream the response into a new blob and record the cache entry.
    async fn populate(
        &self,
        upstream: &Upstream,
        relative_path: &str,
        response: Response,
    ) -> Result<CacheEntry, ProxyError> {
        let key = object_storage_key_for(upstream);
        let (stored, etag, content_type) = self.store_body(&key, response).await?;
        let attributes = EntryAttributes {
            object_storage_key: Some(key.clone()),
            ..downloaded(stored, etag, content_type)
        };
        let result = self
            .store
            .create_or_update(upstream, upstream.group_id, relative_path, attributes)
            .await;

        // A concurrent writer may own the entry, its blob stays
        let orphaned = match &result {
            Ok(entry) => entry.object_storage_key != key,
            Err(_) => true,
        };
        if orphaned {
            self.discard(&key).await;
        }
        Ok(result?)
    }

    /// Download a stale entry again.
    ///
    /// The body is streamed into a new blob first. If the entry got tombstoned meanwhile, the
    /// recreated entry owns that blob. Otherwise the blob replaces the one under the entry's
    /// existing key.
    async fn refresh(
        &self,
        upstream: &Upstream,
        entry: &CacheEntry,
        response: Response,
    ) -> Result<CacheEntry, ProxyError> {
        let key = object_storage_key_for(upstream);
        let (stored, etag, content_type) = self.store_body(&key, response).await?;
        let attributes = EntryAttributes {
            object_storage_key: Some(key.clone()),
            ..downloaded(stored, etag, content_type)
        };
        let result = match self
            .store
            .create_or_update(upstream, entry.group_id, &entry.relative_path, attributes)
            .await
        {
            Ok(refreshed) if refreshed.object_storage_key == key => {
                debug!(entry_id = refreshed.id, "recreated {}", refreshed.relative_path);
                return Ok(refreshed);
            }
            Ok(refreshed) => self
                .storage
                .rename(&key, &refreshed.object_storage_key)
                .await
                .map(|()| refreshed)
                .map_err(ProxyError::from),
            Err(err) => Err(err.into()),
        };
        if result.is_err() {
            self.discard(&key).await;
        }
        result
    }

    async fn discard(&self, key: &str) {
        if let Err(err) = self.storage.delete(key).await {
            warn!("failed to delete unused blob {}: {}", key, err);
        }
    }

    async fn store_body(
        &self,
        key: &str,
        response: Response,
    ) -> Result<(StoredObject, Option<String>, Option<String>), ProxyError> {
        let header = |name| {
            response
                .headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };
        let etag = header(ETAG);
        let content_type = header(CONTENT_TYPE);
        let stream: ByteStream = Box::pin(
            response
                .bytes_stream()
                .map(|chunk| chunk.map_err(io::Error::other)),
        );
        let stored = self.storage.put(key, stream).await?;
        Ok((stored, etag, content_type))
    }

    /// Fetch with respect to download retry policy.
    ///
    /// Only transient errors are retried.
    async fn fetch_with_retry(
        &self,
        upstream: &Upstream,
        relative_path: &str,
        etag: Option<&str>,
    ) -> Result<Fetched, ProxyError> {
        match self.fetch(upstream, relative_path, etag).await {
            Ok(fetched) => Ok(fetched),
            Err(err) if !err.is_transient() => Err(err),
            Err(err) => match self.download_retry_policy {
                RetryPolicy::None => Err(err),
                RetryPolicy::Fixed { number, period } => {
                    let mut result = Err(err);
                    for i in 0..number {
                        time::sleep(period).await;
                        debug!(
                            upstream_id = upstream.id,
                            "retrying fetch of {}, attempt #{}",
                            relative_path,
                            i + 1
                        );
                        match self.fetch(upstream, relative_path, etag).await {
                            Ok(fetched) => {
                                result = Ok(fetched);
                                break;
                            }
                            Err(err) if !err.is_transient() => {
                                result = Err(err);
                                break;
                            }
                            Err(err) => result = Err(err),
                        }
                    }
                    result
                }
            },
        }
    }

    async fn fetch(
        &self,
        upstream: &Upstream,
        relative_path: &str,
        etag: Option<&str>,
    ) -> Result<Fetched, ProxyError> {
        let url = upstream_url(upstream, relative_path);
        trace!("fetching {}", url);
        let mut request = self.reqwest_client.get(&url);
        if let Some(username) = &upstream.username {
            request = request.basic_auth(username, upstream.password.as_ref());
        }
        if let Some(etag) = etag {
            request = request.header(IF_NONE_MATCH, etag);
        }
        let response = request.send().await?;
        match response.status() {
            StatusCode::OK => Ok(Fetched::Body(response)),
            StatusCode::NOT_MODIFIED => Ok(Fetched::NotModified),
            StatusCode::NOT_FOUND => Ok(Fetched::NotFound),
            status => Err(ProxyError::UpstreamStatus {
                upstream_id: upstream.id,
                status: status.as_u16(),
            }),
        }
    }
}

impl fmt::Debug for RegistryProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryProxy")
            .field("store", &self.store)
            .field("reqwest_client", &self.reqwest_client)
            .field("download_retry_policy", &self.download_retry_policy)
            .finish()
    }
}

fn upstream_url(upstream: &Upstream, relative_path: &str) -> String {
    format!(
        "{}/{}",
        upstream.url.trim_end_matches('/'),
        relative_path.trim_start_matches('/')
    )
}

/// Attributes of a freshly downloaded file.
fn downloaded(
    stored: StoredObject,
    etag: Option<String>,
    content_type: Option<String>,
) -> EntryAttributes {
    let now = Utc::now();
    EntryAttributes {
        size: Some(stored.size),
        file_sha1: Some(stored.sha1),
        file_md5: Some(stored.md5),
        upstream_etag: etag,
        content_type,
        upstream_checked_at: Some(now),
        downloaded_at: Some(now),
        object_storage_key: None,
    }
}
