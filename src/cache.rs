//! Cache entry store.
//!
//! Maps `(upstream, relative_path)` to a cached blob and its metadata. At most one live
//! (`default`) entry exists per key, concurrent writers included.

use chrono::{DateTime, Utc};
use diesel_async::scoped_futures::ScopedFutureExt;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::cache_validity;
use crate::database::models::{
    CacheEntry, CacheEntryChangeset, CacheEntryStatus, NewCacheEntry, Upstream,
};
use crate::database::{api, upsert_with_conflict_retry, Database};
use crate::errors::CacheError;

/// Longest accepted relative path.
pub const MAX_PATH_LENGTH: usize = 1024;

/// Longest accepted content type and ETag.
pub const MAX_ATTRIBUTE_LENGTH: usize = 255;

pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Attributes written by [`CacheEntryStore::create_or_update`].
///
/// `None` leaves the stored value untouched. `file_sha1` and `size` are required
/// when the entry does not exist yet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryAttributes {
    pub size: Option<i64>,
    pub file_sha1: Option<String>,
    pub file_md5: Option<String>,
    pub upstream_etag: Option<String>,
    pub content_type: Option<String>,
    pub upstream_checked_at: Option<DateTime<Utc>>,
    pub downloaded_at: Option<DateTime<Utc>>,

    /// Storage key of a new entry. Ignored for existing entries.
    pub object_storage_key: Option<String>,
}

impl EntryAttributes {
    fn validate(&self, relative_path: &str, creating: bool) -> Result<(), CacheError> {
        let mut errors = Vec::new();

        if relative_path.trim().is_empty() {
            errors.push("relative path can't be blank".to_string());
        } else if relative_path.chars().count() > MAX_PATH_LENGTH {
            errors.push(format!(
                "relative path is too long (maximum is {} characters)",
                MAX_PATH_LENGTH
            ));
        }

        match &self.file_sha1 {
            Some(sha1) if !is_hex_of_length(sha1, 40) => {
                errors.push("file sha1 must be 40 hexadecimal characters".to_string())
            }
            None if creating => errors.push("file sha1 can't be blank".to_string()),
            _ => {}
        }

        if let Some(md5) = &self.file_md5 {
            if !is_hex_of_length(md5, 32) {
                errors.push("file md5 must be 32 hexadecimal characters".to_string());
            }
        }

        match self.size {
            Some(size) if size < 0 => {
                errors.push("size must be greater than or equal to 0".to_string())
            }
            None if creating => errors.push("size can't be blank".to_string()),
            _ => {}
        }

        for (name, value) in [
            ("content type", &self.content_type),
            ("upstream etag", &self.upstream_etag),
        ] {
            if value
                .as_ref()
                .is_some_and(|value| value.chars().count() > MAX_ATTRIBUTE_LENGTH)
            {
                errors.push(format!(
                    "{} is too long (maximum is {} characters)",
                    name, MAX_ATTRIBUTE_LENGTH
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(CacheError::Validation(errors))
        }
    }

    fn changeset(&self, now: DateTime<Utc>) -> CacheEntryChangeset {
        CacheEntryChangeset {
            size: self.size,
            file_sha1: self.file_sha1.clone(),
            file_md5: self.file_md5.clone().map(Some),
            upstream_etag: self.upstream_etag.clone().map(Some),
            content_type: self.content_type.clone(),
            upstream_checked_at: self.upstream_checked_at,
            downloaded_at: self.downloaded_at,
            updated_at: Some(now),
        }
    }

    fn new_entry(
        &self,
        upstream: &Upstream,
        group_id: i32,
        relative_path: &str,
        now: DateTime<Utc>,
    ) -> NewCacheEntry {
        NewCacheEntry {
            group_id,
            upstream_id: Some(upstream.id),
            relative_path: relative_path.to_string(),
            object_storage_key: self
                .object_storage_key
                .clone()
                .unwrap_or_else(|| object_storage_key_for(upstream)),
            size: self.size.unwrap_or_default(),
            file_sha1: self.file_sha1.clone().unwrap_or_default(),
            file_md5: self.file_md5.clone(),
            upstream_etag: self.upstream_etag.clone(),
            content_type: self
                .content_type
                .clone()
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
            upstream_checked_at: self.upstream_checked_at.unwrap_or(now),
            downloaded_at: self.downloaded_at.unwrap_or(now),
            downloads_count: 1,
            status: CacheEntryStatus::Default,
            created_at: now,
            updated_at: now,
        }
    }
}

fn is_hex_of_length(value: &str, length: usize) -> bool {
    value.len() == length && value.chars().all(|c| c.is_ascii_hexdigit())
}

/// New object storage key for a file of `upstream`.
///
/// Keys are spread by the hashed upstream id and made unique by a random component.
pub fn object_storage_key_for(upstream: &Upstream) -> String {
    let hash = sha256::digest(upstream.id.to_string());
    format!(
        "virtual_registries/{}/{}/{}/{}/{}",
        upstream.kind,
        &hash[0..2],
        &hash[2..4],
        hash,
        Uuid::new_v4()
    )
}

/// Path suffix of a tombstoned entry, unique per call.
pub fn tombstone_suffix() -> String {
    format!("/deleted/{}", Uuid::new_v4())
}

/// Cache entry store backed by the registry database.
#[derive(Debug, Clone)]
pub struct CacheEntryStore {
    db: Database,
}

impl CacheEntryStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Find the live entry for `(upstream, relative_path)` or create it, then apply `attributes`.
    ///
    /// A concurrent writer winning the race for the same key makes the insert fail with a
    /// unique violation. The whole find-or-initialize is retried exactly once, which then
    /// finds the winner's row and updates it.
    pub async fn create_or_update(
        &self,
        upstream: &Upstream,
        group_id: i32,
        relative_path: &str,
        attributes: EntryAttributes,
    ) -> Result<CacheEntry, CacheError> {
        attributes.validate(relative_path, false)?;
        let attributes = &attributes;
        upsert_with_conflict_retry(1, move || {
            self.find_or_initialize_and_save(upstream, group_id, relative_path, attributes)
        })
        .await
    }

    async fn find_or_initialize_and_save(
        &self,
        upstream: &Upstream,
        group_id: i32,
        relative_path: &str,
        attributes: &EntryAttributes,
    ) -> Result<CacheEntry, CacheError> {
        let mut connection = self.db.get().await?;
        connection
            .immediate_transaction(|conn| {
                async move {
                    let now = Utc::now();
                    match api::cache_entries::find_live(conn, upstream.id, relative_path).await? {
                        Some(entry) => {
                            trace!("updating cache entry {}", entry.id);
                            let changeset = attributes.changeset(now);
                            Ok(api::cache_entries::update(conn, entry.id, &changeset).await?)
                        }
                        None => {
                            attributes.validate(relative_path, true)?;
                            let new_entry =
                                attributes.new_entry(upstream, group_id, relative_path, now);
                            debug!(
                                upstream_id = upstream.id,
                                relative_path, "creating cache entry"
                            );
                            Ok(api::cache_entries::insert(conn, new_entry).await?)
                        }
                    }
                }
                .scope_boxed()
            })
            .await
    }

    /// Tombstone the entry, freeing its path for a new live entry.
    ///
    /// Status and path change in one statement, the storage key is left alone.
    /// Returns `false` if the entry was not live.
    pub async fn mark_as_pending_destruction(
        &self,
        entry: &CacheEntry,
    ) -> Result<bool, CacheError> {
        let suffix = tombstone_suffix();
        let mut conn = self.db.get().await?;
        let updated =
            api::cache_entries::mark_pending_destruction(&mut conn, entry.id, &suffix, Utc::now())
                .await?;
        Ok(updated > 0)
    }

    /// Count one more download of the entry.
    pub async fn bump_downloads_count(&self, entry: &CacheEntry) -> Result<CacheEntry, CacheError> {
        let mut conn = self.db.get().await?;
        Ok(api::cache_entries::bump_downloads_count(&mut conn, entry.id, Utc::now()).await?)
    }

    /// Staleness of the entry when served through `upstream`.
    pub fn is_stale(&self, entry: &CacheEntry, upstream: Option<&Upstream>) -> bool {
        cache_validity::is_entry_stale(entry, upstream, Utc::now())
    }

    pub async fn get(&self, id: i32) -> Result<CacheEntry, CacheError> {
        let mut conn = self.db.get().await?;
        Ok(api::cache_entries::get(&mut conn, id).await?)
    }

    pub async fn find(
        &self,
        upstream_id: i32,
        relative_path: &str,
    ) -> Result<Option<CacheEntry>, CacheError> {
        let mut conn = self.db.get().await?;
        Ok(api::cache_entries::find_live(&mut conn, upstream_id, relative_path).await?)
    }

    /// Live entries of the upstreams not downloaded since `older_than`.
    pub async fn requiring_cleanup(
        &self,
        upstream_ids: &[i32],
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<CacheEntry>, CacheError> {
        let mut conn = self.db.get().await?;
        Ok(api::cache_entries::requiring_cleanup(&mut conn, upstream_ids, older_than, limit).await?)
    }

    /// Live entries of the upstream whose path contains `fragment`.
    pub async fn search(
        &self,
        upstream_id: i32,
        fragment: &str,
        limit: i64,
    ) -> Result<Vec<CacheEntry>, CacheError> {
        let mut conn = self.db.get().await?;
        Ok(api::cache_entries::search(&mut conn, upstream_id, fragment, limit).await?)
    }

    pub async fn list_for_upstream(
        &self,
        upstream_id: i32,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<CacheEntry>, CacheError> {
        let mut conn = self.db.get().await?;
        Ok(api::cache_entries::live_for_upstream(&mut conn, upstream_id, limit, offset).await?)
    }
}
