use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use diesel::deserialize::{self, FromSql, FromSqlRow};
use diesel::serialize::{self, IsNull, Output, ToSql};
use diesel::sql_types::Integer;
use diesel::sqlite::{Sqlite, SqliteValue};
use diesel::{AsChangeset, AsExpression, Insertable, Queryable, Selectable};
use serde::{Deserialize, Serialize};

use crate::database::schema;

/// Implements integer (de)serialization for a fieldless enum.
macro_rules! integer_enum {
    ($name:ident { $($variant:ident = $value:literal),+ $(,)? }) => {
        impl ToSql<Integer, Sqlite> for $name {
            fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Sqlite>) -> serialize::Result {
                let value: i32 = match *self {
                    $(Self::$variant => $value,)+
                };
                out.set_value(value);
                Ok(IsNull::No)
            }
        }

        impl FromSql<Integer, Sqlite> for $name
        where
            i32: FromSql<Integer, Sqlite>,
        {
            fn from_sql(bytes: SqliteValue) -> deserialize::Result<Self> {
                match i32::from_sql(bytes)? {
                    $($value => Ok(Self::$variant),)+
                    other => Err(format!(
                        "unrecognized {} variant: {}",
                        stringify!($name),
                        other
                    )
                    .into()),
                }
            }
        }
    };
}

/// Kind of a namespace.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, FromSqlRow, AsExpression)]
#[derive(Serialize, Deserialize)]
#[diesel(sql_type = Integer)]
#[serde(rename_all = "snake_case")]
pub enum NamespaceKind {
    Group,
    Project,
}

integer_enum!(NamespaceKind {
    Group = 0,
    Project = 1,
});

/// Package format served by a registry and its upstreams.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, FromSqlRow, AsExpression)]
#[derive(Serialize, Deserialize)]
#[diesel(sql_type = Integer)]
#[serde(rename_all = "snake_case")]
pub enum RegistryKind {
    Maven,
    Container,
}

integer_enum!(RegistryKind {
    Maven = 0,
    Container = 1,
});

impl RegistryKind {
    pub const ALL: [RegistryKind; 2] = [RegistryKind::Maven, RegistryKind::Container];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Maven => "maven",
            Self::Container => "container",
        }
    }
}

impl fmt::Display for RegistryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RegistryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown registry kind '{}'", s))
    }
}

/// Status of a cache entry.
///
/// Only [`CacheEntryStatus::Default`] entries are served.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, FromSqlRow, AsExpression)]
#[derive(Serialize, Deserialize)]
#[diesel(sql_type = Integer)]
#[serde(rename_all = "snake_case")]
pub enum CacheEntryStatus {
    /// Live entry.
    #[default]
    Default,

    /// Entry is being written.
    Processing,

    /// Tombstoned entry waiting for physical removal.
    PendingDestruction,

    /// Physical removal failed.
    Error,
}

integer_enum!(CacheEntryStatus {
    Default = 0,
    Processing = 1,
    PendingDestruction = 2,
    Error = 3,
});

impl fmt::Display for CacheEntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match *self {
                Self::Default => "default",
                Self::Processing => "processing",
                Self::PendingDestruction => "pending_destruction",
                Self::Error => "error",
            }
        )
    }
}

/// Status of a cleanup policy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, FromSqlRow, AsExpression)]
#[derive(Serialize, Deserialize)]
#[diesel(sql_type = Integer)]
#[serde(rename_all = "snake_case")]
pub enum CleanupPolicyStatus {
    #[default]
    Scheduled,
    Running,
    Failed,
}

integer_enum!(CleanupPolicyStatus {
    Scheduled = 0,
    Running = 1,
    Failed = 2,
});

impl fmt::Display for CleanupPolicyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match *self {
                Self::Scheduled => "scheduled",
                Self::Running => "running",
                Self::Failed => "failed",
            }
        )
    }
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = schema::namespaces)]
#[diesel(check_for_backend(Sqlite))]
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Namespace {
    pub id: i32,
    pub parent_id: Option<i32>,
    pub kind: NamespaceKind,
    pub path: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Insertable)]
#[diesel(table_name = schema::namespaces)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewNamespace {
    pub parent_id: Option<i32>,
    pub kind: NamespaceKind,
    pub path: String,
    pub created_at: DateTime<Utc>,
}

impl NewNamespace {
    pub fn group(path: &str, parent_id: Option<i32>) -> Self {
        Self {
            parent_id,
            kind: NamespaceKind::Group,
            path: path.to_string(),
            created_at: Utc::now(),
        }
    }

    pub fn project(path: &str, parent_id: i32) -> Self {
        Self {
            parent_id: Some(parent_id),
            kind: NamespaceKind::Project,
            path: path.to_string(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = schema::registries)]
#[diesel(check_for_backend(Sqlite))]
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Registry {
    pub id: i32,
    pub group_id: i32,
    pub top_level_group_id: i32,
    pub kind: RegistryKind,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable)]
#[diesel(table_name = schema::registries)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewRegistry {
    pub group_id: i32,
    pub top_level_group_id: i32,
    pub kind: RegistryKind,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = schema::upstreams)]
#[diesel(check_for_backend(Sqlite))]
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Upstream {
    pub id: i32,
    pub group_id: i32,
    pub kind: RegistryKind,
    pub name: String,
    pub url: String,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub cache_validity_hours: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable)]
#[diesel(table_name = schema::upstreams)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewUpstream {
    pub group_id: i32,
    pub kind: RegistryKind,
    pub name: String,
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub cache_validity_hours: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = schema::registry_upstreams)]
#[diesel(check_for_backend(Sqlite))]
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RegistryUpstream {
    pub id: i32,
    pub registry_id: i32,
    pub upstream_id: i32,
    pub position: i32,
}

#[derive(Insertable)]
#[diesel(table_name = schema::registry_upstreams)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewRegistryUpstream {
    pub registry_id: i32,
    pub upstream_id: i32,
    pub position: i32,
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = schema::cache_entries)]
#[diesel(check_for_backend(Sqlite))]
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CacheEntry {
    pub id: i32,
    pub group_id: i32,
    pub upstream_id: Option<i32>,
    pub relative_path: String,
    pub object_storage_key: String,
    pub size: i64,
    pub file_sha1: String,
    pub file_md5: Option<String>,
    pub upstream_etag: Option<String>,
    pub content_type: String,
    pub upstream_checked_at: DateTime<Utc>,
    pub downloaded_at: DateTime<Utc>,
    pub downloads_count: i64,
    pub status: CacheEntryStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable)]
#[diesel(table_name = schema::cache_entries)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewCacheEntry {
    pub group_id: i32,
    pub upstream_id: Option<i32>,
    pub relative_path: String,
    pub object_storage_key: String,
    pub size: i64,
    pub file_sha1: String,
    pub file_md5: Option<String>,
    pub upstream_etag: Option<String>,
    pub content_type: String,
    pub upstream_checked_at: DateTime<Utc>,
    pub downloaded_at: DateTime<Utc>,
    pub downloads_count: i64,
    pub status: CacheEntryStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Partial update of a cache entry.
///
/// `object_storage_key` is deliberately absent: it is fixed at creation.
#[derive(AsChangeset)]
#[diesel(table_name = schema::cache_entries)]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheEntryChangeset {
    pub size: Option<i64>,
    pub file_sha1: Option<String>,
    pub file_md5: Option<Option<String>>,
    pub upstream_etag: Option<Option<String>>,
    pub content_type: Option<String>,
    pub upstream_checked_at: Option<DateTime<Utc>>,
    pub downloaded_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = schema::cleanup_policies)]
#[diesel(check_for_backend(Sqlite))]
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CleanupPolicy {
    pub id: i32,
    pub group_id: i32,
    pub enabled: bool,
    pub cadence_days: i32,
    pub keep_n_days_after_download: i32,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub status: CleanupPolicyStatus,
    pub last_run_deleted_entries_count: i32,
    pub last_run_deleted_size: i64,
    pub last_run_detailed_metrics: Option<String>,
    pub failure_message: Option<String>,
    pub notify_on_success: bool,
    pub notify_on_failure: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable)]
#[diesel(table_name = schema::cleanup_policies)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewCleanupPolicy {
    pub group_id: i32,
    pub enabled: bool,
    pub cadence_days: i32,
    pub keep_n_days_after_download: i32,
    pub next_run_at: Option<DateTime<Utc>>,
    pub status: CleanupPolicyStatus,
    pub notify_on_success: bool,
    pub notify_on_failure: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Settings update of a cleanup policy.
#[derive(AsChangeset)]
#[diesel(table_name = schema::cleanup_policies)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CleanupPolicySettingsChangeset {
    pub enabled: bool,
    pub cadence_days: i32,
    pub keep_n_days_after_download: i32,
    pub next_run_at: Option<Option<DateTime<Utc>>>,
    pub notify_on_success: bool,
    pub notify_on_failure: bool,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of a cleanup run.
#[derive(AsChangeset)]
#[diesel(table_name = schema::cleanup_policies)]
#[diesel(treat_none_as_null = true)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CleanupRunChangeset {
    pub status: CleanupPolicyStatus,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_deleted_entries_count: i32,
    pub last_run_deleted_size: i64,
    pub last_run_detailed_metrics: Option<String>,
    pub failure_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}
