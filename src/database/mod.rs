//! Virtual registry database.
//!
//! An SQLite database build with migrations from `./migrations`.

use std::fmt;
use std::future::Future;

use diesel::{ConnectionError, ConnectionResult, SqliteConnection};
use diesel_async::async_connection_wrapper::AsyncConnectionWrapper;
use diesel_async::pooled_connection::deadpool::{Object, Pool};
use diesel_async::pooled_connection::{AsyncDieselConnectionManager, ManagerConfig};
use diesel_async::sync_connection_wrapper::SyncConnectionWrapper;
use diesel_async::{AsyncConnection, SimpleAsyncConnection};
use diesel_migrations::{EmbeddedMigrations, MigrationHarness};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::time::{self, Duration};
use tracing::{debug, trace};

use crate::errors::DatabaseError;

pub mod api;
pub mod models;
pub mod schema;

#[cfg(feature = "stresstest")]
#[cfg(test)]
mod database_stresstest;

/// Inner SQLite connection type.
pub type Connection = SyncConnectionWrapper<SqliteConnection>;

/// Connection checked out of the pool.
pub type PooledConnection = Object<Connection>;

/// SQLite pool connection manager type.
type ConnectionManager = AsyncDieselConnectionManager<Connection>;

/// Result of database operations.
pub type DatabaseResult<T> = Result<T, DatabaseError>;

const MIGRATIONS: EmbeddedMigrations =
    diesel_migrations::embed_migrations!("src/database/migrations");

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

const RETRY_TIMES: usize = 3;
const RETRY_PERIOD: Duration = Duration::from_millis(100);

/// Establish connection with SQLite database and configure it with:
///
/// - `PRAGMA journal_mode = WAL`
/// - `PRAGMA synchronous = NORMAL`
/// - `PRAGMA busy_timeout = 10_000`
/// - `PRAGMA foreign_keys = ON`
///
/// We really want this to succeed, that's why we retry.
fn establish_connection(database_url: &str) -> BoxFuture<ConnectionResult<Connection>> {
    let fut = async move {
        trace!("establishing connection with {}", database_url);
        let mut connection = Connection::establish(database_url).await?;

        let query = format!(
            "PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL; PRAGMA busy_timeout = {}; PRAGMA foreign_keys = ON;",
            BUSY_TIMEOUT.as_millis()
        );
        trace!("executing: {}", &query);
        let result = connection.batch_execute(&query).await;

        match result {
            Ok(_) => Ok(connection),
            Err(err) => {
                trace!("SQLite connection configuration failed: {:?}", err);
                let mut result = Err(ConnectionError::CouldntSetupConfiguration(err));
                for i in 0..RETRY_TIMES {
                    trace!("retrying, attempt #{}", i + 1);
                    time::sleep(RETRY_PERIOD).await;
                    if let Err(err) = connection.batch_execute(&query).await {
                        // Last occurred error will be returned
                        trace!("SQLite connection configuration failed: {:?}", err);
                        result = Err(ConnectionError::CouldntSetupConfiguration(err));
                    } else {
                        result = Ok(connection);
                        break;
                    }
                }
                result
            }
        }
    };
    fut.boxed()
}

/// Run pending migrations on SQLite database specified with `database_url`.
pub async fn run_migrations(database_url: &str) -> DatabaseResult<()> {
    let connection = establish_connection(database_url).await?;
    let mut async_wrapper: AsyncConnectionWrapper<Connection> =
        AsyncConnectionWrapper::from(connection);

    trace!("running pending migrations");
    let applied = tokio::task::spawn_blocking(move || {
        async_wrapper
            .run_pending_migrations(MIGRATIONS)
            .map(|applied| {
                applied
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
            })
            .map_err(|e| e.to_string())
    })
    .await
    .map_err(|e| DatabaseError::MigrationError(e.to_string()))?
    .map_err(DatabaseError::MigrationError)?;

    if applied.is_empty() {
        trace!("no migrations applied");
    } else {
        trace!("migrations applied:");
        for migration in &applied {
            trace!(" - {}", migration);
        }
    }
    Ok(())
}

/// Virtual registry database backed by SQLite.
///
/// Cheap to clone: all clones share one connection pool.
#[derive(Clone)]
pub struct Database {
    database_url: String,
    pool: Pool<Connection>,
}

impl Database {
    /// Run pending migrations and build connection pool.
    ///
    /// If SQLite database does not exists, it will be created.
    pub async fn init(database_url: &str, max_size: Option<usize>) -> DatabaseResult<Self> {
        debug!("initializing database {}", database_url);
        run_migrations(database_url).await?;
        Self::connect_pool(database_url, max_size)
    }

    /// Build connection pool for SQLite database with `database_url`.
    ///
    /// For each established connection following configs will be applied:
    /// - `PRAGMA journal_mode = WAL`
    /// - `PRAGMA synchronous = NORMAL`
    /// - `PRAGMA busy_timeout = 10_000`
    /// - `PRAGMA foreign_keys = ON`
    ///
    /// `max_size` defines the maximum size of the pool and defaults to `cpu_count * 4`.
    pub fn connect_pool(database_url: &str, max_size: Option<usize>) -> DatabaseResult<Self> {
        let mut config = ManagerConfig::default();
        config.custom_setup = Box::new(establish_connection);
        let manager = ConnectionManager::new_with_config(database_url, config);
        let mut pool_builder = Pool::builder(manager);
        if let Some(max_size) = max_size {
            pool_builder = pool_builder.max_size(max_size);
        }
        let pool = pool_builder.build()?;
        Ok(Self {
            pool,
            database_url: database_url.to_string(),
        })
    }

    /// Get a connection from the pool.
    pub async fn get(&self) -> DatabaseResult<PooledConnection> {
        Ok(self.pool.get().await?)
    }

    pub fn url(&self) -> &str {
        &self.database_url
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("database_url", &self.database_url)
            .finish()
    }
}

/// Errors which may be caused by a concurrent writer of the same row.
pub trait ConflictError {
    fn is_unique_violation(&self) -> bool;
}

impl ConflictError for DatabaseError {
    fn is_unique_violation(&self) -> bool {
        DatabaseError::is_unique_violation(self)
    }
}

/// Run `op`, running it again up to `max_retries` times while it fails with a unique violation.
///
/// The operation is expected to re-read the state it depends on, so a retry observes the row
/// written by the concurrent winner. Any other error is returned immediately.
pub async fn upsert_with_conflict_retry<T, E, F, Fut>(max_retries: usize, mut op: F) -> Result<T, E>
where
    E: ConflictError,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(err) if err.is_unique_violation() && attempt < max_retries => {
                attempt += 1;
                debug!("unique violation, retrying, attempt #{}", attempt);
            }
            result => return result,
        }
    }
}

/// Database fixtures. Helps in testing database-related code.
#[cfg(test)]
pub(crate) mod fixtures {
    use super::models::{
        CacheEntry, NewCacheEntry, NewNamespace, NewRegistry, NewRegistryUpstream, NewUpstream,
        Registry, RegistryKind, Upstream,
    };
    use super::*;
    use crate::database::models::{CacheEntryStatus, Namespace};
    use crate::errors::NonUtf8PathError;
    use chrono::{DateTime, Utc};
    use rstest::fixture;
    use tempfile::TempDir;

    pub const SHA1: &str = "4e1243bd22c66e76c2ba9eddc1f91394e57f9f83";
    pub const MD5: &str = "d8e8fca2dc0f896fd7cb4cb0031ba249";

    /// Fixture which creates new database as temp file.
    /// Removes database on drop.
    pub(crate) struct DatabaseFixture {
        /// Just holds temp directory, which will be removed on drop.
        #[allow(dead_code)]
        tmp: TempDir,

        /// Path to database `*.sqlite` file.
        pub db_path: String,

        /// Database with connection pool.
        pub db: Database,
    }

    impl DatabaseFixture {
        /// Create new empty temp database.
        pub async fn new() -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let db_path = tmp.path().join("vreg.sqlite");
            let db_path = db_path
                .as_os_str()
                .to_str()
                .ok_or(NonUtf8PathError)
                .unwrap()
                .to_string();
            let db = Database::init(&db_path, Some(8)).await.unwrap();
            Self { tmp, db_path, db }
        }

        pub async fn conn(&self) -> PooledConnection {
            self.db.get().await.unwrap()
        }

        pub async fn group(&self, path: &str, parent_id: Option<i32>) -> Namespace {
            let mut conn = self.conn().await;
            api::namespaces::insert(&mut conn, NewNamespace::group(path, parent_id))
                .await
                .unwrap()
        }

        pub async fn project(&self, path: &str, parent_id: i32) -> Namespace {
            let mut conn = self.conn().await;
            api::namespaces::insert(&mut conn, NewNamespace::project(path, parent_id))
                .await
                .unwrap()
        }

        pub async fn registry(&self, group: &Namespace, kind: RegistryKind) -> Registry {
            let mut conn = self.conn().await;
            let top_level = api::namespaces::top_level_group_id(&mut conn, group.id)
                .await
                .unwrap();
            let now = Utc::now();
            api::registries::insert(
                &mut conn,
                NewRegistry {
                    group_id: group.id,
                    top_level_group_id: top_level,
                    kind,
                    name: format!("{} registry", kind),
                    description: None,
                    created_at: now,
                    updated_at: now,
                },
            )
            .await
            .unwrap()
        }

        /// Create upstream and append it to the registry chain.
        pub async fn upstream(&self, registry: &Registry, cache_validity_hours: i32) -> Upstream {
            let mut conn = self.conn().await;
            let now = Utc::now();
            let upstream = api::upstreams::insert(
                &mut conn,
                NewUpstream {
                    group_id: registry.top_level_group_id,
                    kind: registry.kind,
                    name: "upstream".to_string(),
                    url: "http://localhost:1/repo".to_string(),
                    username: None,
                    password: None,
                    cache_validity_hours,
                    created_at: now,
                    updated_at: now,
                },
            )
            .await
            .unwrap();
            let position = api::registry_upstreams::max_position(&mut conn, registry.id)
                .await
                .unwrap()
                + 1;
            api::registry_upstreams::insert(
                &mut conn,
                NewRegistryUpstream {
                    registry_id: registry.id,
                    upstream_id: upstream.id,
                    position,
                },
            )
            .await
            .unwrap();
            upstream
        }

        pub fn new_entry(upstream: &Upstream, relative_path: &str) -> NewCacheEntry {
            let now = Utc::now();
            NewCacheEntry {
                group_id: upstream.group_id,
                upstream_id: Some(upstream.id),
                relative_path: relative_path.to_string(),
                object_storage_key: format!("test/{}/{}", upstream.id, relative_path),
                size: 42,
                file_sha1: SHA1.to_string(),
                file_md5: Some(MD5.to_string()),
                upstream_etag: None,
                content_type: "application/octet-stream".to_string(),
                upstream_checked_at: now,
                downloaded_at: now,
                downloads_count: 1,
                status: CacheEntryStatus::Default,
                created_at: now,
                updated_at: now,
            }
        }

        pub async fn entry(&self, upstream: &Upstream, relative_path: &str) -> CacheEntry {
            self.insert_entry(Self::new_entry(upstream, relative_path))
                .await
        }

        pub async fn insert_entry(&self, entry: NewCacheEntry) -> CacheEntry {
            let mut conn = self.conn().await;
            api::cache_entries::insert(&mut conn, entry).await.unwrap()
        }

        pub async fn entry_downloaded_at(
            &self,
            upstream: &Upstream,
            relative_path: &str,
            downloaded_at: DateTime<Utc>,
            size: i64,
        ) -> CacheEntry {
            self.insert_entry(NewCacheEntry {
                downloaded_at,
                size,
                ..Self::new_entry(upstream, relative_path)
            })
            .await
        }
    }

    /// New empty database.
    #[fixture]
    pub async fn database() -> DatabaseFixture {
        DatabaseFixture::new().await
    }
}
