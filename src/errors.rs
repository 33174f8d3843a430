//! Error types.

use diesel::result::DatabaseErrorKind;

use crate::database::models::{RegistryKind, Upstream};
use crate::database::ConflictError;

#[doc(no_inline)]
pub use diesel::result::{ConnectionError, Error as DieselError};

#[doc(no_inline)]
pub use diesel_async::pooled_connection::deadpool::{BuildError, PoolError};

/// Registry database related errors.
#[derive(thiserror::Error, Debug)]
pub enum DatabaseError {
    #[error("connection failed")]
    ConnectionError(#[from] ConnectionError),

    #[error("failed to build connection pool")]
    PoolBuildError(#[from] BuildError),

    #[error("connection pool error")]
    PoolError(#[from] PoolError),

    #[error("migration failed: {0}")]
    MigrationError(String),

    #[error(transparent)]
    DieselError(#[from] DieselError),
}

impl DatabaseError {
    /// Whether the error is unique key violation.
    pub fn is_unique_violation(&self) -> bool {
        matches!(
            *self,
            DatabaseError::DieselError(DieselError::DatabaseError(
                DatabaseErrorKind::UniqueViolation,
                _
            ))
        )
    }

    /// Whether the error is a missing row.
    pub fn is_not_found(&self) -> bool {
        matches!(*self, DatabaseError::DieselError(DieselError::NotFound))
    }
}

/// Object storage errors.
#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("invalid object storage key '{0}'")]
    InvalidKey(String),
}

/// Cache entry store errors.
#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    #[error("database error: {0}")]
    DatabaseError(#[from] DatabaseError),

    #[error("cache entry is invalid: {}", .0.join(", "))]
    Validation(Vec<String>),
}

impl CacheError {
    /// Whether the error is a unique violation.
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, CacheError::DatabaseError(err) if err.is_unique_violation())
    }
}

impl ConflictError for CacheError {
    fn is_unique_violation(&self) -> bool {
        CacheError::is_unique_violation(self)
    }
}

impl From<DieselError> for CacheError {
    fn from(err: DieselError) -> Self {
        CacheError::DatabaseError(err.into())
    }
}

/// Upstream resolution errors.
///
/// [`ResolveError::FileNotFound`] is the only variant describing an ordinary cache miss.
/// Every other variant is either a request or a configuration problem.
#[derive(thiserror::Error, Debug)]
pub enum ResolveError {
    #[error("path should be present")]
    BlankPath,

    #[error("invalid path '{0}'")]
    InvalidPath(String),

    #[error("registry {0} not found")]
    RegistryNotFound(i32),

    #[error("no upstreams set")]
    NoUpstreams,

    #[error("no finder strategy registered for {0} registries")]
    NoFinderStrategy(RegistryKind),

    #[error("file '{path}' not found on any upstream")]
    FileNotFound {
        path: String,
        candidates: Vec<Upstream>,
    },

    #[error("database error: {0}")]
    DatabaseError(#[from] DatabaseError),
}

impl ResolveError {
    /// Configuration errors must not be treated as cache misses.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            ResolveError::NoUpstreams | ResolveError::NoFinderStrategy(_)
        )
    }
}

/// Registry and upstream lifecycle errors.
#[derive(thiserror::Error, Debug)]
pub enum LifecycleError {
    #[error("action is not allowed")]
    Unauthorized,

    #[error("{0}")]
    Validation(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i32 },

    #[error("invalid cache entry id: {0}")]
    InvalidEntryId(#[from] EntryIdError),

    #[error("database error: {0}")]
    DatabaseError(#[from] DatabaseError),

    #[error(transparent)]
    CacheError(#[from] CacheError),
}

impl From<DieselError> for LifecycleError {
    fn from(err: DieselError) -> Self {
        LifecycleError::DatabaseError(err.into())
    }
}

/// Cleanup engine errors.
#[derive(thiserror::Error, Debug)]
pub enum CleanupError {
    #[error("database error: {0}")]
    DatabaseError(#[from] DatabaseError),

    #[error("storage error: {0}")]
    StorageError(#[from] StorageError),

    #[error(transparent)]
    CacheError(#[from] CacheError),

    #[error("cleanup worker panicked: {0}")]
    JoinError(#[from] tokio::task::JoinError),

    #[error("{0}")]
    CustomError(String),
}

impl From<DieselError> for CleanupError {
    fn from(err: DieselError) -> Self {
        CleanupError::DatabaseError(err.into())
    }
}

/// Proxy (serve) errors.
#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
    #[error("action is not allowed")]
    Unauthorized,

    #[error(transparent)]
    ResolveError(#[from] ResolveError),

    #[error("file '{0}' not found on any upstream")]
    NotFound(String),

    #[error("download error: {0}")]
    DownloadError(#[from] reqwest::Error),

    #[error("failed to build HTTP client: {0}")]
    ReqwestClientBuildError(reqwest::Error),

    #[error("upstream {upstream_id} responded with HTTP status {status}")]
    UpstreamStatus { upstream_id: i32, status: u16 },

    #[error("storage error: {0}")]
    StorageError(#[from] StorageError),

    #[error(transparent)]
    CacheError(#[from] CacheError),

    #[error("database error: {0}")]
    DatabaseError(#[from] DatabaseError),
}

impl ProxyError {
    /// Transport failures and server-side upstream errors, worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            ProxyError::DownloadError(_) => true,
            ProxyError::UpstreamStatus { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Configuration loading errors.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("malformed configuration: {0}")]
    ParseError(#[from] serde_json::Error),
}

/// Wire-level cache entry id decoding errors.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum EntryIdError {
    #[error("not a valid base64 string")]
    Base64,

    #[error("not a valid UTF-8 string")]
    Utf8,

    #[error("missing upstream id separator")]
    MissingSeparator,

    #[error("upstream id is not a number")]
    UpstreamId,

    #[error("relative path is blank")]
    BlankPath,
}

/// Non UTF-8 symbol in path.
#[derive(thiserror::Error, Debug)]
#[error("non-UTF-8 symbol in path")]
pub struct NonUtf8PathError;
