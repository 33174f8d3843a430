//! # vreg (virtual registry)
//!
//! Upstream caching layer of a virtual package registry. A registry is an ordered chain of
//! upstreams. Files requested through the registry are looked up in the cache of each
//! upstream in chain order, fetched on a miss, and revalidated once stale. Cleanup policies
//! evict files nobody downloaded for a while.
//!
//! ## Example
//!
//! ```rust,no_run
//! # tokio_test::block_on(async {
//! use std::sync::Arc;
//!
//! use vreg::auth::{Actor, AllowAll};
//! use vreg::config::Config;
//! use vreg::database::models::RegistryKind;
//! use vreg::database::Database;
//! use vreg::lifecycle::{RegistryParams, RegistryService, UpstreamParams};
//! use vreg::object_storage::FileSystemStorage;
//! use vreg::proxy::RegistryProxy;
//!
//! let config = Config::default();
//! let db = Database::init("vreg.sqlite", None).await?;
//! let storage = Arc::new(FileSystemStorage::init("/tmp/vreg").await?);
//! let actor = Actor::new(1, "developer");
//!
//! // Create registry with a single upstream
//! let registries = RegistryService::new(db.clone(), Arc::new(AllowAll), &config);
//! let registry = registries
//!     .create_registry(
//!         &actor,
//!         RegistryParams {
//!             group_id: 1,
//!             kind: RegistryKind::Maven,
//!             name: "maven".to_string(),
//!             description: None,
//!         },
//!     )
//!     .await?;
//! registries
//!     .create_upstream(
//!         &actor,
//!         registry.id,
//!         UpstreamParams {
//!             name: "central".to_string(),
//!             url: "https://repo.maven.apache.org/maven2".to_string(),
//!             username: None,
//!             password: None,
//!             cache_validity_hours: 24,
//!         },
//!     )
//!     .await?;
//!
//! // Fetch file or just get it if it's already cached
//! let proxy = RegistryProxy::new(db, storage, Arc::new(AllowAll), &config)?;
//! let served = proxy.serve(&actor, registry.id, "junit/junit/4.13.2/junit-4.13.2.pom").await?;
//! let content = proxy.read(&served.entry).await?;
//! # Ok::<(), anyhow::Error>(())
//! # }).unwrap();
//! ```

pub mod auth;
pub mod cache;
pub mod cache_validity;
pub mod cleanup;
pub mod config;
pub mod database;
pub mod errors;
pub mod lifecycle;
pub mod notify;
pub mod object_storage;
pub mod proxy;
pub mod resolver;
pub mod wire;

// Re-exports of public API arguments from extern crates
#[doc(no_inline)]
pub use chrono::{DateTime, Utc};
