//! Convenient API to interact with the registry database.
//!
//! Every function is a single statement (or a short read sequence) on a [`Connection`].
//! Callers compose them inside `immediate_transaction` when several writes must be atomic.
//!
//! [`Connection`]: super::Connection

pub mod cache_entries;
pub mod cleanup_policies;
pub mod namespaces;
pub mod registries;
pub mod registry_upstreams;
pub mod upstreams;
