//! Stress-testing the cache entry store.
//!
//! This test is pretty heavy, so it is hidden behind `stresstest` feature.
//! It is not going to be run by default.

use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing_test::traced_test;

use crate::cache::{CacheEntryStore, EntryAttributes};
use crate::database::fixtures::{DatabaseFixture, MD5, SHA1};
use crate::database::models::{CacheEntryStatus, RegistryKind, Upstream};
use crate::database::{api, Database};
use crate::errors::{CacheError, DatabaseError};

// num of workers
const N: usize = 24;

// num of operations per worker
const COUNT: usize = 1000;

// num of distinct paths, kept small to provoke conflicts
const PATHS: usize = 16;

#[tokio::test]
#[traced_test]
async fn test_cache_entry_store_stress_testing() {
    // This test runs random operations on the same few keys from many workers.
    // The goal is to get no unexpected errors and never two live entries per key.
    let database = DatabaseFixture::new().await;
    let group = database.group("stress", None).await;
    let registry = database.registry(&group, RegistryKind::Maven).await;
    let upstream = database.upstream(&registry, 1).await;

    let unknown_errors = Arc::new(RwLock::new(0u64));

    let mut tasks = JoinSet::new();
    for _ in 0..N {
        tasks.spawn(inner(
            database.db.clone(),
            upstream.clone(),
            unknown_errors.clone(),
        ));
    }

    async fn inner(db: Database, upstream: Upstream, unknown_errors: Arc<RwLock<u64>>) {
        use rand::Rng;

        let store = CacheEntryStore::new(db);

        // Operation codes:
        // 1 - create_or_update
        // 2 - find
        // 3 - mark_as_pending_destruction
        // 4 - bump_downloads_count
        // 5 - search

        for _ in 0..COUNT {
            let (action, path, size) = {
                let mut rng = rand::rng();
                (
                    rng.random_range(1..6),
                    format!("org/stress/{}/stress.jar", rng.random_range(0..PATHS)),
                    rng.random_range(0..1_000_000i64),
                )
            };

            let allow_some_errors = async |err: CacheError| {
                match &err {
                    CacheError::DatabaseError(DatabaseError::DieselError(
                        diesel::result::Error::NotFound,
                    )) => {}
                    // this includes "database is locked" error
                    CacheError::DatabaseError(DatabaseError::DieselError(
                        diesel::result::Error::DatabaseError(
                            diesel::result::DatabaseErrorKind::Unknown,
                            _,
                        ),
                    )) => {
                        *unknown_errors.write().await += 1;
                    }
                    // lost both attempts of the upsert
                    err if err.is_unique_violation() => {
                        *unknown_errors.write().await += 1;
                    }
                    err => panic!("{:?}", err),
                }
            };

            match action {
                1 => {
                    let attributes = EntryAttributes {
                        size: Some(size),
                        file_sha1: Some(SHA1.to_string()),
                        file_md5: Some(MD5.to_string()),
                        ..EntryAttributes::default()
                    };
                    if let Err(err) = store
                        .create_or_update(&upstream, upstream.group_id, &path, attributes)
                        .await
                    {
                        allow_some_errors(err).await;
                    }
                }
                2 => {
                    if let Err(err) = store.find(upstream.id, &path).await {
                        allow_some_errors(err).await;
                    }
                }
                3 => match store.find(upstream.id, &path).await {
                    Ok(Some(entry)) => {
                        if let Err(err) = store.mark_as_pending_destruction(&entry).await {
                            allow_some_errors(err).await;
                        }
                    }
                    Ok(None) => {}
                    Err(err) => allow_some_errors(err).await,
                },
                4 => match store.find(upstream.id, &path).await {
                    Ok(Some(entry)) => {
                        if let Err(err) = store.bump_downloads_count(&entry).await {
                            allow_some_errors(err).await;
                        }
                    }
                    Ok(None) => {}
                    Err(err) => allow_some_errors(err).await,
                },
                5 => {
                    if let Err(err) = store.search(upstream.id, "stress", 10).await {
                        allow_some_errors(err).await;
                    }
                }
                _ => unreachable!(),
            }
        }
    }

    tasks.join_all().await;

    let total_errors = unknown_errors.read().await;
    const THRESHOLD: u64 = N as u64 * COUNT as u64 / 1000; // 0.1% of all operations are allowed to fail
    if *total_errors > THRESHOLD {
        panic!("total_errors = {}", total_errors);
    }

    // At most one live entry per path
    let mut conn = database.conn().await;
    let live = api::cache_entries::with_status(&mut conn, CacheEntryStatus::Default, i64::MAX)
        .await
        .unwrap();
    let mut paths: Vec<_> = live.iter().map(|entry| entry.relative_path.clone()).collect();
    paths.sort();
    paths.dedup();
    assert_eq!(paths.len(), live.len());
    assert!(live.len() <= PATHS);
}
