diesel::table! {
    /// Groups and projects. Only the hierarchy matters here.
    namespaces (id) {
        /// Primary key.
        id -> Integer,

        /// Parent group, `NULL` for top-level groups.
        parent_id -> Nullable<Integer>,

        /// Group or project.
        kind -> Integer,

        /// Full path of the namespace.
        path -> VarChar,

        /// Creation timestamp.
        created_at -> TimestamptzSqlite,
    }
}

diesel::table! {
    /// Virtual registries.
    registries (id) {
        /// Primary key.
        id -> Integer,

        /// Namespace owning the registry.
        group_id -> Integer,

        /// Root of the namespace hierarchy, used for the per-group limit.
        top_level_group_id -> Integer,

        /// Package format of the registry.
        kind -> Integer,

        name -> VarChar,
        description -> Nullable<VarChar>,
        created_at -> TimestamptzSqlite,
        updated_at -> TimestamptzSqlite,
    }
}

diesel::table! {
    /// Remote registries proxied by virtual registries.
    upstreams (id) {
        /// Primary key.
        id -> Integer,

        /// Top-level group owning the upstream.
        group_id -> Integer,

        /// Package format of the upstream.
        kind -> Integer,

        name -> VarChar,

        /// Base URL of the remote registry.
        url -> VarChar,

        username -> Nullable<VarChar>,
        password -> Nullable<VarChar>,

        /// How long a cached file is fresh. `0` means forever.
        cache_validity_hours -> Integer,

        created_at -> TimestamptzSqlite,
        updated_at -> TimestamptzSqlite,
    }
}

diesel::table! {
    /// Ordered links between registries and upstreams.
    registry_upstreams (id) {
        /// Primary key.
        id -> Integer,

        // Manually added UNIQUE(registry_id, upstream_id) to up.sql, because diesel can't do that
        registry_id -> Integer,
        upstream_id -> Integer,

        /// Position in the resolution chain, starting at 1.
        position -> Integer,
    }
}

diesel::table! {
    /// Cached upstream responses.
    cache_entries (id) {
        /// Surrogate primary key.
        id -> Integer,

        /// Top-level group of the upstream.
        group_id -> Integer,

        // Manually added UNIQUE(upstream_id, relative_path, status) to up.sql, because diesel can't do that
        /// Upstream the file was fetched from, `NULL` once the upstream is gone.
        upstream_id -> Nullable<Integer>,

        /// Path of the file relative to the upstream URL.
        relative_path -> VarChar,

        /// Key of the file in object storage. Never changes.
        object_storage_key -> VarChar,

        size -> BigInt,
        file_sha1 -> VarChar,
        file_md5 -> Nullable<VarChar>,
        upstream_etag -> Nullable<VarChar>,
        content_type -> VarChar,

        /// Last time the file was checked against the upstream.
        upstream_checked_at -> TimestamptzSqlite,

        /// Last time the file was served.
        downloaded_at -> TimestamptzSqlite,

        downloads_count -> BigInt,

        /// Current status of the cache entry.
        status -> Integer,

        created_at -> TimestamptzSqlite,
        updated_at -> TimestamptzSqlite,
    }
}

diesel::table! {
    /// Scheduled cache cleanup, one per top-level group.
    cleanup_policies (id) {
        /// Primary key.
        id -> Integer,

        // Manually added UNIQUE to up.sql, because diesel can't do that
        group_id -> Integer,

        enabled -> Bool,

        /// Days between two runs.
        cadence_days -> Integer,

        /// Entries not downloaded for this many days are removed.
        keep_n_days_after_download -> Integer,

        next_run_at -> Nullable<TimestamptzSqlite>,
        last_run_at -> Nullable<TimestamptzSqlite>,

        /// Current status of the policy.
        status -> Integer,

        last_run_deleted_entries_count -> Integer,
        last_run_deleted_size -> BigInt,

        /// Per registry kind breakdown of the last run, JSON.
        last_run_detailed_metrics -> Nullable<Text>,

        failure_message -> Nullable<Text>,
        notify_on_success -> Bool,
        notify_on_failure -> Bool,
        created_at -> TimestamptzSqlite,
        updated_at -> TimestamptzSqlite,
    }
}

diesel::joinable!(registry_upstreams -> registries (registry_id));
diesel::joinable!(registry_upstreams -> upstreams (upstream_id));
diesel::joinable!(cache_entries -> upstreams (upstream_id));

diesel::allow_tables_to_appear_in_same_query!(
    namespaces,
    registries,
    upstreams,
    registry_upstreams,
    cache_entries,
    cleanup_policies,
);
