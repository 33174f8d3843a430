use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use directories::ProjectDirs;
use serde::Serialize;
use tokio::fs;
use tracing::info;

use vreg::auth::{Actor, AllowAll, Authorizer, CachedAuthorizer};
use vreg::cleanup::{
    CacheEntryDestroyer, CleanupPolicyService, CleanupScheduler, CleanupSettings, CleanupWorker,
    RetentionExecutor,
};
use vreg::config::Config;
use vreg::database::models::{NewNamespace, RegistryKind};
use vreg::database::{api, Database};
use vreg::errors::NonUtf8PathError;
use vreg::lifecycle::{RegistryParams, RegistryService, UpstreamParams};
use vreg::notify::{LogNotifier, StaticOwners};
use vreg::object_storage::{FileSystemStorage, ObjectStorage};
use vreg::proxy::RegistryProxy;
use vreg::wire::CacheEntryId;

/// Default data path.
fn default_data_path() -> PathBuf {
    if let Some(proj_dirs) = ProjectDirs::from("", "gitlab", "vreg") {
        proj_dirs.data_dir().to_path_buf()
    } else {
        PathBuf::from(".vreg")
    }
}

/// Calculate default object storage directory based on OS.
fn default_storage_directory() -> PathBuf {
    default_data_path().join("objects")
}

/// Calculate default database path based on OS.
fn default_database_path() -> PathBuf {
    default_data_path().join("vreg.sqlite")
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// CLI interface of the virtual registry.
#[derive(Parser, Clone, Debug)]
#[command(version, about = "Virtual registry CLI")]
pub struct Cli {
    /// Path to object storage directory.
    ///
    /// This is where cached files are stored.
    #[arg(
        short = 's',
        long,
        value_name = "PATH",
        default_value = default_storage_directory().into_os_string(),
    )]
    storage_dir: PathBuf,

    /// Path to registry database file.
    #[arg(
        short = 'd',
        long,
        value_name = "PATH",
        default_value = default_database_path().into_os_string(),
    )]
    database: PathBuf,

    /// Path to JSON configuration file.
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Command to execute.
    #[command(subcommand)]
    command: Command,
}

/// Everything commands operate on.
pub struct Context {
    db: Database,
    storage: Arc<dyn ObjectStorage>,
    authorizer: Arc<dyn Authorizer>,
    config: Config,
    actor: Actor,
}

impl Context {
    fn registries(&self) -> RegistryService {
        RegistryService::new(self.db.clone(), self.authorizer.clone(), &self.config)
    }

    fn policies(&self) -> CleanupPolicyService {
        CleanupPolicyService::new(self.db.clone(), self.authorizer.clone())
    }

    fn scheduler(&self) -> CleanupScheduler {
        let executor = RetentionExecutor::new(self.db.clone(), self.config.cleanup.batch_size);
        let worker = CleanupWorker::new(
            self.db.clone(),
            Arc::new(executor),
            Arc::new(LogNotifier),
            Arc::new(StaticOwners::new()),
            self.config.cleanup.clone(),
        );
        CleanupScheduler::new(Arc::new(worker))
    }

    fn destroyer(&self) -> CacheEntryDestroyer {
        CacheEntryDestroyer::new(
            self.db.clone(),
            self.storage.clone(),
            self.config.cleanup.destroy_batch_size,
        )
    }
}

impl Cli {
    pub async fn execute(&self) -> anyhow::Result<()> {
        let database = self
            .database
            .as_os_str()
            .to_str()
            .ok_or(NonUtf8PathError)
            .context("failed to create database file")?;

        // Ensure database file has its parent directory
        if let Some(parent_dir) = self.database.parent() {
            fs::create_dir_all(parent_dir)
                .await
                .context("failed to create database file")?;
        }

        let config = match &self.config {
            Some(path) => Config::from_file(path)
                .await
                .with_context(|| format!("failed to load configuration {}", path.display()))?,
            None => Config::default(),
        };
        let db = Database::init(database, None)
            .await
            .context("failed to initialize registry database")?;
        let storage = FileSystemStorage::init(&self.storage_dir)
            .await
            .context("failed to initialize object storage")?;
        let authorizer = CachedAuthorizer::new(AllowAll, config.feature_availability.clone());

        let context = Context {
            db,
            storage: Arc::new(storage),
            authorizer: Arc::new(authorizer),
            config,
            actor: Actor::system(),
        };
        self.command.execute(&context).await
    }
}

/// Virtual registry commands.
#[derive(Clone, Debug, clap::Subcommand)]
pub enum Command {
    /// Manage groups and projects.
    #[command(subcommand)]
    Namespace(NamespaceCommand),

    /// Manage registries.
    #[command(subcommand)]
    Registry(RegistryCommand),

    /// Manage upstreams and registry chains.
    #[command(subcommand)]
    Upstream(UpstreamCommand),

    /// Inspect and delete cache entries.
    #[command(subcommand)]
    Cache(CacheCommand),

    /// Fetch a file through a registry.
    Get {
        /// Registry to serve from.
        #[arg(long)]
        registry: i32,

        /// Requested path.
        path: String,

        /// Write file content here.
        ///
        /// If none provided, the cache entry is printed.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Manage cleanup policies.
    #[command(subcommand)]
    Policy(PolicyCommand),

    /// Run cleanup.
    #[command(subcommand)]
    Cleanup(CleanupCommand),
}

impl Command {
    pub async fn execute(&self, context: &Context) -> anyhow::Result<()> {
        match self {
            Self::Namespace(cmd) => cmd.execute(context).await?,
            Self::Registry(cmd) => cmd.execute(context).await?,
            Self::Upstream(cmd) => cmd.execute(context).await?,
            Self::Cache(cmd) => cmd.execute(context).await?,
            Self::Get {
                registry,
                path,
                output,
            } => {
                let proxy = RegistryProxy::new(
                    context.db.clone(),
                    context.storage.clone(),
                    context.authorizer.clone(),
                    &context.config,
                )?;
                let served = proxy.serve(&context.actor, *registry, path).await?;
                info!(source = ?served.source, "served {}", served.entry.relative_path);
                if let Some(output) = output {
                    let content = proxy.read(&served.entry).await?;
                    fs::write(output, content)
                        .await
                        .with_context(|| format!("failed to write {}", output.display()))?;
                } else {
                    print_json(&served.entry)?;
                }
            }
            Self::Policy(cmd) => cmd.execute(context).await?,
            Self::Cleanup(cmd) => cmd.execute(context).await?,
        }
        Ok(())
    }
}

/// Namespace subcommand.
#[derive(Clone, Debug, clap::Subcommand)]
pub enum NamespaceCommand {
    /// Create a group, or a project with `--project`.
    Create {
        /// Full path of the namespace.
        path: String,

        /// Parent group.
        #[arg(long)]
        parent: Option<i32>,

        /// Create a project. Requires a parent group.
        #[arg(long, requires = "parent")]
        project: bool,
    },
}

impl NamespaceCommand {
    pub async fn execute(&self, context: &Context) -> anyhow::Result<()> {
        match self {
            Self::Create {
                path,
                parent,
                project,
            } => {
                let new_namespace = match (project, parent) {
                    (true, Some(parent)) => NewNamespace::project(path, *parent),
                    _ => NewNamespace::group(path, *parent),
                };
                let mut conn = context.db.get().await?;
                let namespace = api::namespaces::insert(&mut conn, new_namespace).await?;
                print_json(&namespace)?;
            }
        }
        Ok(())
    }
}

/// Registry subcommand.
#[derive(Clone, Debug, clap::Subcommand)]
pub enum RegistryCommand {
    /// Create a registry in a group.
    Create {
        #[arg(long)]
        group: i32,

        /// Registry kind: `maven` or `container`.
        #[arg(long)]
        kind: RegistryKind,

        #[arg(long)]
        name: String,

        #[arg(long)]
        description: Option<String>,
    },

    /// Destroy a registry. Its upstreams are kept.
    Destroy { id: i32 },

    /// List registries of a group.
    List {
        #[arg(long)]
        group: i32,
    },
}

impl RegistryCommand {
    pub async fn execute(&self, context: &Context) -> anyhow::Result<()> {
        let service = context.registries();
        match self {
            Self::Create {
                group,
                kind,
                name,
                description,
            } => {
                let registry = service
                    .create_registry(
                        &context.actor,
                        RegistryParams {
                            group_id: *group,
                            kind: *kind,
                            name: name.clone(),
                            description: description.clone(),
                        },
                    )
                    .await?;
                print_json(&registry)?;
            }
            Self::Destroy { id } => {
                service.destroy_registry(&context.actor, *id).await?;
            }
            Self::List { group } => {
                print_json(&service.list_registries(&context.actor, *group).await?)?;
            }
        }
        Ok(())
    }
}

/// Upstream subcommand.
#[derive(Clone, Debug, clap::Subcommand)]
pub enum UpstreamCommand {
    /// Create an upstream at the end of a registry chain.
    Create {
        #[arg(long)]
        registry: i32,

        #[arg(long)]
        name: String,

        /// Base URL of the remote registry.
        #[arg(long)]
        url: String,

        #[arg(long, requires = "password")]
        username: Option<String>,

        #[arg(long, requires = "username")]
        password: Option<String>,

        /// Hours before a cached file is revalidated, `0` caches forever.
        #[arg(long, default_value_t = 24)]
        cache_validity_hours: i32,
    },

    /// Append an existing upstream to another registry chain.
    Associate {
        #[arg(long)]
        registry: i32,

        #[arg(long)]
        upstream: i32,
    },

    /// Move a chain link to a new position.
    Move {
        /// Chain link id.
        link: i32,

        position: i32,
    },

    /// Destroy an upstream, removing it from every chain.
    Destroy { id: i32 },

    /// List the chain of a registry.
    List {
        #[arg(long)]
        registry: i32,
    },
}

impl UpstreamCommand {
    pub async fn execute(&self, context: &Context) -> anyhow::Result<()> {
        let service = context.registries();
        match self {
            Self::Create {
                registry,
                name,
                url,
                username,
                password,
                cache_validity_hours,
            } => {
                let (upstream, link) = service
                    .create_upstream(
                        &context.actor,
                        *registry,
                        UpstreamParams {
                            name: name.clone(),
                            url: url.clone(),
                            username: username.clone(),
                            password: password.clone(),
                            cache_validity_hours: *cache_validity_hours,
                        },
                    )
                    .await?;
                print_json(&(upstream, link))?;
            }
            Self::Associate { registry, upstream } => {
                let link = service
                    .associate_upstream(&context.actor, *registry, *upstream)
                    .await?;
                print_json(&link)?;
            }
            Self::Move { link, position } => {
                let link = service
                    .update_position(&context.actor, *link, *position)
                    .await?;
                print_json(&link)?;
            }
            Self::Destroy { id } => {
                let tombstoned = service.destroy_upstream(&context.actor, *id).await?;
                println!("{} cache entries scheduled for destruction", tombstoned);
            }
            Self::List { registry } => {
                print_json(&service.list_upstreams(&context.actor, *registry).await?)?;
            }
        }
        Ok(())
    }
}

/// Cache entries subcommand.
#[derive(Clone, Debug, clap::Subcommand)]
pub enum CacheCommand {
    /// List live entries of an upstream.
    List {
        #[arg(long)]
        upstream: i32,

        #[arg(long, default_value_t = 20)]
        limit: i64,

        #[arg(long, default_value_t = 0)]
        offset: i64,
    },

    /// Search live entries of an upstream by path fragment.
    Search {
        #[arg(long)]
        upstream: i32,

        fragment: String,

        #[arg(long, default_value_t = 20)]
        limit: i64,
    },

    /// Delete an entry by its id.
    Delete {
        /// Base64 entry id, as printed by `list`.
        id: String,
    },
}

/// Cache entry with its wire id.
#[derive(Serialize)]
struct ListedEntry<T> {
    id: String,
    #[serde(flatten)]
    entry: T,
}

impl CacheCommand {
    pub async fn execute(&self, context: &Context) -> anyhow::Result<()> {
        let mut conn = context.db.get().await?;
        let entries = match self {
            Self::List {
                upstream,
                limit,
                offset,
            } => {
                api::cache_entries::live_for_upstream(&mut conn, *upstream, *limit, *offset)
                    .await?
            }
            Self::Search {
                upstream,
                fragment,
                limit,
            } => api::cache_entries::search(&mut conn, *upstream, fragment, *limit).await?,
            Self::Delete { id } => {
                drop(conn);
                let entry = context
                    .registries()
                    .destroy_cache_entry(&context.actor, id)
                    .await?;
                print_json(&entry)?;
                return Ok(());
            }
        };
        let listed: Vec<_> = entries
            .into_iter()
            .filter_map(|entry| {
                let upstream_id = entry.upstream_id?;
                Some(ListedEntry {
                    id: CacheEntryId::new(upstream_id, &entry.relative_path).encode(),
                    entry,
                })
            })
            .collect();
        print_json(&listed)
    }
}

/// Cleanup policy subcommand.
#[derive(Clone, Debug, clap::Subcommand)]
pub enum PolicyCommand {
    /// Create or update the cleanup policy of a top-level group.
    Set {
        #[arg(long)]
        group: i32,

        #[arg(long)]
        enabled: bool,

        /// One of 1, 7, 14, 30, 90.
        #[arg(long, default_value_t = 7)]
        cadence_days: i32,

        #[arg(long, default_value_t = 30)]
        keep_days: i32,

        #[arg(long)]
        notify_on_success: bool,

        #[arg(long)]
        notify_on_failure: bool,
    },

    /// Show the cleanup policy of a group.
    Show {
        #[arg(long)]
        group: i32,
    },
}

impl PolicyCommand {
    pub async fn execute(&self, context: &Context) -> anyhow::Result<()> {
        let service = context.policies();
        match self {
            Self::Set {
                group,
                enabled,
                cadence_days,
                keep_days,
                notify_on_success,
                notify_on_failure,
            } => {
                let policy = service
                    .upsert(
                        &context.actor,
                        *group,
                        CleanupSettings {
                            enabled: *enabled,
                            cadence_days: *cadence_days,
                            keep_n_days_after_download: *keep_days,
                            notify_on_success: *notify_on_success,
                            notify_on_failure: *notify_on_failure,
                        },
                    )
                    .await?;
                print_json(&policy)?;
            }
            Self::Show { group } => {
                print_json(&service.get(&context.actor, *group).await?)?;
            }
        }
        Ok(())
    }
}

/// Cleanup subcommand.
#[derive(Clone, Debug, clap::Subcommand)]
pub enum CleanupCommand {
    /// Execute due cleanup policies once.
    Run,

    /// Physically remove tombstoned cache entries once.
    Destroy,

    /// Run cleanup forever.
    ///
    /// Due policies are checked and tombstoned entries removed every `enqueue_period_secs`.
    /// Failed passes are logged and retried on the next period.
    Daemon,
}

impl CleanupCommand {
    pub async fn execute(&self, context: &Context) -> anyhow::Result<()> {
        match self {
            Self::Run => {
                let tick = context.scheduler().run_once().await?;
                if let Some(execution) = tick.execution {
                    let performed = execution.await??;
                    println!("{} cleanup policies executed", performed);
                } else {
                    println!("no cleanup policy is due");
                }
            }
            Self::Destroy => {
                let stats = context.destroyer().run_once().await?;
                println!(
                    "{} cache entries destroyed, {} failed",
                    stats.destroyed, stats.failed
                );
            }
            Self::Daemon => {
                let scheduler = context.scheduler();
                let destroyer = context.destroyer();
                let period = context.config.cleanup.enqueue_period();
                info!("running cleanup every {:?}", period);
                tokio::join!(scheduler.run_every(period), destroyer.run_every(period));
            }
        }
        Ok(())
    }
}
