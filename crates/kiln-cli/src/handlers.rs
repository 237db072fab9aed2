//! Command handlers.

use crate::config::{KilnConfig, StoreConfig};
use anyhow::bail;
use chrono::Utc;
use kiln_core::change::{NewChange, Properties};
use kiln_core::ports::BuildRequestStore;
use kiln_db::{Database, MemoryStore, PgBuildRequestStore};
use kiln_scheduler::config::build_all;
use kiln_scheduler::{ChangeNotifier, SchedulerConfig, SchedulerService};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const FEED_RETRY_DELAY: Duration = Duration::from_secs(1);

fn load(path: &Path) -> anyhow::Result<KilnConfig> {
    let config = KilnConfig::from_file(path)?;
    Ok(config.with_database_url(std::env::var("DATABASE_URL").ok()))
}

async fn connect(store: &StoreConfig) -> anyhow::Result<Option<Database>> {
    match store {
        StoreConfig::Memory => Ok(None),
        StoreConfig::Postgres {
            url,
            max_connections,
        } => Ok(Some(Database::connect(url, *max_connections).await?)),
    }
}

async fn open_postgres(store: &StoreConfig) -> anyhow::Result<Option<PgBuildRequestStore>> {
    match connect(store).await? {
        None => Ok(None),
        Some(db) => {
            db.migrate().await?;
            Ok(Some(PgBuildRequestStore::new(db.pool().clone())))
        }
    }
}

async fn open_store(store: &StoreConfig) -> anyhow::Result<Arc<dyn BuildRequestStore>> {
    match open_postgres(store).await? {
        None => Ok(Arc::new(MemoryStore::new())),
        Some(pg) => Ok(Arc::new(pg)),
    }
}

/// Wake schedulers whenever a change is committed to the shared database.
fn follow_changes(store: PgBuildRequestStore, notifier: ChangeNotifier) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let mut feed = match store.change_feed().await {
                Ok(feed) => feed,
                Err(e) => {
                    warn!(error = %e, "Change feed unavailable, retrying");
                    tokio::time::sleep(FEED_RETRY_DELAY).await;
                    continue;
                }
            };

            loop {
                match feed.recv().await {
                    Ok(change) => {
                        debug!(change = %change, "Change committed");
                        notifier.notify();
                    }
                    Err(e) if e.is_transient() => {
                        warn!(error = %e, "Change feed interrupted, reconnecting");
                        tokio::time::sleep(FEED_RETRY_DELAY).await;
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Ignoring change notification");
                        notifier.notify();
                    }
                }
            }
        }
    })
}

fn kind(config: &SchedulerConfig) -> &'static str {
    match config {
        SchedulerConfig::Multi(_) => "multi",
        SchedulerConfig::Chooser(_) => "chooser",
        SchedulerConfig::Persistent(_) => "persistent",
    }
}

/// Start every scheduler and run until ctrl-c.
pub async fn run(path: &Path) -> anyhow::Result<()> {
    let config = load(path)?;
    if matches!(config.store, StoreConfig::Memory) {
        warn!("Using the in-memory store; state is lost on exit");
    }

    let pg = open_postgres(&config.store).await?;
    let store: Arc<dyn BuildRequestStore> = match &pg {
        Some(pg) => Arc::new(pg.clone()),
        None => Arc::new(MemoryStore::new()),
    };
    let schedulers = build_all(&config.schedulers, store)?;

    let mut service = SchedulerService::new(config.idle_interval());
    for scheduler in schedulers {
        service.register(scheduler)?;
    }
    let feed = pg.map(|pg| follow_changes(pg, service.change_notifier()));
    info!(schedulers = service.len(), "Kiln scheduler service started");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    if let Some(feed) = feed {
        feed.abort();
    }
    service.shutdown();
    service.join().await;
    Ok(())
}

/// Validate a configuration file and list the schedulers it defines.
pub async fn check(path: &Path) -> anyhow::Result<()> {
    let config = load(path)?;
    build_all(&config.schedulers, Arc::new(MemoryStore::new()))?;

    println!(
        "Configuration {} is valid ({} schedulers)",
        path.display(),
        config.schedulers.len()
    );
    for scheduler in &config.schedulers {
        println!("  - {} ({})", scheduler.name(), kind(scheduler));
    }
    Ok(())
}

pub async fn migrate(path: &Path) -> anyhow::Result<()> {
    let config = load(path)?;
    let Some(db) = connect(&config.store).await? else {
        bail!("the in-memory store has no schema to migrate");
    };
    db.migrate().await?;
    println!("Migrations applied");
    Ok(())
}

pub async fn add_change(path: &Path, change: NewChangeArgs) -> anyhow::Result<()> {
    let config = load(path)?;
    if matches!(config.store, StoreConfig::Memory) {
        bail!("add-change needs a postgres store; the in-memory store is per process");
    }

    let store = open_store(&config.store).await?;
    let change = store
        .add_change(NewChange {
            author: change.author,
            branch: change.branch,
            revision: change.revision,
            comments: change.comments,
            files: change.files,
            when: Utc::now(),
            properties: Properties::new(),
        })
        .await?;

    println!("Recorded change {}", change.id);
    Ok(())
}

/// Fields for `add-change`, as given on the command line.
pub struct NewChangeArgs {
    pub author: String,
    pub branch: Option<String>,
    pub revision: Option<String>,
    pub comments: String,
    pub files: Vec<String>,
}

pub fn schema() -> anyhow::Result<()> {
    let schema = schemars::schema_for!(KilnConfig);
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}
