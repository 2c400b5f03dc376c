//! Archive service entry point.
//!
//! `run` starts the daemon: the rebuild scheduler loop plus the periodic
//! sweep against the configured database. `build` forces a one-shot
//! rebuild of a single repository, useful for operational repair.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Arg, ArgAction, Command};
use tracing::{info, warn};

use binary_archive::{
    builder::{ProcessRunner, RepoBuilder, RepositoryBuilder},
    config::ServiceConfig,
    error::{ArchiveError, ArchiveResult},
    models::RepoKey,
    scheduler::RebuildScheduler,
    store::{HierarchyStore, PgStore},
};

#[tokio::main]
async fn main() -> ArchiveResult<()> {
    tracing_subscriber::fmt::init();

    let matches = Command::new("binary-archive")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Binary artifact storage and package repository rebuilds")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("archive.json"),
        )
        .arg(
            Arg::new("database-url")
                .long("database-url")
                .value_name("URL")
                .help("Database connection URL")
                .env("DATABASE_URL"),
        )
        .subcommand(Command::new("run").about("Run the rebuild scheduler daemon"))
        .subcommand(
            Command::new("build")
                .about("Rebuild one repository immediately")
                .arg(Arg::new("project").long("project").required(true))
                .arg(Arg::new("ref").long("ref").required(true))
                .arg(Arg::new("distro").long("distro").required(true))
                .arg(
                    Arg::new("distro-version")
                        .long("distro-version")
                        .required(true),
                )
                .arg(
                    Arg::new("force")
                        .long("force")
                        .help("Build even when the repository is not flagged pending")
                        .action(ArgAction::SetTrue),
                ),
        )
        .get_matches();

    let config_path = PathBuf::from(matches.get_one::<String>("config").unwrap());
    let mut config = if config_path.exists() {
        info!("loading configuration from {:?}", config_path);
        ServiceConfig::from_file(&config_path)?
    } else {
        warn!("configuration file not found, using defaults");
        let config = ServiceConfig::default();
        config.to_file(&config_path)?;
        config
    };

    if let Some(database_url) = matches.get_one::<String>("database-url") {
        config.database.url = database_url.clone();
    }

    match matches.subcommand() {
        Some(("build", sub_matches)) => {
            let key = RepoKey::new(
                sub_matches.get_one::<String>("project").unwrap(),
                sub_matches.get_one::<String>("ref").unwrap(),
                sub_matches.get_one::<String>("distro").unwrap(),
                sub_matches.get_one::<String>("distro-version").unwrap(),
            );
            build_once(&config, key, sub_matches.get_flag("force")).await
        }
        _ => run_daemon(&config).await,
    }
}

async fn connect_store(config: &ServiceConfig) -> ArchiveResult<Arc<PgStore>> {
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .acquire_timeout(Duration::from_secs(config.database.connection_timeout))
        .connect(&config.database.url)
        .await?;

    let store = PgStore::new(pool);
    store.migrate().await?;
    Ok(Arc::new(store))
}

/// Run the scheduler daemon until interrupted.
async fn run_daemon(config: &ServiceConfig) -> ArchiveResult<()> {
    let store: Arc<dyn HierarchyStore> = connect_store(config).await?;

    let builder = Arc::new(RepositoryBuilder::new(
        Arc::clone(&store),
        Arc::new(ProcessRunner),
        config.repos_root.clone(),
        config.builder.clone(),
    ));

    let scheduler = RebuildScheduler::start(
        store,
        builder,
        Duration::from_secs(config.quiet_time_seconds),
        Duration::from_secs(config.polling_cycle_seconds),
    );

    info!("archive daemon running, waiting for interrupt");
    tokio::signal::ctrl_c().await?;

    info!("interrupt received, shutting down");
    scheduler.stop().await;
    Ok(())
}

/// Rebuild one repository synchronously, honoring the single-writer gate.
async fn build_once(config: &ServiceConfig, key: RepoKey, force: bool) -> ArchiveResult<()> {
    let store: Arc<dyn HierarchyStore> = connect_store(config).await?;

    let repo = store
        .get_repo(&key)
        .await?
        .ok_or_else(|| ArchiveError::NotFound(format!("repo {}", key)))?;

    if force {
        store.mark_repo_pending(&key).await?;
    }

    if !store.begin_build(&key).await? {
        return Err(ArchiveError::Conflict(format!(
            "repo {} is not pending or already building",
            key
        )));
    }

    let builder = RepositoryBuilder::new(
        Arc::clone(&store),
        Arc::new(ProcessRunner),
        config.repos_root.clone(),
        config.builder.clone(),
    );

    let result = builder.build(&repo).await;
    store.finish_build(&key, result.is_ok()).await?;
    result
}
