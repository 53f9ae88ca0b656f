// The repository service exposes a query surface (history, heads, tag and
// range lookups) that only part of the CLI drives.
#![allow(dead_code)]

mod bus;
mod config;
mod coordination;
mod credentials;
mod error;
mod git;
mod health;
mod metrics;
mod model;
mod service;
mod store;
mod watcher;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::bus::{KeyDbBus, Subscriber};
use crate::config::Config;
use crate::coordination::RepositoryLocker;
use crate::credentials::ConfigAuthProvider;
use crate::git::{Checkout, GitManager, RepositoryOps};
use crate::health::ObservabilityState;
use crate::metrics::MetricsRegistry;
use crate::service::RepoService;
use crate::store::{KeyDbStore, Store};
use crate::watcher::webhook::{self, RefreshOnPush};
use crate::watcher::{IntervalTicker, Scheduler, Watcher, WatcherSettings};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "forgewatch", about = "Git repository change watcher")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/forgewatch/config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll repositories, consume webhook events and serve health/metrics.
    Run,
    /// Recent commits of a branch in a local bare checkout.
    Log {
        checkout: PathBuf,
        branch: String,
        /// Start the window at this commit.
        #[arg(long, default_value = "")]
        from: String,
        /// Stop the window at this commit.
        #[arg(long, default_value = "")]
        to: String,
        #[arg(long, default_value_t = git::DEFAULT_HISTORY_DEPTH)]
        limit: usize,
    },
    /// Commits reachable from NEW but not OLD, with file statistics.
    RangeDiff {
        checkout: PathBuf,
        old: String,
        new: String,
    },
    /// Metadata of one commit.
    Show { checkout: PathBuf, hash: String },
    /// Commit a tag points at.
    Tag { checkout: PathBuf, tag: String },
    /// Poll one stored repository now and print the outcome.
    Refresh { repository: model::RepositoryId },
    /// Rebuild the checkout of one stored repository, or all of them.
    Reset {
        repository: Option<model::RepositoryId>,
    },
}

// ---------------------------------------------------------------------------
// Local inspection commands
// ---------------------------------------------------------------------------

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn inspect(config: &Config, command: Command) -> Result<()> {
    let git = GitManager::new(config.git.fetch_timeout());
    match command {
        Command::Log {
            checkout,
            branch,
            from,
            to,
            limit,
        } => {
            let checkout = open_local(&checkout).await?;
            print_json(&git.changes_since(&checkout, &branch, &from, &to, limit).await?)
        }
        Command::RangeDiff { checkout, old, new } => {
            print_json(&git.range_diff(&checkout, "", &old, &new).await?)
        }
        Command::Show { checkout, hash } => print_json(&git.commit_metadata(&checkout, &hash).await?),
        Command::Tag { checkout, tag } => print_json(&git.commit_for_tag(&checkout, &tag).await?),
        other => anyhow::bail!("{other:?} needs the KeyDB-backed service"),
    }
}

async fn open_local(path: &Path) -> Result<Checkout> {
    let label = path.display().to_string();
    Ok(Checkout::open(path, &label).await?)
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

struct Components {
    keydb: fred::clients::Pool,
    bus: Arc<KeyDbBus>,
    metrics: MetricsRegistry,
    watcher: Arc<Watcher>,
    service: RepoService,
}

async fn build(config: &Config) -> Result<Components> {
    tokio::fs::create_dir_all(&config.checkout.root)
        .await
        .with_context(|| {
            format!(
                "failed to create checkout root: {}",
                config.checkout.root.display()
            )
        })?;

    let keydb = coordination::redis::connect_pool(&config.keydb).await?;
    let store: Arc<dyn Store> = Arc::new(KeyDbStore::new(keydb.clone()));
    let bus = Arc::new(KeyDbBus::new(keydb.clone(), config.bus.consumer_identity()));
    let auth = Arc::new(ConfigAuthProvider::new(
        config.providers.clone(),
        &config.checkout.root,
    ));
    let git = Arc::new(GitManager::new(config.git.fetch_timeout()));
    let metrics = MetricsRegistry::new();

    let watcher = Arc::new(Watcher::new(
        store,
        bus.clone(),
        auth,
        git,
        Arc::new(RepositoryLocker::new()),
        Arc::clone(&metrics.metrics),
        WatcherSettings {
            change_topic: config.bus.change_topic.clone(),
            history_depth: config.poll.history_depth,
        },
    ));
    let service = RepoService::new(Arc::clone(&watcher), config.checkout.root.clone());

    Ok(Components {
        keydb,
        bus,
        metrics,
        watcher,
        service,
    })
}

/// Check out every live repository that has no checkout yet.
async fn bootstrap_checkouts(components: &Components) -> Result<()> {
    let pending: Vec<_> = components
        .watcher
        .store()
        .find_all_repositories()
        .await?
        .into_iter()
        .filter(|r| !r.checkout_status)
        .collect();
    if pending.is_empty() {
        return Ok(());
    }
    tracing::info!(count = pending.len(), "checking out new repositories");
    for repository in pending {
        if let Err(e) = components.service.checkout_repository(repository.id).await {
            tracing::warn!(repository = repository.id, error = %e, "initial checkout failed");
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Observability server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(config: &Config, state: ObservabilityState, cancel: CancellationToken) -> Result<()> {
    let listen_addr: std::net::SocketAddr = config
        .observability
        .listen
        .parse()
        .context("invalid observability.listen address")?;

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind observability listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "observability server listening");

    axum::serve(listener, health::router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("observability server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

async fn run(config: Arc<Config>) -> Result<()> {
    let components = build(&config).await?;
    bootstrap_checkouts(&components).await?;

    let cancel = CancellationToken::new();

    let http_handle = tokio::spawn({
        let config = Arc::clone(&config);
        let state = ObservabilityState {
            keydb: components.keydb.clone(),
            checkout_root: config.checkout.root.clone(),
            metrics: components.metrics.clone(),
        };
        let cancel = cancel.clone();
        async move {
            if let Err(e) = run_http_server(&config, state, cancel).await {
                tracing::error!(error = %format!("{e:#}"), "observability server failed");
            }
        }
    });

    let deliveries = components
        .bus
        .subscribe(&config.bus.webhook_topic)
        .await
        .context("failed to subscribe to webhook topic")?;
    let webhook_handle = tokio::spawn(webhook::run(
        deliveries,
        Arc::new(RefreshOnPush::new(Arc::clone(&components.watcher))),
        cancel.clone(),
    ));

    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&components.watcher),
        config.poll.workers,
    ));
    scheduler.start(IntervalTicker::new(config.poll.interval()));

    shutdown_signal().await;
    cancel.cancel();
    scheduler.stop().await;
    let _ = tokio::join!(http_handle, webhook_handle);
    Ok(())
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let config = config::load_config(&cli.config)?;
    let config = Arc::new(config);

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            tracing::info!(config_path = %cli.config.display(), "starting forgewatch");
            run(config).await?;
            tracing::info!("forgewatch shut down cleanly");
        }
        Command::Refresh { repository } => {
            let components = build(&config).await?;
            print_json(&components.service.refresh(repository).await?)?;
        }
        Command::Reset { repository } => {
            let components = build(&config).await?;
            let repositories = match repository {
                Some(id) => vec![components.service.reset_repository(id).await?],
                None => components.service.reload_all().await?,
            };
            print_json(&repositories)?;
        }
        command => inspect(&config, command).await?,
    }
    Ok(())
}
