mod auth;
mod checks;
mod classify;
mod config;
mod date;
mod driver;
mod error;
mod lease;
mod metrics;
mod models;
mod provider;
mod queue;
mod reconcile;
mod scheduler;
mod server;
mod store;
mod subscription;
mod sweep;
#[cfg(test)]
mod testing;

use anyhow::{Context, bail};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use crate::checks::{CallerChecks, GoogleTokenVerifier};
use crate::config::{Config, DEFAULT_CONFIG_PATH};
use crate::driver::SyncDriver;
use crate::metrics::Counters;
use crate::provider::{GmailConnector, ProviderConnector, RateLimiter};
use crate::queue::LocalTaskQueue;
use crate::scheduler::Scheduler;
use crate::server::AppState;
use crate::store::{MemoryStateStore, SqliteStateStore, StateStore};
use crate::subscription::SubscriptionManager;
use crate::sweep::Sweeper;

#[derive(Debug, Default)]
struct Args {
    config: Option<PathBuf>,
    memory: bool,
    debug: bool,
    watch: Option<String>,
    unwatch: Option<String>,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> anyhow::Result<Args> {
    let mut parsed = Args::default();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                parsed.config = Some(args.next().context("--config needs a path")?.into());
            }
            "--memory" => parsed.memory = true,
            "--debug" => parsed.debug = true,
            "--watch" => parsed.watch = Some(args.next().context("--watch needs an address")?),
            "--unwatch" => {
                parsed.unwatch = Some(args.next().context("--unwatch needs an address")?)
            }
            other => bail!("unknown argument {}", other),
        }
    }
    Ok(parsed)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = parse_args(std::env::args().skip(1))?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if args.debug {
            EnvFilter::new("labeld=debug,info")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let config = Config::load(&config_path)?;

    let store: Arc<dyn StateStore> = if args.memory {
        tracing::warn!("Using in-memory state, nothing survives a restart");
        Arc::new(MemoryStateStore::new())
    } else {
        let db = SqliteStateStore::new(&config.database_url).await?;
        db.run_migrations().await?;
        Arc::new(db)
    };

    let http = provider::https_client()?;
    let secret = auth::load_secret(&config.provider.client_secret_path).await?;
    let limiter = Arc::new(RateLimiter::new(
        Duration::from_millis(config.provider.rate_limit_interval_ms),
        config.provider.rate_limit_burst,
    ));
    let connector: Arc<dyn ProviderConnector> = Arc::new(GmailConnector::new(
        secret,
        http.clone(),
        store.clone(),
        limiter,
    ));

    let subscriptions = Arc::new(SubscriptionManager::new(
        store.clone(),
        connector.clone(),
        config.provider.pubsub_topic.clone(),
        config.engine.renew_window(),
    ));

    // Operator commands run once and exit.
    if let Some(address) = &args.watch {
        let expiry = subscriptions.watch(address).await?;
        println!("Watching {} until {}", address, expiry.to_rfc3339());
        return Ok(());
    }
    if let Some(address) = &args.unwatch {
        subscriptions.unwatch(address).await?;
        println!("Stopped watching {}", address);
        return Ok(());
    }

    let counters = Arc::new(Counters::default());
    let driver = Arc::new(SyncDriver::new(
        store.clone(),
        connector,
        subscriptions.clone(),
        counters.clone(),
        &config.engine,
        &config.provider,
    ));
    let queue = Arc::new(LocalTaskQueue::new(driver.clone(), &config.queue));
    let scheduler = Arc::new(Scheduler::new(store.clone(), queue, config.engine.debounce()));
    let sweeper = Arc::new(Sweeper::new(
        store,
        subscriptions,
        scheduler.clone(),
        config.engine.stale_after(),
    ));

    if config.auth.operator_key.is_none() {
        tracing::warn!("No operator key configured, only verified callers are accepted");
    }
    let verifier = Arc::new(GoogleTokenVerifier::new(http, config.auth.push_audience.clone()));
    let checks = Arc::new(CallerChecks::new(config.auth.clone(), verifier));

    let state = Arc::new(AppState {
        scheduler,
        driver,
        sweeper,
        checks,
        counters,
    });

    let addr = config.server.socket_addr()?;
    tracing::info!(config = %config_path.display(), "Starting labeld on {}", addr);
    server::serve(addr, state, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
        }
        tracing::info!("Shutting down");
    })
    .await
}
