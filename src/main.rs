//! Slim entry point: load config, wire the components together, run until
//! ctrl-c or the maintainer's remote shutdown command.

use anyhow::{Context, Result};
use birdwatch::config::{init_logging, AppConfig};
use birdwatch::credentials::CredentialPool;
use birdwatch::diff::DiffEngine;
use birdwatch::fetcher::GraphqlSnapshotFetcher;
use birdwatch::health::{health_channel, HealthMonitor};
use birdwatch::notify::{NotificationDispatcher, TelegramCommander, TelegramDispatcher};
use birdwatch::scheduler::Scheduler;
use birdwatch::store::{MemoryStateStore, SqliteStateStore, StateStore};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const STARTUP_TOKEN: &str = "/start";
const SHUTDOWN_TOKEN: &str = "/shutdown";

#[tokio::main]
async fn main() -> Result<()> {
    let config_path =
        std::env::var("BIRDWATCH_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
    let config = AppConfig::from_toml_file(&config_path)
        .with_context(|| format!("failed to load configuration from {config_path}"))?;

    init_logging(&config.log_level);
    info!(
        config = %config_path,
        targets = config.targets.len(),
        credentials = config.credentials.len(),
        "starting birdwatch"
    );

    let store: Arc<dyn StateStore> = match &config.database_path {
        Some(path) => Arc::new(SqliteStateStore::open(path).await?),
        None => {
            warn!("no database_path configured; snapshots will not survive restarts");
            Arc::new(MemoryStateStore::new())
        }
    };

    let (health_sink, health_rx) = health_channel(config.health_event_buffer);
    let pool = Arc::new(CredentialPool::new(
        config.credential_materials(),
        config.auth_failure_threshold,
        health_sink.clone(),
    ));
    let fetcher = Arc::new(GraphqlSnapshotFetcher::new(config.fetcher_config())?);
    let dispatcher: Arc<dyn NotificationDispatcher> = Arc::new(TelegramDispatcher::new(
        config.telegram.bot_token.clone(),
        config.telegram.rate_limit_per_minute,
    )?);
    let commander = Arc::new(TelegramCommander::new(
        config.telegram.bot_token.clone(),
        config.telegram.maintainer_chat_id,
    )?);

    let cancel = CancellationToken::new();

    if config.telegram.require_startup_ack {
        info!(
            "waiting for startup acknowledgement '{}' from the maintainer chat",
            STARTUP_TOKEN
        );
        let _ = dispatcher
            .deliver(
                config.telegram.maintainer_chat_id,
                &format!("birdwatch is up; send {STARTUP_TOKEN} to begin polling"),
            )
            .await;
        if !commander.wait_for_token(STARTUP_TOKEN, &cancel).await {
            info!("cancelled before startup acknowledgement; exiting");
            return Ok(());
        }
        info!("startup acknowledged");
    }

    let monitor = HealthMonitor::new(
        Some(Arc::clone(&dispatcher)),
        config.telegram.maintainer_chat_id,
        config.telegram.daily_summary,
    );
    let health_handle = tokio::spawn(monitor.run(health_rx, cancel.clone()));

    let exit_handle = tokio::spawn(Arc::clone(&commander).run_exit_listener(
        SHUTDOWN_TOKEN.to_string(),
        cancel.clone(),
    ));

    let mut scheduler = Scheduler::new(
        config.scheduler_config(),
        config.targets(),
        pool,
        fetcher,
        store,
        DiffEngine::new(config.diff_config()),
        Arc::clone(&dispatcher),
        health_sink,
    );
    scheduler.restore_state();
    let scheduler_handle = tokio::spawn(scheduler.run(cancel.clone()));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("ctrl-c received; shutting down");
            cancel.cancel();
        }
        _ = cancel.cancelled() => {}
    }

    if let Err(e) = scheduler_handle.await {
        warn!("scheduler task ended abnormally: {}", e);
    }
    health_handle.abort();
    exit_handle.abort();

    info!("birdwatch stopped");
    Ok(())
}
