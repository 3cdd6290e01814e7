//! Flush daemon for the chainscan write-behind caches.
//!
//! Connects to `PostgreSQL`, builds the `output` and `wallet` caches, and
//! applies the mutation commands a producer writes to stdin (see
//! [`commands`]). A flush driver persists the caches in the background. At
//! end of input, or on SIGINT/SIGTERM, the caches are closed and drained so
//! no accepted mutation is lost.
//!
//! # Architecture
//!
//! ```text
//! env --> FlusherConfig --> PostgresPool --+--> OutputCache --+
//!                                          |       ^          +--> flush driver --> PostgreSQL
//!                                          +--> WalletCache --+
//!                                                  ^
//! stdin (JSON lines) --> commands::consume --------+
//! ```

mod commands;
mod config;
mod error;

use std::sync::Arc;

use anyhow::Context as _;
use chainscan_db::{spawn_driver, OutputCache, PostgresPool, WalletCache, WriteBehindCache};
use tokio::io::BufReader;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::FlusherConfig;
use crate::error::FlusherError;

/// Application entry point.
///
/// # Errors
///
/// Returns an error if configuration, connection, migration, the command
/// feed or the final drain fails. The caches are drained before a feed
/// error is reported.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    info!("chainscan-flusher starting");

    let config = FlusherConfig::from_env().context("loading configuration")?;
    info!(
        max_connections = config.postgres.max_connections,
        poll_interval_ms = config.driver.poll_interval.as_millis(),
        fill_threshold_percent = config.driver.fill_threshold_percent,
        run_migrations = config.run_migrations,
        "configuration loaded"
    );

    let pool = PostgresPool::connect(&config.postgres)
        .await
        .map_err(FlusherError::from)
        .context("connecting to PostgreSQL")?;
    if config.run_migrations {
        pool.run_migrations().await.map_err(FlusherError::from)?;
    }

    let outputs = Arc::new(OutputCache::new(pool.output_store(), config.outputs)?);
    let wallets = Arc::new(WalletCache::new(pool.wallet_store(), config.wallets)?);
    info!(
        outputs = ?config.outputs,
        wallets = ?config.wallets,
        "caches initialized"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let driver = spawn_driver(
        vec![
            outputs.clone() as Arc<dyn WriteBehindCache>,
            wallets.clone() as Arc<dyn WriteBehindCache>,
        ],
        config.driver,
        shutdown_rx,
    );

    let mut sigterm = signal(SignalKind::terminate()).map_err(FlusherError::from)?;
    let stdin = BufReader::new(tokio::io::stdin());
    let feed = tokio::select! {
        fed = commands::consume(stdin, outputs.as_ref(), wallets.as_ref()) => Some(fed),
        _ = tokio::signal::ctrl_c() => {
            info!("received SIGINT, shutting down");
            None
        }
        _ = sigterm.recv() => {
            info!("received SIGTERM, shutting down");
            None
        }
    };
    match &feed {
        Some(Ok(fed)) => info!(applied = fed.applied, rejected = fed.rejected, "command feed ended"),
        Some(Err(e)) => warn!(error = %e, "command feed failed, draining what was accepted"),
        None => {}
    }

    // Fails only if the driver task has already returned.
    let _ = shutdown_tx.send(true);
    let stats = driver
        .await
        .context("flush driver task failed")?
        .map_err(FlusherError::from)?;
    info!(inserted = stats.inserted, updated = stats.updated, "flush driver stopped");

    pool.close().await;
    if let Some(Err(e)) = feed {
        return Err(e).context("reading command feed");
    }
    Ok(())
}
