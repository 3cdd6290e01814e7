//! Periodic flush driver for a set of write-behind caches.
//!
//! The caches never flush on their own (apart from the inline safety valve
//! on full update queues). [`FlushDriver`] polls them on an interval, visits
//! the fullest cache first, and drains every cache on shutdown.
//!
//! # Loop
//!
//! ```text
//! every poll_interval:
//!   sort caches by cache_fill_percent (descending)
//!   for each cache that is_execute_needed or is above fill_threshold:
//!     execute_inserts while is_execute_needed
//!     execute_updates
//! on shutdown:
//!   drain_all (flush until pending_len == 0)
//! ```
//!
//! A store error is logged and the cache is retried on the next tick; the
//! cache keeps every un-evicted entry, so the retry re-sends the same batch.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::cache::WriteBehindCache;
use crate::error::DbError;

/// Default poll interval in milliseconds.
const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;

/// Default fill percentage above which a cache is flushed even below
/// `min_batch_size`.
const DEFAULT_FILL_THRESHOLD_PERCENT: u32 = 50;

/// Upper bound on flush rounds per cache while draining, so a store that
/// keeps accepting zero rows cannot spin the shutdown path forever.
const MAX_DRAIN_ROUNDS: usize = 10_000;

/// Scheduling parameters for [`FlushDriver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverConfig {
    /// Time between polls.
    pub poll_interval: Duration,
    /// Fill percentage that forces a flush.
    pub fill_threshold_percent: u32,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            fill_threshold_percent: DEFAULT_FILL_THRESHOLD_PERCENT,
        }
    }
}

impl DriverConfig {
    /// Set the poll interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the forced-flush fill percentage.
    #[must_use]
    pub const fn with_fill_threshold_percent(mut self, percent: u32) -> Self {
        self.fill_threshold_percent = percent;
        self
    }
}

/// Rows written during one driver pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    /// Rows inserted.
    pub inserted: u64,
    /// Rows updated.
    pub updated: u64,
}

impl FlushStats {
    const fn add(self, other: Self) -> Self {
        Self {
            inserted: self.inserted.saturating_add(other.inserted),
            updated: self.updated.saturating_add(other.updated),
        }
    }
}

/// Polls and flushes a fixed set of caches.
pub struct FlushDriver {
    caches: Vec<Arc<dyn WriteBehindCache>>,
    config: DriverConfig,
}

impl FlushDriver {
    /// Create a driver over `caches`.
    pub fn new(caches: Vec<Arc<dyn WriteBehindCache>>, config: DriverConfig) -> Self {
        Self { caches, config }
    }

    /// The caches this driver flushes.
    pub fn caches(&self) -> &[Arc<dyn WriteBehindCache>] {
        &self.caches
    }

    /// Flush one cache: inserts until it no longer needs a flush, then one
    /// pass over its update queues.
    ///
    /// # Errors
    ///
    /// Returns the first store error.
    pub async fn flush_cache(cache: &dyn WriteBehindCache) -> Result<FlushStats, DbError> {
        let mut stats = FlushStats::default();
        loop {
            let inserted = cache.execute_inserts().await?;
            stats.inserted = stats.inserted.saturating_add(inserted);
            if inserted == 0 || !cache.is_execute_needed().await {
                break;
            }
        }
        stats.updated = cache.execute_updates().await?;
        Ok(stats)
    }

    /// One poll: flush every cache that needs it, fullest first.
    ///
    /// A failing cache is logged and skipped so the others still flush.
    pub async fn run_once(&self) -> FlushStats {
        let mut by_fill = Vec::with_capacity(self.caches.len());
        for cache in &self.caches {
            by_fill.push((cache.cache_fill_percent().await, Arc::clone(cache)));
        }
        by_fill.sort_by(|a, b| b.0.cmp(&a.0));

        let mut total = FlushStats::default();
        for (fill, cache) in by_fill {
            let needed = cache.is_execute_needed().await;
            if !needed && fill < self.config.fill_threshold_percent {
                continue;
            }
            match Self::flush_cache(cache.as_ref()).await {
                Ok(stats) => {
                    tracing::debug!(
                        table = cache.table_name(),
                        fill,
                        inserted = stats.inserted,
                        updated = stats.updated,
                        "flushed cache"
                    );
                    total = total.add(stats);
                }
                Err(e) => {
                    tracing::warn!(table = cache.table_name(), error = %e, "flush failed, will retry");
                }
            }
        }
        total
    }

    /// Flush every cache until nothing is pending.
    ///
    /// # Errors
    ///
    /// Returns the first store error; entries not yet flushed stay cached.
    pub async fn drain_all(&self) -> Result<FlushStats, DbError> {
        let mut total = FlushStats::default();
        for cache in &self.caches {
            for _ in 0..MAX_DRAIN_ROUNDS {
                if cache.pending_len().await == 0 {
                    break;
                }
                let inserted = cache.execute_inserts().await?;
                let updated = cache.execute_updates().await?;
                total = total.add(FlushStats { inserted, updated });
            }
            let left = cache.pending_len().await;
            if left > 0 {
                tracing::warn!(table = cache.table_name(), left, "drain stopped with entries pending");
            }
        }
        tracing::info!(inserted = total.inserted, updated = total.updated, "drained caches");
        Ok(total)
    }

    /// Poll until `shutdown` turns `true` (or its sender is dropped), then
    /// close every cache and drain it.
    ///
    /// # Errors
    ///
    /// Returns the first store error hit while draining.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<FlushStats, DbError> {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(
            caches = self.caches.len(),
            poll_interval_ms = self.config.poll_interval.as_millis(),
            fill_threshold_percent = self.config.fill_threshold_percent,
            "flush driver starting"
        );

        let mut total = FlushStats::default();
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = interval.tick() => {
                    total = total.add(self.run_once().await);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!("flush driver stopping, draining caches");
        for cache in &self.caches {
            cache.close();
        }
        let drained = self.drain_all().await?;
        Ok(total.add(drained))
    }
}

/// Start a [`FlushDriver`] over `caches` on its own task.
///
/// This is the entry point for a scanner process: keep clones of the cache
/// handles for the producers, pass the originals here, and send `true` on
/// the `shutdown` channel once producers are done. The handle resolves after
/// the caches are closed and drained.
pub fn spawn_driver(
    caches: Vec<Arc<dyn WriteBehindCache>>,
    config: DriverConfig,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<Result<FlushStats, DbError>> {
    let driver = FlushDriver::new(caches, config);
    tokio::spawn(async move { driver.run(shutdown).await })
}
