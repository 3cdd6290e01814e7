//! Sizing configuration for the write-behind caches.
//!
//! Every cache has four knobs:
//!
//! | Knob | Meaning |
//! |------|---------|
//! | `min_batch_size` | Queue length at which [`is_execute_needed`] turns true |
//! | `max_batch_size` | Most rows a single flush call sends to the store |
//! | `max_insert_queue_len` | Pending inserts at which `add` blocks (backpressure) |
//! | `max_update_queue_len` | Pending updates at which `update_*` flushes inline |
//!
//! Values can be set in code with the `with_*` builders or read from
//! prefixed environment variables with [`CacheConfig::from_env`].
//!
//! [`is_execute_needed`]: crate::cache::WriteBehindCache::is_execute_needed

use crate::error::DbError;

/// Sizing limits for one write-behind cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Soft flush trigger: any queue at or above this length needs a flush.
    pub min_batch_size: usize,
    /// Upper bound on rows per flush call.
    pub max_batch_size: usize,
    /// Capacity of the pending-insert set.
    pub max_insert_queue_len: usize,
    /// Capacity of each pending-update queue.
    pub max_update_queue_len: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::outputs()
    }
}

impl CacheConfig {
    /// Defaults sized for the high-volume `output` table.
    pub const fn outputs() -> Self {
        Self {
            min_batch_size: 1_000,
            max_batch_size: 60_000,
            max_insert_queue_len: 120_000,
            max_update_queue_len: 100_000,
        }
    }

    /// Defaults sized for the `wallet` table.
    pub const fn wallets() -> Self {
        Self {
            min_batch_size: 1_000,
            max_batch_size: 10_000,
            max_insert_queue_len: 20_000,
            max_update_queue_len: 20_000,
        }
    }

    /// Set the soft flush trigger.
    #[must_use]
    pub const fn with_min_batch_size(mut self, size: usize) -> Self {
        self.min_batch_size = size;
        self
    }

    /// Set the per-flush row cap.
    #[must_use]
    pub const fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    /// Set the pending-insert capacity.
    #[must_use]
    pub const fn with_max_insert_queue_len(mut self, len: usize) -> Self {
        self.max_insert_queue_len = len;
        self
    }

    /// Set the pending-update capacity.
    #[must_use]
    pub const fn with_max_update_queue_len(mut self, len: usize) -> Self {
        self.max_update_queue_len = len;
        self
    }

    /// Check that the limits are usable.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Config`] if any limit is zero or the soft trigger
    /// exceeds a queue capacity.
    pub fn validate(&self) -> Result<(), DbError> {
        if self.min_batch_size == 0
            || self.max_batch_size == 0
            || self.max_insert_queue_len == 0
            || self.max_update_queue_len == 0
        {
            return Err(DbError::Config(format!(
                "cache limits must be non-zero: {self:?}"
            )));
        }
        if self.min_batch_size > self.max_insert_queue_len
            || self.min_batch_size > self.max_update_queue_len
        {
            return Err(DbError::Config(format!(
                "min_batch_size {} exceeds a queue capacity",
                self.min_batch_size
            )));
        }
        Ok(())
    }

    /// Override `defaults` with prefixed environment variables.
    ///
    /// Reads, for prefix `OUTPUT`:
    /// - `OUTPUT_MIN_BATCH_SIZE`
    /// - `OUTPUT_MAX_BATCH_SIZE`
    /// - `OUTPUT_MAX_INSERT_QUEUE_LEN`
    /// - `OUTPUT_MAX_UPDATE_QUEUE_LEN`
    ///
    /// Unset variables keep the default. The result is validated.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Config`] if a variable is not a valid number or
    /// the resulting limits fail [`CacheConfig::validate`].
    pub fn from_env(prefix: &str, defaults: Self) -> Result<Self, DbError> {
        let config = Self {
            min_batch_size: env_usize(prefix, "MIN_BATCH_SIZE", defaults.min_batch_size)?,
            max_batch_size: env_usize(prefix, "MAX_BATCH_SIZE", defaults.max_batch_size)?,
            max_insert_queue_len: env_usize(
                prefix,
                "MAX_INSERT_QUEUE_LEN",
                defaults.max_insert_queue_len,
            )?,
            max_update_queue_len: env_usize(
                prefix,
                "MAX_UPDATE_QUEUE_LEN",
                defaults.max_update_queue_len,
            )?,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Read `{prefix}_{name}` as a `usize`, falling back to `default` when unset.
fn env_usize(prefix: &str, name: &str, default: usize) -> Result<usize, DbError> {
    let var = format!("{prefix}_{name}");
    match std::env::var(&var) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| DbError::Config(format!("invalid {var}: {e}"))),
        Err(std::env::VarError::NotPresent) => Ok(default),
        Err(e) => Err(DbError::Config(format!("invalid {var}: {e}"))),
    }
}

/// Fill percentage of a queue, `len * 100 / capacity`, rounded down.
pub(crate) fn fill_percent(len: usize, capacity: usize) -> u32 {
    let percent = len
        .saturating_mul(100)
        .checked_div(capacity)
        .unwrap_or(100);
    u32::try_from(percent).unwrap_or(u32::MAX)
}
