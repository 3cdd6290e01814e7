//! Configuration for the flush daemon.
//!
//! Everything is read from environment variables. Only `DATABASE_URL` is
//! required; cache sizing falls back to the per-table defaults in
//! [`CacheConfig`].

use std::time::Duration;

use chainscan_db::{CacheConfig, DriverConfig, PostgresConfig};

use crate::error::FlusherError;

/// Complete daemon configuration loaded from the environment.
#[derive(Debug, Clone)]
pub struct FlusherConfig {
    /// Connection pool settings.
    pub postgres: PostgresConfig,
    /// Flush scheduling.
    pub driver: DriverConfig,
    /// Sizing for the `output` cache.
    pub outputs: CacheConfig,
    /// Sizing for the `wallet` cache.
    pub wallets: CacheConfig,
    /// Whether to apply migrations at startup.
    pub run_migrations: bool,
}

impl FlusherConfig {
    /// Load configuration from environment variables.
    ///
    /// Required variables:
    /// - `DATABASE_URL` -- `PostgreSQL` connection string
    ///
    /// Optional variables:
    /// - `DB_MAX_CONNECTIONS` -- pool size (default 10)
    /// - `FLUSH_POLL_INTERVAL_MS` -- driver poll interval (default 1000)
    /// - `FLUSH_FILL_THRESHOLD` -- fill percentage that forces a flush (default 50)
    /// - `RUN_MIGRATIONS` -- apply migrations at startup (default `true`)
    /// - `OUTPUT_*` / `WALLET_*` -- cache sizing, see [`CacheConfig::from_env`]
    pub fn from_env() -> Result<Self, FlusherError> {
        let postgres = PostgresConfig::from_env()?;

        let poll_interval_ms: u64 = parse_or("FLUSH_POLL_INTERVAL_MS", 1_000)?;
        if poll_interval_ms == 0 {
            return Err(FlusherError::Config(String::from(
                "FLUSH_POLL_INTERVAL_MS must be at least 1",
            )));
        }
        let fill_threshold: u32 = parse_or("FLUSH_FILL_THRESHOLD", 50)?;
        if fill_threshold > 100 {
            return Err(FlusherError::Config(format!(
                "FLUSH_FILL_THRESHOLD must be a percentage, got {fill_threshold}"
            )));
        }
        let run_migrations: bool = parse_or("RUN_MIGRATIONS", true)?;

        Ok(Self {
            postgres,
            driver: DriverConfig::default()
                .with_poll_interval(Duration::from_millis(poll_interval_ms))
                .with_fill_threshold_percent(fill_threshold),
            outputs: CacheConfig::from_env("OUTPUT", CacheConfig::outputs())?,
            wallets: CacheConfig::from_env("WALLET", CacheConfig::wallets())?,
            run_migrations,
        })
    }
}

/// Parse `name` if set, otherwise return `default`.
fn parse_or<T>(name: &str, default: T) -> Result<T, FlusherError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| FlusherError::Config(format!("invalid {name}: {e}"))),
        Err(std::env::VarError::NotPresent) => Ok(default),
        Err(e) => Err(FlusherError::Config(format!("invalid {name}: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_variable_yields_default() {
        let value: u64 = parse_or("CHAINSCAN_FLUSHER_TEST_UNSET", 7).unwrap_or(0);
        assert_eq!(value, 7);
        let flag: bool = parse_or("CHAINSCAN_FLUSHER_TEST_UNSET_FLAG", true).unwrap_or(false);
        assert!(flag);
    }
}
