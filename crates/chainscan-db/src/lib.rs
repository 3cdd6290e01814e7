//! Write-behind persistence layer for the chainscan blockchain scanner.
//!
//! The scanner produces a heavy stream of small mutations (new outputs,
//! spends, address and amount corrections, new wallets). Writing each one as
//! its own statement would bottleneck on round-trips, so every mutation goes
//! into an in-memory cache first and is persisted later in large batched
//! statements.
//!
//! # Architecture
//!
//! ```text
//! Scanner tasks
//!     |
//!     +-- add / update_* / delete --> OutputCache ---+
//!     |                                              |
//!     +-- add / add_new -----------> WalletCache ----+
//!                                                    |
//!                     FlushDriver (poll + drain) <---+
//!                         |
//!                         +-- execute_inserts / execute_updates
//!                                 |
//!                                 +--> OutputStore / WalletStore
//!                                          |
//!                                          +--> PostgreSQL (UNNEST batches)
//! ```
//!
//! # Modules
//!
//! - [`cache`] -- the [`WriteBehindCache`] contract, backpressure gate, keyed queue
//! - [`output_cache`] -- pending inserts and update queues for `output`
//! - [`wallet_cache`] -- pending inserts and id allocation for `wallet`
//! - [`sequence`] -- lazily seeded id sequence
//! - [`driver`] -- periodic flush loop and shutdown drain
//! - [`store`] -- the bulk-statement boundary the caches write through
//! - [`output_store`] / [`wallet_store`] -- `PostgreSQL` statements
//! - [`postgres`] -- connection pool and migrations
//! - [`config`] -- cache sizing
//! - [`error`] -- shared error type

pub mod cache;
pub mod config;
pub mod driver;
pub mod error;
pub mod output_cache;
pub mod output_store;
pub mod postgres;
pub mod sequence;
pub mod store;
pub mod wallet_cache;
pub mod wallet_store;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

// Re-export primary types for convenience.
pub use cache::{CacheGate, KeyedQueue, WriteBehindCache};
pub use config::CacheConfig;
pub use driver::{spawn_driver, DriverConfig, FlushDriver, FlushStats};
pub use error::DbError;
pub use output_cache::{OutputCache, OutputCacheState};
pub use output_store::{PgOutputStore, OUTPUT_TABLE};
pub use postgres::{PostgresConfig, PostgresPool};
pub use sequence::SequenceAllocator;
pub use store::{OutputStore, WalletStore};
pub use wallet_cache::{WalletCache, WalletCacheState};
pub use wallet_store::{PgWalletStore, WALLET_TABLE};
