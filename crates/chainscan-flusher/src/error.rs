//! Error types for the flush daemon.

use chainscan_db::DbError;

/// Top-level error for the flush daemon.
#[derive(Debug, thiserror::Error)]
pub enum FlusherError {
    /// Configuration is invalid or missing.
    #[error("config error: {0}")]
    Config(String),

    /// The data layer failed (connection, migration, flush).
    #[error("database error: {source}")]
    Db {
        /// The underlying data-layer error.
        #[from]
        source: DbError,
    },

    /// Reading the command feed or installing a signal handler failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
