//! Error types for the data layer.
//!
//! All errors are propagated via [`DbError`]. Store failures wrap the
//! underlying [`sqlx`] error; precondition failures (closed cache, bad
//! argument) carry enough context to tell which cache rejected the call.
//! Nothing in this crate swallows an error or substitutes a default.

/// Errors that can occur in the data layer.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// A `PostgreSQL` operation failed.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] sqlx::Error),

    /// A `PostgreSQL` migration failed.
    #[error("PostgreSQL migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A mutating call reached a cache that has been closed.
    #[error("cache for table `{table}` has been closed")]
    Closed {
        /// Table backing the closed cache.
        table: &'static str,
    },

    /// A caller passed an argument the cache cannot accept.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The id sequence for a table ran past [`i32::MAX`].
    #[error("id sequence for table `{table}` is exhausted")]
    SequenceExhausted {
        /// Table whose ids ran out.
        table: &'static str,
    },

    /// A store implementation reported a failure that is not a `sqlx` error.
    #[error("store error: {0}")]
    Store(String),

    /// A configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl DbError {
    /// Whether this error is a caller bug that a retry cannot fix.
    pub const fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::Closed { .. } | Self::InvalidArgument(_) | Self::Config(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_error_names_the_table() {
        let err = DbError::Closed { table: "output" };
        assert!(err.to_string().contains("output"));
        assert!(err.is_precondition());
    }

    #[test]
    fn store_errors_are_retryable() {
        let err = DbError::Store(String::from("connection reset"));
        assert!(!err.is_precondition());
        let err = DbError::SequenceExhausted { table: "wallet" };
        assert!(!err.is_precondition());
    }
}
