//! Lazily seeded id sequence for tables whose ids the scanner assigns.
//!
//! The first call to [`SequenceAllocator::next`] asks the store for the
//! current maximum id; every later call is an atomic increment with no
//! round-trip. Concurrent first callers share a single seed query.
//!
//! An empty table and a failed query are different outcomes: the seed query
//! reports `Ok(None)` for "no rows yet", which seeds the sequence at zero, and
//! `Err(_)` for a failure, which is returned to the caller and leaves the
//! sequence unseeded so the next call tries again.

use std::future::Future;
use std::sync::atomic::{AtomicI32, Ordering};

use tokio::sync::OnceCell;

use crate::error::DbError;

/// Strictly increasing `i32` ids, seeded once from the store.
#[derive(Debug)]
pub struct SequenceAllocator {
    table: &'static str,
    last: OnceCell<AtomicI32>,
}

impl SequenceAllocator {
    /// Create an unseeded allocator for `table`.
    pub const fn new(table: &'static str) -> Self {
        Self {
            table,
            last: OnceCell::const_new(),
        }
    }

    /// Last id handed out (or the seed), if the allocator has been seeded.
    pub fn current(&self) -> Option<i32> {
        self.last.get().map(|last| last.load(Ordering::Acquire))
    }

    /// Return the next id.
    ///
    /// `seed` is only invoked if the allocator has not been seeded yet, and
    /// at most once across concurrent callers.
    ///
    /// # Errors
    ///
    /// Returns the seed query's error unchanged, or
    /// [`DbError::SequenceExhausted`] once the sequence reaches [`i32::MAX`].
    pub async fn next<F, Fut>(&self, seed: F) -> Result<i32, DbError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<i32>, DbError>>,
    {
        let last = self
            .last
            .get_or_try_init(|| async move {
                let start = seed().await?.unwrap_or(0);
                tracing::info!(table = self.table, start, "seeded id sequence");
                Ok::<_, DbError>(AtomicI32::new(start))
            })
            .await?;

        last.fetch_update(Ordering::AcqRel, Ordering::Acquire, |prev| prev.checked_add(1))
            .ok()
            .and_then(|prev| prev.checked_add(1))
            .ok_or(DbError::SequenceExhausted { table: self.table })
    }
}
