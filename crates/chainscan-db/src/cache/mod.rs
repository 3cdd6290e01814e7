//! The write-behind cache contract shared by every entity cache.
//!
//! A write-behind cache accepts mutations immediately and persists them in
//! bulk when an external driver calls [`WriteBehindCache::execute_inserts`]
//! and [`WriteBehindCache::execute_updates`]. The driver decides *when* by
//! polling [`WriteBehindCache::cache_fill_percent`] and
//! [`WriteBehindCache::is_execute_needed`].
//!
//! # Locking
//!
//! Each cache owns exactly one [`tokio::sync::Mutex`] around its whole
//! state. A flush holds it across the store call, so choosing a batch,
//! executing it and evicting it form one critical section: nothing can be
//! mutated or added in between and then lost by the eviction.
//!
//! # Backpressure
//!
//! [`CacheGate::lock_with_room`] is the only place a producer waits. It
//! parks on a [`Notify`] without holding the lock until a flush frees space
//! or the cache is closed.

pub mod queue;

use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::BoxFuture;
use tokio::sync::{Mutex, MutexGuard, Notify};

use crate::error::DbError;

pub use queue::KeyedQueue;

/// Driver-facing surface of a write-behind cache.
///
/// Object-safe so a driver can hold caches of different entity types in one
/// collection (`Vec<Arc<dyn WriteBehindCache>>`).
pub trait WriteBehindCache: Send + Sync {
    /// Name of the table this cache persists to.
    fn table_name(&self) -> &'static str;

    /// Whether the cache still accepts mutations.
    fn is_active(&self) -> bool;

    /// Stop accepting mutations. Producers blocked on backpressure wake up
    /// and fail with [`DbError::Closed`]. Pending state is kept so a driver
    /// can still drain it.
    fn close(&self);

    /// Highest fill percentage across all of this cache's queues.
    fn cache_fill_percent(&self) -> BoxFuture<'_, u32>;

    /// Whether any queue has reached the soft flush trigger.
    fn is_execute_needed(&self) -> BoxFuture<'_, bool>;

    /// Total entries waiting across all queues.
    fn pending_len(&self) -> BoxFuture<'_, usize>;

    /// Flush at most one batch of pending inserts. Returns rows inserted.
    fn execute_inserts(&self) -> BoxFuture<'_, Result<u64, DbError>>;

    /// Flush at most one batch from every pending-update queue. Returns the
    /// total rows updated.
    fn execute_updates(&self) -> BoxFuture<'_, Result<u64, DbError>>;
}

/// Lifecycle flag plus the backpressure signal of one cache.
#[derive(Debug)]
pub struct CacheGate {
    table: &'static str,
    active: AtomicBool,
    space_freed: Notify,
}

impl CacheGate {
    /// Create an open gate for `table`.
    pub fn new(table: &'static str) -> Self {
        Self {
            table,
            active: AtomicBool::new(true),
            space_freed: Notify::new(),
        }
    }

    /// Table this gate guards.
    pub const fn table(&self) -> &'static str {
        self.table
    }

    /// Whether the cache is still open.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Fail with [`DbError::Closed`] if the cache has been closed.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Closed`] once [`CacheGate::close`] has run.
    pub fn ensure_active(&self) -> Result<(), DbError> {
        if self.is_active() {
            Ok(())
        } else {
            Err(DbError::Closed { table: self.table })
        }
    }

    /// Close the gate and wake every waiting producer.
    pub fn close(&self) {
        self.active.store(false, Ordering::Release);
        self.space_freed.notify_waiters();
        tracing::info!(table = self.table, "cache closed");
    }

    /// Wake producers waiting for room. Called after every eviction.
    pub fn notify_space_freed(&self) {
        self.space_freed.notify_waiters();
    }

    /// Lock `state` once `has_room` holds for it.
    ///
    /// While `has_room` is false the lock is released and the caller waits
    /// for [`CacheGate::notify_space_freed`] or [`CacheGate::close`]. The
    /// check and the returned guard belong to the same critical section, so
    /// the caller can insert without ever exceeding capacity.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Closed`] if the cache is closed before or while
    /// waiting.
    pub async fn lock_with_room<'a, S>(
        &self,
        state: &'a Mutex<S>,
        has_room: impl Fn(&S) -> bool,
    ) -> Result<MutexGuard<'a, S>, DbError> {
        loop {
            // Register before checking so a flush between the check and the
            // await still wakes us.
            let notified = self.space_freed.notified();
            self.ensure_active()?;
            {
                let guard = state.lock().await;
                if has_room(&guard) {
                    return Ok(guard);
                }
            }
            tracing::debug!(table = self.table, "pending inserts at capacity, waiting for flush");
            notified.await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn closed_gate_rejects() {
        let gate = CacheGate::new("t");
        assert!(gate.ensure_active().is_ok());
        gate.close();
        assert!(!gate.is_active());
        assert!(matches!(gate.ensure_active(), Err(DbError::Closed { table: "t" })));
    }

    #[tokio::test]
    async fn lock_with_room_returns_immediately_when_not_full() {
        let gate = CacheGate::new("t");
        let state = Mutex::new(Vec::<u8>::new());
        let mut guard = gate.lock_with_room(&state, Vec::is_empty).await.unwrap();
        guard.push(1);
        drop(guard);
        assert_eq!(state.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn waiter_wakes_after_space_freed() {
        let gate = Arc::new(CacheGate::new("t"));
        let state = Arc::new(Mutex::new(vec![1_u8]));

        let waiter = {
            let gate = Arc::clone(&gate);
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                let mut guard = gate.lock_with_room(&*state, |v| v.is_empty()).await?;
                guard.push(2);
                Ok::<_, DbError>(())
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        state.lock().await.clear();
        gate.notify_space_freed();

        waiter.await.unwrap().unwrap();
        assert_eq!(*state.lock().await, vec![2]);
    }

    #[tokio::test]
    async fn close_wakes_waiter_with_error() {
        let gate = Arc::new(CacheGate::new("t"));
        let state = Arc::new(Mutex::new(vec![1_u8]));

        let waiter = {
            let gate = Arc::clone(&gate);
            let state = Arc::clone(&state);
            tokio::spawn(async move { gate.lock_with_room(&*state, |v| v.is_empty()).await.map(|_| ()) })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.close();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(DbError::Closed { .. })));
    }
}
