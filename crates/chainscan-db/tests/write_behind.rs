//! Behavioural tests for the write-behind caches against an in-memory store.
//!
//! These exercise the cache contract end to end: key uniqueness, folding of
//! updates into pending inserts, last-write-wins update queues, rollback
//! purges, backpressure, retry after a failed flush, and the atomicity of a
//! flush against concurrent producers.

#![allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    clippy::missing_panics_doc
)]

use std::sync::Arc;
use std::time::Duration;

use chainscan_db::testing::MemoryOutputStore;
use chainscan_db::{CacheConfig, DbError, OutputCache, WriteBehindCache};
use chainscan_types::{AddressId, OutputKey, TransactionId, TxOutput, STATUS_SPENT};

// =============================================================================
// Helpers
// =============================================================================

fn key(tx: i32, pos: i16) -> OutputKey {
    OutputKey::new(TransactionId(tx), pos)
}

fn output(tx: i32, pos: i16, amount: i64) -> TxOutput {
    TxOutput {
        transaction_id: TransactionId(tx),
        pos,
        address_id: AddressId(tx),
        amount,
        status: 0,
    }
}

fn config(capacity: usize, batch: usize) -> CacheConfig {
    CacheConfig::outputs()
        .with_min_batch_size(1)
        .with_max_batch_size(batch)
        .with_max_insert_queue_len(capacity)
        .with_max_update_queue_len(capacity)
}

fn cache(store: MemoryOutputStore, capacity: usize, batch: usize) -> OutputCache<MemoryOutputStore> {
    OutputCache::new(store, config(capacity, batch)).unwrap()
}

// =============================================================================
// Properties
// =============================================================================

#[tokio::test]
async fn pending_keys_are_unique() {
    let cache = cache(MemoryOutputStore::default(), 10, 10);
    cache.add(output(1, 0, 10)).await.unwrap();
    cache.add(output(1, 0, 20)).await.unwrap();
    cache.add(output(1, 1, 30)).await.unwrap();

    assert_eq!(cache.pending_len().await, 2);
    assert_eq!(cache.pending_output(key(1, 0)).await.map(|o| o.amount), Some(20));

    assert_eq!(cache.execute_inserts().await.unwrap(), 2);
    assert_eq!(cache.store().len(), 2);
}

#[tokio::test]
async fn update_of_pending_row_folds_into_insert() {
    let cache = cache(MemoryOutputStore::default(), 10, 10);
    cache.add(output(1, 0, 10)).await.unwrap();

    cache.update_spent(key(1, 0), STATUS_SPENT).await.unwrap();
    cache.update_address(key(1, 0), AddressId(99)).await.unwrap();
    cache.update_amount(key(1, 0), 11).await.unwrap();

    assert_eq!(cache.state().await.update_lens(), [0, 0, 0]);
    let pending = cache.pending_output(key(1, 0)).await.unwrap();
    assert_eq!(pending.status, STATUS_SPENT);
    assert_eq!(pending.address_id, AddressId(99));
    assert_eq!(pending.amount, 11);

    cache.execute_inserts().await.unwrap();
    assert_eq!(cache.store().row(key(1, 0)), Some(pending));
    assert_eq!(cache.execute_updates().await.unwrap(), 0);
}

#[tokio::test]
async fn queued_updates_are_last_write_wins() {
    let store = MemoryOutputStore::default();
    store.seed(output(1, 0, 10));
    store.seed(output(1, 1, 10));
    let cache = cache(store, 10, 10);

    cache.update_amount(key(1, 0), 20).await.unwrap();
    cache.update_amount(key(1, 1), 30).await.unwrap();
    cache.update_amount(key(1, 0), 25).await.unwrap();

    {
        let state = cache.state().await;
        assert_eq!(state.update_lens(), [0, 0, 2]);
        assert_eq!(state.queued_amount(&key(1, 0)), Some(25));
    }

    assert_eq!(cache.execute_updates().await.unwrap(), 2);
    assert_eq!(cache.store().row(key(1, 0)).map(|r| r.amount), Some(25));
    assert_eq!(cache.store().row(key(1, 1)).map(|r| r.amount), Some(30));
}

#[tokio::test]
async fn delete_all_above_purges_pending_state_and_store() {
    let store = MemoryOutputStore::default();
    store.seed(output(1, 0, 1));
    store.seed(output(5, 0, 1));
    store.seed(output(6, 0, 1));
    let cache = cache(store, 10, 10);

    cache.add(output(2, 0, 1)).await.unwrap();
    cache.add(output(7, 0, 1)).await.unwrap();
    cache.add(output(7, 1, 1)).await.unwrap();
    cache.update_spent(key(1, 0), STATUS_SPENT).await.unwrap();
    cache.update_spent(key(6, 0), STATUS_SPENT).await.unwrap();

    // Two persisted rows above 2 are deleted; the boundary itself survives.
    assert_eq!(cache.delete_all_above(TransactionId(2)).await.unwrap(), 2);

    let state = cache.state().await;
    assert_eq!(state.insert_len(), 1);
    assert!(state.pending(&key(2, 0)).is_some());
    assert!(!state.indexes_transaction(TransactionId(7)));
    assert_eq!(state.queued_spent(&key(1, 0)), Some(STATUS_SPENT));
    assert_eq!(state.queued_spent(&key(6, 0)), None);
    drop(state);

    assert_eq!(cache.store().len(), 1);
    assert!(cache.pending_outputs_of(TransactionId(7)).await.is_empty());
}

#[tokio::test]
async fn failed_flush_is_retried_without_duplicates() {
    let cache = cache(MemoryOutputStore::default(), 10, 10);
    for pos in 0..4 {
        cache.add(output(1, pos, 1)).await.unwrap();
    }

    cache.store().fail_next(1);
    assert!(cache.execute_inserts().await.is_err());
    assert_eq!(cache.pending_len().await, 4);
    assert_eq!(cache.store().len(), 0);

    assert_eq!(cache.execute_inserts().await.unwrap(), 4);
    assert_eq!(cache.pending_len().await, 0);
    assert_eq!(cache.store().len(), 4);
    // Nothing left to resend, so a third call cannot produce duplicates.
    assert_eq!(cache.execute_inserts().await.unwrap(), 0);
}

#[tokio::test]
async fn folded_update_and_second_add_flush_in_one_batch() {
    let cache = cache(MemoryOutputStore::default(), 10, 2);
    cache.add(output(1, 0, 100)).await.unwrap();
    cache.add(output(2, 0, 200)).await.unwrap();
    cache.update_amount(key(1, 0), 150).await.unwrap();

    {
        let state = cache.state().await;
        assert_eq!(state.pending(&key(1, 0)).map(|o| o.amount), Some(150));
        assert_eq!(state.pending(&key(2, 0)).map(|o| o.amount), Some(200));
        assert_eq!(state.update_lens(), [0, 0, 0]);
    }

    assert_eq!(cache.execute_inserts().await.unwrap(), 2);
    assert_eq!(cache.pending_len().await, 0);
    assert_eq!(cache.store().row(key(1, 0)).map(|o| o.amount), Some(150));
}

#[tokio::test]
async fn add_supersedes_updates_queued_for_the_same_key() {
    let cache = cache(MemoryOutputStore::default(), 10, 10);
    cache.update_amount(key(1, 0), 5).await.unwrap();
    cache.update_spent(key(1, 0), STATUS_SPENT).await.unwrap();
    cache.update_amount(key(1, 1), 7).await.unwrap();

    cache.add(output(1, 0, 9)).await.unwrap();

    {
        let state = cache.state().await;
        assert_eq!(state.queued_amount(&key(1, 0)), None);
        assert_eq!(state.queued_spent(&key(1, 0)), None);
        assert_eq!(state.queued_amount(&key(1, 1)), Some(7));
        assert_eq!(state.pending(&key(1, 0)).map(|o| o.amount), Some(9));
    }

    assert_eq!(cache.execute_inserts().await.unwrap(), 1);
    // Only the update for the unrelated key is left, and it matches no row.
    assert_eq!(cache.execute_updates().await.unwrap(), 0);
    let row = cache.store().row(key(1, 0)).unwrap();
    assert_eq!(row.amount, 9);
    assert_eq!(row.status, 0);
}

// =============================================================================
// Concurrency
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn add_blocks_at_capacity_until_flush() {
    let cache = Arc::new(cache(MemoryOutputStore::default(), 3, 10));
    for pos in 0..3 {
        cache.add(output(1, pos, 1)).await.unwrap();
    }

    let blocked = {
        let cache = Arc::clone(&cache);
        tokio::spawn(async move { cache.add(output(1, 3, 1)).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!blocked.is_finished());
    assert_eq!(cache.pending_len().await, 3);

    assert_eq!(cache.execute_inserts().await.unwrap(), 3);
    blocked.await.unwrap().unwrap();
    assert_eq!(cache.pending_len().await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn close_releases_blocked_producer() {
    let cache = Arc::new(cache(MemoryOutputStore::default(), 1, 10));
    cache.add(output(1, 0, 1)).await.unwrap();

    let blocked = {
        let cache = Arc::clone(&cache);
        tokio::spawn(async move { cache.add(output(1, 1, 1)).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    WriteBehindCache::close(cache.as_ref());

    assert!(matches!(blocked.await.unwrap(), Err(DbError::Closed { .. })));
    // Pending state survives the close so it can still be drained.
    assert_eq!(cache.execute_inserts().await.unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_producers_never_exceed_capacity() {
    const CAPACITY: usize = 8;
    const PRODUCERS: i32 = 6;
    const PER_PRODUCER: i16 = 40;

    let cache = Arc::new(cache(MemoryOutputStore::default(), CAPACITY, 3));
    let mut producers = Vec::new();
    for tx in 0..PRODUCERS {
        let cache = Arc::clone(&cache);
        producers.push(tokio::spawn(async move {
            for pos in 0..PER_PRODUCER {
                cache.add(output(tx, pos, 1)).await.unwrap();
            }
        }));
    }

    let flusher = {
        let cache = Arc::clone(&cache);
        tokio::spawn(async move {
            let total = (PRODUCERS as usize) * (PER_PRODUCER as usize);
            let mut max_seen = 0;
            while cache.store().len() < total {
                max_seen = max_seen.max(cache.pending_len().await);
                cache.execute_inserts().await.unwrap();
                tokio::task::yield_now().await;
            }
            max_seen
        })
    };

    for producer in producers {
        producer.await.unwrap();
    }
    let max_seen = flusher.await.unwrap();
    assert!(max_seen <= CAPACITY, "saw {max_seen} pending inserts");
    assert_eq!(cache.store().len(), 240);
    assert_eq!(cache.pending_len().await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mutations_during_flush_are_not_lost() {
    let cache = Arc::new(cache(MemoryOutputStore::slow(Duration::from_millis(50)), 10, 10));
    cache.add(output(1, 0, 1)).await.unwrap();
    cache.add(output(1, 1, 1)).await.unwrap();

    let flush = {
        let cache = Arc::clone(&cache);
        tokio::spawn(async move { cache.execute_inserts().await })
    };
    // Let the flush take the lock and enter the slow store call.
    while cache.store().insert_calls() == 0 {
        tokio::task::yield_now().await;
    }

    // Both wait for the flush; the update then targets a persisted row.
    cache.update_amount(key(1, 0), 42).await.unwrap();
    cache.add(output(2, 0, 1)).await.unwrap();

    assert_eq!(flush.await.unwrap().unwrap(), 2);
    {
        let state = cache.state().await;
        assert_eq!(state.insert_len(), 1);
        assert!(state.pending(&key(2, 0)).is_some());
        assert!(state.pending(&key(1, 0)).is_none());
        assert_eq!(state.queued_amount(&key(1, 0)), Some(42));
    }

    assert_eq!(cache.execute_updates().await.unwrap(), 1);
    assert_eq!(cache.execute_inserts().await.unwrap(), 1);
    assert_eq!(cache.store().row(key(1, 0)).map(|o| o.amount), Some(42));
    assert_eq!(cache.store().len(), 3);
}
