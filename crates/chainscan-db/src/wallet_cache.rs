//! Write-behind cache for the `wallet` table.
//!
//! Wallets are only ever inserted by the scanner; they have no updatable
//! field groups, so [`WalletCache::execute_updates`] always returns zero.
//! Wallet ids are assigned by the scanner from a [`SequenceAllocator`]
//! seeded with the table's current maximum id.

use chainscan_types::{Wallet, WalletId};
use futures::future::BoxFuture;
use futures::FutureExt as _;
use tokio::sync::Mutex;

use crate::cache::{CacheGate, KeyedQueue, WriteBehindCache};
use crate::config::{fill_percent, CacheConfig};
use crate::error::DbError;
use crate::sequence::SequenceAllocator;
use crate::store::WalletStore;
use crate::wallet_store::WALLET_TABLE;

/// Pending wallet inserts, in arrival order.
#[derive(Debug, Default)]
pub struct WalletCacheState {
    inserts: KeyedQueue<WalletId, Wallet>,
}

impl WalletCacheState {
    /// Number of pending inserts.
    pub fn insert_len(&self) -> usize {
        self.inserts.len()
    }

    /// Pending wallet with id `wallet_id`.
    pub fn pending(&self, wallet_id: WalletId) -> Option<&Wallet> {
        self.inserts.get(&wallet_id)
    }

    /// Pending wallet ids in flush order.
    pub fn pending_ids(&self) -> Vec<WalletId> {
        self.inserts.iter().map(|(id, _)| *id).collect()
    }
}

/// Write-behind cache for `wallet` rows.
pub struct WalletCache<S> {
    store: S,
    config: CacheConfig,
    gate: CacheGate,
    sequence: SequenceAllocator,
    state: Mutex<WalletCacheState>,
}

impl<S: WalletStore> WalletCache<S> {
    /// Create a cache that persists through `store`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Config`] if `config` fails validation.
    pub fn new(store: S, config: CacheConfig) -> Result<Self, DbError> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            gate: CacheGate::new(WALLET_TABLE),
            sequence: SequenceAllocator::new(WALLET_TABLE),
            state: Mutex::new(WalletCacheState::default()),
        })
    }

    /// The store this cache persists through.
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Lock and borrow the cache state, for reads and tests.
    pub async fn state(&self) -> tokio::sync::MutexGuard<'_, WalletCacheState> {
        self.state.lock().await
    }

    /// Current value of a pending (not yet inserted) wallet.
    pub async fn pending_wallet(&self, wallet_id: WalletId) -> Option<Wallet> {
        self.state.lock().await.pending(wallet_id).cloned()
    }

    /// Allocate the next wallet id.
    ///
    /// The first call seeds the sequence from `MAX(wallet_id)`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Closed`] if the cache is closed, the seed query's
    /// error, or [`DbError::SequenceExhausted`].
    pub async fn next_wallet_id(&self) -> Result<WalletId, DbError> {
        self.gate.ensure_active()?;
        let id = self
            .sequence
            .next(|| async {
                let max = self.store.max_wallet_id().await?;
                Ok::<_, DbError>(max.map(WalletId::into_inner))
            })
            .await?;
        Ok(WalletId(id))
    }

    /// Allocate an id and queue an empty wallet under it.
    ///
    /// # Errors
    ///
    /// See [`WalletCache::next_wallet_id`] and [`WalletCache::add`].
    pub async fn add_new(&self) -> Result<Wallet, DbError> {
        let wallet_id = self.next_wallet_id().await?;
        self.add(Wallet::new(wallet_id)).await
    }

    /// Queue `wallet` for insertion and return it as stored.
    ///
    /// A wallet carrying [`WalletId::UNASSIGNED`] gets the next id from the
    /// sequence first. Waits while the pending-insert set is at capacity.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Closed`] if the cache is closed,
    /// [`DbError::InvalidArgument`] for a negative id, or an allocation error.
    pub async fn add(&self, wallet: Wallet) -> Result<Wallet, DbError> {
        tracing::trace!(wallet_id = %wallet.wallet_id, "add wallet");
        self.gate.ensure_active()?;
        if wallet.wallet_id.into_inner() < 0 {
            return Err(DbError::InvalidArgument(format!(
                "wallet id must be non-negative, got {}",
                wallet.wallet_id
            )));
        }
        let wallet = if wallet.wallet_id.is_unassigned() {
            let wallet_id = self.next_wallet_id().await?;
            wallet.with_id(wallet_id)
        } else {
            wallet
        };

        let capacity = self.config.max_insert_queue_len;
        let wallet_id = wallet.wallet_id;
        let mut state = self
            .gate
            .lock_with_room(&self.state, |s| {
                s.inserts.len() < capacity || s.inserts.contains(&wallet_id)
            })
            .await?;
        state.inserts.upsert(wallet_id, wallet.clone());
        Ok(wallet)
    }

    /// Insert up to `max_batch_size` pending wallets, oldest first.
    ///
    /// # Errors
    ///
    /// Returns the store error unchanged; nothing is evicted in that case.
    pub async fn execute_inserts(&self) -> Result<u64, DbError> {
        let mut state = self.state.lock().await;
        let batch = state.inserts.front(self.config.max_batch_size);
        if batch.is_empty() {
            return Ok(0);
        }
        let rows: Vec<Wallet> = batch.iter().map(|(_, wallet)| wallet.clone()).collect();
        let inserted = self.store.insert_wallets(&rows).await?;
        for (wallet_id, _) in &batch {
            state.inserts.remove(wallet_id);
        }
        drop(state);
        self.gate.notify_space_freed();
        tracing::debug!(table = WALLET_TABLE, batch = rows.len(), inserted, "flushed inserts");
        Ok(inserted)
    }

    /// Wallets have no update queues.
    ///
    /// # Errors
    ///
    /// Never fails; the `Result` matches [`WriteBehindCache`].
    #[allow(clippy::unused_async)]
    pub async fn execute_updates(&self) -> Result<u64, DbError> {
        Ok(0)
    }

    /// Fill percentage of the pending-insert set.
    pub async fn cache_fill_percent(&self) -> u32 {
        fill_percent(self.state.lock().await.inserts.len(), self.config.max_insert_queue_len)
    }

    /// Whether pending inserts have reached `min_batch_size`.
    pub async fn is_execute_needed(&self) -> bool {
        self.state.lock().await.inserts.len() >= self.config.min_batch_size
    }

    /// Number of pending inserts.
    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.inserts.len()
    }
}

impl<S: WalletStore> WriteBehindCache for WalletCache<S> {
    fn table_name(&self) -> &'static str {
        self.gate.table()
    }

    fn is_active(&self) -> bool {
        self.gate.is_active()
    }

    fn close(&self) {
        self.gate.close();
    }

    fn cache_fill_percent(&self) -> BoxFuture<'_, u32> {
        Self::cache_fill_percent(self).boxed()
    }

    fn is_execute_needed(&self) -> BoxFuture<'_, bool> {
        Self::is_execute_needed(self).boxed()
    }

    fn pending_len(&self) -> BoxFuture<'_, usize> {
        Self::pending_len(self).boxed()
    }

    fn execute_inserts(&self) -> BoxFuture<'_, Result<u64, DbError>> {
        Self::execute_inserts(self).boxed()
    }

    fn execute_updates(&self) -> BoxFuture<'_, Result<u64, DbError>> {
        Self::execute_updates(self).boxed()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::testing::MemoryWalletStore;

    fn cache(store: MemoryWalletStore) -> WalletCache<MemoryWalletStore> {
        let config = CacheConfig::wallets()
            .with_min_batch_size(2)
            .with_max_batch_size(2)
            .with_max_insert_queue_len(4)
            .with_max_update_queue_len(4);
        WalletCache::new(store, config).unwrap()
    }

    #[tokio::test]
    async fn add_new_allocates_after_persisted_max() {
        let cache = cache(MemoryWalletStore::with_max(Some(WalletId(10))));
        let first = cache.add_new().await.unwrap();
        let second = cache.add_new().await.unwrap();
        assert_eq!(first.wallet_id, WalletId(11));
        assert_eq!(second.wallet_id, WalletId(12));
        assert_eq!(cache.state().await.pending_ids(), vec![WalletId(11), WalletId(12)]);
    }

    #[tokio::test]
    async fn unassigned_id_is_allocated_on_add() {
        let cache = cache(MemoryWalletStore::with_max(None));
        let named = Wallet {
            wallet_id: WalletId::UNASSIGNED,
            name: Some(String::from("miner")),
            details: None,
        };
        let stored = cache.add(named).await.unwrap();
        assert_eq!(stored.wallet_id, WalletId(1));
        assert_eq!(
            cache.pending_wallet(WalletId(1)).await.and_then(|w| w.name),
            Some(String::from("miner"))
        );
    }

    #[tokio::test]
    async fn explicit_id_is_kept() {
        let cache = cache(MemoryWalletStore::with_max(None));
        let stored = cache.add(Wallet::new(WalletId(77))).await.unwrap();
        assert_eq!(stored.wallet_id, WalletId(77));
        // The sequence was never consulted.
        assert_eq!(cache.store().max_queries(), 0);
    }

    #[tokio::test]
    async fn negative_id_is_rejected() {
        let cache = cache(MemoryWalletStore::with_max(None));
        let result = cache.add(Wallet::new(WalletId(-3))).await;
        assert!(matches!(result, Err(DbError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn failed_seed_query_is_not_treated_as_empty() {
        let store = MemoryWalletStore::with_max(Some(WalletId(50)));
        store.fail_next(1);
        let cache = cache(store);
        assert!(cache.add_new().await.is_err());
        assert_eq!(cache.add_new().await.unwrap().wallet_id, WalletId(51));
    }

    #[tokio::test]
    async fn flush_is_chunked_and_fifo() {
        let cache = cache(MemoryWalletStore::with_max(None));
        for _ in 0..3 {
            cache.add_new().await.unwrap();
        }
        assert!(cache.is_execute_needed().await);
        assert_eq!(cache.cache_fill_percent().await, 75);

        assert_eq!(cache.execute_inserts().await.unwrap(), 2);
        assert_eq!(cache.store().inserted_ids(), vec![WalletId(1), WalletId(2)]);
        assert_eq!(cache.state().await.pending_ids(), vec![WalletId(3)]);
        assert!(!cache.is_execute_needed().await);

        assert_eq!(cache.execute_inserts().await.unwrap(), 1);
        assert_eq!(cache.execute_updates().await.unwrap(), 0);
        assert_eq!(cache.pending_len().await, 0);
    }

    #[tokio::test]
    async fn closed_cache_rejects_adds() {
        let cache = cache(MemoryWalletStore::with_max(None));
        cache.close();
        assert!(matches!(cache.add_new().await, Err(DbError::Closed { table: "wallet" })));
        assert!(!WriteBehindCache::is_active(&cache));
    }
}
