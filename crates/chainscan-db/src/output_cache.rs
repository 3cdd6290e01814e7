//! Write-behind cache for the `output` table.
//!
//! Outputs are the highest-volume rows the scanner produces: one per
//! transaction output, each later marked spent, sometimes re-addressed or
//! re-valued. [`OutputCache`] buffers them so the scanner never waits on a
//! round-trip per row.
//!
//! # State per key
//!
//! ```text
//! add ----------> pending insert --execute_inserts--> persisted, clean
//!                   |      ^                              |
//!          update_* |      | (folded in place)   update_* |
//!                   +------+                              v
//!                                          pending update (spent/address/amount)
//!                                                         |
//!                                         execute_updates v
//!                                                  persisted, clean
//! ```
//!
//! An update to a key that is still a pending insert rewrites the pending
//! record and never reaches an update queue. An update to any other key is
//! queued as a sparse record; a second update to the same key before a flush
//! overwrites the first (last write wins, original queue position kept).

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;

use chainscan_types::{
    AddressId, AddressUpdate, AmountUpdate, OutputKey, OutputStatus, SpentUpdate, TransactionId,
    TxOutput,
};
use futures::future::BoxFuture;
use futures::FutureExt as _;
use tokio::sync::{Mutex, MutexGuard};

use crate::cache::{CacheGate, KeyedQueue, WriteBehindCache};
use crate::config::{fill_percent, CacheConfig};
use crate::error::DbError;
use crate::output_store::OUTPUT_TABLE;
use crate::store::OutputStore;

// =========================================================================
// State
// =========================================================================

/// Everything an [`OutputCache`] holds in memory, guarded by one lock.
#[derive(Debug, Default)]
pub struct OutputCacheState {
    /// Pending inserts in arrival order; doubles as the primary-key index.
    inserts: KeyedQueue<OutputKey, TxOutput>,
    /// Pending-insert positions grouped by parent transaction.
    by_transaction: BTreeMap<TransactionId, BTreeSet<i16>>,
    /// Pending `spent` updates for persisted rows.
    spent: KeyedQueue<OutputKey, OutputStatus>,
    /// Pending `address_id` updates for persisted rows.
    address: KeyedQueue<OutputKey, AddressId>,
    /// Pending `amount` updates for persisted rows.
    amount: KeyedQueue<OutputKey, i64>,
}

impl OutputCacheState {
    /// Number of pending inserts.
    pub fn insert_len(&self) -> usize {
        self.inserts.len()
    }

    /// Lengths of the spent, address and amount update queues.
    pub fn update_lens(&self) -> [usize; 3] {
        [self.spent.len(), self.address.len(), self.amount.len()]
    }

    /// Pending insert for `key`, with every folded update applied.
    pub fn pending(&self, key: &OutputKey) -> Option<&TxOutput> {
        self.inserts.get(key)
    }

    /// Pending inserts in flush order.
    pub fn pending_inserts(&self) -> Vec<TxOutput> {
        self.inserts.iter().map(|(_, out)| *out).collect()
    }

    /// Positions of pending inserts belonging to `transaction_id`.
    pub fn pending_positions(&self, transaction_id: TransactionId) -> Vec<i16> {
        self.by_transaction
            .get(&transaction_id)
            .map(|positions| positions.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Whether the secondary index has any entry for `transaction_id`.
    pub fn indexes_transaction(&self, transaction_id: TransactionId) -> bool {
        self.by_transaction.contains_key(&transaction_id)
    }

    /// Queued spent update for `key`.
    pub fn queued_spent(&self, key: &OutputKey) -> Option<OutputStatus> {
        self.spent.get(key).copied()
    }

    /// Queued address update for `key`.
    pub fn queued_address(&self, key: &OutputKey) -> Option<AddressId> {
        self.address.get(key).copied()
    }

    /// Queued amount update for `key`.
    pub fn queued_amount(&self, key: &OutputKey) -> Option<i64> {
        self.amount.get(key).copied()
    }

    fn total_len(&self) -> usize {
        self.update_lens()
            .iter()
            .fold(self.inserts.len(), |acc, len| acc.saturating_add(*len))
    }

    fn index(&mut self, key: OutputKey) {
        self.by_transaction
            .entry(key.transaction_id)
            .or_default()
            .insert(key.pos);
    }

    fn unindex(&mut self, key: &OutputKey) {
        if let Some(positions) = self.by_transaction.get_mut(&key.transaction_id) {
            positions.remove(&key.pos);
            if positions.is_empty() {
                self.by_transaction.remove(&key.transaction_id);
            }
        }
    }

    /// Drop `key` from the pending inserts and the secondary index.
    fn forget_insert(&mut self, key: &OutputKey) -> bool {
        let removed = self.inserts.remove(key).is_some();
        if removed {
            self.unindex(key);
        }
        removed
    }

    /// Drop every queued update for `key`. Returns how many were dropped.
    fn forget_updates(&mut self, key: &OutputKey) -> usize {
        [
            self.spent.remove(key).is_some(),
            self.address.remove(key).is_some(),
            self.amount.remove(key).is_some(),
        ]
        .into_iter()
        .filter(|removed| *removed)
        .count()
    }

    /// Drop every pending insert and queued update above `transaction_id`.
    fn purge_above(&mut self, transaction_id: TransactionId) -> usize {
        let above = |key: &OutputKey| key.transaction_id > transaction_id;
        let removed = self.inserts.retain(|key, _| !above(key));
        // Everything in the split-off half is above the threshold.
        if let Some(first_above) = transaction_id.into_inner().checked_add(1) {
            drop(self.by_transaction.split_off(&TransactionId(first_above)));
        }
        self.spent.retain(|key, _| !above(key));
        self.address.retain(|key, _| !above(key));
        self.amount.retain(|key, _| !above(key));
        removed
    }
}

/// Fold `change` into the pending insert for `key`, if there is one.
///
/// Returns `true` when the key is a pending insert (whether or not its value
/// changed), meaning the update must not be queued.
fn fold_into_pending(
    state: &mut OutputCacheState,
    key: &OutputKey,
    change: impl FnOnce(TxOutput) -> TxOutput,
) -> bool {
    let Some(current) = state.inserts.get(key).copied() else {
        return false;
    };
    let updated = change(current);
    if updated != current {
        state.inserts.replace(key, updated);
    }
    true
}

// =========================================================================
// Cache
// =========================================================================

/// Write-behind cache for `output` rows.
///
/// Cheap to share behind an [`std::sync::Arc`]; every method takes `&self`.
pub struct OutputCache<S> {
    store: S,
    config: CacheConfig,
    gate: CacheGate,
    state: Mutex<OutputCacheState>,
}

impl<S: OutputStore> OutputCache<S> {
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
            gate: CacheGate::new(OUTPUT_TABLE),
            state: Mutex::new(OutputCacheState::default()),
        })
    }

    /// The sizing limits this cache runs with.
    pub const fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// The store this cache persists through.
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Lock and borrow the cache state, for reads and tests.
    pub async fn state(&self) -> MutexGuard<'_, OutputCacheState> {
        self.state.lock().await
    }

    /// Current value of a pending (not yet inserted) output.
    pub async fn pending_output(&self, key: OutputKey) -> Option<TxOutput> {
        self.state.lock().await.pending(&key).copied()
    }

    /// Pending (not yet inserted) outputs of one transaction, by position.
    pub async fn pending_outputs_of(&self, transaction_id: TransactionId) -> Vec<TxOutput> {
        let state = self.state.lock().await;
        state
            .pending_positions(transaction_id)
            .into_iter()
            .filter_map(|pos| state.pending(&OutputKey::new(transaction_id, pos)).copied())
            .collect()
    }

    // ---------------------------------------------------------------------
    // Producer operations
    // ---------------------------------------------------------------------

    /// Queue `output` for insertion.
    ///
    /// Waits while the pending-insert set is at capacity. Adding a key that
    /// is already pending replaces its value in place. The added record is
    /// authoritative: updates already queued for the same key are dropped.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Closed`] if the cache is closed, before or while
    /// waiting, and [`DbError::InvalidArgument`] for a negative position.
    pub async fn add(&self, output: TxOutput) -> Result<(), DbError> {
        tracing::trace!(key = %output.key(), "add output");
        if output.pos < 0 {
            return Err(DbError::InvalidArgument(format!(
                "output position must be non-negative, got {}",
                output.pos
            )));
        }
        let capacity = self.config.max_insert_queue_len;
        let key = output.key();
        let mut state = self
            .gate
            .lock_with_room(&self.state, |s| s.inserts.len() < capacity || s.inserts.contains(&key))
            .await?;
        if state.inserts.upsert(key, output).is_none() {
            state.index(key);
        }
        let dropped = state.forget_updates(&key);
        if dropped > 0 {
            tracing::debug!(%key, dropped, "queued updates superseded by add");
        }
        Ok(())
    }

    /// Set the spent status of `key`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Closed`] if the cache is closed, or the store error
    /// if the spent queue filled up and its inline flush failed.
    pub async fn update_spent(&self, key: OutputKey, status: OutputStatus) -> Result<(), DbError> {
        tracing::trace!(%key, status, "update spent");
        let staged = self
            .stage_update(key, status, |s| &mut s.spent, |out| out.with_status(status))
            .await?;
        if let Some(mut state) = staged {
            self.flush_spent(&mut state).await?;
        }
        Ok(())
    }

    /// Set the destination address of `key`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Closed`] if the cache is closed, or the store error
    /// if the address queue filled up and its inline flush failed.
    pub async fn update_address(&self, key: OutputKey, address_id: AddressId) -> Result<(), DbError> {
        tracing::trace!(%key, %address_id, "update address");
        let staged = self
            .stage_update(key, address_id, |s| &mut s.address, |out| out.with_address(address_id))
            .await?;
        if let Some(mut state) = staged {
            self.flush_address(&mut state).await?;
        }
        Ok(())
    }

    /// Set the amount of `key`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Closed`] if the cache is closed, or the store error
    /// if the amount queue filled up and its inline flush failed.
    pub async fn update_amount(&self, key: OutputKey, amount: i64) -> Result<(), DbError> {
        tracing::trace!(%key, amount, "update amount");
        let staged = self
            .stage_update(key, amount, |s| &mut s.amount, |out| out.with_amount(amount))
            .await?;
        if let Some(mut state) = staged {
            self.flush_amount(&mut state).await?;
        }
        Ok(())
    }

    /// Fold an update into the pending insert for `key`, or queue it.
    ///
    /// Returns the still-held lock when the queue reached
    /// `max_update_queue_len`, so the caller can flush it inline.
    async fn stage_update<V>(
        &self,
        key: OutputKey,
        value: V,
        queue: fn(&mut OutputCacheState) -> &mut KeyedQueue<OutputKey, V>,
        fold: impl FnOnce(TxOutput) -> TxOutput,
    ) -> Result<Option<MutexGuard<'_, OutputCacheState>>, DbError>
    where
        V: Copy,
    {
        self.gate.ensure_active()?;
        let mut state = self.state.lock().await;
        if fold_into_pending(&mut state, &key, fold) {
            return Ok(None);
        }
        let pending = queue(&mut state);
        pending.upsert(key, value);
        if pending.len() >= self.config.max_update_queue_len {
            Ok(Some(state))
        } else {
            Ok(None)
        }
    }

    /// Delete `key` from the store immediately and from the cache.
    ///
    /// Returns whether a persisted row was removed, regardless of whether
    /// the key was also pending.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Closed`] if the cache is closed, or the store error
    /// (in which case the cache is left untouched).
    pub async fn delete(&self, key: OutputKey) -> Result<bool, DbError> {
        tracing::trace!(%key, "delete output");
        self.gate.ensure_active()?;
        let mut state = self.state.lock().await;
        let deleted = self.store.delete_output(key).await?;
        let was_pending = state.forget_insert(&key);
        state.forget_updates(&key);
        drop(state);
        if was_pending {
            self.gate.notify_space_freed();
        }
        Ok(deleted == 1)
    }

    /// Delete every output whose transaction id is above `transaction_id`,
    /// from the store and from the cache. Used to roll back a partially
    /// scanned block.
    ///
    /// Returns the number of persisted rows removed.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Closed`] if the cache is closed, or the store error
    /// (in which case the cache is left untouched).
    pub async fn delete_all_above(&self, transaction_id: TransactionId) -> Result<u64, DbError> {
        tracing::trace!(%transaction_id, "delete outputs above");
        self.gate.ensure_active()?;
        let mut state = self.state.lock().await;
        let deleted = self.store.delete_outputs_above(transaction_id).await?;
        let purged = state.purge_above(transaction_id);
        drop(state);
        if purged > 0 {
            self.gate.notify_space_freed();
        }
        tracing::debug!(%transaction_id, deleted, purged, "rolled back outputs");
        Ok(deleted)
    }

    // ---------------------------------------------------------------------
    // Driver operations
    // ---------------------------------------------------------------------

    /// Insert up to `max_batch_size` pending outputs, oldest first.
    ///
    /// Flushed rows leave the cache only after the store confirms the
    /// insert; on error everything stays pending for the next attempt.
    ///
    /// # Errors
    ///
    /// Returns the store error unchanged.
    pub async fn execute_inserts(&self) -> Result<u64, DbError> {
        let mut state = self.state.lock().await;
        let batch = state.inserts.front(self.config.max_batch_size);
        if batch.is_empty() {
            return Ok(0);
        }
        let rows: Vec<TxOutput> = batch.iter().map(|(_, out)| *out).collect();
        let inserted = self.store.insert_outputs(&rows).await?;
        for (key, _) in &batch {
            state.forget_insert(key);
        }
        let remaining = state.inserts.len();
        drop(state);
        self.gate.notify_space_freed();
        tracing::debug!(table = OUTPUT_TABLE, batch = rows.len(), inserted, remaining, "flushed inserts");
        Ok(inserted)
    }

    /// Flush up to `max_batch_size` entries from each update queue.
    ///
    /// # Errors
    ///
    /// Returns the first store error; queues flushed before it stay flushed.
    pub async fn execute_updates(&self) -> Result<u64, DbError> {
        let mut state = self.state.lock().await;
        let spent = self.flush_spent(&mut state).await?;
        let address = self.flush_address(&mut state).await?;
        let amount = self.flush_amount(&mut state).await?;
        Ok(spent.saturating_add(address).saturating_add(amount))
    }

    /// Highest fill percentage across all queues.
    pub async fn cache_fill_percent(&self) -> u32 {
        let state = self.state.lock().await;
        let inserts = fill_percent(state.inserts.len(), self.config.max_insert_queue_len);
        state
            .update_lens()
            .iter()
            .map(|len| fill_percent(*len, self.config.max_update_queue_len))
            .fold(inserts, u32::max)
    }

    /// Whether any queue has reached `min_batch_size`.
    pub async fn is_execute_needed(&self) -> bool {
        let state = self.state.lock().await;
        let min = self.config.min_batch_size;
        state.inserts.len() >= min || state.update_lens().iter().any(|len| *len >= min)
    }

    /// Total entries waiting across all queues.
    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.total_len()
    }

    // ---------------------------------------------------------------------
    // Per-queue flushes (caller holds the lock)
    // ---------------------------------------------------------------------

    async fn flush_spent(&self, state: &mut OutputCacheState) -> Result<u64, DbError> {
        let store = &self.store;
        self.flush_queue(
            &mut state.spent,
            "spent",
            |key, status| SpentUpdate { key, status },
            move |rows| async move { store.update_spent(&rows).await },
        )
        .await
    }

    async fn flush_address(&self, state: &mut OutputCacheState) -> Result<u64, DbError> {
        let store = &self.store;
        self.flush_queue(
            &mut state.address,
            "address",
            |key, address_id| AddressUpdate { key, address_id },
            move |rows| async move { store.update_address(&rows).await },
        )
        .await
    }

    async fn flush_amount(&self, state: &mut OutputCacheState) -> Result<u64, DbError> {
        let store = &self.store;
        self.flush_queue(
            &mut state.amount,
            "amount",
            |key, amount| AmountUpdate { key, amount },
            move |rows| async move { store.update_amount(&rows).await },
        )
        .await
    }

    /// Send the oldest `max_batch_size` entries of `pending` through `write`
    /// and evict them once the store confirms.
    async fn flush_queue<V, R, W, Fut>(
        &self,
        pending: &mut KeyedQueue<OutputKey, V>,
        queue: &'static str,
        build: impl Fn(OutputKey, V) -> R,
        write: W,
    ) -> Result<u64, DbError>
    where
        V: Copy,
        W: FnOnce(Vec<R>) -> Fut,
        Fut: Future<Output = Result<u64, DbError>>,
    {
        let batch = pending.front(self.config.max_batch_size);
        if batch.is_empty() {
            return Ok(0);
        }
        let rows: Vec<R> = batch.iter().map(|(key, value)| build(*key, *value)).collect();
        let updated = write(rows).await?;
        for (key, _) in &batch {
            pending.remove(key);
        }
        tracing::debug!(table = OUTPUT_TABLE, queue, batch = batch.len(), updated, "flushed updates");
        Ok(updated)
    }
}

impl<S: OutputStore> WriteBehindCache for OutputCache<S> {
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
