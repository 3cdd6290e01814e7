//! In-memory stores for exercising the caches without `PostgreSQL`.
//!
//! Compiled for this crate's own tests and, behind the `test-util` feature,
//! for integration tests and downstream crates.

#![allow(clippy::arithmetic_side_effects, clippy::missing_panics_doc)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chainscan_types::{
    AddressUpdate, AmountUpdate, OutputKey, SpentUpdate, TransactionId, TxOutput, Wallet, WalletId,
};

use crate::error::DbError;
use crate::store::{OutputStore, WalletStore};

/// Decrement `counter` if positive and report whether this call should fail.
fn should_fail(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        .is_ok()
}

fn injected() -> DbError {
    DbError::Store(String::from("injected failure"))
}

/// `output` table held in a [`BTreeMap`].
///
/// Inserting a key that already exists fails like a primary-key violation.
#[derive(Debug, Default)]
pub struct MemoryOutputStore {
    rows: Mutex<BTreeMap<OutputKey, TxOutput>>,
    failures: AtomicUsize,
    insert_delay: Option<Duration>,
    insert_calls: AtomicUsize,
}

#[allow(clippy::unwrap_used)]
impl MemoryOutputStore {
    /// A store whose inserts sleep for `delay` before touching the table.
    pub fn slow(delay: Duration) -> Self {
        Self {
            insert_delay: Some(delay),
            ..Self::default()
        }
    }

    /// Write `row` straight into the table, bypassing any cache.
    pub fn seed(&self, row: TxOutput) {
        self.rows.lock().unwrap().insert(row.key(), row);
    }

    /// The persisted row for `key`, if any.
    pub fn row(&self, key: OutputKey) -> Option<TxOutput> {
        self.rows.lock().unwrap().get(&key).copied()
    }

    /// Number of persisted rows.
    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of insert statements started so far, including failed ones.
    pub fn insert_calls(&self) -> usize {
        self.insert_calls.load(Ordering::Acquire)
    }

    /// Make the next `n` statements fail.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::Release);
    }

    fn apply(&self, key: OutputKey, change: impl FnOnce(&mut TxOutput)) -> u64 {
        self.rows.lock().unwrap().get_mut(&key).map_or(0, |row| {
            change(row);
            1
        })
    }
}

#[allow(clippy::unwrap_used)]
impl OutputStore for MemoryOutputStore {
    async fn insert_outputs(&self, rows: &[TxOutput]) -> Result<u64, DbError> {
        self.insert_calls.fetch_add(1, Ordering::AcqRel);
        if let Some(delay) = self.insert_delay {
            tokio::time::sleep(delay).await;
        }
        if should_fail(&self.failures) {
            return Err(injected());
        }
        let mut table = self.rows.lock().unwrap();
        if let Some(dup) = rows.iter().find(|row| table.contains_key(&row.key())) {
            return Err(DbError::Store(format!("duplicate key {}", dup.key())));
        }
        for row in rows {
            table.insert(row.key(), *row);
        }
        Ok(rows.len() as u64)
    }

    async fn update_spent(&self, rows: &[SpentUpdate]) -> Result<u64, DbError> {
        if should_fail(&self.failures) {
            return Err(injected());
        }
        Ok(rows.iter().map(|u| self.apply(u.key, |row| row.status = u.status)).sum())
    }

    async fn update_address(&self, rows: &[AddressUpdate]) -> Result<u64, DbError> {
        if should_fail(&self.failures) {
            return Err(injected());
        }
        Ok(rows.iter().map(|u| self.apply(u.key, |row| row.address_id = u.address_id)).sum())
    }

    async fn update_amount(&self, rows: &[AmountUpdate]) -> Result<u64, DbError> {
        if should_fail(&self.failures) {
            return Err(injected());
        }
        Ok(rows.iter().map(|u| self.apply(u.key, |row| row.amount = u.amount)).sum())
    }

    async fn delete_output(&self, key: OutputKey) -> Result<u64, DbError> {
        if should_fail(&self.failures) {
            return Err(injected());
        }
        Ok(u64::from(self.rows.lock().unwrap().remove(&key).is_some()))
    }

    async fn delete_outputs_above(&self, transaction_id: TransactionId) -> Result<u64, DbError> {
        if should_fail(&self.failures) {
            return Err(injected());
        }
        let mut table = self.rows.lock().unwrap();
        let before = table.len();
        table.retain(|key, _| key.transaction_id <= transaction_id);
        Ok((before - table.len()) as u64)
    }
}

/// `wallet` table held in a [`BTreeMap`].
#[derive(Debug, Default)]
pub struct MemoryWalletStore {
    rows: Mutex<BTreeMap<WalletId, Wallet>>,
    max: Option<WalletId>,
    max_queries: AtomicUsize,
    failures: AtomicUsize,
}

#[allow(clippy::unwrap_used)]
impl MemoryWalletStore {
    /// A store whose seed query reports `max` until rows are inserted.
    pub fn with_max(max: Option<WalletId>) -> Self {
        Self {
            max,
            ..Self::default()
        }
    }

    /// Make the next `n` statements fail.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::Release);
    }

    /// How many times the seed query ran.
    pub fn max_queries(&self) -> usize {
        self.max_queries.load(Ordering::Acquire)
    }

    /// Ids of every persisted wallet, ascending.
    pub fn inserted_ids(&self) -> Vec<WalletId> {
        self.rows.lock().unwrap().keys().copied().collect()
    }
}

#[allow(clippy::unwrap_used)]
impl WalletStore for MemoryWalletStore {
    async fn insert_wallets(&self, rows: &[Wallet]) -> Result<u64, DbError> {
        if should_fail(&self.failures) {
            return Err(injected());
        }
        let mut table = self.rows.lock().unwrap();
        for row in rows {
            table.insert(row.wallet_id, row.clone());
        }
        Ok(rows.len() as u64)
    }

    async fn max_wallet_id(&self) -> Result<Option<WalletId>, DbError> {
        self.max_queries.fetch_add(1, Ordering::AcqRel);
        if should_fail(&self.failures) {
            return Err(injected());
        }
        let persisted = self.rows.lock().unwrap().keys().next_back().copied();
        Ok(persisted.max(self.max))
    }
}
