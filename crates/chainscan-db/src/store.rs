//! The store boundary consumed by the write-behind caches.
//!
//! A cache never talks to `PostgreSQL` directly. It holds one implementation
//! of [`OutputStore`] or [`WalletStore`] and calls one bulk operation per
//! statement kind. Every operation binds a whole slice of rows, executes as
//! a single all-or-nothing statement, and reports the affected-row count.
//!
//! The `PostgreSQL` implementations live in [`crate::output_store`] and
//! [`crate::wallet_store`]. Tests substitute in-memory stores.

use std::future::Future;

use chainscan_types::{
    AddressUpdate, AmountUpdate, OutputKey, SpentUpdate, TransactionId, TxOutput, Wallet, WalletId,
};

use crate::error::DbError;

/// Bulk statements against the `output` table.
pub trait OutputStore: Send + Sync {
    /// Insert every row in `rows`. Returns the number of rows inserted.
    fn insert_outputs(&self, rows: &[TxOutput])
    -> impl Future<Output = Result<u64, DbError>> + Send;

    /// Set `spent` on each targeted row. Returns the number of rows updated.
    fn update_spent(&self, rows: &[SpentUpdate])
    -> impl Future<Output = Result<u64, DbError>> + Send;

    /// Set `address_id` on each targeted row. Returns the number of rows updated.
    fn update_address(
        &self,
        rows: &[AddressUpdate],
    ) -> impl Future<Output = Result<u64, DbError>> + Send;

    /// Set `amount` on each targeted row. Returns the number of rows updated.
    fn update_amount(&self, rows: &[AmountUpdate])
    -> impl Future<Output = Result<u64, DbError>> + Send;

    /// Delete a single row. Returns the number of rows deleted (0 or 1).
    fn delete_output(&self, key: OutputKey) -> impl Future<Output = Result<u64, DbError>> + Send;

    /// Delete every row whose transaction id is strictly greater than
    /// `transaction_id`. Returns the number of rows deleted.
    fn delete_outputs_above(
        &self,
        transaction_id: TransactionId,
    ) -> impl Future<Output = Result<u64, DbError>> + Send;
}

/// Bulk statements against the `wallet` table.
pub trait WalletStore: Send + Sync {
    /// Insert every row in `rows`. Returns the number of rows inserted.
    fn insert_wallets(&self, rows: &[Wallet]) -> impl Future<Output = Result<u64, DbError>> + Send;

    /// Highest persisted wallet id, or `None` if the table is empty.
    fn max_wallet_id(&self) -> impl Future<Output = Result<Option<WalletId>, DbError>> + Send;
}
