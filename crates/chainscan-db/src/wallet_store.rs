//! `PostgreSQL` statements for the `wallet` table.

use chainscan_types::{Wallet, WalletId};
use sqlx::PgPool;

use crate::error::DbError;
use crate::store::WalletStore;

/// Name of the backing table.
pub const WALLET_TABLE: &str = "wallet";

/// [`WalletStore`] backed by a `PostgreSQL` pool.
#[derive(Debug, Clone)]
pub struct PgWalletStore {
    pool: PgPool,
}

impl PgWalletStore {
    /// Create a store bound to a connection pool.
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl WalletStore for PgWalletStore {
    async fn insert_wallets(&self, rows: &[Wallet]) -> Result<u64, DbError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let len = rows.len();
        let mut wallet_ids = Vec::with_capacity(len);
        let mut names: Vec<Option<String>> = Vec::with_capacity(len);
        let mut details: Vec<Option<String>> = Vec::with_capacity(len);

        for row in rows {
            wallet_ids.push(row.wallet_id.into_inner());
            names.push(row.name.clone());
            details.push(row.details.clone());
        }

        let result = sqlx::query(
            r"INSERT INTO wallet (wallet_id, name, details)
              SELECT * FROM UNNEST($1::INTEGER[], $2::TEXT[], $3::TEXT[])",
        )
        .bind(&wallet_ids)
        .bind(&names)
        .bind(&details)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn max_wallet_id(&self) -> Result<Option<WalletId>, DbError> {
        // MAX over an empty table is a single NULL row, not an error.
        let max: Option<i32> = sqlx::query_scalar("SELECT MAX(wallet_id) FROM wallet")
            .fetch_one(&self.pool)
            .await?;
        Ok(max.map(WalletId))
    }
}
