//! `PostgreSQL` statements for the `output` table.
//!
//! Every bulk operation is a single statement over `UNNEST` arrays, so a
//! batch of N rows costs one round-trip and commits or fails as a unit.
//! Updates join the target table against the unnested `(key, value)` pairs.

use chainscan_types::{
    AddressUpdate, AmountUpdate, OutputKey, SpentUpdate, TransactionId, TxOutput,
};
use sqlx::PgPool;

use crate::error::DbError;
use crate::store::OutputStore;

/// Name of the backing table.
pub const OUTPUT_TABLE: &str = "output";

const SQL_INSERT: &str = r"INSERT INTO output (transaction_id, pos, address_id, amount, spent)
  SELECT * FROM UNNEST($1::INTEGER[], $2::SMALLINT[], $3::INTEGER[], $4::BIGINT[], $5::SMALLINT[])";

const SQL_UPDATE_SPENT: &str = r"UPDATE output AS o SET spent = u.spent
  FROM UNNEST($1::INTEGER[], $2::SMALLINT[], $3::SMALLINT[]) AS u(transaction_id, pos, spent)
  WHERE o.transaction_id = u.transaction_id AND o.pos = u.pos";

const SQL_UPDATE_ADDRESS: &str = r"UPDATE output AS o SET address_id = u.address_id
  FROM UNNEST($1::INTEGER[], $2::SMALLINT[], $3::INTEGER[]) AS u(transaction_id, pos, address_id)
  WHERE o.transaction_id = u.transaction_id AND o.pos = u.pos";

const SQL_UPDATE_AMOUNT: &str = r"UPDATE output AS o SET amount = u.amount
  FROM UNNEST($1::INTEGER[], $2::SMALLINT[], $3::BIGINT[]) AS u(transaction_id, pos, amount)
  WHERE o.transaction_id = u.transaction_id AND o.pos = u.pos";

const SQL_DELETE: &str = "DELETE FROM output WHERE transaction_id = $1 AND pos = $2";

const SQL_DELETE_ABOVE: &str = "DELETE FROM output WHERE transaction_id > $1";

/// [`OutputStore`] backed by a `PostgreSQL` pool.
#[derive(Debug, Clone)]
pub struct PgOutputStore {
    pool: PgPool,
}

impl PgOutputStore {
    /// Create a store bound to a connection pool.
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Look up a persisted row by key.
    ///
    /// Reads the store only; rows still pending in a cache are not visible
    /// here.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the query fails.
    pub async fn find(&self, key: OutputKey) -> Result<Option<TxOutput>, DbError> {
        let row = sqlx::query_as::<_, OutputRow>(
            r"SELECT transaction_id, pos, address_id, amount, spent
              FROM output
              WHERE transaction_id = $1 AND pos = $2",
        )
        .bind(key.transaction_id.into_inner())
        .bind(key.pos)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(OutputRow::into_output))
    }
}

/// Split a slice of keyed values into parallel `(transaction_id, pos, value)` arrays.
fn key_columns<T, V>(
    rows: &[T],
    key: impl Fn(&T) -> OutputKey,
    value: impl Fn(&T) -> V,
) -> (Vec<i32>, Vec<i16>, Vec<V>) {
    let mut transaction_ids = Vec::with_capacity(rows.len());
    let mut positions = Vec::with_capacity(rows.len());
    let mut values = Vec::with_capacity(rows.len());
    for row in rows {
        let k = key(row);
        transaction_ids.push(k.transaction_id.into_inner());
        positions.push(k.pos);
        values.push(value(row));
    }
    (transaction_ids, positions, values)
}

impl OutputStore for PgOutputStore {
    async fn insert_outputs(&self, rows: &[TxOutput]) -> Result<u64, DbError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let len = rows.len();
        let mut transaction_ids = Vec::with_capacity(len);
        let mut positions = Vec::with_capacity(len);
        let mut address_ids = Vec::with_capacity(len);
        let mut amounts = Vec::with_capacity(len);
        let mut statuses = Vec::with_capacity(len);

        for row in rows {
            transaction_ids.push(row.transaction_id.into_inner());
            positions.push(row.pos);
            address_ids.push(row.address_id.into_inner());
            amounts.push(row.amount);
            statuses.push(i16::from(row.status));
        }

        let result = sqlx::query(SQL_INSERT)
            .bind(&transaction_ids)
            .bind(&positions)
            .bind(&address_ids)
            .bind(&amounts)
            .bind(&statuses)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn update_spent(&self, rows: &[SpentUpdate]) -> Result<u64, DbError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let (transaction_ids, positions, statuses) =
            key_columns(rows, |u| u.key, |u| i16::from(u.status));
        let result = sqlx::query(SQL_UPDATE_SPENT)
            .bind(&transaction_ids)
            .bind(&positions)
            .bind(&statuses)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn update_address(&self, rows: &[AddressUpdate]) -> Result<u64, DbError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let (transaction_ids, positions, address_ids) =
            key_columns(rows, |u| u.key, |u| u.address_id.into_inner());
        let result = sqlx::query(SQL_UPDATE_ADDRESS)
            .bind(&transaction_ids)
            .bind(&positions)
            .bind(&address_ids)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn update_amount(&self, rows: &[AmountUpdate]) -> Result<u64, DbError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let (transaction_ids, positions, amounts) = key_columns(rows, |u| u.key, |u| u.amount);
        let result = sqlx::query(SQL_UPDATE_AMOUNT)
            .bind(&transaction_ids)
            .bind(&positions)
            .bind(&amounts)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_output(&self, key: OutputKey) -> Result<u64, DbError> {
        let result = sqlx::query(SQL_DELETE)
            .bind(key.transaction_id.into_inner())
            .bind(key.pos)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_outputs_above(&self, transaction_id: TransactionId) -> Result<u64, DbError> {
        let result = sqlx::query(SQL_DELETE_ABOVE)
            .bind(transaction_id.into_inner())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

/// A row from the `output` table.
#[derive(Debug, Clone, sqlx::FromRow)]
struct OutputRow {
    transaction_id: i32,
    pos: i16,
    address_id: i32,
    amount: i64,
    spent: i16,
}

impl OutputRow {
    fn into_output(self) -> TxOutput {
        TxOutput {
            transaction_id: TransactionId(self.transaction_id),
            pos: self.pos,
            address_id: self.address_id.into(),
            amount: self.amount,
            // Out-of-range statuses never come from this crate; clamp rather than fail a read.
            status: u8::try_from(self.spent.clamp(0, i16::from(u8::MAX))).unwrap_or(u8::MAX),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainscan_types::AddressId;

    #[test]
    fn key_columns_split_in_order() {
        let rows = [
            SpentUpdate {
                key: OutputKey::new(TransactionId(1), 0),
                status: 1,
            },
            SpentUpdate {
                key: OutputKey::new(TransactionId(2), 3),
                status: 0,
            },
        ];
        let (txs, positions, statuses) = key_columns(&rows, |u| u.key, |u| i16::from(u.status));
        assert_eq!(txs, vec![1, 2]);
        assert_eq!(positions, vec![0, 3]);
        assert_eq!(statuses, vec![1, 0]);
    }

    #[test]
    fn output_row_maps_to_record() {
        let row = OutputRow {
            transaction_id: 7,
            pos: 1,
            address_id: 4,
            amount: 100,
            spent: 1,
        };
        let out = row.into_output();
        assert_eq!(out.key(), OutputKey::new(TransactionId(7), 1));
        assert_eq!(out.address_id, AddressId(4));
        assert_eq!(out.status, 1);
    }
}
