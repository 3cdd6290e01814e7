//! Newline-delimited JSON mutation feed.
//!
//! The scanner (or any other producer) writes one [`Command`] per line to the
//! daemon's stdin. Each command is applied to the matching cache; the flush
//! driver persists it later. Lines that do not parse, or that a cache rejects
//! as invalid, are logged and skipped. Any other cache error ends the feed.
//!
//! ```text
//! {"op":"add_output","transaction_id":7,"pos":0,"address_id":3,"amount":500,"status":0}
//! {"op":"update_spent","key":{"transaction_id":7,"pos":0},"status":1}
//! {"op":"delete_all_above","transaction_id":6}
//! {"op":"add_wallet","name":"cold storage"}
//! ```

use chainscan_db::{DbError, OutputCache, OutputStore, WalletCache, WalletStore};
use chainscan_types::{AddressId, OutputKey, OutputStatus, TransactionId, TxOutput, Wallet, WalletId};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt as _};

use crate::error::FlusherError;

/// One cache mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    /// Queue a full output row for insertion.
    AddOutput(TxOutput),
    /// Set the spent status of an output.
    UpdateSpent {
        /// Target output.
        key: OutputKey,
        /// New status.
        status: OutputStatus,
    },
    /// Set the destination address of an output.
    UpdateAddress {
        /// Target output.
        key: OutputKey,
        /// New address.
        address_id: AddressId,
    },
    /// Set the amount of an output.
    UpdateAmount {
        /// Target output.
        key: OutputKey,
        /// New amount.
        amount: i64,
    },
    /// Delete one output everywhere.
    Delete {
        /// Target output.
        key: OutputKey,
    },
    /// Roll back every output above a transaction.
    DeleteAllAbove {
        /// Last transaction to keep.
        transaction_id: TransactionId,
    },
    /// Queue a new wallet; the id is allocated by the cache.
    AddWallet {
        /// Display name.
        name: Option<String>,
        /// Free-form details.
        details: Option<String>,
    },
}

/// Counts for one run of [`consume`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedStats {
    /// Commands handed to a cache.
    pub applied: u64,
    /// Lines skipped as malformed or invalid.
    pub rejected: u64,
}

/// Apply `command` to the cache it targets.
///
/// # Errors
///
/// Returns whatever the cache returns.
pub async fn apply<O: OutputStore, W: WalletStore>(
    command: Command,
    outputs: &OutputCache<O>,
    wallets: &WalletCache<W>,
) -> Result<(), DbError> {
    match command {
        Command::AddOutput(output) => outputs.add(output).await,
        Command::UpdateSpent { key, status } => outputs.update_spent(key, status).await,
        Command::UpdateAddress { key, address_id } => outputs.update_address(key, address_id).await,
        Command::UpdateAmount { key, amount } => outputs.update_amount(key, amount).await,
        Command::Delete { key } => {
            let existed = outputs.delete(key).await?;
            tracing::debug!(%key, existed, "output deleted");
            Ok(())
        }
        Command::DeleteAllAbove { transaction_id } => {
            let removed = outputs.delete_all_above(transaction_id).await?;
            tracing::info!(%transaction_id, removed, "rolled back outputs");
            Ok(())
        }
        Command::AddWallet { name, details } => {
            let wallet = wallets
                .add(Wallet {
                    wallet_id: WalletId::UNASSIGNED,
                    name,
                    details,
                })
                .await?;
            tracing::debug!(wallet_id = %wallet.wallet_id, "wallet queued");
            Ok(())
        }
    }
}

/// Read commands from `reader` until end of input and apply each one.
///
/// # Errors
///
/// Returns [`FlusherError::Io`] if reading fails, or [`FlusherError::Db`]
/// for a cache error other than [`DbError::InvalidArgument`]. Commands
/// applied before the error stay in the caches.
pub async fn consume<R, O, W>(
    reader: R,
    outputs: &OutputCache<O>,
    wallets: &WalletCache<W>,
) -> Result<FeedStats, FlusherError>
where
    R: AsyncBufRead + Unpin,
    O: OutputStore,
    W: WalletStore,
{
    let mut lines = reader.lines();
    let mut stats = FeedStats::default();
    let mut line_no: u64 = 0;
    while let Some(line) = lines.next_line().await? {
        line_no = line_no.saturating_add(1);
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let command = match serde_json::from_str::<Command>(line) {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!(line = line_no, error = %e, "skipping malformed command");
                stats.rejected = stats.rejected.saturating_add(1);
                continue;
            }
        };
        match apply(command, outputs, wallets).await {
            Ok(()) => stats.applied = stats.applied.saturating_add(1),
            Err(DbError::InvalidArgument(reason)) => {
                tracing::warn!(line = line_no, %reason, "skipping invalid command");
                stats.rejected = stats.rejected.saturating_add(1);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(stats)
}
