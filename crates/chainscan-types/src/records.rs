//! Row records produced by the scanner and buffered by the write-behind caches.
//!
//! Records are immutable values. A field change produces a new record via the
//! `with_*` methods, which keeps cached copies and queued copies from aliasing.
//! Identity for caching purposes is the primary key ([`OutputKey`] or
//! [`WalletId`]), never full value equality.

use serde::{Deserialize, Serialize};

use crate::ids::{AddressId, TransactionId, WalletId};

// ---------------------------------------------------------------------------
// Outputs
// ---------------------------------------------------------------------------

/// Primary key of an `output` row: parent transaction plus position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OutputKey {
    /// Parent transaction.
    pub transaction_id: TransactionId,
    /// Output index within the transaction.
    pub pos: i16,
}

impl OutputKey {
    /// Build a key from its parts.
    pub const fn new(transaction_id: TransactionId, pos: i16) -> Self {
        Self {
            transaction_id,
            pos,
        }
    }
}

impl core::fmt::Display for OutputKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}", self.transaction_id, self.pos)
    }
}

/// Spent status of an output.
///
/// Stored as a `SMALLINT`. The scanner uses `0` for unspent and `1` for
/// spent; other values are passed through untouched.
pub type OutputStatus = u8;

/// Status value of an output nobody has spent yet.
pub const STATUS_UNSPENT: OutputStatus = 0;

/// Status value of an output consumed by a later input.
pub const STATUS_SPENT: OutputStatus = 1;

/// A transaction output row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxOutput {
    /// Parent transaction.
    pub transaction_id: TransactionId,
    /// Output index within the transaction.
    pub pos: i16,
    /// Destination address.
    pub address_id: AddressId,
    /// Amount in base units (satoshi).
    pub amount: i64,
    /// Spent status flag.
    pub status: OutputStatus,
}

impl TxOutput {
    /// The primary key of this row.
    pub const fn key(&self) -> OutputKey {
        OutputKey::new(self.transaction_id, self.pos)
    }

    /// Copy of this record with a different spent status.
    #[must_use]
    pub const fn with_status(self, status: OutputStatus) -> Self {
        Self { status, ..self }
    }

    /// Copy of this record with a different destination address.
    #[must_use]
    pub const fn with_address(self, address_id: AddressId) -> Self {
        Self { address_id, ..self }
    }

    /// Copy of this record with a different amount.
    #[must_use]
    pub const fn with_amount(self, amount: i64) -> Self {
        Self { amount, ..self }
    }
}

/// Sparse update of an output's spent status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpentUpdate {
    /// Target row.
    pub key: OutputKey,
    /// New status.
    pub status: OutputStatus,
}

/// Sparse update of an output's destination address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressUpdate {
    /// Target row.
    pub key: OutputKey,
    /// New address.
    pub address_id: AddressId,
}

/// Sparse update of an output's amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmountUpdate {
    /// Target row.
    pub key: OutputKey,
    /// New amount.
    pub amount: i64,
}

// ---------------------------------------------------------------------------
// Wallets
// ---------------------------------------------------------------------------

/// A wallet row: a cluster of addresses believed to share an owner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    /// Wallet id, or [`WalletId::UNASSIGNED`] if one should be allocated.
    pub wallet_id: WalletId,
    /// Optional human-readable name.
    pub name: Option<String>,
    /// Optional free-form details.
    pub details: Option<String>,
}

impl Wallet {
    /// An empty wallet with the given id.
    pub const fn new(wallet_id: WalletId) -> Self {
        Self {
            wallet_id,
            name: None,
            details: None,
        }
    }

    /// Copy of this wallet with a different id.
    #[must_use]
    pub fn with_id(self, wallet_id: WalletId) -> Self {
        Self { wallet_id, ..self }
    }
}
