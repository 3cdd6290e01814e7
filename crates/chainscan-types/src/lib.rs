//! Shared type definitions for the chainscan persistence layer.
//!
//! The scanner produces these records; `chainscan-db` buffers and persists
//! them. Keeping them in their own crate lets producers depend on the types
//! without pulling in the database stack.
//!
//! # Modules
//!
//! - [`ids`] -- Integer id newtypes for transactions, addresses and wallets
//! - [`records`] -- Output and wallet rows, plus sparse update records

pub mod ids;
pub mod records;

// Re-export all public types at crate root for convenience.
pub use ids::{AddressId, TransactionId, WalletId};
pub use records::{
    AddressUpdate, AmountUpdate, OutputKey, OutputStatus, STATUS_SPENT, STATUS_UNSPENT,
    SpentUpdate, TxOutput, Wallet,
};
