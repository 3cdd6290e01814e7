//! Type-safe identifier wrappers around the store's integer keys.
//!
//! The scanner assigns dense integer ids to transactions, addresses and
//! wallets. Each gets its own newtype so a wallet id can never be passed
//! where a transaction id is expected. The inner values map one-to-one to
//! `INTEGER` columns in `PostgreSQL`.

use serde::{Deserialize, Serialize};

/// Generates a newtype wrapper around [`i32`] with standard derives.
macro_rules! define_id {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i32);

        impl $name {
            /// Wrap a raw identifier.
            pub const fn new(id: i32) -> Self {
                Self(id)
            }

            /// Return the inner [`i32`] value.
            pub const fn into_inner(self) -> i32 {
                self.0
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i32> for $name {
            fn from(id: i32) -> Self {
                Self(id)
            }
        }

        impl From<$name> for i32 {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

define_id! {
    /// Identifier of a transaction row.
    TransactionId
}

define_id! {
    /// Identifier of an address row.
    AddressId
}

define_id! {
    /// Identifier of a wallet row.
    ///
    /// `WalletId(0)` is reserved: a wallet carrying it has not been assigned
    /// an id yet.
    WalletId
}

impl WalletId {
    /// The placeholder id of a wallet that still needs one allocated.
    pub const UNASSIGNED: Self = Self(0);

    /// Whether this id still needs to be allocated.
    pub const fn is_unassigned(self) -> bool {
        self.0 == 0
    }
}
