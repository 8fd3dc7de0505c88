//! Trikey Wallet
//!
//! One [`SpendingWallet`] per keyset, backed by a [`WalletEngine`].
//!
//! The engine owns chain sync, address derivation, PSBT building, signing
//! and broadcast. [`DescriptorEngine`] implements it over any
//! [`ChainSource`]; the Electrum one lives in `trikey-electrum`.
//!
//! PSBTs are values: every signing step returns a new [`Psbt`].

pub mod chain;
pub mod coin_selection;
pub mod engine;
pub mod error;
pub mod fee_bump;
pub mod fees;
pub mod method;
pub mod psbt;
pub mod signer;
pub mod spending;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use chain::{ChainError, ChainSource, ChainUtxo, HistoryEntry};
pub use engine::{Balance, DescriptorEngine, LocalUtxo, WalletEngine};
pub use error::{EngineError, SpendingWalletError, WalletErrorKind};
pub use fee_bump::{FeeBumpAllowShrinkingChecker, NeverShrinkChecker, SendAllShrinkingChecker};
pub use method::{
    CoinSelectionStrategy, FeePolicy, MethodError, PsbtConstructionMethod, SpendAmount, UtxoSet,
};
pub use psbt::Psbt;
pub use spending::SpendingWallet;
