use crate::chain::ChainError;
use crate::method::MethodError;
use crate::signer::SignerError;
use bitcoin::{Amount, OutPoint, Txid};
use thiserror::Error;
use trikey_keybox::DescriptorError;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Wallet has not been synced")]
    NotSynced,

    #[error("Insufficient funds: need {needed}, have {available}")]
    InsufficientFunds { needed: Amount, available: Amount },

    #[error(transparent)]
    Method(#[from] MethodError),

    #[error("UTXO {0} is not owned by this wallet")]
    UnknownUtxo(OutPoint),

    #[error("Recipient address is not valid for this network")]
    NetworkMismatch,

    #[error("Transaction {0} is already confirmed")]
    AlreadyConfirmed(Txid),

    #[error("Input {0} has been spent by another transaction")]
    InputAlreadySpent(OutPoint),

    #[error("Input {0} does not belong to this wallet")]
    ForeignInput(OutPoint),

    #[error("Descriptor error: {0}")]
    Descriptor(String),

    #[error("PSBT error: {0}")]
    Psbt(String),

    #[error("Signing failed: {0}")]
    Signing(#[from] SignerError),

    #[error("Could not finalize PSBT: {0}")]
    Finalize(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<DescriptorError> for EngineError {
    fn from(e: DescriptorError) -> Self {
        EngineError::Descriptor(e.to_string())
    }
}

impl From<miniscript::Error> for EngineError {
    fn from(e: miniscript::Error) -> Self {
        EngineError::Descriptor(e.to_string())
    }
}

/// Coarse classification callers act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalletErrorKind {
    /// Network or server unreachable; safe to retry
    Connectivity,
    /// Terminal for this attempt
    InsufficientFunds,
    /// Programming contract broken; never retry
    InvariantViolation,
    /// Engine failure, surfaced as-is
    Engine,
}

#[derive(Error, Debug)]
pub enum SpendingWalletError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Descriptor error: {0}")]
    Descriptor(#[from] DescriptorError),

    #[error("Wallet is watch-only; no app key to sign with")]
    WatchOnly,

    #[error(transparent)]
    Method(#[from] MethodError),
}

impl SpendingWalletError {
    pub fn kind(&self) -> WalletErrorKind {
        match self {
            SpendingWalletError::Engine(e) => match e {
                EngineError::Chain(c) if c.is_connectivity() => WalletErrorKind::Connectivity,
                EngineError::InsufficientFunds { .. } => WalletErrorKind::InsufficientFunds,
                EngineError::Method(_)
                | EngineError::NetworkMismatch
                | EngineError::UnknownUtxo(_)
                | EngineError::ForeignInput(_)
                | EngineError::NotSynced => WalletErrorKind::InvariantViolation,
                _ => WalletErrorKind::Engine,
            },
            SpendingWalletError::Descriptor(_)
            | SpendingWalletError::WatchOnly
            | SpendingWalletError::Method(_) => WalletErrorKind::InvariantViolation,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == WalletErrorKind::Connectivity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let offline = SpendingWalletError::from(EngineError::Chain(ChainError::Connection(
            "refused".into(),
        )));
        assert_eq!(offline.kind(), WalletErrorKind::Connectivity);
        assert!(offline.is_retryable());

        let broke = SpendingWalletError::from(EngineError::InsufficientFunds {
            needed: Amount::from_sat(10),
            available: Amount::ZERO,
        });
        assert_eq!(broke.kind(), WalletErrorKind::InsufficientFunds);
        assert!(!broke.is_retryable());

        let empty = SpendingWalletError::from(MethodError::EmptyUtxoSet);
        assert_eq!(empty.kind(), WalletErrorKind::InvariantViolation);

        let engine = SpendingWalletError::from(EngineError::Finalize("missing sig".into()));
        assert_eq!(engine.kind(), WalletErrorKind::Engine);
        assert!(engine.to_string().contains("missing sig"));
    }
}
