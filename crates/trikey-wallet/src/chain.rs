//! Blockchain access used by [`crate::DescriptorEngine`].
//!
//! Implementations are blocking; the engine calls them off the async runtime.

use bitcoin::{Amount, OutPoint, Script, Transaction, Txid};
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum ChainError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transaction not found: {0}")]
    TxNotFound(Txid),

    #[error("Broadcast failed: {0}")]
    BroadcastFailed(String),
}

impl ChainError {
    pub fn is_connectivity(&self) -> bool {
        matches!(self, ChainError::Connection(_))
    }
}

/// A transaction touching a script. `height` is `None` while unconfirmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub txid: Txid,
    pub height: Option<u32>,
}

/// An unspent output paying to a script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainUtxo {
    pub outpoint: OutPoint,
    pub value: Amount,
    pub height: Option<u32>,
}

pub trait ChainSource: Send + Sync {
    fn tip_height(&self) -> Result<u32, ChainError>;

    fn script_history(&self, script: &Script) -> Result<Vec<HistoryEntry>, ChainError>;

    fn script_utxos(&self, script: &Script) -> Result<Vec<ChainUtxo>, ChainError>;

    fn transaction(&self, txid: &Txid) -> Result<Transaction, ChainError>;

    fn broadcast(&self, tx: &Transaction) -> Result<Txid, ChainError>;
}
