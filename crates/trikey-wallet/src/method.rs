//! How a PSBT should be built.

use bitcoin::{Address, Amount, FeeRate, OutPoint, Txid};
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MethodError {
    #[error("Drain requires at least one UTXO")]
    EmptyUtxoSet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpendAmount {
    Exact(Amount),
    /// Everything selected, minus fee
    SendAll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeePolicy {
    /// The network's minimum relay rate (1 sat/vB)
    MinRelayRate,
    Rate(FeeRate),
    Absolute(Amount),
}

/// Which UTXOs the engine may spend.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CoinSelectionStrategy {
    /// Engine chooses freely
    #[default]
    Default,
    /// Only these
    Strict(BTreeSet<OutPoint>),
    /// These must be included; the engine may add more
    Preselected(BTreeSet<OutPoint>),
}

/// A non-empty set of outpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtxoSet(BTreeSet<OutPoint>);

impl UtxoSet {
    pub fn new(outpoints: impl IntoIterator<Item = OutPoint>) -> Result<Self, MethodError> {
        let set: BTreeSet<OutPoint> = outpoints.into_iter().collect();
        if set.is_empty() {
            return Err(MethodError::EmptyUtxoSet);
        }
        Ok(Self(set))
    }

    pub fn iter(&self) -> impl Iterator<Item = &OutPoint> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PsbtConstructionMethod {
    Regular {
        recipient: Address,
        amount: SpendAmount,
        fee_policy: FeePolicy,
        coin_selection: CoinSelectionStrategy,
    },
    /// Spend exactly `utxos` to `recipient`, no change.
    DrainAllFromUtxos {
        recipient: Address,
        fee_policy: FeePolicy,
        utxos: UtxoSet,
    },
    /// Replace unconfirmed `txid` paying `fee_rate`.
    BumpFee { txid: Txid, fee_rate: FeeRate },
}

impl PsbtConstructionMethod {
    pub fn drain_all_from_utxos(
        recipient: Address,
        fee_policy: FeePolicy,
        utxos: impl IntoIterator<Item = OutPoint>,
    ) -> Result<Self, MethodError> {
        Ok(PsbtConstructionMethod::DrainAllFromUtxos {
            recipient,
            fee_policy,
            utxos: UtxoSet::new(utxos)?,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            PsbtConstructionMethod::Regular { .. } => "regular",
            PsbtConstructionMethod::DrainAllFromUtxos { .. } => "drain",
            PsbtConstructionMethod::BumpFee { .. } => "bump-fee",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use std::str::FromStr;

    fn address() -> Address {
        Address::from_str("tb1qw508d6qejxtdg4y5r3zarvary0c5xw7kxpjzsx")
            .unwrap()
            .assume_checked()
    }

    #[test]
    fn test_drain_rejects_empty_set() {
        let result = PsbtConstructionMethod::drain_all_from_utxos(
            address(),
            FeePolicy::MinRelayRate,
            Vec::<OutPoint>::new(),
        );
        assert_eq!(result, Err(MethodError::EmptyUtxoSet));
    }

    #[test]
    fn test_drain_dedups_outpoints() {
        let op = OutPoint::new(Txid::all_zeros(), 1);
        let method = PsbtConstructionMethod::drain_all_from_utxos(
            address(),
            FeePolicy::MinRelayRate,
            [op, op],
        )
        .unwrap();
        match method {
            PsbtConstructionMethod::DrainAllFromUtxos { utxos, .. } => assert_eq!(utxos.len(), 1),
            _ => panic!("expected drain"),
        }
    }
}
