//! Immutable PSBT value.

use bitcoin::{Amount, Txid};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A partially signed transaction, compared by its serialized bytes.
///
/// Nothing in this crate mutates a `Psbt` in place; signing returns a new one.
#[derive(Clone)]
pub struct Psbt(bitcoin::Psbt);

impl Psbt {
    pub fn new(inner: bitcoin::Psbt) -> Self {
        Self(inner)
    }

    pub fn inner(&self) -> &bitcoin::Psbt {
        &self.0
    }

    pub fn into_inner(self) -> bitcoin::Psbt {
        self.0
    }

    pub fn serialize(&self) -> Vec<u8> {
        self.0.serialize()
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, bitcoin::psbt::Error> {
        bitcoin::Psbt::deserialize(bytes).map(Self)
    }

    /// Txid of the unsigned transaction. Stable across signing.
    pub fn txid(&self) -> Txid {
        self.0.unsigned_tx.compute_txid()
    }

    pub fn fee(&self) -> Result<Amount, bitcoin::psbt::Error> {
        self.0.fee()
    }

    pub fn output_total(&self) -> Amount {
        self.0.unsigned_tx.output.iter().map(|o| o.value).sum()
    }

    pub fn input_count(&self) -> usize {
        self.0.inputs.len()
    }

    /// Number of partial signatures on input `index`.
    pub fn signature_count(&self, index: usize) -> usize {
        self.0
            .inputs
            .get(index)
            .map(|input| input.partial_sigs.len())
            .unwrap_or(0)
    }
}

impl PartialEq for Psbt {
    fn eq(&self, other: &Self) -> bool {
        self.serialize() == other.serialize()
    }
}

impl Eq for Psbt {}

impl fmt::Display for Psbt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for Psbt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Psbt({})", self.txid())
    }
}

impl FromStr for Psbt {
    type Err = bitcoin::psbt::PsbtParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        bitcoin::Psbt::from_str(s).map(Self)
    }
}

impl From<bitcoin::Psbt> for Psbt {
    fn from(inner: bitcoin::Psbt) -> Self {
        Self(inner)
    }
}

impl Serialize for Psbt {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Psbt {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::absolute::LockTime;
    use bitcoin::transaction::Version;
    use bitcoin::{OutPoint, ScriptBuf, Transaction, TxIn, TxOut};

    fn sample(value: u64) -> Psbt {
        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                ..Default::default()
            }],
            output: vec![TxOut {
                value: Amount::from_sat(value),
                script_pubkey: ScriptBuf::new(),
            }],
        };
        Psbt::new(bitcoin::Psbt::from_unsigned_tx(tx).unwrap())
    }

    #[test]
    fn test_equality_by_content() {
        assert_eq!(sample(1000), sample(1000));
        assert_ne!(sample(1000), sample(1001));
    }

    #[test]
    fn test_base64_roundtrip() {
        let psbt = sample(5000);
        let parsed: Psbt = psbt.to_string().parse().unwrap();
        assert_eq!(parsed, psbt);
        assert_eq!(parsed.txid(), psbt.txid());
    }

    #[test]
    fn test_output_total() {
        assert_eq!(sample(1234).output_total(), Amount::from_sat(1234));
        assert_eq!(sample(1).signature_count(0), 0);
        assert_eq!(sample(1).signature_count(9), 0);
    }
}
