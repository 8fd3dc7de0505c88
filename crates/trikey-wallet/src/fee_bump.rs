//! Which output, if any, a fee bump may shrink.

use crate::engine::LocalUtxo;
use bitcoin::{ScriptBuf, Transaction};

/// Decides whether a replacement may take its extra fee out of a
/// non-wallet output.
pub trait FeeBumpAllowShrinkingChecker: Send + Sync {
    /// The script of the output allowed to shrink, if any.
    fn allow_shrinking_output(
        &self,
        original: &Transaction,
        wallet_utxos: &[LocalUtxo],
    ) -> Option<ScriptBuf>;
}

/// Allows shrinking the lone output of a send-all, once the wallet has
/// nothing else left to fund the bump with.
#[derive(Debug, Default, Clone, Copy)]
pub struct SendAllShrinkingChecker;

impl FeeBumpAllowShrinkingChecker for SendAllShrinkingChecker {
    fn allow_shrinking_output(
        &self,
        original: &Transaction,
        wallet_utxos: &[LocalUtxo],
    ) -> Option<ScriptBuf> {
        let txid = original.compute_txid();
        let spendable = wallet_utxos.iter().any(|u| u.outpoint.txid != txid);
        match original.output.as_slice() {
            [only] if !spendable => Some(only.script_pubkey.clone()),
            _ => None,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NeverShrinkChecker;

impl FeeBumpAllowShrinkingChecker for NeverShrinkChecker {
    fn allow_shrinking_output(&self, _: &Transaction, _: &[LocalUtxo]) -> Option<ScriptBuf> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::absolute::LockTime;
    use bitcoin::hashes::Hash;
    use bitcoin::transaction::Version;
    use bitcoin::{Amount, OutPoint, TxOut, Txid, WScriptHash};
    use trikey_keybox::descriptor::Keychain;

    fn tx(outputs: usize) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![],
            output: (0..outputs)
                .map(|i| TxOut {
                    value: Amount::from_sat(10_000),
                    script_pubkey: ScriptBuf::new_p2wsh(&WScriptHash::from_byte_array(
                        [i as u8; 32],
                    )),
                })
                .collect(),
        }
    }

    fn utxo(txid: Txid) -> LocalUtxo {
        LocalUtxo {
            outpoint: OutPoint::new(txid, 0),
            txout: TxOut::NULL,
            keychain: Keychain::Receiving,
            derivation_index: 0,
            confirmation_height: Some(1),
        }
    }

    #[test]
    fn test_send_all_with_empty_wallet_may_shrink() {
        let original = tx(1);
        let allowed = SendAllShrinkingChecker.allow_shrinking_output(&original, &[]);
        assert_eq!(allowed, Some(original.output[0].script_pubkey.clone()));
    }

    #[test]
    fn test_remaining_funds_block_shrinking() {
        let original = tx(1);
        let other = utxo(Txid::from_byte_array([9; 32]));
        assert!(SendAllShrinkingChecker
            .allow_shrinking_output(&original, &[other])
            .is_none());
    }

    #[test]
    fn test_own_outputs_do_not_count_as_funds() {
        let original = tx(1);
        let own = utxo(original.compute_txid());
        assert!(SendAllShrinkingChecker
            .allow_shrinking_output(&original, &[own])
            .is_some());
    }

    #[test]
    fn test_multi_output_never_shrinks() {
        assert!(SendAllShrinkingChecker
            .allow_shrinking_output(&tx(2), &[])
            .is_none());
        assert!(NeverShrinkChecker.allow_shrinking_output(&tx(1), &[]).is_none());
    }
}
