//! Fee and weight arithmetic.

use crate::error::EngineError;
use crate::method::FeePolicy;
use bitcoin::absolute::LockTime;
use bitcoin::transaction::Version;
use bitcoin::{Amount, FeeRate, Transaction, TxIn, TxOut, Weight};
use trikey_keybox::descriptor::Keychain;
use trikey_keybox::WatchingDescriptor;

pub const MIN_RELAY_FEE_RATE: FeeRate = FeeRate::BROADCAST_MIN;

/// Segwit marker and flag bytes
const SEGWIT_HEADER_WU: u64 = 2;
/// Witness item count varint
const WITNESS_COUNT_WU: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeeTarget {
    Rate(FeeRate),
    Absolute(Amount),
}

impl FeeTarget {
    pub fn from_policy(policy: FeePolicy) -> Self {
        match policy {
            FeePolicy::MinRelayRate => FeeTarget::Rate(MIN_RELAY_FEE_RATE),
            FeePolicy::Rate(rate) => FeeTarget::Rate(rate),
            FeePolicy::Absolute(amount) => FeeTarget::Absolute(amount),
        }
    }

    pub fn fee(&self, weight: Weight) -> Amount {
        match self {
            FeeTarget::Rate(rate) => fee_for(*rate, weight),
            FeeTarget::Absolute(amount) => *amount,
        }
    }
}

/// Fee at `rate`, rounded up to whole vbytes and whole sat/vB.
pub fn fee_for(rate: FeeRate, weight: Weight) -> Amount {
    Amount::from_sat(rate.to_sat_per_vb_ceil() * weight.to_vbytes_ceil())
}

/// Worst-case witness weight to spend one output of `wallet`.
pub fn satisfaction_weight(wallet: &WatchingDescriptor) -> Result<Weight, EngineError> {
    let weight = wallet.receiving.max_weight_to_satisfy()?;
    Ok(weight + Weight::from_wu(WITNESS_COUNT_WU))
}

/// Weight of a fully signed transaction with `n_inputs` wallet inputs.
pub fn estimate_weight(n_inputs: usize, outputs: &[TxOut], satisfaction: Weight) -> Weight {
    let skeleton = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn::default(); n_inputs],
        output: outputs.to_vec(),
    };
    skeleton.weight() + Weight::from_wu(SEGWIT_HEADER_WU) + satisfaction * n_inputs as u64
}

/// Smallest balance worth sweeping: `n_inputs` wallet inputs drained to one
/// wallet output at the minimum relay rate, with the output above dust.
pub fn min_spendable_amount(
    wallet: &WatchingDescriptor,
    n_inputs: usize,
) -> Result<Amount, EngineError> {
    let script = wallet.derive(Keychain::Receiving, 0)?.script_pubkey();
    let dust = script.minimal_non_dust();
    let output = TxOut {
        value: Amount::ZERO,
        script_pubkey: script,
    };
    let weight = estimate_weight(n_inputs, &[output], satisfaction_weight(wallet)?);
    Ok(dust + fee_for(MIN_RELAY_FEE_RATE, weight))
}

#[cfg(test)]
mod tests {
    use super::*;
    use trikey_keybox::test_utils::keyset;

    #[test]
    fn test_fee_rounds_up() {
        let rate = FeeRate::from_sat_per_vb_unchecked(2);
        assert_eq!(fee_for(rate, Weight::from_wu(401)), Amount::from_sat(202));
        assert_eq!(fee_for(rate, Weight::from_wu(400)), Amount::from_sat(200));
    }

    #[test]
    fn test_absolute_fee_ignores_weight() {
        let target = FeeTarget::from_policy(FeePolicy::Absolute(Amount::from_sat(777)));
        assert_eq!(target.fee(Weight::from_wu(10_000)), Amount::from_sat(777));
    }

    #[test]
    fn test_weight_grows_per_input() {
        let wallet = WatchingDescriptor::for_keyset(&keyset(1)).unwrap();
        let sat = satisfaction_weight(&wallet).unwrap();
        // 2-of-3 wsh: two signatures plus the witness script
        assert!(sat.to_wu() > 250);

        let one = estimate_weight(1, &[], sat);
        let two = estimate_weight(2, &[], sat);
        assert_eq!(two - one, sat + Weight::from_wu(41 * 4));
    }

    #[test]
    fn test_min_spendable_amount() {
        let wallet = WatchingDescriptor::for_keyset(&keyset(1)).unwrap();
        let min = min_spendable_amount(&wallet, 1).unwrap();
        // P2WSH dust is 330 sat; a 1-in-1-out sweep costs well under 1000 sat at 1 sat/vB
        assert!(min > Amount::from_sat(330));
        assert!(min < Amount::from_sat(1000));
    }

    #[test]
    fn test_min_spendable_amount_prices_every_input() {
        let wallet = WatchingDescriptor::for_keyset(&keyset(1)).unwrap();
        let one = min_spendable_amount(&wallet, 1).unwrap();
        let three = min_spendable_amount(&wallet, 3).unwrap();

        let per_input = fee_for(
            MIN_RELAY_FEE_RATE,
            estimate_weight(2, &[], satisfaction_weight(&wallet).unwrap())
                - estimate_weight(1, &[], satisfaction_weight(&wallet).unwrap()),
        );
        // Three inputs cost roughly two more inputs' worth of fee
        assert!(three > one + per_input);
        assert!(three <= one + per_input * 2 + Amount::from_sat(1));
    }
}
