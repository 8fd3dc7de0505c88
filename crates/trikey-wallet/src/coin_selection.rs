//! Largest-first coin selection.
//!
//! Required UTXOs are always spent; optional ones are added largest first
//! until outputs plus fee are covered. Change is only created when it would
//! be above dust, otherwise the excess goes to fee.

use crate::engine::LocalUtxo;
use crate::error::EngineError;
use crate::fees::{estimate_weight, FeeTarget};
use crate::method::CoinSelectionStrategy;
use bitcoin::{Amount, OutPoint, TxOut, Weight};

#[derive(Debug, Clone)]
pub struct CoinSelection {
    pub selected: Vec<LocalUtxo>,
    pub fee: Amount,
    /// Change value, if a change output should be added
    pub change: Option<Amount>,
}

impl CoinSelection {
    pub fn selected_amount(&self) -> Amount {
        total(&self.selected)
    }
}

pub fn total(utxos: &[LocalUtxo]) -> Amount {
    utxos.iter().map(|u| u.txout.value).sum()
}

/// Look up each of `wanted` among the wallet's UTXOs.
pub fn resolve_outpoints<'a>(
    utxos: &[LocalUtxo],
    wanted: impl IntoIterator<Item = &'a OutPoint>,
) -> Result<Vec<LocalUtxo>, EngineError> {
    wanted
        .into_iter()
        .map(|op| {
            utxos
                .iter()
                .find(|u| &u.outpoint == op)
                .cloned()
                .ok_or(EngineError::UnknownUtxo(*op))
        })
        .collect()
}

/// Split the wallet's UTXOs into (required, optional) per `strategy`.
pub fn partition(
    utxos: &[LocalUtxo],
    strategy: &CoinSelectionStrategy,
) -> Result<(Vec<LocalUtxo>, Vec<LocalUtxo>), EngineError> {
    match strategy {
        CoinSelectionStrategy::Default => Ok((Vec::new(), utxos.to_vec())),
        CoinSelectionStrategy::Strict(set) => Ok((resolve_outpoints(utxos, set)?, Vec::new())),
        CoinSelectionStrategy::Preselected(set) => {
            let required = resolve_outpoints(utxos, set)?;
            let optional = utxos
                .iter()
                .filter(|u| !set.contains(&u.outpoint))
                .cloned()
                .collect();
            Ok((required, optional))
        }
    }
}

/// Select inputs paying `recipients` plus fee, with change to `change_output`.
///
/// `change_output` carries the change script; its value is ignored.
pub fn select_largest_first(
    required: Vec<LocalUtxo>,
    mut optional: Vec<LocalUtxo>,
    recipients: &[TxOut],
    change_output: &TxOut,
    fee_target: FeeTarget,
    satisfaction: Weight,
) -> Result<CoinSelection, EngineError> {
    optional.sort_by(|a, b| b.txout.value.cmp(&a.txout.value));
    let target: Amount = recipients.iter().map(|o| o.value).sum();
    let change_dust = change_output.script_pubkey.minimal_non_dust();

    let mut with_change = recipients.to_vec();
    with_change.push(change_output.clone());

    let mut selected = required;
    let mut optional = optional.into_iter();
    loop {
        let n = selected.len();
        let in_total = total(&selected);
        if n > 0 {
            let fee_no_change = fee_target.fee(estimate_weight(n, recipients, satisfaction));
            if in_total >= target + fee_no_change {
                let fee_change = fee_target.fee(estimate_weight(n, &with_change, satisfaction));
                let change = in_total
                    .checked_sub(target + fee_change)
                    .filter(|c| *c >= change_dust);
                let fee = match change {
                    Some(_) => fee_change,
                    None => in_total - target,
                };
                return Ok(CoinSelection {
                    selected,
                    fee,
                    change,
                });
            }
        }

        match optional.next() {
            Some(utxo) => selected.push(utxo),
            None => {
                let fee = fee_target.fee(estimate_weight(n.max(1), recipients, satisfaction));
                return Err(EngineError::InsufficientFunds {
                    needed: target + fee,
                    available: in_total,
                });
            }
        }
    }
}

/// Spend every UTXO in `inputs` to a single output with script `recipient`.
///
/// Returns the output value after fee.
pub fn drain(
    inputs: &[LocalUtxo],
    recipient: &TxOut,
    fee_target: FeeTarget,
    satisfaction: Weight,
) -> Result<(Amount, Amount), EngineError> {
    let in_total = total(inputs);
    let fee = fee_target.fee(estimate_weight(
        inputs.len(),
        std::slice::from_ref(recipient),
        satisfaction,
    ));
    let dust = recipient.script_pubkey.minimal_non_dust();

    match in_total.checked_sub(fee) {
        Some(value) if value >= dust => Ok((value, fee)),
        _ => Err(EngineError::InsufficientFunds {
            needed: fee + dust,
            available: in_total,
        }),
    }
}
