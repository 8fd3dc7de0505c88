//! In-memory chain for wallet tests.

use crate::chain::{ChainError, ChainSource, ChainUtxo, HistoryEntry};
use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, OutPoint, Script, ScriptBuf, Transaction, TxIn, TxOut, Txid,
};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use trikey_keybox::descriptor::Keychain;
use trikey_keybox::WatchingDescriptor;

#[derive(Default)]
struct ChainState {
    tip: u32,
    txs: HashMap<Txid, (Transaction, Option<u32>)>,
    broadcasts: Vec<Txid>,
    offline: bool,
    poisoned: HashSet<ScriptBuf>,
    faucet: u32,
}

impl ChainState {
    fn spender_of(&self, outpoint: &OutPoint) -> Option<Txid> {
        self.txs.iter().find_map(|(txid, (tx, _))| {
            tx.input
                .iter()
                .any(|i| &i.previous_output == outpoint)
                .then_some(*txid)
        })
    }

    fn prevout(&self, outpoint: &OutPoint) -> Option<&TxOut> {
        self.txs
            .get(&outpoint.txid)
            .and_then(|(tx, _)| tx.output.get(outpoint.vout as usize))
    }

    fn touches(&self, tx: &Transaction, script: &Script) -> bool {
        tx.output.iter().any(|o| o.script_pubkey.as_script() == script)
            || tx
                .input
                .iter()
                .filter_map(|i| self.prevout(&i.previous_output))
                .any(|o| o.script_pubkey.as_script() == script)
    }

    fn check(&self, script: &Script) -> Result<(), ChainError> {
        if self.offline {
            return Err(ChainError::Connection("chain offline".into()));
        }
        if self.poisoned.contains(script) {
            return Err(ChainError::Protocol(format!("bad response for {}", script)));
        }
        Ok(())
    }
}

/// A toy chain: funding transactions appear from nowhere, broadcasts land in
/// the mempool until [`MemoryChain::mine`]. Replacements evict conflicting
/// mempool transactions.
#[derive(Default)]
pub struct MemoryChain {
    state: Mutex<ChainState>,
}

impl MemoryChain {
    pub fn new(tip: u32) -> Self {
        Self {
            state: Mutex::new(ChainState {
                tip,
                ..Default::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ChainState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn faucet(&self, script: &Script, amount: Amount, confirmed: bool) -> OutPoint {
        let mut state = self.state();
        state.faucet += 1;
        let mut source = [0xfa; 32];
        source[..4].copy_from_slice(&state.faucet.to_le_bytes());

        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::new(Txid::from_byte_array(source), 0),
                ..Default::default()
            }],
            output: vec![TxOut {
                value: amount,
                script_pubkey: script.to_owned(),
            }],
        };
        let txid = tx.compute_txid();
        let height = confirmed.then_some(state.tip);
        state.txs.insert(txid, (tx, height));
        OutPoint::new(txid, 0)
    }

    /// Pay `amount` to `script` in a confirmed transaction.
    pub fn fund(&self, script: &Script, amount: Amount) -> OutPoint {
        self.faucet(script, amount, true)
    }

    pub fn fund_unconfirmed(&self, script: &Script, amount: Amount) -> OutPoint {
        self.faucet(script, amount, false)
    }

    /// Add `tx` as-is, skipping every validity check.
    pub fn insert(&self, tx: Transaction, height: Option<u32>) -> Txid {
        let txid = tx.compute_txid();
        self.state().txs.insert(txid, (tx, height));
        txid
    }

    /// Confirm all mempool transactions in a new block.
    pub fn mine(&self) {
        let mut state = self.state();
        state.tip += 1;
        let tip = state.tip;
        for (_, height) in state.txs.values_mut() {
            height.get_or_insert(tip);
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    /// Make every query for `script` fail with a protocol error.
    pub fn poison(&self, script: &Script) {
        self.state().poisoned.insert(script.to_owned());
    }

    pub fn broadcasts(&self) -> Vec<Txid> {
        self.state().broadcasts.clone()
    }

    pub fn height_of(&self, txid: &Txid) -> Option<Option<u32>> {
        self.state().txs.get(txid).map(|(_, h)| *h)
    }
}

impl ChainSource for MemoryChain {
    fn tip_height(&self) -> Result<u32, ChainError> {
        let state = self.state();
        if state.offline {
            return Err(ChainError::Connection("chain offline".into()));
        }
        Ok(state.tip)
    }

    fn script_history(&self, script: &Script) -> Result<Vec<HistoryEntry>, ChainError> {
        let state = self.state();
        state.check(script)?;
        Ok(state
            .txs
            .iter()
            .filter(|(_, (tx, _))| state.touches(tx, script))
            .map(|(txid, (_, height))| HistoryEntry {
                txid: *txid,
                height: *height,
            })
            .collect())
    }

    fn script_utxos(&self, script: &Script) -> Result<Vec<ChainUtxo>, ChainError> {
        let state = self.state();
        state.check(script)?;
        let mut utxos = Vec::new();
        for (txid, (tx, height)) in &state.txs {
            for (vout, output) in tx.output.iter().enumerate() {
                let outpoint = OutPoint::new(*txid, vout as u32);
                if output.script_pubkey.as_script() == script && state.spender_of(&outpoint).is_none()
                {
                    utxos.push(ChainUtxo {
                        outpoint,
                        value: output.value,
                        height: *height,
                    });
                }
            }
        }
        Ok(utxos)
    }

    fn transaction(&self, txid: &Txid) -> Result<Transaction, ChainError> {
        let state = self.state();
        if state.offline {
            return Err(ChainError::Connection("chain offline".into()));
        }
        state
            .txs
            .get(txid)
            .map(|(tx, _)| tx.clone())
            .ok_or(ChainError::TxNotFound(*txid))
    }

    fn broadcast(&self, tx: &Transaction) -> Result<Txid, ChainError> {
        let mut state = self.state();
        if state.offline {
            return Err(ChainError::Connection("chain offline".into()));
        }

        let txid = tx.compute_txid();
        let mut evict = Vec::new();
        for input in &tx.input {
            if input.witness.is_empty() {
                return Err(ChainError::BroadcastFailed(format!(
                    "input {} has no witness",
                    input.previous_output
                )));
            }
            if state.prevout(&input.previous_output).is_none() {
                return Err(ChainError::BroadcastFailed(format!(
                    "missing input {}",
                    input.previous_output
                )));
            }
            match state.spender_of(&input.previous_output) {
                Some(other) if other == txid => {}
                Some(other) => match state.txs.get(&other) {
                    Some((_, None)) => evict.push(other),
                    _ => {
                        return Err(ChainError::BroadcastFailed(format!(
                            "input {} already spent",
                            input.previous_output
                        )))
                    }
                },
                None => {}
            }
        }

        for other in evict {
            state.txs.remove(&other);
        }
        state.txs.insert(txid, (tx.clone(), None));
        state.broadcasts.push(txid);
        Ok(txid)
    }
}

/// A testnet P2WPKH address outside every test wallet.
pub fn external_address() -> Address {
    // Fixed, valid testnet address
    Address::from_str("tb1qw508d6qejxtdg4y5r3zarvary0c5xw7kxpjzsx")
        .unwrap()
        .assume_checked()
}

/// Fund `wallet` at (`keychain`, `index`) with a confirmed output.
pub fn fund(
    chain: &MemoryChain,
    wallet: &WatchingDescriptor,
    keychain: Keychain,
    index: u32,
    sats: u64,
) -> OutPoint {
    let script = wallet
        .derive(keychain, index)
        .unwrap()
        .script_pubkey();
    chain.fund(&script, Amount::from_sat(sats))
}
