//! Wallet engine over 2-of-3 descriptors.
//!
//! [`DescriptorEngine`] keeps a per-descriptor cache of discovered UTXOs and
//! derivation indices, refreshed by [`WalletEngine::sync`]. All chain access
//! goes through a blocking [`ChainSource`] run on tokio's blocking pool.

use crate::chain::ChainSource;
use crate::coin_selection::{drain, partition, resolve_outpoints, select_largest_first, total};
use crate::error::EngineError;
use crate::fees::{estimate_weight, fee_for, satisfaction_weight, FeeTarget, MIN_RELAY_FEE_RATE};
use crate::method::{PsbtConstructionMethod, SpendAmount};
use crate::psbt::Psbt;
use crate::signer;
use async_trait::async_trait;
use bitcoin::absolute::LockTime;
use bitcoin::secp256k1::Secp256k1;
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, FeeRate, Network, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut,
    Txid,
};
use miniscript::psbt::PsbtExt;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use trikey_keybox::descriptor::Keychain;
use trikey_keybox::{SpendingDescriptor, WatchingDescriptor};

pub const DEFAULT_GAP_LIMIT: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Balance {
    pub confirmed: Amount,
    pub pending: Amount,
}

impl Balance {
    pub fn total(&self) -> Amount {
        self.confirmed + self.pending
    }
}

/// A wallet-owned unspent output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalUtxo {
    pub outpoint: OutPoint,
    pub txout: TxOut,
    pub keychain: Keychain,
    pub derivation_index: u32,
    pub confirmation_height: Option<u32>,
}

/// The wallet library the spending wallet delegates to.
#[async_trait]
pub trait WalletEngine: Send + Sync {
    async fn sync(&self, wallet: &WatchingDescriptor) -> Result<(), EngineError>;

    async fn balance(&self, wallet: &WatchingDescriptor) -> Result<Balance, EngineError>;

    async fn list_unspent(&self, wallet: &WatchingDescriptor)
        -> Result<Vec<LocalUtxo>, EngineError>;

    /// Reveal the next receiving address.
    async fn new_address(&self, wallet: &WatchingDescriptor) -> Result<Address, EngineError>;

    /// Build an unsigned PSBT. For fee bumps, `shrinkable_output` names the
    /// one non-wallet output that may be reduced to pay the higher fee.
    async fn build_psbt(
        &self,
        wallet: &WatchingDescriptor,
        method: &PsbtConstructionMethod,
        shrinkable_output: Option<&ScriptBuf>,
    ) -> Result<Psbt, EngineError>;

    async fn sign(&self, wallet: &SpendingDescriptor, psbt: &Psbt) -> Result<Psbt, EngineError>;

    /// Finalize, extract and broadcast.
    async fn broadcast(&self, psbt: &Psbt) -> Result<Txid, EngineError>;

    async fn transaction(&self, txid: &Txid) -> Result<Transaction, EngineError>;
}

#[derive(Debug, Clone, Default)]
struct WalletState {
    utxos: Vec<LocalUtxo>,
    scripts: HashMap<ScriptBuf, (Keychain, u32)>,
    next_receiving: u32,
    next_change: u32,
}

impl WalletState {
    fn next_index(&self, keychain: Keychain) -> u32 {
        match keychain {
            Keychain::Receiving => self.next_receiving,
            Keychain::Change => self.next_change,
        }
    }

    fn set_next_index(&mut self, keychain: Keychain, index: u32) {
        match keychain {
            Keychain::Receiving => self.next_receiving = index,
            Keychain::Change => self.next_change = index,
        }
    }

    fn change_output(&mut self, wallet: &WatchingDescriptor) -> Result<TxOut, EngineError> {
        let index = self.next_change;
        let script = wallet.derive(Keychain::Change, index)?.script_pubkey();
        self.scripts
            .insert(script.clone(), (Keychain::Change, index));
        Ok(TxOut {
            value: Amount::ZERO,
            script_pubkey: script,
        })
    }
}

struct EngineInner {
    chain: Arc<dyn ChainSource>,
    network: Network,
    gap_limit: u32,
    wallets: Mutex<HashMap<String, WalletState>>,
}

pub struct DescriptorEngine {
    inner: Arc<EngineInner>,
}

impl DescriptorEngine {
    pub fn new(chain: Arc<dyn ChainSource>, network: Network) -> Self {
        Self::with_gap_limit(chain, network, DEFAULT_GAP_LIMIT)
    }

    pub fn with_gap_limit(chain: Arc<dyn ChainSource>, network: Network, gap_limit: u32) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                chain,
                network,
                gap_limit: gap_limit.max(1),
                wallets: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn network(&self) -> Network {
        self.inner.network
    }

    async fn run<T, F>(&self, f: F) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: FnOnce(&EngineInner) -> Result<T, EngineError> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| EngineError::Internal(e.to_string()))?
    }
}

impl EngineInner {
    fn wallets(&self) -> Result<MutexGuard<'_, HashMap<String, WalletState>>, EngineError> {
        self.wallets
            .lock()
            .map_err(|_| EngineError::Internal("wallet cache poisoned".into()))
    }

    fn snapshot(&self, wallet: &WatchingDescriptor) -> Result<WalletState, EngineError> {
        self.wallets()?
            .get(&wallet.id())
            .cloned()
            .ok_or(EngineError::NotSynced)
    }

    fn sync(&self, wallet: &WatchingDescriptor) -> Result<(), EngineError> {
        let previous = self.snapshot(wallet).ok();
        let mut state = WalletState::default();

        for keychain in [Keychain::Receiving, Keychain::Change] {
            let revealed = previous
                .as_ref()
                .map(|p| p.next_index(keychain))
                .unwrap_or(0);
            let mut last_used: Option<u32> = None;
            let mut index = 0;

            loop {
                let floor = last_used.map(|i| i + 1).unwrap_or(0).max(revealed);
                if index >= floor + self.gap_limit {
                    break;
                }

                let script = wallet.derive(keychain, index)?.script_pubkey();
                let history = self.chain.script_history(&script)?;
                if !history.is_empty() {
                    last_used = Some(index);
                    for utxo in self.chain.script_utxos(&script)? {
                        state.utxos.push(LocalUtxo {
                            outpoint: utxo.outpoint,
                            txout: TxOut {
                                value: utxo.value,
                                script_pubkey: script.clone(),
                            },
                            keychain,
                            derivation_index: index,
                            confirmation_height: utxo.height,
                        });
                    }
                }
                state.scripts.insert(script, (keychain, index));
                index += 1;
            }

            let next = last_used.map(|i| i + 1).unwrap_or(0).max(revealed);
            state.set_next_index(keychain, next);
        }

        log::debug!(
            "Synced wallet: {} UTXOs, {} scripts watched",
            state.utxos.len(),
            state.scripts.len()
        );
        self.wallets()?.insert(wallet.id(), state);
        Ok(())
    }

    fn new_address(&self, wallet: &WatchingDescriptor) -> Result<Address, EngineError> {
        let mut wallets = self.wallets()?;
        let state = wallets.get_mut(&wallet.id()).ok_or(EngineError::NotSynced)?;

        let index = state.next_receiving;
        let address = wallet
            .derive(Keychain::Receiving, index)?
            .address(self.network)?;
        state
            .scripts
            .insert(address.script_pubkey(), (Keychain::Receiving, index));
        state.next_receiving = index + 1;
        Ok(address)
    }

    fn build_psbt(
        &self,
        wallet: &WatchingDescriptor,
        method: &PsbtConstructionMethod,
        shrinkable_output: Option<&ScriptBuf>,
    ) -> Result<Psbt, EngineError> {
        let mut state = self.snapshot(wallet)?;
        let satisfaction = satisfaction_weight(wallet)?;

        let psbt = match method {
            PsbtConstructionMethod::Regular {
                recipient,
                amount,
                fee_policy,
                coin_selection,
            } => {
                self.check_recipient(recipient)?;
                let fee_target = FeeTarget::from_policy(*fee_policy);
                let (required, optional) = partition(&state.utxos, coin_selection)?;

                match amount {
                    SpendAmount::Exact(value) => {
                        let pay = TxOut {
                            value: *value,
                            script_pubkey: recipient.script_pubkey(),
                        };
                        let dust = pay.script_pubkey.minimal_non_dust();
                        if pay.value < dust {
                            return Err(EngineError::InsufficientFunds {
                                needed: dust,
                                available: pay.value,
                            });
                        }

                        let mut change = state.change_output(wallet)?;
                        let selection = select_largest_first(
                            required,
                            optional,
                            std::slice::from_ref(&pay),
                            &change,
                            fee_target,
                            satisfaction,
                        )?;

                        let mut outputs = vec![pay];
                        if let Some(value) = selection.change {
                            change.value = value;
                            outputs.push(change);
                        }
                        assemble(wallet, &state, &selection.selected, outputs)?
                    }
                    SpendAmount::SendAll => {
                        let inputs: Vec<LocalUtxo> = required.into_iter().chain(optional).collect();
                        let mut pay = TxOut {
                            value: Amount::ZERO,
                            script_pubkey: recipient.script_pubkey(),
                        };
                        let (value, _fee) = drain(&inputs, &pay, fee_target, satisfaction)?;
                        pay.value = value;
                        assemble(wallet, &state, &inputs, vec![pay])?
                    }
                }
            }
            PsbtConstructionMethod::DrainAllFromUtxos {
                recipient,
                fee_policy,
                utxos,
            } => {
                self.check_recipient(recipient)?;
                let inputs = resolve_outpoints(&state.utxos, utxos.iter())?;
                let mut pay = TxOut {
                    value: Amount::ZERO,
                    script_pubkey: recipient.script_pubkey(),
                };
                let (value, _fee) = drain(
                    &inputs,
                    &pay,
                    FeeTarget::from_policy(*fee_policy),
                    satisfaction,
                )?;
                pay.value = value;
                assemble(wallet, &state, &inputs, vec![pay])?
            }
            PsbtConstructionMethod::BumpFee { txid, fee_rate } => self.build_fee_bump(
                wallet,
                &mut state,
                *txid,
                *fee_rate,
                shrinkable_output,
            )?,
        };

        log::debug!(
            "Built {} PSBT {} ({} inputs)",
            method.name(),
            psbt.txid(),
            psbt.input_count()
        );
        Ok(psbt)
    }

    fn check_recipient(&self, recipient: &Address) -> Result<(), EngineError> {
        if !recipient.as_unchecked().is_valid_for_network(self.network) {
            return Err(EngineError::NetworkMismatch);
        }
        Ok(())
    }

    /// Rebuild `txid` at a higher fee, after checking it can still be replaced.
    fn build_fee_bump(
        &self,
        wallet: &WatchingDescriptor,
        state: &mut WalletState,
        txid: Txid,
        fee_rate: FeeRate,
        shrinkable_output: Option<&ScriptBuf>,
    ) -> Result<Psbt, EngineError> {
        let original = self.chain.transaction(&txid)?;

        if let Some(first) = original.output.first() {
            let history = self.chain.script_history(&first.script_pubkey)?;
            if history.iter().any(|h| h.txid == txid && h.height.is_some()) {
                return Err(EngineError::AlreadyConfirmed(txid));
            }
        }

        let mut inputs = Vec::with_capacity(original.input.len());
        for txin in &original.input {
            let outpoint = txin.previous_output;
            let parent = self.chain.transaction(&outpoint.txid)?;
            let prevout = parent
                .output
                .get(outpoint.vout as usize)
                .cloned()
                .ok_or_else(|| EngineError::Psbt(format!("missing prevout {}", outpoint)))?;
            let (keychain, index) = *state
                .scripts
                .get(&prevout.script_pubkey)
                .ok_or(EngineError::ForeignInput(outpoint))?;

            for entry in self.chain.script_history(&prevout.script_pubkey)? {
                if entry.txid == txid || entry.txid == outpoint.txid {
                    continue;
                }
                let other = self.chain.transaction(&entry.txid)?;
                if other.input.iter().any(|i| i.previous_output == outpoint) {
                    return Err(EngineError::InputAlreadySpent(outpoint));
                }
            }

            inputs.push(LocalUtxo {
                outpoint,
                txout: prevout,
                keychain,
                derivation_index: index,
                confirmation_height: None,
            });
        }

        let original_out: Amount = original.output.iter().map(|o| o.value).sum();
        let original_fee = total(&inputs)
            .checked_sub(original_out)
            .ok_or_else(|| EngineError::Psbt("original transaction overspends".into()))?;

        let satisfaction = satisfaction_weight(wallet)?;
        let replacement_fee = |n_inputs: usize, outputs: &[TxOut]| {
            let weight = estimate_weight(n_inputs, outputs, satisfaction);
            fee_for(fee_rate, weight).max(original_fee + fee_for(MIN_RELAY_FEE_RATE, weight))
        };
        let others_total = |outputs: &[TxOut], skip: usize| -> Amount {
            outputs
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != skip)
                .map(|(_, o)| o.value)
                .sum()
        };

        let mut outputs = original.output.clone();
        let own_pos = outputs
            .iter()
            .position(|o| state.scripts.contains_key(&o.script_pubkey));
        let shrink_pos =
            shrinkable_output.and_then(|s| outputs.iter().position(|o| &o.script_pubkey == s));

        // Absorb the extra fee into our own output, or an output we may shrink
        for pos in [own_pos, shrink_pos].into_iter().flatten() {
            let fee = replacement_fee(inputs.len(), &outputs);
            let dust = outputs[pos].script_pubkey.minimal_non_dust();
            let value = total(&inputs).checked_sub(others_total(&outputs, pos) + fee);
            if let Some(value) = value.filter(|v| *v >= dust) {
                outputs[pos].value = value;
                return assemble(wallet, state, &inputs, outputs);
            }
        }

        // Otherwise add wallet UTXOs and collect the remainder as change
        let spent: HashSet<OutPoint> = inputs.iter().map(|u| u.outpoint).collect();
        let mut extra: Vec<LocalUtxo> = state
            .utxos
            .iter()
            .filter(|u| !spent.contains(&u.outpoint) && u.outpoint.txid != txid)
            .cloned()
            .collect();
        extra.sort_by(|a, b| b.txout.value.cmp(&a.txout.value));

        let change_pos = match own_pos {
            Some(pos) => pos,
            None => {
                outputs.push(state.change_output(wallet)?);
                outputs.len() - 1
            }
        };
        let dust = outputs[change_pos].script_pubkey.minimal_non_dust();
        let others = others_total(&outputs, change_pos);

        for utxo in extra {
            inputs.push(utxo);
            let fee = replacement_fee(inputs.len(), &outputs);
            let value = total(&inputs).checked_sub(others + fee);
            if let Some(value) = value.filter(|v| *v >= dust) {
                outputs[change_pos].value = value;
                return assemble(wallet, state, &inputs, outputs);
            }
        }

        Err(EngineError::InsufficientFunds {
            needed: others + replacement_fee(inputs.len(), &outputs),
            available: total(&inputs),
        })
    }

    fn broadcast(&self, psbt: &Psbt) -> Result<Txid, EngineError> {
        let secp = Secp256k1::verification_only();
        let mut finalized = psbt.inner().clone();
        finalized.finalize_mut(&secp).map_err(|errors| {
            EngineError::Finalize(
                errors
                    .iter()
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join("; "),
            )
        })?;
        let tx = finalized
            .extract_tx()
            .map_err(|e| EngineError::Finalize(e.to_string()))?;

        let txid = self.chain.broadcast(&tx)?;

        let spent: HashSet<OutPoint> = tx.input.iter().map(|i| i.previous_output).collect();
        for state in self.wallets()?.values_mut() {
            state.utxos.retain(|u| !spent.contains(&u.outpoint));
        }
        log::info!("Broadcast transaction {}", txid);
        Ok(txid)
    }
}

/// Unsigned PSBT spending `inputs`, with descriptor data for every wallet input and output.
fn assemble(
    wallet: &WatchingDescriptor,
    state: &WalletState,
    inputs: &[LocalUtxo],
    outputs: Vec<TxOut>,
) -> Result<Psbt, EngineError> {
    let tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: inputs
            .iter()
            .map(|u| TxIn {
                previous_output: u.outpoint,
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                ..Default::default()
            })
            .collect(),
        output: outputs,
    };

    let mut psbt =
        bitcoin::Psbt::from_unsigned_tx(tx).map_err(|e| EngineError::Psbt(e.to_string()))?;

    for (i, utxo) in inputs.iter().enumerate() {
        psbt.inputs[i].witness_utxo = Some(utxo.txout.clone());
        let derived = wallet.derive(utxo.keychain, utxo.derivation_index)?;
        psbt.update_input_with_descriptor(i, &derived)
            .map_err(|e| EngineError::Psbt(e.to_string()))?;
    }

    let owned: Vec<(usize, Keychain, u32)> = psbt
        .unsigned_tx
        .output
        .iter()
        .enumerate()
        .filter_map(|(i, o)| {
            state
                .scripts
                .get(&o.script_pubkey)
                .map(|(keychain, index)| (i, *keychain, *index))
        })
        .collect();
    for (i, keychain, index) in owned {
        let derived = wallet.derive(keychain, index)?;
        psbt.update_output_with_descriptor(i, &derived)
            .map_err(|e| EngineError::Psbt(e.to_string()))?;
    }

    Ok(Psbt::new(psbt))
}

#[async_trait]
impl WalletEngine for DescriptorEngine {
    async fn sync(&self, wallet: &WatchingDescriptor) -> Result<(), EngineError> {
        let wallet = wallet.clone();
        self.run(move |inner| inner.sync(&wallet)).await
    }

    async fn balance(&self, wallet: &WatchingDescriptor) -> Result<Balance, EngineError> {
        let state = self.inner.snapshot(wallet)?;
        let mut balance = Balance::default();
        for utxo in &state.utxos {
            match utxo.confirmation_height {
                Some(_) => balance.confirmed += utxo.txout.value,
                None => balance.pending += utxo.txout.value,
            }
        }
        Ok(balance)
    }

    async fn list_unspent(
        &self,
        wallet: &WatchingDescriptor,
    ) -> Result<Vec<LocalUtxo>, EngineError> {
        Ok(self.inner.snapshot(wallet)?.utxos)
    }

    async fn new_address(&self, wallet: &WatchingDescriptor) -> Result<Address, EngineError> {
        self.inner.new_address(wallet)
    }

    async fn build_psbt(
        &self,
        wallet: &WatchingDescriptor,
        method: &PsbtConstructionMethod,
        shrinkable_output: Option<&ScriptBuf>,
    ) -> Result<Psbt, EngineError> {
        let wallet = wallet.clone();
        let method = method.clone();
        let shrinkable = shrinkable_output.cloned();
        self.run(move |inner| inner.build_psbt(&wallet, &method, shrinkable.as_ref()))
            .await
    }

    async fn sign(&self, wallet: &SpendingDescriptor, psbt: &Psbt) -> Result<Psbt, EngineError> {
        let signed = signer::sign_psbt(wallet.app_private_key(), psbt.inner())?;
        Ok(Psbt::new(signed))
    }

    async fn broadcast(&self, psbt: &Psbt) -> Result<Txid, EngineError> {
        let psbt = psbt.clone();
        self.run(move |inner| inner.broadcast(&psbt)).await
    }

    async fn transaction(&self, txid: &Txid) -> Result<Transaction, EngineError> {
        let txid = *txid;
        self.run(move |inner| Ok(inner.chain.transaction(&txid)?))
            .await
    }
}
