//! Drain PSBTs for funds left on inactive keysets.

use bitcoin::{Address, Amount};
use std::sync::Arc;
use thiserror::Error;
use trikey_keybox::{AppKeyStore, Keybox, SpendingKeyset, StoreError};
use trikey_wallet::{
    FeeBumpAllowShrinkingChecker, FeePolicy, Psbt, PsbtConstructionMethod, SendAllShrinkingChecker,
    SpendingWallet, SpendingWalletError, WalletEngine,
};

/// Which factor adds the second local signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum SigningFactor {
    App,
    Hardware,
}

/// One keyset's drain, with the factor that must sign it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepPsbt {
    pub psbt: Psbt,
    pub signing_factor: SigningFactor,
    pub source_keyset: SpendingKeyset,
}

/// Everything one generation produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sweep {
    pub psbts: Vec<SweepPsbt>,
    /// Active wallet address every PSBT pays to
    pub destination: Address,
    pub total_fee: Amount,
    pub total_transfer_amount: Amount,
}

impl Sweep {
    pub fn needs_hardware_signing(&self) -> bool {
        self.psbts
            .iter()
            .any(|p| p.signing_factor == SigningFactor::Hardware)
    }

    pub fn hardware_psbts(&self) -> Vec<SweepPsbt> {
        self.psbts
            .iter()
            .filter(|p| p.signing_factor == SigningFactor::Hardware)
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepGeneration {
    /// No inactive keyset holds a spendable balance
    NoFundsFound,
    Generated(Sweep),
}

#[derive(Error, Debug)]
pub enum SweepGeneratorError {
    #[error("Could not read app key for keyset {keyset_id}: {source}")]
    KeyStore {
        keyset_id: String,
        #[source]
        source: StoreError,
    },

    #[error("Could not open wallet for keyset {keyset_id}: {source}")]
    ErrorCreatingWallet {
        keyset_id: String,
        #[source]
        source: SpendingWalletError,
    },

    #[error("Could not sync wallet for keyset {keyset_id}: {source}")]
    ErrorSyncingSpendingWallet {
        keyset_id: String,
        #[source]
        source: SpendingWalletError,
    },

    #[error("Could not read balance of keyset {keyset_id}: {source}")]
    ErrorCheckingBalance {
        keyset_id: String,
        #[source]
        source: SpendingWalletError,
    },

    #[error("Could not get a sweep destination: {0}")]
    ErrorGettingDestination(#[source] SpendingWalletError),

    #[error("Could not build sweep PSBT for keyset {keyset_id}: {source}")]
    ErrorBuildingPsbt {
        keyset_id: String,
        #[source]
        source: SpendingWalletError,
    },
}

impl SweepGeneratorError {
    pub fn is_retryable(&self) -> bool {
        match self {
            SweepGeneratorError::KeyStore { .. } => false,
            SweepGeneratorError::ErrorCreatingWallet { source, .. }
            | SweepGeneratorError::ErrorSyncingSpendingWallet { source, .. }
            | SweepGeneratorError::ErrorCheckingBalance { source, .. }
            | SweepGeneratorError::ErrorBuildingPsbt { source, .. }
            | SweepGeneratorError::ErrorGettingDestination(source) => source.is_retryable(),
        }
    }
}

pub struct SweepGenerator {
    engine: Arc<dyn WalletEngine>,
    key_store: Arc<dyn AppKeyStore>,
    shrink_checker: Arc<dyn FeeBumpAllowShrinkingChecker>,
}

impl SweepGenerator {
    pub fn new(engine: Arc<dyn WalletEngine>, key_store: Arc<dyn AppKeyStore>) -> Self {
        Self {
            engine,
            key_store,
            shrink_checker: Arc::new(SendAllShrinkingChecker),
        }
    }

    /// Wallet for `keyset`, holding the app key if it is still stored locally.
    pub fn wallet_for(&self, keyset: &SpendingKeyset) -> Result<SpendingWallet, SweepGeneratorError> {
        let keyset_id = keyset.local_id().to_string();
        let app_key = self
            .key_store
            .app_private_key(keyset.app_key())
            .map_err(|source| SweepGeneratorError::KeyStore {
                keyset_id: keyset_id.clone(),
                source,
            })?;

        SpendingWallet::new(
            keyset.clone(),
            app_key,
            self.engine.clone(),
            self.shrink_checker.clone(),
        )
        .map_err(|source| SweepGeneratorError::ErrorCreatingWallet { keyset_id, source })
    }

    /// Scan `keybox`'s inactive keysets, oldest first.
    ///
    /// Any sync failure aborts the whole generation. The destination address
    /// is drawn from the active wallet once, when the first spendable keyset
    /// turns up.
    pub async fn generate(&self, keybox: &Keybox) -> Result<SweepGeneration, SweepGeneratorError> {
        let mut destination: Option<Address> = None;
        let mut psbts = Vec::new();

        for keyset in keybox.inactive_by_creation() {
            let keyset_id = keyset.local_id().to_string();
            let wallet = self.wallet_for(keyset)?;

            wallet
                .sync()
                .await
                .map_err(|source| SweepGeneratorError::ErrorSyncingSpendingWallet {
                    keyset_id: keyset_id.clone(),
                    source,
                })?;

            let spendable = wallet.is_balance_spendable().await.map_err(|source| {
                SweepGeneratorError::ErrorCheckingBalance {
                    keyset_id: keyset_id.clone(),
                    source,
                }
            })?;
            if !spendable {
                log::debug!("Keyset {} has nothing worth sweeping", keyset_id);
                continue;
            }

            let to = match &destination {
                Some(address) => address.clone(),
                None => {
                    let address = self.destination(keybox).await?;
                    destination = Some(address.clone());
                    address
                }
            };

            let psbt = self.drain(&wallet, to).await.map_err(|source| {
                SweepGeneratorError::ErrorBuildingPsbt {
                    keyset_id: keyset_id.clone(),
                    source,
                }
            })?;
            let signing_factor = if wallet.is_watch_only() {
                SigningFactor::Hardware
            } else {
                SigningFactor::App
            };

            log::info!(
                "Sweep of keyset {}: {} sat, signed by {:?}",
                keyset_id,
                psbt.output_total().to_sat(),
                signing_factor
            );
            psbts.push(SweepPsbt {
                psbt,
                signing_factor,
                source_keyset: keyset.clone(),
            });
        }

        let destination = match destination {
            Some(address) if !psbts.is_empty() => address,
            _ => return Ok(SweepGeneration::NoFundsFound),
        };

        let mut total_fee = Amount::ZERO;
        let mut total_transfer_amount = Amount::ZERO;
        for sweep in &psbts {
            total_fee += sweep.psbt.fee().map_err(|e| SweepGeneratorError::ErrorBuildingPsbt {
                keyset_id: sweep.source_keyset.local_id().to_string(),
                source: SpendingWalletError::Engine(trikey_wallet::EngineError::Psbt(
                    e.to_string(),
                )),
            })?;
            total_transfer_amount += sweep.psbt.output_total();
        }

        Ok(SweepGeneration::Generated(Sweep {
            psbts,
            destination,
            total_fee,
            total_transfer_amount,
        }))
    }

    async fn destination(&self, keybox: &Keybox) -> Result<Address, SweepGeneratorError> {
        let active = self.wallet_for(keybox.active())?;
        active
            .sync()
            .await
            .map_err(SweepGeneratorError::ErrorGettingDestination)?;
        active
            .new_receive_address()
            .await
            .map_err(SweepGeneratorError::ErrorGettingDestination)
    }

    async fn drain(
        &self,
        wallet: &SpendingWallet,
        destination: Address,
    ) -> Result<Psbt, SpendingWalletError> {
        let utxos = wallet.list_unspent().await?;
        let method = PsbtConstructionMethod::drain_all_from_utxos(
            destination,
            FeePolicy::MinRelayRate,
            utxos.iter().map(|u| u.outpoint),
        )?;
        wallet.create_psbt(&method).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::Network;
    use trikey_keybox::descriptor::Keychain;
    use trikey_keybox::test_utils::{app_keypair, keybox};
    use trikey_keybox::{MemoryAppKeyStore, WatchingDescriptor};
    use trikey_wallet::test_utils::{fund, MemoryChain};
    use trikey_wallet::DescriptorEngine;

    struct Fixture {
        chain: Arc<MemoryChain>,
        keys: Arc<MemoryAppKeyStore>,
        generator: SweepGenerator,
    }

    fn fixture() -> Fixture {
        let chain = Arc::new(MemoryChain::new(100));
        let engine = Arc::new(DescriptorEngine::with_gap_limit(
            chain.clone(),
            Network::Testnet,
            5,
        ));
        let keys = Arc::new(MemoryAppKeyStore::new());
        Fixture {
            generator: SweepGenerator::new(engine, keys.clone()),
            chain,
            keys,
        }
    }

    fn inactive_wallet(kb: &Keybox, seed: u8) -> WatchingDescriptor {
        let keyset = kb
            .inactive()
            .iter()
            .find(|k| k.local_id() == format!("local-{}", seed))
            .unwrap();
        WatchingDescriptor::for_keyset(keyset).unwrap()
    }

    fn fund_keyset(f: &Fixture, kb: &Keybox, seed: u8, sats: u64) {
        fund(&f.chain, &inactive_wallet(kb, seed), Keychain::Receiving, 0, sats);
    }

    #[tokio::test]
    async fn test_no_inactive_funds() {
        let f = fixture();
        let kb = keybox(1, &[2, 3]);
        fund_keyset(&f, &kb, 3, 300);

        let result = f.generator.generate(&kb).await.unwrap();
        assert_eq!(result, SweepGeneration::NoFundsFound);
    }

    #[tokio::test]
    async fn test_scattered_dust_keyset_is_skipped() {
        let f = fixture();
        f.keys.store_app_private_key(&app_keypair(3).private).unwrap();
        let kb = keybox(1, &[2, 3]);
        // 489 sat over three outputs: more than one input costs to move,
        // less than three do
        let dusty = inactive_wallet(&kb, 2);
        for index in 0..3 {
            fund(&f.chain, &dusty, Keychain::Receiving, index, 163);
        }
        fund_keyset(&f, &kb, 3, 10_000);

        let sweep = match f.generator.generate(&kb).await.unwrap() {
            SweepGeneration::Generated(sweep) => sweep,
            other => panic!("expected sweep, got {:?}", other),
        };
        assert_eq!(sweep.psbts.len(), 1);
        assert_eq!(sweep.psbts[0].source_keyset.local_id(), "local-3");
        assert_eq!(sweep.psbts[0].signing_factor, SigningFactor::App);
        assert_eq!(
            sweep.total_fee + sweep.total_transfer_amount,
            Amount::from_sat(10_000)
        );
    }

    #[tokio::test]
    async fn test_factor_follows_app_key_presence() {
        let f = fixture();
        f.keys.store_app_private_key(&app_keypair(2).private).unwrap();
        let kb = keybox(1, &[2, 3]);
        fund_keyset(&f, &kb, 2, 10_000);
        fund_keyset(&f, &kb, 3, 20_000);

        let sweep = match f.generator.generate(&kb).await.unwrap() {
            SweepGeneration::Generated(sweep) => sweep,
            other => panic!("expected sweep, got {:?}", other),
        };

        assert_eq!(sweep.psbts.len(), 2);
        // Oldest keyset first
        assert_eq!(sweep.psbts[0].source_keyset.local_id(), "local-2");
        assert_eq!(sweep.psbts[0].signing_factor, SigningFactor::App);
        assert_eq!(sweep.psbts[1].signing_factor, SigningFactor::Hardware);
        assert!(sweep.needs_hardware_signing());
        assert_eq!(sweep.hardware_psbts().len(), 1);

        // Shared destination in the active wallet
        let active = WatchingDescriptor::for_keyset(kb.active()).unwrap();
        assert_eq!(
            sweep.destination.script_pubkey(),
            active.derive(Keychain::Receiving, 0).unwrap().script_pubkey()
        );
        for p in &sweep.psbts {
            let outputs = &p.psbt.inner().unsigned_tx.output;
            assert_eq!(outputs.len(), 1);
            assert_eq!(outputs[0].script_pubkey, sweep.destination.script_pubkey());
        }
        assert_eq!(
            sweep.total_fee + sweep.total_transfer_amount,
            Amount::from_sat(30_000)
        );
    }

    #[tokio::test]
    async fn test_sync_failure_aborts_everything() {
        let f = fixture();
        let kb = keybox(1, &[2, 3]);
        fund_keyset(&f, &kb, 2, 10_000);
        let poisoned = WatchingDescriptor::for_keyset(&kb.inactive()[1])
            .unwrap()
            .derive(Keychain::Receiving, 0)
            .unwrap()
            .script_pubkey();
        f.chain.poison(&poisoned);

        let err = f.generator.generate(&kb).await.unwrap_err();
        assert!(matches!(
            err,
            SweepGeneratorError::ErrorSyncingSpendingWallet { ref keyset_id, .. } if keyset_id == "local-3"
        ));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_balance_failure_is_its_own_error() {
        let err = SweepGeneratorError::ErrorCheckingBalance {
            keyset_id: "local-2".into(),
            source: SpendingWalletError::Engine(trikey_wallet::EngineError::NotSynced),
        };
        assert!(err
            .to_string()
            .starts_with("Could not read balance of keyset local-2"));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_offline_is_retryable() {
        let f = fixture();
        f.chain.set_offline(true);
        let err = f.generator.generate(&keybox(1, &[2])).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
