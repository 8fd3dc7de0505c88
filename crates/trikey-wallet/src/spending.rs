//! One keyset's wallet.

use crate::engine::{Balance, LocalUtxo, WalletEngine};
use crate::error::SpendingWalletError;
use crate::fee_bump::FeeBumpAllowShrinkingChecker;
use crate::fees::min_spendable_amount;
use crate::method::PsbtConstructionMethod;
use crate::psbt::Psbt;
use bitcoin::{Address, Amount, Network, Txid};
use std::fmt;
use std::sync::Arc;
use trikey_core::AppSpendingPrivateKey;
use trikey_keybox::{SpendingDescriptor, SpendingKeyset, WatchingDescriptor};

/// Wallet bound to a single keyset.
///
/// Without the app private key the wallet is watch-only: it can sync, report
/// balances and build PSBTs, but signing fails with
/// [`SpendingWalletError::WatchOnly`].
pub struct SpendingWallet {
    keyset: SpendingKeyset,
    watching: WatchingDescriptor,
    spending: Option<SpendingDescriptor>,
    engine: Arc<dyn WalletEngine>,
    shrink_checker: Arc<dyn FeeBumpAllowShrinkingChecker>,
}

impl SpendingWallet {
    pub fn new(
        keyset: SpendingKeyset,
        app_private_key: Option<AppSpendingPrivateKey>,
        engine: Arc<dyn WalletEngine>,
        shrink_checker: Arc<dyn FeeBumpAllowShrinkingChecker>,
    ) -> Result<Self, SpendingWalletError> {
        let watching = WatchingDescriptor::for_keyset(&keyset)?;
        let spending = app_private_key
            .map(|key| SpendingDescriptor::for_keyset(&keyset, key))
            .transpose()?;

        Ok(Self {
            keyset,
            watching,
            spending,
            engine,
            shrink_checker,
        })
    }

    pub fn keyset(&self) -> &SpendingKeyset {
        &self.keyset
    }

    pub fn network(&self) -> Network {
        self.keyset.network()
    }

    pub fn descriptor(&self) -> &WatchingDescriptor {
        &self.watching
    }

    pub fn is_watch_only(&self) -> bool {
        self.spending.is_none()
    }

    pub async fn sync(&self) -> Result<(), SpendingWalletError> {
        log::debug!("Syncing keyset {}", self.keyset.local_id());
        Ok(self.engine.sync(&self.watching).await?)
    }

    pub async fn balance(&self) -> Result<Balance, SpendingWalletError> {
        Ok(self.engine.balance(&self.watching).await?)
    }

    pub async fn list_unspent(&self) -> Result<Vec<LocalUtxo>, SpendingWalletError> {
        Ok(self.engine.list_unspent(&self.watching).await?)
    }

    pub async fn new_receive_address(&self) -> Result<Address, SpendingWalletError> {
        Ok(self.engine.new_address(&self.watching).await?)
    }

    /// Whether confirmed plus pending funds are worth more than the cost of
    /// moving them, with every current UTXO as an input.
    pub async fn is_balance_spendable(&self) -> Result<bool, SpendingWalletError> {
        let utxos = self.list_unspent().await?;
        if utxos.is_empty() {
            return Ok(false);
        }
        let total: Amount = utxos.iter().map(|u| u.txout.value).sum();
        let threshold = min_spendable_amount(&self.watching, utxos.len())?;
        Ok(total > threshold)
    }

    /// Build an unsigned PSBT.
    pub async fn create_psbt(
        &self,
        method: &PsbtConstructionMethod,
    ) -> Result<Psbt, SpendingWalletError> {
        let shrinkable = match method {
            PsbtConstructionMethod::BumpFee { txid, .. } => {
                let original = self.engine.transaction(txid).await?;
                let utxos = self.list_unspent().await?;
                self.shrink_checker
                    .allow_shrinking_output(&original, &utxos)
            }
            _ => None,
        };

        Ok(self
            .engine
            .build_psbt(&self.watching, method, shrinkable.as_ref())
            .await?)
    }

    /// Build a PSBT and add this wallet's signature to every input.
    pub async fn create_signed_psbt(
        &self,
        method: &PsbtConstructionMethod,
    ) -> Result<Psbt, SpendingWalletError> {
        let psbt = self.create_psbt(method).await?;
        self.sign_psbt(&psbt).await
    }

    pub async fn sign_psbt(&self, psbt: &Psbt) -> Result<Psbt, SpendingWalletError> {
        let spending = self
            .spending
            .as_ref()
            .ok_or(SpendingWalletError::WatchOnly)?;
        Ok(self.engine.sign(spending, psbt).await?)
    }

    /// Finalize and broadcast a fully co-signed PSBT.
    pub async fn broadcast(&self, psbt: &Psbt) -> Result<Txid, SpendingWalletError> {
        Ok(self.engine.broadcast(psbt).await?)
    }
}

impl fmt::Debug for SpendingWallet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpendingWallet")
            .field("keyset", &self.keyset.local_id())
            .field("watch_only", &self.is_watch_only())
            .finish()
    }
}
