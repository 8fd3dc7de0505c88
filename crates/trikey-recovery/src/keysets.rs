//! Merge server-known keysets into the local keybox.
//!
//! A phone restored after losing the app factor never held the keysets that
//! were active before it. The server lists them, so they can be swept too.

use crate::f8e::{F8eClient, F8eError};
use thiserror::Error;
use trikey_keybox::{Keybox, KeyboxError};

#[derive(Error, Debug)]
pub enum KeysetSyncError {
    #[error("Could not list keysets: {0}")]
    F8e(#[from] F8eError),

    #[error("Server keyset rejected: {0}")]
    Keybox(#[from] KeyboxError),
}

/// Returns `keybox` with every server keyset it lacks appended as inactive.
pub async fn sync_inactive_keysets(
    keybox: Keybox,
    f8e: &dyn F8eClient,
) -> Result<Keybox, KeysetSyncError> {
    let listed = f8e.list_keysets(keybox.account_id()).await?;
    let before = keybox.inactive().len();

    let merged = keybox.with_inactive_keysets(listed)?;
    let added = merged.inactive().len() - before;
    if added > 0 {
        log::info!("Discovered {} inactive keyset(s) from server", added);
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::f8e::{InitiateRecoveryError, InitiateRecoveryRequest, PendingDelayNotify};
    use async_trait::async_trait;
    use bitcoin::Network;
    use trikey_keybox::test_utils::{keybox, keyset};
    use trikey_keybox::SpendingKeyset;
    use trikey_wallet::Psbt;

    struct Listing(Result<Vec<SpendingKeyset>, F8eError>);

    #[async_trait]
    impl F8eClient for Listing {
        async fn initiate_delay_notify_recovery(
            &self,
            _: &InitiateRecoveryRequest,
        ) -> Result<PendingDelayNotify, InitiateRecoveryError> {
            unimplemented!()
        }

        async fn cancel_delay_notify_recovery(&self, _: &str) -> Result<(), F8eError> {
            unimplemented!()
        }

        async fn sign_psbt(&self, _: &str, _: &str, _: &Psbt) -> Result<Psbt, F8eError> {
            unimplemented!()
        }

        async fn list_keysets(&self, _: &str) -> Result<Vec<SpendingKeyset>, F8eError> {
            self.0.clone()
        }
    }

    #[tokio::test]
    async fn test_unknown_keysets_are_appended() {
        let server = Listing(Ok(vec![keyset(1), keyset(2), keyset(3)]));
        let merged = sync_inactive_keysets(keybox(1, &[2]), &server).await.unwrap();

        assert_eq!(merged.active(), &keyset(1));
        assert_eq!(merged.inactive(), &[keyset(2), keyset(3)]);
    }

    #[tokio::test]
    async fn test_server_error_propagates() {
        let server = Listing(Err(F8eError::Connectivity("offline".into())));
        let err = sync_inactive_keysets(keybox(1, &[]), &server).await.unwrap_err();
        assert!(matches!(err, KeysetSyncError::F8e(e) if e.is_retryable()));
    }

    #[tokio::test]
    async fn test_wrong_network_keyset_rejected() {
        let app = trikey_core::AppSpendingKeypair::from_seed(&[9; 32], Network::Bitcoin).unwrap();
        let hw = trikey_core::AppSpendingKeypair::from_seed(&[10; 32], Network::Bitcoin).unwrap();
        let server_key =
            trikey_core::AppSpendingKeypair::from_seed(&[11; 32], Network::Bitcoin).unwrap();
        let mainnet = SpendingKeyset::new(
            "local-main",
            "f8e-main",
            Network::Bitcoin,
            app.public,
            trikey_core::HwSpendingPublicKey(hw.public.0),
            trikey_core::F8eSpendingPublicKey(server_key.public.0),
            1,
        )
        .unwrap();

        let server = Listing(Ok(vec![mainnet]));
        let err = sync_inactive_keysets(keybox(1, &[]), &server).await.unwrap_err();
        assert!(matches!(err, KeysetSyncError::Keybox(KeyboxError::NetworkMismatch { .. })));
    }
}
