//! Server (F8e) interface: recovery registration, co-signing, keyset listing.
//!
//! Transport is not part of this crate; callers supply an [`F8eClient`].

use async_trait::async_trait;
use bitcoin::secp256k1::PublicKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use trikey_core::{
    AppGlobalAuthKeyHwSignature, AppSpendingPublicKey, HwAuthPublicKey, HwSpendingPublicKey,
};
use trikey_keybox::SpendingKeyset;
use trikey_wallet::Psbt;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum F8eError {
    #[error("Server unreachable: {0}")]
    Connectivity(String),

    #[error("Notification comms must be verified first")]
    CommsVerificationRequired,

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Server rejected request: {0}")]
    Rejected(String),

    #[error("Unexpected server response: {0}")]
    Unexpected(String),
}

impl F8eError {
    /// Only transport failures are safe to retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, F8eError::Connectivity(_))
    }
}

/// Outcome of a failed recovery registration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InitiateRecoveryError {
    #[error("Server requires out-of-band verification of notification comms")]
    CommsVerificationRequired,

    #[error(transparent)]
    Other(F8eError),
}

impl From<F8eError> for InitiateRecoveryError {
    fn from(e: F8eError) -> Self {
        match e {
            F8eError::CommsVerificationRequired => InitiateRecoveryError::CommsVerificationRequired,
            other => InitiateRecoveryError::Other(other),
        }
    }
}

/// Which factor the recovering customer lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LostFactor {
    App,
    Hardware,
}

/// A server-held recovery waiting out its delay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingDelayNotify {
    pub recovery_id: String,
    pub lost_factor: LostFactor,
    /// Unix seconds at which the server will allow completion
    pub delay_end_time: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InitiateRecoveryRequest {
    pub account_id: String,
    pub lost_factor: LostFactor,
    pub app_auth_key: PublicKey,
    pub app_spending_key: AppSpendingPublicKey,
    pub hw_auth_key: HwAuthPublicKey,
    pub hw_spending_key: HwSpendingPublicKey,
    /// Hardware's signature over `app_auth_key`
    pub hw_signature: AppGlobalAuthKeyHwSignature,
}

#[async_trait]
pub trait F8eClient: Send + Sync {
    async fn initiate_delay_notify_recovery(
        &self,
        request: &InitiateRecoveryRequest,
    ) -> Result<PendingDelayNotify, InitiateRecoveryError>;

    async fn cancel_delay_notify_recovery(&self, account_id: &str) -> Result<(), F8eError>;

    /// Add the server's signature to `psbt`, spending from keyset `f8e_keyset_id`.
    async fn sign_psbt(
        &self,
        account_id: &str,
        f8e_keyset_id: &str,
        psbt: &Psbt,
    ) -> Result<Psbt, F8eError>;

    /// Every keyset the server knows for the account, active included.
    async fn list_keysets(&self, account_id: &str) -> Result<Vec<SpendingKeyset>, F8eError>;
}
