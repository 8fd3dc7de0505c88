use super::machine::{
    initial, transition, InitiationEffect, InitiationError, InitiationEvent, InitiationState,
    NewAppKeys, NewHardware,
};
use crate::f8e::{F8eClient, InitiateRecoveryRequest, LostFactor};
use bitcoin::Network;
use std::sync::Arc;
use trikey_core::{AppGlobalAuthKeyHwSignature, AppGlobalAuthKeypair, AppSpendingKeypair, HwKeyBundle};
use trikey_keybox::AppKeyStore;

/// Drives a lost-hardware Delay & Notify recovery for one account.
pub struct InitiationSession {
    state: InitiationState,
    account_id: String,
    network: Network,
    f8e: Arc<dyn F8eClient>,
    key_store: Arc<dyn AppKeyStore>,
    pending: Option<InitiationEffect>,
}

impl InitiationSession {
    pub fn new(
        account_id: impl Into<String>,
        network: Network,
        f8e: Arc<dyn F8eClient>,
        key_store: Arc<dyn AppKeyStore>,
    ) -> Self {
        let (state, effect) = initial();
        Self {
            state,
            account_id: account_id.into(),
            network,
            f8e,
            key_store,
            pending: Some(effect),
        }
    }

    pub fn state(&self) -> &InitiationState {
        &self.state
    }

    /// Generate the replacement app keys.
    pub async fn start(&mut self) -> &InitiationState {
        if let Some(effect) = self.pending.take() {
            self.run(effect).await;
        }
        &self.state
    }

    pub async fn add_hardware_keys(
        &mut self,
        keys: HwKeyBundle,
        signature: AppGlobalAuthKeyHwSignature,
    ) -> &InitiationState {
        self.send(InitiationEvent::HardwareKeysProvided(NewHardware { keys, signature }))
            .await
    }

    /// Out-of-band comms verification completed.
    pub async fn comms_verified(&mut self) -> &InitiationState {
        self.send(InitiationEvent::CommsVerified).await
    }

    pub async fn retry(&mut self) -> &InitiationState {
        self.send(InitiationEvent::Retry).await
    }

    pub async fn rollback(&mut self) -> &InitiationState {
        self.send(InitiationEvent::Rollback).await
    }

    pub async fn cancel_recovery(&mut self) -> &InitiationState {
        self.send(InitiationEvent::CancelRecovery).await
    }

    pub async fn send(&mut self, event: InitiationEvent) -> &InitiationState {
        if let Some(effect) = self.apply(event) {
            self.run(effect).await;
        }
        &self.state
    }

    fn apply(&mut self, event: InitiationEvent) -> Option<InitiationEffect> {
        let state = std::mem::replace(&mut self.state, InitiationState::RolledBack);
        let from = state.name();
        let (state, effect) = transition(state, event);
        if state.name() != from {
            log::debug!("Recovery initiation {} -> {}", from, state.name());
        }
        self.state = state;
        effect
    }

    async fn run(&mut self, effect: InitiationEffect) {
        let mut next = Some(effect);
        while let Some(effect) = next.take() {
            let event = match effect {
                InitiationEffect::GenerateAppKeys => match self.generate_app_keys() {
                    Ok(keys) => InitiationEvent::AppKeysGenerated(keys),
                    Err(e) => InitiationEvent::AppKeyGenerationFailed(Arc::new(e)),
                },
                InitiationEffect::InitiateRecovery { app_keys, hardware } => {
                    let request = self.request(&app_keys, &hardware);
                    match self.f8e.initiate_delay_notify_recovery(&request).await {
                        Ok(pending) => InitiationEvent::RecoveryInitiated(pending),
                        Err(e) => InitiationEvent::InitiationFailed(e),
                    }
                }
                InitiationEffect::CancelRecovery => {
                    match self.f8e.cancel_delay_notify_recovery(&self.account_id).await {
                        Ok(()) => InitiationEvent::Cancelled,
                        Err(e) => InitiationEvent::CancelFailed(e),
                    }
                }
            };
            next = self.apply(event);
        }
    }

    /// The spending private key is persisted before anything reaches the server.
    fn generate_app_keys(&self) -> Result<NewAppKeys, InitiationError> {
        let spending = AppSpendingKeypair::generate(self.network)?;
        self.key_store.store_app_private_key(&spending.private)?;
        log::info!("Generated replacement app spending key {}", spending.public);

        Ok(NewAppKeys {
            spending,
            auth: AppGlobalAuthKeypair::generate(),
        })
    }

    fn request(&self, app_keys: &NewAppKeys, hardware: &NewHardware) -> InitiateRecoveryRequest {
        InitiateRecoveryRequest {
            account_id: self.account_id.clone(),
            lost_factor: LostFactor::Hardware,
            app_auth_key: app_keys.auth.public_key(),
            app_spending_key: app_keys.spending.public.clone(),
            hw_auth_key: hardware.keys.auth,
            hw_spending_key: hardware.keys.spending.clone(),
            hw_signature: hardware.signature.clone(),
        }
    }
}
