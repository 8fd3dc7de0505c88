//! Runs a sweep: feeds events to [`transition`] and executes its effects.

use super::generator::{SigningFactor, SweepGenerator, SweepPsbt};
use super::machine::{initial, transition, SweepEffect, SweepError, SweepEvent, SweepState};
use crate::f8e::F8eClient;
use crate::keysets::sync_inactive_keysets;
use bitcoin::Txid;
use std::sync::Arc;
use trikey_keybox::Keybox;
use trikey_wallet::Psbt;

/// One sweep attempt per keybox.
///
/// Takes `&mut self` for every step, so a session can never run two
/// attempts at once.
pub struct SweepSession {
    state: SweepState,
    keybox: Keybox,
    generator: SweepGenerator,
    f8e: Arc<dyn F8eClient>,
    pending: Option<SweepEffect>,
}

impl SweepSession {
    pub fn new(keybox: Keybox, generator: SweepGenerator, f8e: Arc<dyn F8eClient>) -> Self {
        let (state, effect) = initial();
        Self {
            state,
            keybox,
            generator,
            f8e,
            pending: Some(effect),
        }
    }

    pub fn state(&self) -> &SweepState {
        &self.state
    }

    /// Keybox including any keysets discovered from the server.
    pub fn keybox(&self) -> &Keybox {
        &self.keybox
    }

    /// Run the initial generation.
    pub async fn start(&mut self) -> &SweepState {
        if let Some(effect) = self.pending.take() {
            self.run(effect).await;
        }
        &self.state
    }

    pub async fn start_sweep(&mut self) -> &SweepState {
        self.send(SweepEvent::StartSweep).await
    }

    pub async fn add_hw_signed_sweeps(&mut self, psbts: Vec<Psbt>) -> &SweepState {
        self.send(SweepEvent::HardwareSigned(psbts)).await
    }

    pub async fn retry(&mut self) -> &SweepState {
        self.send(SweepEvent::Retry).await
    }

    pub async fn proceed(&mut self) -> &SweepState {
        self.send(SweepEvent::Proceed).await
    }

    pub async fn send(&mut self, event: SweepEvent) -> &SweepState {
        if let Some(effect) = self.apply(event) {
            self.run(effect).await;
        }
        &self.state
    }

    fn apply(&mut self, event: SweepEvent) -> Option<SweepEffect> {
        let state = std::mem::replace(&mut self.state, SweepState::Exited);
        let from = state.name();
        let (state, effect) = transition(state, event);
        if state.name() != from {
            log::debug!("Sweep {} -> {}", from, state.name());
        }
        self.state = state;
        effect
    }

    async fn run(&mut self, effect: SweepEffect) {
        let mut next = Some(effect);
        while let Some(effect) = next.take() {
            let event = match effect {
                SweepEffect::GeneratePsbts => self.generate().await,
                SweepEffect::SignAndBroadcast(psbts) => match self.sign_and_broadcast(&psbts).await {
                    Ok(txids) => SweepEvent::Broadcast(txids),
                    Err(e) => SweepEvent::BroadcastFailed(Arc::new(e)),
                },
            };
            next = self.apply(event);
        }
    }

    async fn generate(&mut self) -> SweepEvent {
        let merged = match sync_inactive_keysets(self.keybox.clone(), self.f8e.as_ref()).await {
            Ok(keybox) => keybox,
            Err(e) => return SweepEvent::GenerationFailed(Arc::new(e.into())),
        };
        self.keybox = merged;

        match self.generator.generate(&self.keybox).await {
            Ok(generation) => SweepEvent::Generated(generation),
            Err(e) => SweepEvent::GenerationFailed(Arc::new(e.into())),
        }
    }

    async fn sign_and_broadcast(&self, psbts: &[SweepPsbt]) -> Result<Vec<Txid>, SweepError> {
        let mut txids = Vec::with_capacity(psbts.len());
        for sweep in psbts {
            let keyset = &sweep.source_keyset;
            let wallet = self.generator.wallet_for(keyset)?;

            let signed = match sweep.signing_factor {
                SigningFactor::App => wallet.sign_psbt(&sweep.psbt).await?,
                SigningFactor::Hardware => sweep.psbt.clone(),
            };

            let cosigned = self
                .f8e
                .sign_psbt(self.keybox.account_id(), keyset.f8e_keyset_id(), &signed)
                .await?;
            if cosigned.txid() != signed.txid() {
                return Err(SweepError::CosignMismatch {
                    expected: signed.txid(),
                    found: cosigned.txid(),
                });
            }

            let txid = wallet.broadcast(&cosigned).await?;
            log::info!("Swept keyset {} in {}", keyset.local_id(), txid);
            txids.push(txid);
        }
        Ok(txids)
    }
}
