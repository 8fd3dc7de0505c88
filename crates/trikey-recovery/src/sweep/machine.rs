//! Sweep states and the pure transition function.

use super::generator::{SigningFactor, Sweep, SweepGeneration, SweepGeneratorError, SweepPsbt};
use crate::f8e::F8eError;
use crate::keysets::KeysetSyncError;
use bitcoin::{Address, Amount, Txid};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use trikey_wallet::{Psbt, SpendingWalletError};

#[derive(Error, Debug)]
pub enum SweepError {
    #[error(transparent)]
    Generator(#[from] SweepGeneratorError),

    #[error("Keyset discovery failed: {0}")]
    KeysetSync(#[from] KeysetSyncError),

    #[error(transparent)]
    Wallet(#[from] SpendingWalletError),

    #[error("Server co-signing failed: {0}")]
    F8e(#[from] F8eError),

    #[error("Co-signed PSBT {found} does not match {expected}")]
    CosignMismatch { expected: Txid, found: Txid },

    #[error("No hardware-signed PSBT returned for {0}")]
    MissingHardwareSignature(Txid),

    #[error("Hardware returned a PSBT for unknown transaction {0}")]
    UnexpectedHardwarePsbt(Txid),

    #[error("Hardware PSBT {0} carries no signature")]
    UnsignedHardwarePsbt(Txid),
}

impl SweepError {
    pub fn is_retryable(&self) -> bool {
        match self {
            SweepError::Generator(e) => e.is_retryable(),
            SweepError::KeysetSync(KeysetSyncError::F8e(e)) | SweepError::F8e(e) => {
                e.is_retryable()
            }
            SweepError::Wallet(e) => e.is_retryable(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub enum SweepState {
    GeneratingPsbts,
    /// Retry regenerates
    GeneratePsbtsFailed { error: Arc<SweepError> },
    /// Proceed
    NoFundsFound,
    /// Start the sweep, or leave
    PsbtsGenerated { sweep: Sweep },
    AwaitingHardwareSignedSweeps {
        sweep: Sweep,
        needs_hw_sign: Vec<SweepPsbt>,
    },
    SigningAndBroadcasting { sweep: Sweep },
    /// Retry regenerates; stale PSBTs are never reused
    SweepFailed { error: Arc<SweepError> },
    SweepComplete {
        total_fee: Amount,
        total_transfer_amount: Amount,
        destination: Address,
        txids: Vec<Txid>,
    },
    /// A completed sweep was started again
    SweepCompleteNoData,
    /// The caller proceeded past a terminal state
    Exited,
}

impl SweepState {
    pub fn name(&self) -> &'static str {
        match self {
            SweepState::GeneratingPsbts => "GeneratingPsbts",
            SweepState::GeneratePsbtsFailed { .. } => "GeneratePsbtsFailed",
            SweepState::NoFundsFound => "NoFundsFound",
            SweepState::PsbtsGenerated { .. } => "PsbtsGenerated",
            SweepState::AwaitingHardwareSignedSweeps { .. } => "AwaitingHardwareSignedSweeps",
            SweepState::SigningAndBroadcasting { .. } => "SigningAndBroadcasting",
            SweepState::SweepFailed { .. } => "SweepFailed",
            SweepState::SweepComplete { .. } => "SweepComplete",
            SweepState::SweepCompleteNoData => "SweepCompleteNoData",
            SweepState::Exited => "Exited",
        }
    }

    /// Whether signing or broadcasting may be under way.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, SweepState::SigningAndBroadcasting { .. })
    }
}

#[derive(Debug, Clone)]
pub enum SweepEvent {
    Generated(SweepGeneration),
    GenerationFailed(Arc<SweepError>),
    StartSweep,
    /// PSBTs back from the hardware signer
    HardwareSigned(Vec<Psbt>),
    Broadcast(Vec<Txid>),
    BroadcastFailed(Arc<SweepError>),
    Retry,
    Proceed,
}

/// Work the session must do after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepEffect {
    GeneratePsbts,
    /// Sign App PSBTs locally, get every PSBT co-signed, broadcast all
    SignAndBroadcast(Vec<SweepPsbt>),
}

/// Starting state plus the effect that drives it.
pub fn initial() -> (SweepState, SweepEffect) {
    (SweepState::GeneratingPsbts, SweepEffect::GeneratePsbts)
}

pub fn transition(state: SweepState, event: SweepEvent) -> (SweepState, Option<SweepEffect>) {
    use SweepEvent as E;
    use SweepState as S;

    match (state, event) {
        (S::GeneratingPsbts, E::Generated(SweepGeneration::NoFundsFound)) => (S::NoFundsFound, None),
        (S::GeneratingPsbts, E::Generated(SweepGeneration::Generated(sweep))) => {
            (S::PsbtsGenerated { sweep }, None)
        }
        (S::GeneratingPsbts, E::GenerationFailed(error)) => {
            log::warn!("Sweep generation failed: {}", error);
            (S::GeneratePsbtsFailed { error }, None)
        }

        (S::GeneratePsbtsFailed { .. }, E::Retry) | (S::SweepFailed { .. }, E::Retry) => {
            (S::GeneratingPsbts, Some(SweepEffect::GeneratePsbts))
        }

        (S::PsbtsGenerated { sweep }, E::StartSweep) => {
            if sweep.needs_hardware_signing() {
                let needs_hw_sign = sweep.hardware_psbts();
                (
                    S::AwaitingHardwareSignedSweeps {
                        sweep,
                        needs_hw_sign,
                    },
                    None,
                )
            } else {
                let effect = SweepEffect::SignAndBroadcast(sweep.psbts.clone());
                (S::SigningAndBroadcasting { sweep }, Some(effect))
            }
        }

        (S::AwaitingHardwareSignedSweeps { sweep, .. }, E::HardwareSigned(signed)) => {
            match merge_hardware_signed(&sweep, signed) {
                Ok(psbts) => {
                    let effect = SweepEffect::SignAndBroadcast(psbts.clone());
                    let sweep = Sweep { psbts, ..sweep };
                    (S::SigningAndBroadcasting { sweep }, Some(effect))
                }
                Err(error) => {
                    log::warn!("Rejected hardware-signed sweeps: {}", error);
                    (
                        S::SweepFailed {
                            error: Arc::new(error),
                        },
                        None,
                    )
                }
            }
        }

        (S::SigningAndBroadcasting { sweep }, E::Broadcast(txids)) => (
            S::SweepComplete {
                total_fee: sweep.total_fee,
                total_transfer_amount: sweep.total_transfer_amount,
                destination: sweep.destination,
                txids,
            },
            None,
        ),
        (S::SigningAndBroadcasting { .. }, E::BroadcastFailed(error)) => {
            log::warn!("Sweep failed: {}", error);
            (S::SweepFailed { error }, None)
        }

        (S::SweepComplete { .. }, E::StartSweep) | (S::SweepCompleteNoData, E::StartSweep) => {
            (S::SweepCompleteNoData, None)
        }

        (S::NoFundsFound, E::Proceed)
        | (S::SweepComplete { .. }, E::Proceed)
        | (S::SweepCompleteNoData, E::Proceed) => (S::Exited, None),

        (state, event) => {
            log::debug!("Sweep ignored {:?} in {}", event_name(&event), state.name());
            (state, None)
        }
    }
}

fn event_name(event: &SweepEvent) -> &'static str {
    match event {
        SweepEvent::Generated(_) => "Generated",
        SweepEvent::GenerationFailed(_) => "GenerationFailed",
        SweepEvent::StartSweep => "StartSweep",
        SweepEvent::HardwareSigned(_) => "HardwareSigned",
        SweepEvent::Broadcast(_) => "Broadcast",
        SweepEvent::BroadcastFailed(_) => "BroadcastFailed",
        SweepEvent::Retry => "Retry",
        SweepEvent::Proceed => "Proceed",
    }
}

/// Replace each Hardware PSBT with its signed copy, matched by txid.
fn merge_hardware_signed(sweep: &Sweep, signed: Vec<Psbt>) -> Result<Vec<SweepPsbt>, SweepError> {
    let mut by_txid: HashMap<Txid, Psbt> = HashMap::new();
    for psbt in signed {
        let txid = psbt.txid();
        let expected = sweep
            .psbts
            .iter()
            .any(|p| p.signing_factor == SigningFactor::Hardware && p.psbt.txid() == txid);
        if !expected {
            return Err(SweepError::UnexpectedHardwarePsbt(txid));
        }
        if (0..psbt.input_count()).any(|i| psbt.signature_count(i) == 0) {
            return Err(SweepError::UnsignedHardwarePsbt(txid));
        }
        by_txid.insert(txid, psbt);
    }

    sweep
        .psbts
        .iter()
        .map(|p| match p.signing_factor {
            SigningFactor::App => Ok(p.clone()),
            SigningFactor::Hardware => {
                let txid = p.psbt.txid();
                let psbt = by_txid
                    .remove(&txid)
                    .ok_or(SweepError::MissingHardwareSignature(txid))?;
                Ok(SweepPsbt {
                    psbt,
                    ..p.clone()
                })
            }
        })
        .collect()
}
