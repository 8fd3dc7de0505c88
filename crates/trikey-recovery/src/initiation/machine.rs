//! Delay & Notify initiation states and the pure transition function.

use crate::f8e::{F8eError, InitiateRecoveryError, PendingDelayNotify};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use trikey_core::{
    AppGlobalAuthKeyHwSignature, AppGlobalAuthKeypair, AppSpendingKeypair, HwKeyBundle, KeyError,
};
use trikey_keybox::StoreError;

#[derive(Error, Debug)]
pub enum InitiationError {
    #[error("Could not generate app keys: {0}")]
    KeyGeneration(#[from] KeyError),

    #[error("Could not store new app key: {0}")]
    KeyStore(#[from] StoreError),

    #[error("Hardware keys rejected: {0}")]
    InvalidHardware(#[source] KeyError),

    #[error(transparent)]
    Initiate(#[from] InitiateRecoveryError),

    #[error("Could not cancel recovery: {0}")]
    Cancel(#[from] F8eError),
}

/// Replacement app keys, kept across retries.
#[derive(Clone, PartialEq, Eq)]
pub struct NewAppKeys {
    pub spending: AppSpendingKeypair,
    pub auth: AppGlobalAuthKeypair,
}

impl fmt::Debug for NewAppKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewAppKeys")
            .field("spending", &self.spending.public)
            .field("auth", &self.auth.public_key())
            .finish()
    }
}

/// The replacement hardware's keys and its attestation over the new app auth key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewHardware {
    pub keys: HwKeyBundle,
    pub signature: AppGlobalAuthKeyHwSignature,
}

impl NewHardware {
    /// Same network as the app keys, and a valid signature over the app auth key.
    pub fn validate(&self, app_keys: &NewAppKeys) -> Result<(), KeyError> {
        let expected = app_keys.spending.public.key().network_kind();
        let found = self.keys.spending.key().network_kind();
        if expected != found {
            return Err(KeyError::NetworkMismatch { expected, found });
        }
        self.signature
            .verify(&self.keys.auth, &app_keys.auth.public_key())
    }
}

#[derive(Debug, Clone)]
pub enum InitiationState {
    GeneratingNewAppKeys,
    FailedGeneratingAppKeys {
        error: Arc<InitiationError>,
    },
    /// `rejected` holds the reason the last offered hardware keys were refused
    AwaitingNewHardware {
        app_keys: NewAppKeys,
        rejected: Option<Arc<InitiationError>>,
    },
    InitiatingRecoveryWithF8e {
        app_keys: NewAppKeys,
        hardware: NewHardware,
    },
    VerifyingNotificationComms {
        app_keys: NewAppKeys,
        hardware: NewHardware,
    },
    FailedInitiatingRecoveryWithF8e {
        app_keys: NewAppKeys,
        hardware: NewHardware,
        error: Arc<InitiationError>,
    },
    /// The server acknowledged; its delay clock is running
    AwaitingDelayPeriod {
        app_keys: NewAppKeys,
        pending: PendingDelayNotify,
    },
    CancellingRecovery {
        app_keys: NewAppKeys,
    },
    FailedCancellingRecovery {
        app_keys: NewAppKeys,
        error: Arc<InitiationError>,
    },
    RolledBack,
}

impl InitiationState {
    pub fn name(&self) -> &'static str {
        match self {
            InitiationState::GeneratingNewAppKeys => "GeneratingNewAppKeys",
            InitiationState::FailedGeneratingAppKeys { .. } => "FailedGeneratingAppKeys",
            InitiationState::AwaitingNewHardware { .. } => "AwaitingNewHardware",
            InitiationState::InitiatingRecoveryWithF8e { .. } => "InitiatingRecoveryWithF8e",
            InitiationState::VerifyingNotificationComms { .. } => "VerifyingNotificationComms",
            InitiationState::FailedInitiatingRecoveryWithF8e { .. } => {
                "FailedInitiatingRecoveryWithF8e"
            }
            InitiationState::AwaitingDelayPeriod { .. } => "AwaitingDelayPeriod",
            InitiationState::CancellingRecovery { .. } => "CancellingRecovery",
            InitiationState::FailedCancellingRecovery { .. } => "FailedCancellingRecovery",
            InitiationState::RolledBack => "RolledBack",
        }
    }

    pub fn app_keys(&self) -> Option<&NewAppKeys> {
        match self {
            InitiationState::AwaitingNewHardware { app_keys, .. }
            | InitiationState::InitiatingRecoveryWithF8e { app_keys, .. }
            | InitiationState::VerifyingNotificationComms { app_keys, .. }
            | InitiationState::FailedInitiatingRecoveryWithF8e { app_keys, .. }
            | InitiationState::AwaitingDelayPeriod { app_keys, .. }
            | InitiationState::CancellingRecovery { app_keys }
            | InitiationState::FailedCancellingRecovery { app_keys, .. } => Some(app_keys),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum InitiationEvent {
    AppKeysGenerated(NewAppKeys),
    AppKeyGenerationFailed(Arc<InitiationError>),
    HardwareKeysProvided(NewHardware),
    RecoveryInitiated(PendingDelayNotify),
    InitiationFailed(InitiateRecoveryError),
    /// Out-of-band comms verification finished
    CommsVerified,
    Retry,
    /// Abandon locally; only valid before the server acknowledged
    Rollback,
    /// Ask the server to cancel an acknowledged recovery
    CancelRecovery,
    Cancelled,
    CancelFailed(F8eError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitiationEffect {
    GenerateAppKeys,
    InitiateRecovery {
        app_keys: NewAppKeys,
        hardware: NewHardware,
    },
    CancelRecovery,
}

pub fn initial() -> (InitiationState, InitiationEffect) {
    (
        InitiationState::GeneratingNewAppKeys,
        InitiationEffect::GenerateAppKeys,
    )
}

fn initiate(app_keys: NewAppKeys, hardware: NewHardware) -> (InitiationState, Option<InitiationEffect>) {
    let effect = InitiationEffect::InitiateRecovery {
        app_keys: app_keys.clone(),
        hardware: hardware.clone(),
    };
    (
        InitiationState::InitiatingRecoveryWithF8e { app_keys, hardware },
        Some(effect),
    )
}

fn cancel(app_keys: NewAppKeys) -> (InitiationState, Option<InitiationEffect>) {
    (
        InitiationState::CancellingRecovery { app_keys },
        Some(InitiationEffect::CancelRecovery),
    )
}

pub fn transition(
    state: InitiationState,
    event: InitiationEvent,
) -> (InitiationState, Option<InitiationEffect>) {
    use InitiationEvent as E;
    use InitiationState as S;

    match (state, event) {
        (S::GeneratingNewAppKeys, E::AppKeysGenerated(app_keys)) => (
            S::AwaitingNewHardware {
                app_keys,
                rejected: None,
            },
            None,
        ),
        (S::GeneratingNewAppKeys, E::AppKeyGenerationFailed(error)) => {
            log::warn!("App key generation failed: {}", error);
            (S::FailedGeneratingAppKeys { error }, None)
        }
        (S::FailedGeneratingAppKeys { .. }, E::Retry) => (
            S::GeneratingNewAppKeys,
            Some(InitiationEffect::GenerateAppKeys),
        ),

        (S::AwaitingNewHardware { app_keys, .. }, E::HardwareKeysProvided(hardware)) => {
            match hardware.validate(&app_keys) {
                Ok(()) => initiate(app_keys, hardware),
                Err(e) => {
                    log::warn!("Rejected new hardware keys: {}", e);
                    (
                        S::AwaitingNewHardware {
                            app_keys,
                            rejected: Some(Arc::new(InitiationError::InvalidHardware(e))),
                        },
                        None,
                    )
                }
            }
        }

        (S::InitiatingRecoveryWithF8e { app_keys, .. }, E::RecoveryInitiated(pending)) => {
            log::info!(
                "Recovery {} registered; delay ends at {}",
                pending.recovery_id,
                pending.delay_end_time
            );
            (S::AwaitingDelayPeriod { app_keys, pending }, None)
        }
        (S::InitiatingRecoveryWithF8e { app_keys, hardware }, E::InitiationFailed(error)) => {
            match error {
                InitiateRecoveryError::CommsVerificationRequired => {
                    (S::VerifyingNotificationComms { app_keys, hardware }, None)
                }
                other => {
                    log::warn!("Recovery initiation failed: {}", other);
                    (
                        S::FailedInitiatingRecoveryWithF8e {
                            app_keys,
                            hardware,
                            error: Arc::new(other.into()),
                        },
                        None,
                    )
                }
            }
        }
        (S::VerifyingNotificationComms { app_keys, hardware }, E::CommsVerified)
        | (S::FailedInitiatingRecoveryWithF8e { app_keys, hardware, .. }, E::Retry) => {
            initiate(app_keys, hardware)
        }

        (
            S::GeneratingNewAppKeys
            | S::FailedGeneratingAppKeys { .. }
            | S::AwaitingNewHardware { .. }
            | S::VerifyingNotificationComms { .. }
            | S::FailedInitiatingRecoveryWithF8e { .. },
            E::Rollback,
        ) => (S::RolledBack, None),

        (S::AwaitingDelayPeriod { app_keys, .. }, E::CancelRecovery)
        | (S::FailedCancellingRecovery { app_keys, .. }, E::Retry) => cancel(app_keys),
        (S::CancellingRecovery { .. }, E::Cancelled) => (S::RolledBack, None),
        (S::CancellingRecovery { app_keys }, E::CancelFailed(e)) => {
            log::warn!("Recovery cancellation failed: {}", e);
            (
                S::FailedCancellingRecovery {
                    app_keys,
                    error: Arc::new(e.into()),
                },
                None,
            )
        }

        (state, event) => {
            log::debug!("Initiation ignored {:?} in {}", event, state.name());
            (state, None)
        }
    }
}
