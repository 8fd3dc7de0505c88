//! Trikey Recovery
//!
//! Getting back to 2-of-3 control after losing a factor, and moving funds
//! off retired keysets.
//!
//! # Flow
//!
//! 1. [`initiation`] generates replacement app keys, collects the new
//!    hardware's keys and registers a Delay & Notify recovery with the
//!    server. The server owns the delay clock.
//! 2. Once the server completes the recovery, the account's keybox gets a
//!    new active keyset and the old one becomes inactive.
//! 3. [`sweep`] finds inactive keysets that still hold funds and drains
//!    each into the active wallet, co-signed by the server.
//!
//! Both flows are pure state machines (`transition(state, event)`) with an
//! async session that executes their effects.

pub mod f8e;
pub mod initiation;
pub mod keysets;
pub mod sweep;

pub use f8e::{
    F8eClient, F8eError, InitiateRecoveryError, InitiateRecoveryRequest, PendingDelayNotify,
};
pub use initiation::{
    InitiationError, InitiationEvent, InitiationSession, InitiationState, NewAppKeys, NewHardware,
};
pub use keysets::{sync_inactive_keysets, KeysetSyncError};
pub use sweep::{
    SigningFactor, Sweep, SweepError, SweepEvent, SweepGeneration, SweepGenerator,
    SweepGeneratorError, SweepPsbt, SweepSession, SweepState,
};
