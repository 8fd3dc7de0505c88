//! Delay & Notify recovery initiation after losing the hardware factor.
//!
//! New app keys are generated once and kept across every retry. The server
//! is the only source of truth for the delay period.

mod machine;
mod session;

pub use machine::{
    initial, transition, InitiationEffect, InitiationError, InitiationEvent, InitiationState,
    NewAppKeys, NewHardware,
};
pub use session::InitiationSession;
