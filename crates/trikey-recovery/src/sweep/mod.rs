//! Sweeping funds off inactive keysets into the active wallet.
//!
//! [`generator`] builds one drain PSBT per funded inactive keyset,
//! [`machine`] is the state machine the UI follows, and [`session`] runs it
//! against the wallet engine and server.

pub mod generator;
pub mod machine;
pub mod session;

pub use generator::{
    SigningFactor, Sweep, SweepGeneration, SweepGenerator, SweepGeneratorError, SweepPsbt,
};
pub use machine::{transition, SweepEffect, SweepError, SweepEvent, SweepState};
pub use session::SweepSession;
