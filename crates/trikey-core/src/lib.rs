//! Trikey Core
//!
//! Key material shared by every trikey crate.
//!
//! # Custody Model
//!
//! Funds are locked by a 2-of-3 multisig over three spending keys:
//! - **App**: held on the phone, the only private key this codebase ever touches
//! - **Hardware**: held on the NFC signing device, public key only
//! - **Server** (F8e): held by the co-signing server, public key only
//!
//! # Secret Storage
//!
//! App private keys are sealed at rest with an Argon2id-derived key and AES-256-GCM.

pub mod crypto;
pub mod keys;

pub use crypto::{CryptoError, SealedSecret, StoreKey};
pub use keys::*;
