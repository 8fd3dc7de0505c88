//! Deterministic key material for tests.

use crate::keybox::Keybox;
use crate::keyset::SpendingKeyset;
use bitcoin::bip32::Xpriv;
use bitcoin::Network;
use trikey_core::{
    AppSpendingKeypair, AppSpendingPrivateKey, ExtendedPublicKey, F8eSpendingPublicKey,
    HwSpendingPublicKey,
};

pub const TEST_NETWORK: Network = Network::Testnet;

fn keypair_from(tag: u8, seed: u8) -> AppSpendingKeypair {
    let mut bytes = [seed; 32];
    bytes[0] = tag;
    // Seeds are fixed and valid
    AppSpendingKeypair::from_seed(&bytes, TEST_NETWORK).unwrap()
}

pub fn app_keypair(seed: u8) -> AppSpendingKeypair {
    keypair_from(0xa0, seed)
}

/// The hardware factor's account xpriv, for tests that sign as the device.
pub fn hw_private(seed: u8) -> AppSpendingPrivateKey {
    keypair_from(0xb0, seed).private
}

pub fn hw_key(seed: u8) -> HwSpendingPublicKey {
    HwSpendingPublicKey(public_of(&hw_private(seed)))
}

/// The server factor's account xpriv, for fake co-signers.
pub fn server_private(seed: u8) -> AppSpendingPrivateKey {
    keypair_from(0xc0, seed).private
}

pub fn server_key(seed: u8) -> F8eSpendingPublicKey {
    F8eSpendingPublicKey(public_of(&server_private(seed)))
}

fn public_of(private: &AppSpendingPrivateKey) -> ExtendedPublicKey {
    private.public_key().0
}

pub fn xpriv_of(private: &AppSpendingPrivateKey) -> Xpriv {
    *private.xpriv()
}

/// Keyset whose three factors all derive from `seed`.
pub fn keyset(seed: u8) -> SpendingKeyset {
    SpendingKeyset::new(
        format!("local-{}", seed),
        format!("f8e-{}", seed),
        TEST_NETWORK,
        app_keypair(seed).public,
        hw_key(seed),
        server_key(seed),
        1_700_000_000 + seed as u64,
    )
    .unwrap()
}

/// Keybox with `active` as active and `inactive` as retired keysets.
pub fn keybox(active: u8, inactive: &[u8]) -> Keybox {
    Keybox::new("account-1", keyset(active))
        .with_inactive_keysets(inactive.iter().map(|s| keyset(*s)))
        .unwrap()
}
