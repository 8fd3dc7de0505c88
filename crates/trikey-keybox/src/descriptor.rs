//! 2-of-3 sorted multisig descriptor construction
//!
//! The builders are plain string transforms: keys have already been validated
//! when the keyset was constructed. [`WatchingDescriptor`] and
//! [`SpendingDescriptor`] parse the strings into miniscript descriptors for
//! the wallet engine.

use crate::keyset::SpendingKeyset;
use bitcoin::secp256k1::Secp256k1;
use miniscript::descriptor::{DefiniteDescriptorKey, DescriptorPublicKey};
use miniscript::Descriptor;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use trikey_core::{
    AppSpendingPrivateKey, AppSpendingPublicKey, F8eSpendingPublicKey, HwSpendingPublicKey,
};
use zeroize::Zeroize;

const RECEIVING_CHILD: u32 = 0;
const CHANGE_CHILD: u32 = 1;

#[derive(Error, Debug)]
pub enum DescriptorError {
    #[error("Miniscript error: {0}")]
    Miniscript(#[from] miniscript::Error),

    #[error("Derivation failed: {0}")]
    Derivation(String),

    #[error("App private key {private} does not match keyset app key {expected}")]
    AppKeyMismatch { private: String, expected: String },
}

/// Output descriptor string for one branch of a keyset.
#[derive(Clone, PartialEq, Eq)]
pub enum WalletDescriptor {
    /// Carries the app xprv inline. Memory only.
    Spending(String),
    /// Public keys only, safe to log and persist.
    Watching(String),
}

impl WalletDescriptor {
    pub fn as_str(&self) -> &str {
        match self {
            WalletDescriptor::Spending(s) | WalletDescriptor::Watching(s) => s,
        }
    }

    pub fn is_spending(&self) -> bool {
        matches!(self, WalletDescriptor::Spending(_))
    }
}

impl Drop for WalletDescriptor {
    fn drop(&mut self) {
        if let WalletDescriptor::Spending(s) = self {
            s.zeroize();
        }
    }
}

impl fmt::Debug for WalletDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WalletDescriptor::Spending(_) => f.write_str("Spending(<redacted>)"),
            WalletDescriptor::Watching(s) => write!(f, "Watching({})", s),
        }
    }
}

fn with_child(key: &str, child: u32) -> String {
    let suffix = format!("/{}/*", child);
    if key.ends_with(&suffix) {
        key.to_string()
    } else {
        format!("{}{}", key, suffix)
    }
}

/// Append `/0/*` unless already present.
pub fn with_receiving_child(key: &str) -> String {
    with_child(key, RECEIVING_CHILD)
}

/// Append `/1/*` unless already present.
pub fn with_change_child(key: &str) -> String {
    with_child(key, CHANGE_CHILD)
}

fn sorted_multi(app: &str, hw: &str, server: &str, child: u32) -> String {
    format!(
        "wsh(sortedmulti(2,{},{},{}))",
        with_child(app, child),
        with_child(hw, child),
        with_child(server, child)
    )
}

pub fn spending_receiving_descriptor(
    app: &AppSpendingPrivateKey,
    hardware: &HwSpendingPublicKey,
    server: &F8eSpendingPublicKey,
) -> WalletDescriptor {
    let app = app.expose_secret();
    WalletDescriptor::Spending(sorted_multi(
        &app,
        &hardware.to_string(),
        &server.to_string(),
        RECEIVING_CHILD,
    ))
}

pub fn spending_change_descriptor(
    app: &AppSpendingPrivateKey,
    hardware: &HwSpendingPublicKey,
    server: &F8eSpendingPublicKey,
) -> WalletDescriptor {
    let app = app.expose_secret();
    WalletDescriptor::Spending(sorted_multi(
        &app,
        &hardware.to_string(),
        &server.to_string(),
        CHANGE_CHILD,
    ))
}

pub fn watching_receiving_descriptor(
    app: &AppSpendingPublicKey,
    hardware: &HwSpendingPublicKey,
    server: &F8eSpendingPublicKey,
) -> WalletDescriptor {
    WalletDescriptor::Watching(sorted_multi(
        &app.to_string(),
        &hardware.to_string(),
        &server.to_string(),
        RECEIVING_CHILD,
    ))
}

pub fn watching_change_descriptor(
    app: &AppSpendingPublicKey,
    hardware: &HwSpendingPublicKey,
    server: &F8eSpendingPublicKey,
) -> WalletDescriptor {
    WalletDescriptor::Watching(sorted_multi(
        &app.to_string(),
        &hardware.to_string(),
        &server.to_string(),
        CHANGE_CHILD,
    ))
}

/// Keychain branch of a wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Keychain {
    Receiving,
    Change,
}

/// Parsed public descriptors for both branches of a keyset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchingDescriptor {
    pub receiving: Descriptor<DescriptorPublicKey>,
    pub change: Descriptor<DescriptorPublicKey>,
}

impl WatchingDescriptor {
    pub fn for_keyset(keyset: &SpendingKeyset) -> Result<Self, DescriptorError> {
        let receiving = watching_receiving_descriptor(
            keyset.app_key(),
            keyset.hardware_key(),
            keyset.server_key(),
        );
        let change =
            watching_change_descriptor(keyset.app_key(), keyset.hardware_key(), keyset.server_key());

        Ok(Self {
            receiving: Descriptor::from_str(receiving.as_str())?,
            change: Descriptor::from_str(change.as_str())?,
        })
    }

    pub fn branch(&self, keychain: Keychain) -> &Descriptor<DescriptorPublicKey> {
        match keychain {
            Keychain::Receiving => &self.receiving,
            Keychain::Change => &self.change,
        }
    }

    pub fn derive(
        &self,
        keychain: Keychain,
        index: u32,
    ) -> Result<Descriptor<DefiniteDescriptorKey>, DescriptorError> {
        self.branch(keychain)
            .at_derivation_index(index)
            .map_err(|e| DescriptorError::Derivation(e.to_string()))
    }

    /// Stable identifier for caching per-wallet state.
    pub fn id(&self) -> String {
        self.receiving.to_string()
    }
}

/// Private-key-bearing descriptors for a keyset, held only while signing.
pub struct SpendingDescriptor {
    receiving: WalletDescriptor,
    change: WalletDescriptor,
    watching: WatchingDescriptor,
    app_private_key: AppSpendingPrivateKey,
}

impl SpendingDescriptor {
    pub fn for_keyset(
        keyset: &SpendingKeyset,
        app_private_key: AppSpendingPrivateKey,
    ) -> Result<Self, DescriptorError> {
        let derived = app_private_key.public_key();
        if &derived != keyset.app_key() {
            return Err(DescriptorError::AppKeyMismatch {
                private: derived.to_string(),
                expected: keyset.app_key().to_string(),
            });
        }

        let receiving = spending_receiving_descriptor(
            &app_private_key,
            keyset.hardware_key(),
            keyset.server_key(),
        );
        let change = spending_change_descriptor(
            &app_private_key,
            keyset.hardware_key(),
            keyset.server_key(),
        );

        // The secret-bearing string must describe the same script as the watching one
        let secp = Secp256k1::signing_only();
        let (parsed, _keys) = Descriptor::parse_descriptor(&secp, receiving.as_str())?;
        let watching = WatchingDescriptor::for_keyset(keyset)?;
        debug_assert_eq!(parsed, watching.receiving);

        Ok(Self {
            receiving,
            change,
            watching,
            app_private_key,
        })
    }

    pub fn receiving(&self) -> &WalletDescriptor {
        &self.receiving
    }

    pub fn change(&self) -> &WalletDescriptor {
        &self.change
    }

    pub fn watching(&self) -> &WatchingDescriptor {
        &self.watching
    }

    pub fn app_private_key(&self) -> &AppSpendingPrivateKey {
        &self.app_private_key
    }
}

impl fmt::Debug for SpendingDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpendingDescriptor")
            .field("watching", &self.watching.receiving.to_string())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{app_keypair, keyset};

    #[test]
    fn test_child_append_is_idempotent() {
        let key = "[d34db33f/84'/1'/0']tpubD6NzVbkrYhZ4";
        let once = with_receiving_child(key);
        assert_eq!(once, format!("{}/0/*", key));
        assert_eq!(with_receiving_child(&once), once);

        let change = with_change_child(key);
        assert_eq!(with_change_child(&change), change);
        assert_eq!(change, format!("{}/1/*", key));
    }

    #[test]
    fn test_watching_descriptor_shape() {
        let ks = keyset(1);
        let d = watching_receiving_descriptor(ks.app_key(), ks.hardware_key(), ks.server_key());

        assert!(!d.is_spending());
        assert!(d.as_str().starts_with("wsh(sortedmulti(2,"));
        assert_eq!(d.as_str().matches("/0/*").count(), 3);
        assert!(!d.as_str().contains("prv"));

        let c = watching_change_descriptor(ks.app_key(), ks.hardware_key(), ks.server_key());
        assert_eq!(c.as_str().matches("/1/*").count(), 3);
    }

    #[test]
    fn test_spending_descriptor_is_redacted() {
        let ks = keyset(1);
        let app = app_keypair(1);
        let d = spending_receiving_descriptor(&app.private, ks.hardware_key(), ks.server_key());

        assert!(d.is_spending());
        assert!(d.as_str().contains("tprv"));
        assert_eq!(format!("{:?}", d), "Spending(<redacted>)");
    }

    #[test]
    fn test_watching_descriptor_parses() {
        let ks = keyset(2);
        let wd = WatchingDescriptor::for_keyset(&ks).unwrap();

        let receive = wd.derive(Keychain::Receiving, 0).unwrap().script_pubkey();
        let change = wd.derive(Keychain::Change, 0).unwrap().script_pubkey();
        assert!(receive.is_p2wsh());
        assert_ne!(receive, change);
    }

    #[test]
    fn test_spending_descriptor_matches_keyset() {
        let ks = keyset(3);
        let sd = SpendingDescriptor::for_keyset(&ks, app_keypair(3).private).unwrap();
        assert_eq!(sd.watching(), &WatchingDescriptor::for_keyset(&ks).unwrap());
        assert!(!format!("{:?}", sd).contains("tprv"));
    }

    #[test]
    fn test_spending_descriptor_rejects_foreign_key() {
        let ks = keyset(3);
        let result = SpendingDescriptor::for_keyset(&ks, app_keypair(4).private);
        assert!(matches!(result, Err(DescriptorError::AppKeyMismatch { .. })));
    }
}
