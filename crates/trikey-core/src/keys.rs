//! Spending and authentication keys
//!
//! Spending keys are account-level extended keys carrying their origin,
//! rendered as `[fingerprint/path]xpub`. That string is exactly what goes
//! into a wallet descriptor, so malformed keys are rejected at parse time.

use bitcoin::bip32::{ChildNumber, DerivationPath, Fingerprint, Xpriv, Xpub};
use bitcoin::hashes::{sha256, Hash};
use bitcoin::secp256k1::{ecdsa, Message, PublicKey, Secp256k1, SecretKey};
use bitcoin::{Network, NetworkKind};
use miniscript::descriptor::{DescriptorPublicKey, DescriptorSecretKey, Wildcard};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use zeroize::Zeroizing;

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Invalid extended key: {0}")]
    InvalidKey(String),

    #[error("Extended key has no origin fingerprint and path")]
    MissingOrigin,

    #[error("Key belongs to {found:?} but {expected:?} was expected")]
    NetworkMismatch {
        expected: NetworkKind,
        found: NetworkKind,
    },

    #[error("Derivation failed: {0}")]
    Derivation(#[from] bitcoin::bip32::Error),

    #[error("Invalid hardware signature: {0}")]
    InvalidSignature(String),
}

/// BIP-84 style account path: `m/84'/coin'/0'`.
pub fn account_path(network: Network) -> DerivationPath {
    let coin = if network == Network::Bitcoin { 0 } else { 1 };
    DerivationPath::from(vec![
        ChildNumber::Hardened { index: 84 },
        ChildNumber::Hardened { index: coin },
        ChildNumber::Hardened { index: 0 },
    ])
}

fn format_origin(fingerprint: &Fingerprint, path: &DerivationPath) -> String {
    let path = path.to_string();
    let path = path.trim_start_matches('m').trim_start_matches('/');
    if path.is_empty() {
        format!("[{}]", fingerprint)
    } else {
        format!("[{}/{}]", fingerprint, path)
    }
}

/// Serde via `Display`/`FromStr`.
macro_rules! string_serde_impl {
    ($type:ty) => {
        impl Serialize for $type {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $type {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                <$type>::from_str(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}

/// An account-level xpub together with its origin.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ExtendedPublicKey {
    fingerprint: Fingerprint,
    path: DerivationPath,
    xpub: Xpub,
}

impl ExtendedPublicKey {
    pub fn new(fingerprint: Fingerprint, path: DerivationPath, xpub: Xpub) -> Self {
        Self {
            fingerprint,
            path,
            xpub,
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub fn path(&self) -> &DerivationPath {
        &self.path
    }

    pub fn xpub(&self) -> &Xpub {
        &self.xpub
    }

    pub fn network_kind(&self) -> NetworkKind {
        self.xpub.network
    }

    pub fn ensure_network(&self, network: Network) -> Result<(), KeyError> {
        let expected = NetworkKind::from(network);
        if self.xpub.network != expected {
            return Err(KeyError::NetworkMismatch {
                expected,
                found: self.xpub.network,
            });
        }
        Ok(())
    }
}

impl fmt::Display for ExtendedPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", format_origin(&self.fingerprint, &self.path), self.xpub)
    }
}

impl fmt::Debug for ExtendedPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for ExtendedPublicKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key =
            DescriptorPublicKey::from_str(s).map_err(|e| KeyError::InvalidKey(e.to_string()))?;

        let xkey = match key {
            DescriptorPublicKey::XPub(xkey) => xkey,
            _ => return Err(KeyError::InvalidKey("expected a single xpub".into())),
        };
        if xkey.wildcard != Wildcard::None || !xkey.derivation_path.is_master() {
            return Err(KeyError::InvalidKey(
                "account key must not carry a child path".into(),
            ));
        }
        let (fingerprint, path) = xkey.origin.ok_or(KeyError::MissingOrigin)?;

        Ok(Self::new(fingerprint, path, xkey.xkey))
    }
}

string_serde_impl!(ExtendedPublicKey);

macro_rules! spending_public_key {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub ExtendedPublicKey);

        impl $name {
            pub fn key(&self) -> &ExtendedPublicKey {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl FromStr for $name {
            type Err = KeyError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.parse()?))
            }
        }
    };
}

spending_public_key!(
    /// Public half of the key held by the app.
    AppSpendingPublicKey
);
spending_public_key!(
    /// Public half of the key held by the hardware signer.
    HwSpendingPublicKey
);
spending_public_key!(
    /// Public half of the key held by the co-signing server.
    F8eSpendingPublicKey
);

/// The app's account-level xpriv with its origin. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct AppSpendingPrivateKey {
    fingerprint: Fingerprint,
    path: DerivationPath,
    xpriv: Xpriv,
}

impl AppSpendingPrivateKey {
    pub fn new(fingerprint: Fingerprint, path: DerivationPath, xpriv: Xpriv) -> Self {
        Self {
            fingerprint,
            path,
            xpriv,
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub fn path(&self) -> &DerivationPath {
        &self.path
    }

    pub fn xpriv(&self) -> &Xpriv {
        &self.xpriv
    }

    pub fn public_key(&self) -> AppSpendingPublicKey {
        let secp = Secp256k1::signing_only();
        let xpub = Xpub::from_priv(&secp, &self.xpriv);
        AppSpendingPublicKey(ExtendedPublicKey::new(
            self.fingerprint,
            self.path.clone(),
            xpub,
        ))
    }

    /// The `[fingerprint/path]xprv` form used in spending descriptors and at rest.
    pub fn expose_secret(&self) -> Zeroizing<String> {
        Zeroizing::new(format!(
            "{}{}",
            format_origin(&self.fingerprint, &self.path),
            self.xpriv
        ))
    }

    pub fn from_secret_str(s: &str) -> Result<Self, KeyError> {
        let key =
            DescriptorSecretKey::from_str(s).map_err(|_| KeyError::InvalidKey("xprv".into()))?;
        let xkey = match key {
            DescriptorSecretKey::XPrv(xkey) => xkey,
            _ => return Err(KeyError::InvalidKey("expected a single xprv".into())),
        };
        let (fingerprint, path) = xkey.origin.ok_or(KeyError::MissingOrigin)?;
        Ok(Self::new(fingerprint, path, xkey.xkey))
    }
}

impl fmt::Debug for AppSpendingPrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AppSpendingPrivateKey({}<redacted>)",
            format_origin(&self.fingerprint, &self.path)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppSpendingKeypair {
    pub public: AppSpendingPublicKey,
    pub private: AppSpendingPrivateKey,
}

impl AppSpendingKeypair {
    /// Fresh keypair from 32 bytes of OS randomness.
    pub fn generate(network: Network) -> Result<Self, KeyError> {
        let mut seed = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(seed.as_mut());
        Self::from_seed(seed.as_ref(), network)
    }

    pub fn from_seed(seed: &[u8], network: Network) -> Result<Self, KeyError> {
        let secp = Secp256k1::new();
        let master = Xpriv::new_master(network, seed)?;
        let path = account_path(network);
        let account = master.derive_priv(&secp, &path)?;

        let private = AppSpendingPrivateKey::new(master.fingerprint(&secp), path, account);
        Ok(Self {
            public: private.public_key(),
            private,
        })
    }
}

/// Key the app uses to authenticate to the server.
#[derive(Clone, PartialEq, Eq)]
pub struct AppGlobalAuthKeypair {
    secret: SecretKey,
    public: PublicKey,
}

impl AppGlobalAuthKeypair {
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let (secret, public) = secp.generate_keypair(&mut OsRng);
        Self { secret, public }
    }

    pub fn from_secret(secret: SecretKey) -> Self {
        let secp = Secp256k1::signing_only();
        Self {
            public: secret.public_key(&secp),
            secret,
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    pub fn secret_key(&self) -> &SecretKey {
        &self.secret
    }
}

impl fmt::Debug for AppGlobalAuthKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AppGlobalAuthKeypair({})", self.public)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HwAuthPublicKey(pub PublicKey);

/// Keys read off a newly paired hardware signer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HwKeyBundle {
    pub spending: HwSpendingPublicKey,
    pub auth: HwAuthPublicKey,
    pub network: Network,
}

impl HwKeyBundle {
    pub fn new(
        spending: HwSpendingPublicKey,
        auth: HwAuthPublicKey,
        network: Network,
    ) -> Result<Self, KeyError> {
        spending.key().ensure_network(network)?;
        Ok(Self {
            spending,
            auth,
            network,
        })
    }
}

/// Digest the hardware signs to vouch for the app's new auth key.
pub fn app_auth_attestation_digest(app_auth: &PublicKey) -> sha256::Hash {
    sha256::Hash::hash(&app_auth.serialize())
}

/// Hex DER ECDSA signature by the hardware auth key over the app auth key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppGlobalAuthKeyHwSignature(pub String);

impl AppGlobalAuthKeyHwSignature {
    pub fn from_signature(sig: &ecdsa::Signature) -> Self {
        Self(hex::encode(sig.serialize_der()))
    }

    pub fn verify(&self, hw_auth: &HwAuthPublicKey, app_auth: &PublicKey) -> Result<(), KeyError> {
        let der = hex::decode(&self.0).map_err(|e| KeyError::InvalidSignature(e.to_string()))?;
        let sig =
            ecdsa::Signature::from_der(&der).map_err(|e| KeyError::InvalidSignature(e.to_string()))?;
        let msg = Message::from_digest(app_auth_attestation_digest(app_auth).to_byte_array());

        Secp256k1::verification_only()
            .verify_ecdsa(&msg, &sig, &hw_auth.0)
            .map_err(|e| KeyError::InvalidSignature(e.to_string()))
    }
}
