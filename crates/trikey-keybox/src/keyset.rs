//! Spending keysets
//!
//! A keyset is one app/hardware/server triple. Keysets are immutable: key
//! rotation creates a new keyset and retires the old one.

use bitcoin::Network;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use trikey_core::{AppSpendingPublicKey, F8eSpendingPublicKey, HwSpendingPublicKey, KeyError};

#[derive(Error, Debug)]
pub enum KeysetError {
    #[error("{factor} key does not belong to {network}: {source}")]
    NetworkMismatch {
        factor: &'static str,
        network: Network,
        #[source]
        source: KeyError,
    },

    #[error("Keyset id must not be empty")]
    EmptyId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "KeysetFields")]
pub struct SpendingKeyset {
    local_id: String,
    f8e_keyset_id: String,
    network: Network,
    app_key: AppSpendingPublicKey,
    hardware_key: HwSpendingPublicKey,
    server_key: F8eSpendingPublicKey,
    /// Unix seconds
    created_at: u64,
}

#[derive(Deserialize)]
struct KeysetFields {
    local_id: String,
    f8e_keyset_id: String,
    network: Network,
    app_key: AppSpendingPublicKey,
    hardware_key: HwSpendingPublicKey,
    server_key: F8eSpendingPublicKey,
    created_at: u64,
}

impl TryFrom<KeysetFields> for SpendingKeyset {
    type Error = KeysetError;

    fn try_from(f: KeysetFields) -> Result<Self, Self::Error> {
        SpendingKeyset::new(
            f.local_id,
            f.f8e_keyset_id,
            f.network,
            f.app_key,
            f.hardware_key,
            f.server_key,
            f.created_at,
        )
    }
}

impl SpendingKeyset {
    /// `network` is the app-wide active network; every key must belong to it.
    pub fn new(
        local_id: impl Into<String>,
        f8e_keyset_id: impl Into<String>,
        network: Network,
        app_key: AppSpendingPublicKey,
        hardware_key: HwSpendingPublicKey,
        server_key: F8eSpendingPublicKey,
        created_at: u64,
    ) -> Result<Self, KeysetError> {
        let local_id = local_id.into();
        let f8e_keyset_id = f8e_keyset_id.into();
        if local_id.is_empty() || f8e_keyset_id.is_empty() {
            return Err(KeysetError::EmptyId);
        }

        let check = |factor: &'static str, key: &trikey_core::ExtendedPublicKey| {
            key.ensure_network(network)
                .map_err(|source| KeysetError::NetworkMismatch {
                    factor,
                    network,
                    source,
                })
        };
        check("app", app_key.key())?;
        check("hardware", hardware_key.key())?;
        check("server", server_key.key())?;

        Ok(Self {
            local_id,
            f8e_keyset_id,
            network,
            app_key,
            hardware_key,
            server_key,
            created_at,
        })
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn f8e_keyset_id(&self) -> &str {
        &self.f8e_keyset_id
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn app_key(&self) -> &AppSpendingPublicKey {
        &self.app_key
    }

    pub fn hardware_key(&self) -> &HwSpendingPublicKey {
        &self.hardware_key
    }

    pub fn server_key(&self) -> &F8eSpendingPublicKey {
        &self.server_key
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Same id, locally or server-side.
    pub fn same_keyset(&self, other: &SpendingKeyset) -> bool {
        self.local_id == other.local_id || self.f8e_keyset_id == other.f8e_keyset_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{app_keypair, hw_key, server_key};

    #[test]
    fn test_keyset_construction() {
        let ks = SpendingKeyset::new(
            "local-1",
            "f8e-1",
            Network::Testnet,
            app_keypair(1).public,
            hw_key(1),
            server_key(1),
            1_700_000_000,
        )
        .unwrap();

        assert_eq!(ks.local_id(), "local-1");
        assert_eq!(ks.f8e_keyset_id(), "f8e-1");
        assert_eq!(ks.network(), Network::Testnet);
    }

    #[test]
    fn test_keyset_rejects_network_mismatch() {
        let result = SpendingKeyset::new(
            "local-1",
            "f8e-1",
            Network::Bitcoin,
            app_keypair(1).public,
            hw_key(1),
            server_key(1),
            0,
        );

        match result {
            Err(KeysetError::NetworkMismatch { factor, .. }) => assert_eq!(factor, "app"),
            other => panic!("expected network mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_keyset_rejects_empty_id() {
        let result = SpendingKeyset::new(
            "",
            "f8e-1",
            Network::Testnet,
            app_keypair(1).public,
            hw_key(1),
            server_key(1),
            0,
        );
        assert!(matches!(result, Err(KeysetError::EmptyId)));
    }

    #[test]
    fn test_keyset_serde_revalidates() {
        let ks = crate::test_utils::keyset(5);
        let json = serde_json::to_string(&ks).unwrap();
        let back: SpendingKeyset = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ks);

        let tampered = json.replace("\"testnet\"", "\"bitcoin\"");
        assert!(serde_json::from_str::<SpendingKeyset>(&tampered).is_err());
    }
}
