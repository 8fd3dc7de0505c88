//! The account keybox: one active keyset plus every retired one.
//!
//! Keyboxes are values. Rotation returns a new keybox and leaves the old one
//! untouched, so a failure can never leave a half-rotated account.

use crate::keyset::SpendingKeyset;
use bitcoin::Network;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KeyboxError {
    #[error("Keyset {0} is already part of this keybox")]
    DuplicateKeyset(String),

    #[error("Keyset {id} is on {found}, keybox is on {expected}")]
    NetworkMismatch {
        id: String,
        expected: Network,
        found: Network,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Keybox {
    account_id: String,
    active: SpendingKeyset,
    /// Retired keysets, oldest rotation first
    inactive: Vec<SpendingKeyset>,
}

impl Keybox {
    pub fn new(account_id: impl Into<String>, active: SpendingKeyset) -> Self {
        Self {
            account_id: account_id.into(),
            active,
            inactive: Vec::new(),
        }
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn active(&self) -> &SpendingKeyset {
        &self.active
    }

    pub fn inactive(&self) -> &[SpendingKeyset] {
        &self.inactive
    }

    pub fn network(&self) -> Network {
        self.active.network()
    }

    /// Inactive keysets by ascending creation time (ties by local id).
    pub fn inactive_by_creation(&self) -> Vec<&SpendingKeyset> {
        let mut keysets: Vec<&SpendingKeyset> = self.inactive.iter().collect();
        keysets.sort_by(|a, b| {
            a.created_at()
                .cmp(&b.created_at())
                .then_with(|| a.local_id().cmp(b.local_id()))
        });
        keysets
    }

    pub fn contains(&self, keyset: &SpendingKeyset) -> bool {
        self.active.same_keyset(keyset) || self.inactive.iter().any(|k| k.same_keyset(keyset))
    }

    fn check_network(&self, keyset: &SpendingKeyset) -> Result<(), KeyboxError> {
        if keyset.network() != self.network() {
            return Err(KeyboxError::NetworkMismatch {
                id: keyset.local_id().to_string(),
                expected: self.network(),
                found: keyset.network(),
            });
        }
        Ok(())
    }

    /// Append keysets not already present. Known keysets (including the active
    /// one) are skipped; nothing is ever removed.
    pub fn with_inactive_keysets(
        mut self,
        keysets: impl IntoIterator<Item = SpendingKeyset>,
    ) -> Result<Self, KeyboxError> {
        for keyset in keysets {
            self.check_network(&keyset)?;
            if self.contains(&keyset) {
                continue;
            }
            self.inactive.push(keyset);
        }
        Ok(self)
    }

    /// Make `new_active` active and retire the current active keyset.
    pub fn rotate(&self, new_active: SpendingKeyset) -> Result<Keybox, KeyboxError> {
        self.check_network(&new_active)?;
        if self.contains(&new_active) {
            return Err(KeyboxError::DuplicateKeyset(new_active.local_id().to_string()));
        }

        let mut inactive = self.inactive.clone();
        inactive.push(self.active.clone());
        Ok(Keybox {
            account_id: self.account_id.clone(),
            active: new_active,
            inactive,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{keybox, keyset};
    use trikey_core::AppSpendingKeypair;

    #[test]
    fn test_rotate_moves_active_to_inactive() {
        let kb = keybox(1, &[]);
        let rotated = kb.rotate(keyset(2)).unwrap();

        assert_eq!(rotated.active(), &keyset(2));
        assert_eq!(rotated.inactive(), &[keyset(1)]);
        // Original untouched
        assert_eq!(kb.active(), &keyset(1));
        assert!(kb.inactive().is_empty());
    }

    #[test]
    fn test_rotate_rejects_known_keyset() {
        let kb = keybox(1, &[2]);
        assert!(matches!(
            kb.rotate(keyset(2)),
            Err(KeyboxError::DuplicateKeyset(_))
        ));
        assert!(matches!(
            kb.rotate(keyset(1)),
            Err(KeyboxError::DuplicateKeyset(_))
        ));
    }

    #[test]
    fn test_rotate_rejects_other_network() {
        let kb = keybox(1, &[]);
        let pair = AppSpendingKeypair::from_seed(&[9; 32], Network::Bitcoin).unwrap();
        let hw = trikey_core::HwSpendingPublicKey(pair.public.0.clone());
        let server = trikey_core::F8eSpendingPublicKey(pair.public.0.clone());
        let mainnet =
            SpendingKeyset::new("m", "m", Network::Bitcoin, pair.public, hw, server, 0).unwrap();

        assert!(matches!(
            kb.rotate(mainnet),
            Err(KeyboxError::NetworkMismatch { .. })
        ));
    }

    #[test]
    fn test_active_never_in_inactive() {
        let kb = keybox(1, &[2, 3])
            .with_inactive_keysets(vec![keyset(1), keyset(3), keyset(4)])
            .unwrap();

        let ids: Vec<&str> = kb.inactive().iter().map(|k| k.local_id()).collect();
        assert_eq!(ids, vec!["local-2", "local-3", "local-4"]);
        assert!(!kb.inactive().iter().any(|k| k.same_keyset(kb.active())));
    }

    #[test]
    fn test_inactive_by_creation_order() {
        let kb = keybox(1, &[5, 2, 4]);
        let ids: Vec<&str> = kb.inactive_by_creation().iter().map(|k| k.local_id()).collect();
        assert_eq!(ids, vec!["local-2", "local-4", "local-5"]);
    }
}
