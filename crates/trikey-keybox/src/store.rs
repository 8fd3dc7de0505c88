//! SQLite persistence for the keybox and sealed app keys.
//!
//! Keysets live in a `keysets` table, app private keys in `app_keys` sealed
//! under a passphrase-derived key. The KDF salt and a passphrase check value
//! sit in a key-value `config` table.

use crate::keybox::{Keybox, KeyboxError};
use crate::keyset::{KeysetError, SpendingKeyset};
use bitcoin::Network;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use trikey_core::crypto::{generate_salt, CryptoError, SealedSecret, StoreKey};
use trikey_core::{
    AppSpendingPrivateKey, AppSpendingPublicKey, F8eSpendingPublicKey, HwSpendingPublicKey,
};

const SALT_KEY: &str = "kdf_salt";
const CHECK_KEY: &str = "passphrase_check";
const ACCOUNT_KEY: &str = "account_id";
const CHECK_PLAINTEXT: &[u8] = b"trikey-keybox";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Wrong passphrase")]
    WrongPassphrase,

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Keybox error: {0}")]
    Keybox(#[from] KeyboxError),

    #[error("Keyset error: {0}")]
    Keyset(#[from] KeysetError),

    #[error("No keybox stored")]
    NoKeybox,

    #[error("Store lock poisoned")]
    Poisoned,
}

/// Lookup of app spending private keys by their public half.
pub trait AppKeyStore: Send + Sync {
    fn app_private_key(
        &self,
        public: &AppSpendingPublicKey,
    ) -> Result<Option<AppSpendingPrivateKey>, StoreError>;

    fn store_app_private_key(&self, key: &AppSpendingPrivateKey) -> Result<(), StoreError>;
}

pub struct KeyboxStore {
    conn: Mutex<Connection>,
    key: StoreKey,
}

type Kdf = fn(&str, &[u8]) -> Result<StoreKey, CryptoError>;

impl KeyboxStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: &Path, passphrase: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(conn, passphrase, StoreKey::derive)
    }

    pub fn open_in_memory(passphrase: &str) -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, passphrase, StoreKey::derive)
    }

    /// Same as [`KeyboxStore::open`] with a cheap KDF.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn open_insecure(path: Option<&Path>, passphrase: &str) -> Result<Self, StoreError> {
        let conn = match path {
            Some(path) => Connection::open(path)?,
            None => Connection::open_in_memory()?,
        };
        Self::init(conn, passphrase, StoreKey::derive_insecure)
    }

    fn init(conn: Connection, passphrase: &str, kdf: Kdf) -> Result<Self, StoreError> {
        migrate(&conn)?;

        let salt = match config_get(&conn, SALT_KEY)? {
            Some(hex_salt) => hex::decode(&hex_salt)
                .map_err(|e| StoreError::Corrupt(format!("salt: {}", e)))?,
            None => {
                let salt = generate_salt();
                config_set(&conn, SALT_KEY, &hex::encode(salt))?;
                salt.to_vec()
            }
        };
        let key = kdf(passphrase, &salt)?;

        match config_get(&conn, CHECK_KEY)? {
            Some(check) => {
                let bytes =
                    hex::decode(&check).map_err(|e| StoreError::Corrupt(format!("check: {}", e)))?;
                SealedSecret::from_bytes(&bytes)?
                    .open(&key)
                    .map_err(|_| StoreError::WrongPassphrase)?;
            }
            None => {
                let check = SealedSecret::seal(&key, CHECK_PLAINTEXT)?;
                config_set(&conn, CHECK_KEY, &hex::encode(check.to_bytes()))?;
            }
        }

        Ok(Self {
            conn: Mutex::new(conn),
            key,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Persist every keyset of `keybox`. Existing rows are updated, never removed.
    pub fn save_keybox(&self, keybox: &Keybox) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        write_keybox(&tx, keybox)?;
        tx.commit()?;
        log::debug!(
            "Saved keybox {} ({} inactive keysets)",
            keybox.account_id(),
            keybox.inactive().len()
        );
        Ok(())
    }

    pub fn load_keybox(&self) -> Result<Option<Keybox>, StoreError> {
        let conn = self.lock()?;
        read_keybox(&conn)
    }

    /// Atomically make `new_active` the active keyset and retire the old one.
    pub fn rotate_active_keyset(&self, new_active: SpendingKeyset) -> Result<Keybox, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let current = read_keybox(&tx)?.ok_or(StoreError::NoKeybox)?;
        let rotated = current.rotate(new_active)?;
        write_keybox(&tx, &rotated)?;
        tx.commit()?;

        log::info!(
            "Rotated active keyset {} -> {}",
            current.active().local_id(),
            rotated.active().local_id()
        );
        Ok(rotated)
    }
}

impl AppKeyStore for KeyboxStore {
    fn app_private_key(
        &self,
        public: &AppSpendingPublicKey,
    ) -> Result<Option<AppSpendingPrivateKey>, StoreError> {
        let sealed: Option<Vec<u8>> = {
            let conn = self.lock()?;
            conn.query_row(
                "SELECT sealed FROM app_keys WHERE public_key = ?1",
                params![public.to_string()],
                |row| row.get(0),
            )
            .optional()?
        };
        let Some(sealed) = sealed else {
            return Ok(None);
        };

        let plaintext = SealedSecret::from_bytes(&sealed)?.open(&self.key)?;
        let secret = std::str::from_utf8(&plaintext)
            .map_err(|_| StoreError::Corrupt("app key is not utf-8".into()))?;
        let key = AppSpendingPrivateKey::from_secret_str(secret)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        if &key.public_key() != public {
            return Err(StoreError::Corrupt(format!(
                "stored key does not match {}",
                public
            )));
        }
        Ok(Some(key))
    }

    fn store_app_private_key(&self, key: &AppSpendingPrivateKey) -> Result<(), StoreError> {
        let sealed = SealedSecret::seal(&self.key, key.expose_secret().as_bytes())?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO app_keys (public_key, sealed) VALUES (?1, ?2)
             ON CONFLICT(public_key) DO UPDATE SET sealed = excluded.sealed",
            params![key.public_key().to_string(), sealed.to_bytes()],
        )?;
        Ok(())
    }
}

fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS config (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS keysets (
            local_id      TEXT PRIMARY KEY,
            f8e_keyset_id TEXT NOT NULL,
            network       TEXT NOT NULL,
            app_key       TEXT NOT NULL,
            hardware_key  TEXT NOT NULL,
            server_key    TEXT NOT NULL,
            created_at    INTEGER NOT NULL,
            active        INTEGER NOT NULL DEFAULT 0,
            position      INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS app_keys (
            public_key TEXT PRIMARY KEY,
            sealed     BLOB NOT NULL
        );
        ",
    )
}

fn config_get(conn: &Connection, key: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT value FROM config WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
}

fn config_set(conn: &Connection, key: &str, value: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO config (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

fn upsert_keyset(
    conn: &Connection,
    keyset: &SpendingKeyset,
    active: bool,
    position: usize,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO keysets
            (local_id, f8e_keyset_id, network, app_key, hardware_key, server_key,
             created_at, active, position)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(local_id) DO UPDATE SET
            active = excluded.active,
            position = excluded.position",
        params![
            keyset.local_id(),
            keyset.f8e_keyset_id(),
            keyset.network().to_string(),
            keyset.app_key().to_string(),
            keyset.hardware_key().to_string(),
            keyset.server_key().to_string(),
            keyset.created_at() as i64,
            active,
            position as i64,
        ],
    )?;
    Ok(())
}

fn write_keybox(conn: &Connection, keybox: &Keybox) -> Result<(), StoreError> {
    if let Some(existing) = config_get(conn, ACCOUNT_KEY)? {
        if existing != keybox.account_id() {
            return Err(StoreError::Corrupt(format!(
                "store belongs to account {}, not {}",
                existing,
                keybox.account_id()
            )));
        }
    }
    config_set(conn, ACCOUNT_KEY, keybox.account_id())?;

    for (position, keyset) in keybox.inactive().iter().enumerate() {
        upsert_keyset(conn, keyset, false, position)?;
    }
    upsert_keyset(conn, keybox.active(), true, keybox.inactive().len())?;
    Ok(())
}

struct KeysetRow {
    local_id: String,
    f8e_keyset_id: String,
    network: String,
    app_key: String,
    hardware_key: String,
    server_key: String,
    created_at: i64,
    active: bool,
}

impl KeysetRow {
    fn into_keyset(self) -> Result<SpendingKeyset, StoreError> {
        let corrupt = |what: &str, e: &dyn std::fmt::Display| {
            StoreError::Corrupt(format!("keyset {} {}: {}", self.local_id, what, e))
        };
        let network = Network::from_str(&self.network).map_err(|e| corrupt("network", &e))?;
        let app_key = self
            .app_key
            .parse::<AppSpendingPublicKey>()
            .map_err(|e| corrupt("app key", &e))?;
        let hardware_key = self
            .hardware_key
            .parse::<HwSpendingPublicKey>()
            .map_err(|e| corrupt("hardware key", &e))?;
        let server_key = self
            .server_key
            .parse::<F8eSpendingPublicKey>()
            .map_err(|e| corrupt("server key", &e))?;

        Ok(SpendingKeyset::new(
            self.local_id.clone(),
            self.f8e_keyset_id.clone(),
            network,
            app_key,
            hardware_key,
            server_key,
            self.created_at.max(0) as u64,
        )?)
    }
}

fn read_keybox(conn: &Connection) -> Result<Option<Keybox>, StoreError> {
    let Some(account_id) = config_get(conn, ACCOUNT_KEY)? else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT local_id, f8e_keyset_id, network, app_key, hardware_key, server_key,
                created_at, active
         FROM keysets ORDER BY position",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok(KeysetRow {
                local_id: row.get(0)?,
                f8e_keyset_id: row.get(1)?,
                network: row.get(2)?,
                app_key: row.get(3)?,
                hardware_key: row.get(4)?,
                server_key: row.get(5)?,
                created_at: row.get(6)?,
                active: row.get(7)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut active = None;
    let mut inactive = Vec::new();
    for row in rows {
        let is_active = row.active;
        let keyset = row.into_keyset()?;
        if is_active {
            if active.is_some() {
                return Err(StoreError::Corrupt("more than one active keyset".into()));
            }
            active = Some(keyset);
        } else {
            inactive.push(keyset);
        }
    }

    let active = active.ok_or_else(|| StoreError::Corrupt("no active keyset".into()))?;
    Ok(Some(
        Keybox::new(account_id, active).with_inactive_keysets(inactive)?,
    ))
}

/// In-memory [`AppKeyStore`].
#[derive(Default)]
pub struct MemoryAppKeyStore {
    keys: Mutex<HashMap<String, AppSpendingPrivateKey>>,
}

impl MemoryAppKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AppKeyStore for MemoryAppKeyStore {
    fn app_private_key(
        &self,
        public: &AppSpendingPublicKey,
    ) -> Result<Option<AppSpendingPrivateKey>, StoreError> {
        let keys = self.keys.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(keys.get(&public.to_string()).cloned())
    }

    fn store_app_private_key(&self, key: &AppSpendingPrivateKey) -> Result<(), StoreError> {
        let mut keys = self.keys.lock().map_err(|_| StoreError::Poisoned)?;
        keys.insert(key.public_key().to_string(), key.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{app_keypair, keybox, keyset};
    use tempfile::NamedTempFile;

    fn temp_store(file: &NamedTempFile) -> KeyboxStore {
        KeyboxStore::open_insecure(Some(file.path()), "hunter2").expect("open store")
    }

    #[test]
    fn test_empty_store_has_no_keybox() {
        let store = KeyboxStore::open_insecure(None, "pw").unwrap();
        assert!(store.load_keybox().unwrap().is_none());
        assert!(matches!(
            store.rotate_active_keyset(keyset(1)),
            Err(StoreError::NoKeybox)
        ));
    }

    #[test]
    fn test_keybox_roundtrip() {
        let file = NamedTempFile::new().unwrap();
        let kb = keybox(3, &[1, 2]);
        temp_store(&file).save_keybox(&kb).unwrap();

        // Reopen
        let loaded = temp_store(&file).load_keybox().unwrap().unwrap();
        assert_eq!(loaded, kb);
    }

    #[test]
    fn test_rotate_is_persisted() {
        let file = NamedTempFile::new().unwrap();
        let store = temp_store(&file);
        store.save_keybox(&keybox(1, &[])).unwrap();

        let rotated = store.rotate_active_keyset(keyset(2)).unwrap();
        assert_eq!(rotated.active(), &keyset(2));

        let loaded = temp_store(&file).load_keybox().unwrap().unwrap();
        assert_eq!(loaded.active(), &keyset(2));
        assert_eq!(loaded.inactive(), &[keyset(1)]);
    }

    #[test]
    fn test_failed_rotation_leaves_store_untouched() {
        let store = KeyboxStore::open_insecure(None, "pw").unwrap();
        let kb = keybox(1, &[2]);
        store.save_keybox(&kb).unwrap();

        assert!(store.rotate_active_keyset(keyset(2)).is_err());
        assert_eq!(store.load_keybox().unwrap().unwrap(), kb);
    }

    #[test]
    fn test_wrong_passphrase_rejected() {
        let file = NamedTempFile::new().unwrap();
        drop(temp_store(&file));

        let result = KeyboxStore::open_insecure(Some(file.path()), "not-it");
        assert!(matches!(result, Err(StoreError::WrongPassphrase)));
    }

    #[test]
    fn test_app_key_sealed_roundtrip() {
        let file = NamedTempFile::new().unwrap();
        let pair = app_keypair(7);
        temp_store(&file).store_app_private_key(&pair.private).unwrap();

        let store = temp_store(&file);
        let loaded = store.app_private_key(&pair.public).unwrap().unwrap();
        assert_eq!(loaded, pair.private);
        assert!(store.app_private_key(&app_keypair(8).public).unwrap().is_none());
    }

    #[test]
    fn test_app_key_not_stored_in_clear() {
        let store = KeyboxStore::open_insecure(None, "pw").unwrap();
        let pair = app_keypair(7);
        store.store_app_private_key(&pair.private).unwrap();

        let conn = store.lock().unwrap();
        let blob: Vec<u8> = conn
            .query_row("SELECT sealed FROM app_keys", [], |row| row.get(0))
            .unwrap();
        let secret = pair.private.expose_secret();
        assert!(!blob
            .windows(secret.len())
            .any(|w| w == secret.as_bytes()));
    }

    #[test]
    fn test_memory_app_key_store() {
        let store = MemoryAppKeyStore::new();
        let pair = app_keypair(1);
        assert!(store.app_private_key(&pair.public).unwrap().is_none());
        store.store_app_private_key(&pair.private).unwrap();
        assert_eq!(store.app_private_key(&pair.public).unwrap(), Some(pair.private));
    }
}
