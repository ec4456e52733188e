//! Local at-rest vault storage.
//!
//! The entry list is serialized as one JSON array and stored as a single
//! XChaCha20-Poly1305 blob under the Argon2id-derived vault master key.
//! Unlock re-derives the key; lock zeroizes it.

use crate::crypto::{self, kdf};
use crate::sync::state::StateError;
use crate::{LatchkeyError, Result};
use chrono::{DateTime, Utc};
use rand::RngCore;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, RwLock};
use zeroize::Zeroize;

const VAULT: TableDefinition<&str, &[u8]> = TableDefinition::new("vault");

const KEY_VAULT_SALT: &str = "vault_salt";
const KEY_ENTRIES_BLOB: &str = "entries_blob";

/// A password entry. Identity is the stable 128-bit hex `id`, generated at
/// creation and unchanged across upserts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub id: String,
    pub website: String,
    pub username: String,
    pub password: String,
    pub notes: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl Entry {
    pub fn new(
        website: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        notes: impl Into<String>,
        tags: Vec<String>,
    ) -> Self {
        let mut raw = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut raw);

        Self {
            id: hex::encode(raw),
            website: website.into(),
            username: username.into(),
            password: password.into(),
            notes: notes.into(),
            tags,
            updated_at: Utc::now(),
        }
    }
}

/// The on-disk vault: one key-value database file shared with the sync
/// state store.
pub struct LocalVault {
    db: Arc<Database>,
    master_key: RwLock<Option<[u8; 32]>>,
}

impl LocalVault {
    /// Open or create the vault database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::create(path).map_err(|e| StateError::Database(e.into()))?;

        let txn = db.begin_write().map_err(StateError::from)?;
        txn.open_table(VAULT).map_err(StateError::from)?;
        txn.commit().map_err(StateError::from)?;

        Ok(Self {
            db: Arc::new(db),
            master_key: RwLock::new(None),
        })
    }

    /// The underlying database, shared with [`crate::SyncStateStore`].
    pub fn database(&self) -> Arc<Database> {
        Arc::clone(&self.db)
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let txn = self.db.begin_read().map_err(StateError::from)?;
        let table = txn.open_table(VAULT).map_err(StateError::from)?;
        let value = table
            .get(key)
            .map_err(StateError::from)?
            .map(|v| v.value().to_vec());
        Ok(value)
    }

    pub fn is_initialized(&self) -> bool {
        matches!(self.get(KEY_VAULT_SALT), Ok(Some(_)))
    }

    /// First-time setup: store a fresh salt and an encrypted empty entry
    /// list. The vault stays locked.
    pub fn initialize(&self, master_password: &str) -> Result<()> {
        if self.is_initialized() {
            return Err(LatchkeyError::InvalidInput(
                "vault is already initialized".to_string(),
            ));
        }

        let salt = kdf::generate_salt();
        let mut key = kdf::derive_vault_master_key(master_password, &salt)?;

        let empty = serde_json::to_vec(&Vec::<Entry>::new())
            .map_err(|e| LatchkeyError::InvalidInput(e.to_string()))?;
        let blob = crypto::seal(&key, &empty)?;
        key.zeroize();

        let txn = self.db.begin_write().map_err(StateError::from)?;
        {
            let mut table = txn.open_table(VAULT).map_err(StateError::from)?;
            table
                .insert(KEY_VAULT_SALT, salt.as_slice())
                .map_err(StateError::from)?;
            table
                .insert(KEY_ENTRIES_BLOB, blob.as_slice())
                .map_err(StateError::from)?;
        }
        txn.commit().map_err(StateError::from)?;
        Ok(())
    }

    /// Unlock with the master password and return the decrypted entries.
    /// The derived key stays in memory until [`Self::lock`].
    pub fn unlock(&self, master_password: &str) -> Result<Vec<Entry>> {
        let salt_raw = self
            .get(KEY_VAULT_SALT)?
            .ok_or_else(|| LatchkeyError::InvalidInput("vault is not initialized".to_string()))?;
        let salt: [u8; kdf::SALT_LEN] =
            salt_raw
                .as_slice()
                .try_into()
                .map_err(|_| StateError::InvalidRecord {
                    field: "vault_salt",
                    expected: kdf::SALT_LEN,
                    got: salt_raw.len(),
                })?;
        let blob = self
            .get(KEY_ENTRIES_BLOB)?
            .ok_or_else(|| LatchkeyError::InvalidInput("vault is not initialized".to_string()))?;

        let key = kdf::derive_vault_master_key(master_password, &salt)?;
        let plaintext = crypto::open(&key, &blob)?;
        let entries: Vec<Entry> = serde_json::from_slice(&plaintext)
            .map_err(|e| LatchkeyError::InvalidInput(format!("corrupt vault blob: {}", e)))?;

        *self
            .master_key
            .write()
            .map_err(|_| LatchkeyError::LockPoisoned("vault master key"))? = Some(key);

        Ok(entries)
    }

    /// Zeroize and drop the in-memory master key.
    pub fn lock(&self) {
        if let Ok(mut guard) = self.master_key.write() {
            if let Some(mut key) = guard.take() {
                key.zeroize();
            }
        }
    }

    pub fn is_unlocked(&self) -> bool {
        self.master_key
            .read()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }

    /// A copy of the master key for wiring up the sync state store.
    pub fn master_key(&self) -> Result<[u8; 32]> {
        self.master_key
            .read()
            .map_err(|_| LatchkeyError::LockPoisoned("vault master key"))?
            .ok_or(LatchkeyError::VaultLocked)
    }

    /// Re-encrypt and persist the whole entry list.
    pub fn save_entries(&self, entries: &[Entry]) -> Result<()> {
        let key = self.master_key()?;

        let plaintext =
            serde_json::to_vec(entries).map_err(|e| LatchkeyError::InvalidInput(e.to_string()))?;
        let blob = crypto::seal(&key, &plaintext)?;

        let txn = self.db.begin_write().map_err(StateError::from)?;
        {
            let mut table = txn.open_table(VAULT).map_err(StateError::from)?;
            table
                .insert(KEY_ENTRIES_BLOB, blob.as_slice())
                .map_err(StateError::from)?;
        }
        txn.commit().map_err(StateError::from)?;
        Ok(())
    }

    /// Decrypt and return the current entry list.
    pub fn entries(&self) -> Result<Vec<Entry>> {
        let key = self.master_key()?;
        let blob = self
            .get(KEY_ENTRIES_BLOB)?
            .ok_or_else(|| LatchkeyError::InvalidInput("vault is not initialized".to_string()))?;

        let plaintext = crypto::open(&key, &blob)?;
        serde_json::from_slice(&plaintext)
            .map_err(|e| LatchkeyError::InvalidInput(format!("corrupt vault blob: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault() -> (LocalVault, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let vault = LocalVault::open(dir.path().join("vault.redb")).unwrap();
        (vault, dir)
    }

    #[test]
    fn entry_ids_are_128_bit_hex() {
        let e = Entry::new("example.com", "alice", "pw", "", vec![]);
        assert_eq!(e.id.len(), 32);
        assert!(e.id.bytes().all(|b| b.is_ascii_hexdigit()));

        let f = Entry::new("example.com", "alice", "pw", "", vec![]);
        assert_ne!(e.id, f.id);
    }

    #[test]
    fn initialize_unlock_save_roundtrip() {
        let (vault, _dir) = vault();
        assert!(!vault.is_initialized());

        vault.initialize("master password").unwrap();
        assert!(vault.is_initialized());
        assert!(!vault.is_unlocked());

        let entries = vault.unlock("master password").unwrap();
        assert!(entries.is_empty());
        assert!(vault.is_unlocked());

        let entry = Entry::new("example.com", "alice", "hunter2", "note", vec!["work".into()]);
        vault.save_entries(&[entry.clone()]).unwrap();

        let loaded = vault.entries().unwrap();
        assert_eq!(loaded, vec![entry]);
    }

    #[test]
    fn wrong_password_fails_to_unlock() {
        let (vault, _dir) = vault();
        vault.initialize("right password").unwrap();

        assert!(vault.unlock("wrong password").is_err());
        assert!(!vault.is_unlocked());
    }

    #[test]
    fn double_initialize_rejected() {
        let (vault, _dir) = vault();
        vault.initialize("pw").unwrap();
        assert!(matches!(
            vault.initialize("pw"),
            Err(LatchkeyError::InvalidInput(_))
        ));
    }

    #[test]
    fn locked_vault_refuses_key_dependent_calls() {
        let (vault, _dir) = vault();
        vault.initialize("pw").unwrap();
        vault.unlock("pw").unwrap();
        vault.lock();

        assert!(!vault.is_unlocked());
        assert!(matches!(
            vault.master_key(),
            Err(LatchkeyError::VaultLocked)
        ));
        assert!(matches!(
            vault.save_entries(&[]),
            Err(LatchkeyError::VaultLocked)
        ));
        assert!(matches!(vault.entries(), Err(LatchkeyError::VaultLocked)));

        // The store is untouched: unlocking again still works.
        let entries = vault.unlock("pw").unwrap();
        assert!(entries.is_empty());
    }
}
