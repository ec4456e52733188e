//! Transactional sync state over the key-value database.
//!
//! Five logical buckets, one redb table each: `sync_meta` (scalars),
//! `sync_members` (verified members), `sync_event_heads` (fixed 40-byte
//! counter+hash records), `sync_pending` (encrypted queued mutations), and
//! `entry_schemes`. Secret material (private keys, the vault key, pending
//! entries) is sealed under the vault master key before it touches disk;
//! public keys, hashes, and cursors are stored in clear.
//!
//! Every mutation is a single write transaction.

use crate::crypto::{self, cipher::EntryScheme, CryptoError};
use crate::sync::device::DeviceKeys;
use crate::sync::models::{base64_bytes, DeviceId, Op, WireError};
use crate::vault::Entry;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;
use zeroize::Zeroize;

const SYNC_META: TableDefinition<&str, &[u8]> = TableDefinition::new("sync_meta");
const SYNC_MEMBERS: TableDefinition<&str, &[u8]> = TableDefinition::new("sync_members");
const SYNC_EVENT_HEADS: TableDefinition<&str, &[u8]> = TableDefinition::new("sync_event_heads");
const SYNC_PENDING: TableDefinition<&str, &[u8]> = TableDefinition::new("sync_pending");
const ENTRY_SCHEMES: TableDefinition<&str, &[u8]> = TableDefinition::new("entry_schemes");

const KEY_VAULT_ID: &str = "vault_id";
const KEY_DEVICE_ID: &str = "device_id";
const KEY_PUBKEY_SIGN: &str = "pubkey_sign";
const KEY_PRIVKEY_SIGN_ENC: &str = "privkey_sign_enc";
const KEY_PUBKEY_BOX: &str = "pubkey_box";
const KEY_PRIVKEY_BOX_ENC: &str = "privkey_box_enc";
const KEY_VAULT_KEY_ENC: &str = "vault_key_enc";
const KEY_KEY_EPOCH: &str = "key_epoch";
const KEY_OWNER_DEVICE_ID: &str = "owner_device_id";
const KEY_MEMBER_SEQ: &str = "member_seq";
const KEY_MEMBER_HEAD_HASH: &str = "member_head_hash";
const KEY_SYNC_CURSOR: &str = "sync_cursor";
const KEY_LAMPORT: &str = "lamport";
const KEY_SERVER_URL: &str = "server_url";

/// Errors from the sync state store.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("{0} is not set")]
    Missing(&'static str),

    #[error("invalid stored {field}: expected {expected} bytes, got {got}")]
    InvalidRecord {
        field: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("entry id is required")]
    MissingEntryId,

    #[error("database error: {0}")]
    Database(#[from] redb::Error),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("invalid wire data: {0}")]
    Wire(#[from] WireError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<redb::TransactionError> for StateError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Database(e.into())
    }
}

impl From<redb::TableError> for StateError {
    fn from(e: redb::TableError) -> Self {
        Self::Database(e.into())
    }
}

impl From<redb::StorageError> for StateError {
    fn from(e: redb::StorageError) -> Self {
        Self::Database(e.into())
    }
}

impl From<redb::CommitError> for StateError {
    fn from(e: redb::CommitError) -> Self {
        Self::Database(e.into())
    }
}

/// The cached head of the membership ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MembershipHead {
    pub member_seq: u64,
    pub member_head_hash: [u8; 32],
}

/// The cached head of our own per-device event chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventHead {
    pub last_counter: u64,
    pub last_hash: [u8; 32],
}

/// A device admitted through a validated membership event; its signing key
/// is trusted for event verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifiedMember {
    pub device_id: DeviceId,
    #[serde(with = "base64_bytes")]
    pub pubkey_sign: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub pubkey_box: Vec<u8>,
    pub key_epoch: u64,
}

/// A mutation that failed to push, queued for retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingEntry {
    pub op: Op,
    pub entry: Entry,
}

/// Transactional, encrypted-at-rest persistence of replication state.
pub struct SyncStateStore {
    db: Arc<Database>,
    master_key: [u8; 32],
}

impl Drop for SyncStateStore {
    fn drop(&mut self) {
        self.master_key.zeroize();
    }
}

fn u64_record(field: &'static str, bytes: &[u8]) -> Result<u64, StateError> {
    let arr: [u8; 8] = bytes.try_into().map_err(|_| StateError::InvalidRecord {
        field,
        expected: 8,
        got: bytes.len(),
    })?;
    Ok(u64::from_be_bytes(arr))
}

impl SyncStateStore {
    /// Open the store over an existing database, sealing secrets under the
    /// given vault master key. Creates missing buckets.
    pub fn new(db: Arc<Database>, master_key: [u8; 32]) -> Result<Self, StateError> {
        let txn = db.begin_write()?;
        {
            txn.open_table(SYNC_META)?;
            txn.open_table(SYNC_MEMBERS)?;
            txn.open_table(SYNC_EVENT_HEADS)?;
            txn.open_table(SYNC_PENDING)?;
            txn.open_table(ENTRY_SCHEMES)?;
        }
        txn.commit()?;

        Ok(Self { db, master_key })
    }

    fn get(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> Result<Option<Vec<u8>>, StateError> {
        let txn = self.db.begin_read()?;
        let t = txn.open_table(table)?;
        Ok(t.get(key)?.map(|v| v.value().to_vec()))
    }

    fn put(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
        value: &[u8],
    ) -> Result<(), StateError> {
        let txn = self.db.begin_write()?;
        {
            let mut t = txn.open_table(table)?;
            t.insert(key, value)?;
        }
        txn.commit()?;
        Ok(())
    }

    fn delete(&self, table: TableDefinition<&str, &[u8]>, key: &str) -> Result<(), StateError> {
        let txn = self.db.begin_write()?;
        {
            let mut t = txn.open_table(table)?;
            t.remove(key)?;
        }
        txn.commit()?;
        Ok(())
    }

    fn clear_table(&self, table: TableDefinition<&str, &[u8]>) -> Result<(), StateError> {
        let txn = self.db.begin_write()?;
        {
            let mut t = txn.open_table(table)?;
            let keys: Vec<String> = t
                .iter()?
                .map(|item| item.map(|(k, _)| k.value().to_string()))
                .collect::<Result<_, _>>()?;
            for key in keys {
                t.remove(key.as_str())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Whether sync has been set up on this device.
    pub fn is_configured(&self) -> bool {
        matches!(self.get(SYNC_META, KEY_VAULT_ID), Ok(Some(_)))
            && matches!(self.get(SYNC_META, KEY_DEVICE_ID), Ok(Some(_)))
    }

    pub fn vault_id(&self) -> Result<Uuid, StateError> {
        let data = self
            .get(SYNC_META, KEY_VAULT_ID)?
            .ok_or(StateError::Missing("vault_id"))?;
        let arr: [u8; 16] = data
            .as_slice()
            .try_into()
            .map_err(|_| StateError::InvalidRecord {
                field: "vault_id",
                expected: 16,
                got: data.len(),
            })?;
        Ok(Uuid::from_bytes(arr))
    }

    pub fn set_vault_id(&self, vault_id: &Uuid) -> Result<(), StateError> {
        self.put(SYNC_META, KEY_VAULT_ID, vault_id.as_bytes())
    }

    /// Load the device identity, decrypting private keys with the master
    /// key.
    pub fn device_keys(&self) -> Result<DeviceKeys, StateError> {
        let device_id_raw = self
            .get(SYNC_META, KEY_DEVICE_ID)?
            .ok_or(StateError::Missing("device_id"))?;
        let device_id = DeviceId::parse(&String::from_utf8_lossy(&device_id_raw))?;

        let pubkey_sign = self.fixed_scalar::<32>(KEY_PUBKEY_SIGN, "pubkey_sign")?;
        let pubkey_box = self.fixed_scalar::<32>(KEY_PUBKEY_BOX, "pubkey_box")?;
        let privkey_sign = self.sealed_scalar::<32>(KEY_PRIVKEY_SIGN_ENC, "privkey_sign")?;
        let privkey_box = self.sealed_scalar::<32>(KEY_PRIVKEY_BOX_ENC, "privkey_box")?;

        Ok(DeviceKeys::from_parts(
            device_id,
            pubkey_sign,
            privkey_sign,
            pubkey_box,
            privkey_box,
        ))
    }

    /// Persist the device identity, sealing private keys with the master
    /// key.
    pub fn set_device_keys(&self, keys: &DeviceKeys) -> Result<(), StateError> {
        let privkey_sign_enc = crypto::seal(&self.master_key, keys.privkey_sign_bytes())?;
        let privkey_box_enc = crypto::seal(&self.master_key, keys.privkey_box_bytes())?;

        let txn = self.db.begin_write()?;
        {
            let mut t = txn.open_table(SYNC_META)?;
            t.insert(KEY_DEVICE_ID, keys.device_id.as_str().as_bytes())?;
            t.insert(KEY_PUBKEY_SIGN, keys.pubkey_sign.as_slice())?;
            t.insert(KEY_PRIVKEY_SIGN_ENC, privkey_sign_enc.as_slice())?;
            t.insert(KEY_PUBKEY_BOX, keys.pubkey_box.as_slice())?;
            t.insert(KEY_PRIVKEY_BOX_ENC, privkey_box_enc.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    fn fixed_scalar<const N: usize>(
        &self,
        key: &'static str,
        field: &'static str,
    ) -> Result<[u8; N], StateError> {
        let data = self.get(SYNC_META, key)?.ok_or(StateError::Missing(field))?;
        data.as_slice()
            .try_into()
            .map_err(|_| StateError::InvalidRecord {
                field,
                expected: N,
                got: data.len(),
            })
    }

    fn sealed_scalar<const N: usize>(
        &self,
        key: &'static str,
        field: &'static str,
    ) -> Result<[u8; N], StateError> {
        let blob = self.get(SYNC_META, key)?.ok_or(StateError::Missing(field))?;
        let plain = crypto::open(&self.master_key, &blob)?;
        plain
            .as_slice()
            .try_into()
            .map_err(|_| StateError::InvalidRecord {
                field,
                expected: N,
                got: plain.len(),
            })
    }

    pub fn vault_key(&self) -> Result<[u8; 32], StateError> {
        self.sealed_scalar::<32>(KEY_VAULT_KEY_ENC, "vault_key")
    }

    pub fn set_vault_key(&self, vault_key: &[u8; 32]) -> Result<(), StateError> {
        let sealed = crypto::seal(&self.master_key, vault_key)?;
        self.put(SYNC_META, KEY_VAULT_KEY_ENC, &sealed)
    }

    pub fn key_epoch(&self) -> Result<u64, StateError> {
        match self.get(SYNC_META, KEY_KEY_EPOCH)? {
            Some(data) => u64_record("key_epoch", &data),
            None => Ok(0),
        }
    }

    pub fn set_key_epoch(&self, epoch: u64) -> Result<(), StateError> {
        self.put(SYNC_META, KEY_KEY_EPOCH, &epoch.to_be_bytes())
    }

    pub fn owner_device_id(&self) -> Result<Option<DeviceId>, StateError> {
        match self.get(SYNC_META, KEY_OWNER_DEVICE_ID)? {
            Some(data) => Ok(Some(DeviceId::parse(&String::from_utf8_lossy(&data))?)),
            None => Ok(None),
        }
    }

    pub fn set_owner_device_id(&self, device_id: &DeviceId) -> Result<(), StateError> {
        self.put(SYNC_META, KEY_OWNER_DEVICE_ID, device_id.as_str().as_bytes())
    }

    pub fn membership_head(&self) -> Result<MembershipHead, StateError> {
        let mut head = MembershipHead::default();
        if let Some(data) = self.get(SYNC_META, KEY_MEMBER_SEQ)? {
            head.member_seq = u64_record("member_seq", &data)?;
        }
        if let Some(data) = self.get(SYNC_META, KEY_MEMBER_HEAD_HASH)? {
            head.member_head_hash =
                data.as_slice()
                    .try_into()
                    .map_err(|_| StateError::InvalidRecord {
                        field: "member_head_hash",
                        expected: 32,
                        got: data.len(),
                    })?;
        }
        Ok(head)
    }

    pub fn set_membership_head(&self, head: &MembershipHead) -> Result<(), StateError> {
        let txn = self.db.begin_write()?;
        {
            let mut t = txn.open_table(SYNC_META)?;
            t.insert(KEY_MEMBER_SEQ, head.member_seq.to_be_bytes().as_slice())?;
            t.insert(KEY_MEMBER_HEAD_HASH, head.member_head_hash.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Read a device's event-chain head. Zero when the device has never
    /// authored an event (the seeding trigger).
    pub fn event_head(&self, device_id: &DeviceId) -> Result<EventHead, StateError> {
        match self.get(SYNC_EVENT_HEADS, device_id.as_str())? {
            Some(data) if data.len() == 40 => {
                let mut head = EventHead::default();
                head.last_counter = u64_record("event_head", &data[..8])?;
                head.last_hash.copy_from_slice(&data[8..40]);
                Ok(head)
            }
            Some(data) => Err(StateError::InvalidRecord {
                field: "event_head",
                expected: 40,
                got: data.len(),
            }),
            None => Ok(EventHead::default()),
        }
    }

    pub fn set_event_head(&self, device_id: &DeviceId, head: &EventHead) -> Result<(), StateError> {
        let mut record = [0u8; 40];
        record[..8].copy_from_slice(&head.last_counter.to_be_bytes());
        record[8..].copy_from_slice(&head.last_hash);
        self.put(SYNC_EVENT_HEADS, device_id.as_str(), &record)
    }

    pub fn clear_event_heads(&self) -> Result<(), StateError> {
        self.clear_table(SYNC_EVENT_HEADS)
    }

    pub fn sync_cursor(&self) -> Result<u64, StateError> {
        match self.get(SYNC_META, KEY_SYNC_CURSOR)? {
            Some(data) => u64_record("sync_cursor", &data),
            None => Ok(0),
        }
    }

    pub fn set_sync_cursor(&self, cursor: u64) -> Result<(), StateError> {
        self.put(SYNC_META, KEY_SYNC_CURSOR, &cursor.to_be_bytes())
    }

    pub fn lamport(&self) -> Result<u64, StateError> {
        match self.get(SYNC_META, KEY_LAMPORT)? {
            Some(data) => u64_record("lamport", &data),
            None => Ok(0),
        }
    }

    /// Atomically advance the Lamport clock by one and return the new
    /// value. Used for every outbound event.
    pub fn increment_lamport(&self) -> Result<u64, StateError> {
        self.bump_lamport(|current| current + 1)
    }

    /// Atomically advance the Lamport clock past an observed value:
    /// `new = max(current, observed) + 1`.
    pub fn update_lamport(&self, observed: u64) -> Result<u64, StateError> {
        self.bump_lamport(|current| current.max(observed) + 1)
    }

    fn bump_lamport(&self, next: impl FnOnce(u64) -> u64) -> Result<u64, StateError> {
        let txn = self.db.begin_write()?;
        let new_lamport;
        {
            let mut t = txn.open_table(SYNC_META)?;
            let current = match t.get(KEY_LAMPORT)? {
                Some(v) => u64_record("lamport", v.value())?,
                None => 0,
            };
            new_lamport = next(current);
            t.insert(KEY_LAMPORT, new_lamport.to_be_bytes().as_slice())?;
        }
        txn.commit()?;
        Ok(new_lamport)
    }

    pub fn server_url(&self) -> Result<Option<String>, StateError> {
        Ok(self
            .get(SYNC_META, KEY_SERVER_URL)?
            .map(|data| String::from_utf8_lossy(&data).into_owned()))
    }

    pub fn set_server_url(&self, url: &str) -> Result<(), StateError> {
        self.put(SYNC_META, KEY_SERVER_URL, url.as_bytes())
    }

    pub fn verified_members(&self) -> Result<Vec<VerifiedMember>, StateError> {
        let txn = self.db.begin_read()?;
        let t = txn.open_table(SYNC_MEMBERS)?;
        let mut members = Vec::new();
        for item in t.iter()? {
            let (_, value) = item?;
            members.push(serde_json::from_slice(value.value())?);
        }
        Ok(members)
    }

    pub fn verified_member(
        &self,
        device_id: &DeviceId,
    ) -> Result<Option<VerifiedMember>, StateError> {
        match self.get(SYNC_MEMBERS, device_id.as_str())? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    pub fn set_verified_member(&self, member: &VerifiedMember) -> Result<(), StateError> {
        let data = serde_json::to_vec(member)?;
        self.put(SYNC_MEMBERS, member.device_id.as_str(), &data)
    }

    pub fn remove_verified_member(&self, device_id: &DeviceId) -> Result<(), StateError> {
        self.delete(SYNC_MEMBERS, device_id.as_str())
    }

    pub fn clear_verified_members(&self) -> Result<(), StateError> {
        self.clear_table(SYNC_MEMBERS)
    }

    /// Queue a failed mutation for retry, sealed under the master key.
    pub fn add_pending(&self, op: Op, entry: &Entry) -> Result<(), StateError> {
        if entry.id.is_empty() {
            return Err(StateError::MissingEntryId);
        }
        let record = serde_json::to_vec(&PendingEntry {
            op,
            entry: entry.clone(),
        })?;
        let sealed = crypto::seal(&self.master_key, &record)?;
        self.put(SYNC_PENDING, &entry.id, &sealed)
    }

    pub fn remove_pending(&self, entry_id: &str) -> Result<(), StateError> {
        if entry_id.is_empty() {
            return Ok(());
        }
        self.delete(SYNC_PENDING, entry_id)
    }

    pub fn pending_entries(&self) -> Result<Vec<PendingEntry>, StateError> {
        let txn = self.db.begin_read()?;
        let t = txn.open_table(SYNC_PENDING)?;
        let mut pending = Vec::new();
        for item in t.iter()? {
            let (_, value) = item?;
            let plain = crypto::open(&self.master_key, value.value())?;
            pending.push(serde_json::from_slice(&plain)?);
        }
        Ok(pending)
    }

    pub fn clear_pending(&self) -> Result<(), StateError> {
        self.clear_table(SYNC_PENDING)
    }

    pub fn entry_scheme(&self, entry_id: &str) -> Result<Option<EntryScheme>, StateError> {
        Ok(self
            .get(ENTRY_SCHEMES, entry_id)?
            .map(|data| EntryScheme::parse(&String::from_utf8_lossy(&data))))
    }

    pub fn set_entry_scheme(&self, entry_id: &str, scheme: EntryScheme) -> Result<(), StateError> {
        self.put(ENTRY_SCHEMES, entry_id, scheme.as_str().as_bytes())
    }

    pub fn remove_entry_scheme(&self, entry_id: &str) -> Result<(), StateError> {
        self.delete(ENTRY_SCHEMES, entry_id)
    }

    /// Delete all per-vault scalars. Device identity and the server URL
    /// survive so the device can re-create or re-join.
    pub fn clear_vault_state(&self) -> Result<(), StateError> {
        let txn = self.db.begin_write()?;
        {
            let mut t = txn.open_table(SYNC_META)?;
            for key in [
                KEY_VAULT_ID,
                KEY_VAULT_KEY_ENC,
                KEY_KEY_EPOCH,
                KEY_OWNER_DEVICE_ID,
                KEY_MEMBER_SEQ,
                KEY_MEMBER_HEAD_HASH,
                KEY_SYNC_CURSOR,
                KEY_LAMPORT,
            ] {
                t.remove(key)?;
            }
        }
        txn.commit()?;
        Ok(())
    }
}
