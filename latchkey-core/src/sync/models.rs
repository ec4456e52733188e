//! Wire types for the coordination relay.
//!
//! JSON conventions: binary fields are standard base64 strings, UUIDs are
//! canonical hyphenated hex, and `u64` values that may exceed 2^53 travel
//! as decimal strings. Byte-length invariants are enforced before any
//! signed byte-sequence is recomputed.

use crate::sync::wire::{self, DEVICE_ID_LEN, HASH_LEN, PUBKEY_LEN, SIG_LEN};
use crate::vault::Entry;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

pub const MSG_TYPE_MEMBER_ADD: &str = "member_add";
pub const MSG_TYPE_MEMBER_REMOVE: &str = "member_remove";
pub const MSG_TYPE_INVITE: &str = "invite";
pub const MSG_TYPE_INVITE_CLAIM: &str = "invite_claim";
pub const MSG_TYPE_EVENT: &str = "event";

/// Errors raised while validating or canonicalizing wire data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("invalid {field} length: expected {expected} bytes, got {got}")]
    InvalidLength {
        field: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("invalid device id: {0}")]
    InvalidDeviceId(String),

    #[error("device id does not match signing key")]
    DeviceIdMismatch,

    #[error("signature verification failed")]
    InvalidSignature,

    #[error("unknown message type: {0}")]
    UnknownMessageType(String),
}

fn to_arr<const N: usize>(field: &'static str, bytes: &[u8]) -> Result<[u8; N], WireError> {
    bytes.try_into().map_err(|_| WireError::InvalidLength {
        field,
        expected: N,
        got: bytes.len(),
    })
}

fn u64_is_zero(v: &u64) -> bool {
    *v == 0
}

/// A device identifier: 64 lowercase hex characters, the SHA-256 of the
/// device's Ed25519 verifying key. Validated on every parse.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId(String);

impl DeviceId {
    /// Parse and validate a device id string.
    pub fn parse(s: &str) -> Result<Self, WireError> {
        if s.len() != 64 || !s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(WireError::InvalidDeviceId(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    /// Derive the device id from an Ed25519 verifying key.
    pub fn from_signing_pubkey(pubkey_sign: &[u8; PUBKEY_LEN]) -> Self {
        Self(hex::encode(Sha256::digest(pubkey_sign)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The 32 raw bytes behind the hex form.
    pub fn to_bytes(&self) -> Result<[u8; DEVICE_ID_LEN], WireError> {
        let raw = hex::decode(&self.0)
            .map_err(|_| WireError::InvalidDeviceId(self.0.clone()))?;
        to_arr("device_id", &raw)
    }
}

impl TryFrom<String> for DeviceId {
    type Error = WireError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A device's publicly announced identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceBundle {
    pub device_id: DeviceId,
    #[serde(with = "base64_bytes")]
    pub device_pubkey_sign: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub device_pubkey_box: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub device_bundle_sig: Vec<u8>,
}

impl DeviceBundle {
    /// The signing public key as a fixed array.
    pub fn pubkey_sign_array(&self) -> Result<[u8; PUBKEY_LEN], WireError> {
        to_arr("device_pubkey_sign", &self.device_pubkey_sign)
    }

    /// The box public key as a fixed array.
    pub fn pubkey_box_array(&self) -> Result<[u8; PUBKEY_LEN], WireError> {
        to_arr("device_pubkey_box", &self.device_pubkey_box)
    }

    /// The bundle self-signature as a fixed array.
    pub fn bundle_sig_array(&self) -> Result<[u8; SIG_LEN], WireError> {
        to_arr("device_bundle_sig", &self.device_bundle_sig)
    }

    /// Check the bundle invariants: key lengths, device id derived from the
    /// signing key, and a valid self-signature.
    pub fn verify(&self) -> Result<(), WireError> {
        let pubkey_sign: [u8; PUBKEY_LEN] = to_arr("device_pubkey_sign", &self.device_pubkey_sign)?;
        let pubkey_box: [u8; PUBKEY_LEN] = to_arr("device_pubkey_box", &self.device_pubkey_box)?;
        let sig: [u8; SIG_LEN] = to_arr("device_bundle_sig", &self.device_bundle_sig)?;

        if self.device_id != DeviceId::from_signing_pubkey(&pubkey_sign) {
            return Err(WireError::DeviceIdMismatch);
        }

        let signed = wire::device_bundle_bytes(&self.device_id.to_bytes()?, &pubkey_sign, &pubkey_box);
        let key = VerifyingKey::from_bytes(&pubkey_sign).map_err(|_| WireError::InvalidSignature)?;
        key.verify(&signed, &Signature::from_bytes(&sig))
            .map_err(|_| WireError::InvalidSignature)
    }
}

/// An entry on the hash-chained membership ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberEvent {
    pub msg_type: String,
    pub member_event_id: Uuid,
    pub vault_id: Uuid,
    #[serde(with = "u64_string")]
    pub member_seq: u64,
    #[serde(with = "base64_bytes")]
    pub prev_hash: Vec<u8>,
    pub actor_device_id: DeviceId,
    pub subject_device_id: DeviceId,
    #[serde(with = "base64_bytes")]
    pub subject_pubkey_sign: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub subject_pubkey_box: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub subject_bundle_sig: Vec<u8>,
    pub invite_id: Uuid,
    #[serde(with = "base64_bytes")]
    pub claim_sig: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub signature: Vec<u8>,
}

impl MemberEvent {
    /// Recompute the canonical signed byte-sequence for this ledger entry.
    pub fn signed_bytes(&self) -> Result<Vec<u8>, WireError> {
        let prev_hash: [u8; HASH_LEN] = to_arr("prev_hash", &self.prev_hash)?;
        let actor = self.actor_device_id.to_bytes()?;
        let subject = self.subject_device_id.to_bytes()?;

        match self.msg_type.as_str() {
            MSG_TYPE_MEMBER_ADD => Ok(wire::member_add_bytes(
                &self.member_event_id,
                &self.vault_id,
                self.member_seq,
                &prev_hash,
                &actor,
                &subject,
                &self.invite_id,
                &to_arr("claim_sig", &self.claim_sig)?,
                &to_arr("subject_bundle_sig", &self.subject_bundle_sig)?,
                &to_arr("subject_pubkey_sign", &self.subject_pubkey_sign)?,
                &to_arr("subject_pubkey_box", &self.subject_pubkey_box)?,
            )),
            MSG_TYPE_MEMBER_REMOVE => Ok(wire::member_remove_bytes(
                &self.member_event_id,
                &self.vault_id,
                self.member_seq,
                &prev_hash,
                &actor,
                &subject,
            )),
            other => Err(WireError::UnknownMessageType(other.to_string())),
        }
    }
}

/// A signed invitation carrying the vault key sealed to the target device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invite {
    pub msg_type: String,
    pub invite_id: Uuid,
    pub vault_id: Uuid,
    pub target_device_id: DeviceId,
    #[serde(with = "base64_bytes")]
    pub target_device_pubkey_sign: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub target_device_pubkey_box: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub target_device_bundle_sig: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub nonce: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub wrapped_payload: Vec<u8>,
    pub created_by_device_id: DeviceId,
    pub single_use: bool,
    #[serde(with = "base64_bytes")]
    pub signature: Vec<u8>,
}

impl Invite {
    /// Recompute the canonical signed byte-sequence for this invite.
    pub fn signed_bytes(&self) -> Result<Vec<u8>, WireError> {
        Ok(wire::invite_bytes(
            &self.invite_id,
            &self.vault_id,
            &self.target_device_id.to_bytes()?,
            &to_arr("target_device_pubkey_sign", &self.target_device_pubkey_sign)?,
            &to_arr("target_device_pubkey_box", &self.target_device_pubkey_box)?,
            &to_arr("target_device_bundle_sig", &self.target_device_bundle_sig)?,
            &to_arr("nonce", &self.nonce)?,
            &self.wrapped_payload,
            &self.created_by_device_id.to_bytes()?,
            self.single_use,
        ))
    }
}

/// A claimant's proof of possession of an invited device's signing key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InviteClaim {
    pub msg_type: String,
    pub invite_id: Uuid,
    pub vault_id: Uuid,
    pub device_id: DeviceId,
    #[serde(with = "base64_bytes")]
    pub signature: Vec<u8>,
}

impl InviteClaim {
    /// Recompute the canonical signed byte-sequence for this claim.
    pub fn signed_bytes(&self) -> Result<Vec<u8>, WireError> {
        Ok(wire::invite_claim_bytes(
            &self.invite_id,
            &self.vault_id,
            &self.device_id.to_bytes()?,
        ))
    }
}

/// One encrypted mutation on a device's per-device chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub msg_type: String,
    pub event_id: Uuid,
    pub vault_id: Uuid,
    pub device_id: DeviceId,
    #[serde(with = "u64_string")]
    pub counter: u64,
    #[serde(with = "u64_string")]
    pub lamport: u64,
    #[serde(with = "u64_string")]
    pub key_epoch: u64,
    #[serde(with = "base64_bytes")]
    pub prev_hash: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub nonce: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub signature: Vec<u8>,
    /// Relay-assigned per-vault sequence. Present on pulled events, absent
    /// on push bodies; used only as the pull cursor.
    #[serde(with = "u64_string", default, skip_serializing_if = "u64_is_zero")]
    pub seq: u64,
}

impl Event {
    /// Recompute the canonical signed byte-sequence for this event. The
    /// relay-assigned `seq` is not part of the signed region.
    pub fn signed_bytes(&self) -> Result<Vec<u8>, WireError> {
        Ok(wire::event_bytes(
            &self.event_id,
            &self.vault_id,
            &self.device_id.to_bytes()?,
            self.counter,
            self.lamport,
            self.key_epoch,
            &to_arr("prev_hash", &self.prev_hash)?,
            &to_arr("nonce", &self.nonce)?,
            &self.ciphertext,
        ))
    }
}

/// The operation carried inside an event payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Op {
    Upsert,
    Delete,
}

/// The decrypted payload of an [`Event`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventPayload {
    pub op: Op,
    pub entry: Entry,
}

/// One member in the relay's membership summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultMember {
    pub device_id: DeviceId,
    #[serde(with = "base64_bytes")]
    pub device_pubkey_sign: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub device_pubkey_box: Vec<u8>,
    #[serde(with = "u64_string")]
    pub key_epoch: u64,
}

/// Response of `GET /v1/vaults/{vault_id}/members`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultMembershipResponse {
    #[serde(with = "u64_string")]
    pub member_seq: u64,
    #[serde(with = "base64_bytes")]
    pub head_hash: Vec<u8>,
    pub members: Vec<VaultMember>,
}

/// Response of `POST /v1/vaults/{vault_id}/events`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventResponse {
    #[serde(with = "u64_string")]
    pub seq: u64,
}

/// Standard-base64 serialization for binary fields.
pub(crate) mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Vec<u8>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Decimal-string serialization for `u64` values that may exceed 2^53.
mod u64_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u64, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::device::DeviceKeys;
    use ed25519_dalek::Signer;

    #[test]
    fn device_id_accepts_lower_hex() {
        let id = "a".repeat(64);
        assert!(DeviceId::parse(&id).is_ok());
    }

    #[test]
    fn device_id_rejects_bad_input() {
        assert!(DeviceId::parse("abc").is_err());
        assert!(DeviceId::parse(&"A".repeat(64)).is_err());
        assert!(DeviceId::parse(&"g".repeat(64)).is_err());
        assert!(DeviceId::parse(&"a".repeat(63)).is_err());
        assert!(DeviceId::parse(&"a".repeat(65)).is_err());
    }

    #[test]
    fn device_id_rejected_on_deserialize() {
        let err = serde_json::from_str::<DeviceId>("\"not-a-device-id\"");
        assert!(err.is_err());
    }

    #[test]
    fn device_id_bytes_roundtrip() {
        let keys = DeviceKeys::generate();
        let raw = keys.device_id.to_bytes().unwrap();
        assert_eq!(hex::encode(raw), keys.device_id.as_str());
    }

    #[test]
    fn event_u64_fields_travel_as_strings() {
        let keys = DeviceKeys::generate();
        let event = Event {
            msg_type: MSG_TYPE_EVENT.to_string(),
            event_id: Uuid::new_v4(),
            vault_id: Uuid::new_v4(),
            device_id: keys.device_id.clone(),
            counter: u64::MAX,
            lamport: 9_007_199_254_740_993, // 2^53 + 1
            key_epoch: 1,
            prev_hash: vec![0u8; 32],
            nonce: vec![0u8; 24],
            ciphertext: vec![1, 2, 3],
            signature: vec![0u8; 64],
            seq: 0,
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["counter"], "18446744073709551615");
        assert_eq!(json["lamport"], "9007199254740993");
        assert!(json.get("seq").is_none());

        let back: Event = serde_json::from_value(json).unwrap();
        assert_eq!(back.counter, u64::MAX);
        assert_eq!(back.lamport, 9_007_199_254_740_993);
        assert_eq!(back.seq, 0);
    }

    #[test]
    fn pulled_event_seq_is_parsed() {
        let keys = DeviceKeys::generate();
        let json = format!(
            r#"{{"msg_type":"event","event_id":"{}","vault_id":"{}",
                "device_id":"{}","counter":"1","lamport":"1","key_epoch":"1",
                "prev_hash":"{}","nonce":"{}","ciphertext":"{}",
                "signature":"{}","seq":"42"}}"#,
            Uuid::nil(),
            Uuid::nil(),
            keys.device_id,
            base64::Engine::encode(&base64::engine::general_purpose::STANDARD, [0u8; 32]),
            base64::Engine::encode(&base64::engine::general_purpose::STANDARD, [0u8; 24]),
            base64::Engine::encode(&base64::engine::general_purpose::STANDARD, [1u8]),
            base64::Engine::encode(&base64::engine::general_purpose::STANDARD, [0u8; 64]),
        );
        let event: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(event.seq, 42);
    }

    #[test]
    fn bundle_verify_accepts_self_signed() {
        let keys = DeviceKeys::generate();
        let signed = wire::device_bundle_bytes(
            &keys.device_id.to_bytes().unwrap(),
            &keys.pubkey_sign,
            &keys.pubkey_box,
        );
        let signature = keys.signing_key().sign(&signed);

        let bundle = DeviceBundle {
            device_id: keys.device_id.clone(),
            device_pubkey_sign: keys.pubkey_sign.to_vec(),
            device_pubkey_box: keys.pubkey_box.to_vec(),
            device_bundle_sig: signature.to_bytes().to_vec(),
        };
        assert!(bundle.verify().is_ok());
    }

    #[test]
    fn bundle_verify_rejects_wrong_id_and_bad_sig() {
        let keys = DeviceKeys::generate();
        let other = DeviceKeys::generate();
        let signed = wire::device_bundle_bytes(
            &keys.device_id.to_bytes().unwrap(),
            &keys.pubkey_sign,
            &keys.pubkey_box,
        );
        let signature = keys.signing_key().sign(&signed);

        let mut bundle = DeviceBundle {
            device_id: other.device_id.clone(),
            device_pubkey_sign: keys.pubkey_sign.to_vec(),
            device_pubkey_box: keys.pubkey_box.to_vec(),
            device_bundle_sig: signature.to_bytes().to_vec(),
        };
        assert_eq!(bundle.verify(), Err(WireError::DeviceIdMismatch));

        bundle.device_id = keys.device_id.clone();
        bundle.device_bundle_sig[0] ^= 1;
        assert_eq!(bundle.verify(), Err(WireError::InvalidSignature));
    }

    #[test]
    fn event_signed_bytes_enforces_lengths() {
        let keys = DeviceKeys::generate();
        let mut event = Event {
            msg_type: MSG_TYPE_EVENT.to_string(),
            event_id: Uuid::new_v4(),
            vault_id: Uuid::new_v4(),
            device_id: keys.device_id.clone(),
            counter: 1,
            lamport: 1,
            key_epoch: 1,
            prev_hash: vec![0u8; 31],
            nonce: vec![0u8; 24],
            ciphertext: vec![1],
            signature: vec![0u8; 64],
            seq: 0,
        };
        assert!(matches!(
            event.signed_bytes(),
            Err(WireError::InvalidLength {
                field: "prev_hash",
                ..
            })
        ));

        event.prev_hash = vec![0u8; 32];
        event.nonce = vec![0u8; 23];
        assert!(matches!(
            event.signed_bytes(),
            Err(WireError::InvalidLength { field: "nonce", .. })
        ));
    }

    #[test]
    fn member_event_unknown_type_rejected() {
        let keys = DeviceKeys::generate();
        let event = MemberEvent {
            msg_type: "member_promote".to_string(),
            member_event_id: Uuid::new_v4(),
            vault_id: Uuid::new_v4(),
            member_seq: 1,
            prev_hash: vec![0u8; 32],
            actor_device_id: keys.device_id.clone(),
            subject_device_id: keys.device_id.clone(),
            subject_pubkey_sign: vec![0u8; 32],
            subject_pubkey_box: vec![0u8; 32],
            subject_bundle_sig: vec![0u8; 64],
            invite_id: Uuid::nil(),
            claim_sig: vec![0u8; 64],
            signature: vec![0u8; 64],
        };
        assert!(matches!(
            event.signed_bytes(),
            Err(WireError::UnknownMessageType(_))
        ));
    }

    #[test]
    fn op_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Op::Upsert).unwrap(), "\"upsert\"");
        assert_eq!(serde_json::to_string(&Op::Delete).unwrap(), "\"delete\"");
        assert!(serde_json::from_str::<Op>("\"rename\"").is_err());
    }
}
