//! Canonical byte-sequences covered by signatures.
//!
//! Every signature (and every chain hash) is computed over a deterministic
//! concatenation: a message-type tag first, then the fields in a fixed
//! order. Integers are big-endian u64; fixed-size fields are written raw;
//! variable-size fields carry a 4-byte big-endian length prefix. Free-form
//! JSON re-serialization is never used as signature input.

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// UUID length on the wire.
pub const UUID_LEN: usize = 16;
/// SHA-256 hash length.
pub const HASH_LEN: usize = 32;
/// Ed25519 / X25519 public key length.
pub const PUBKEY_LEN: usize = 32;
/// Ed25519 signature length.
pub const SIG_LEN: usize = 64;
/// Device id length in raw bytes (64 hex characters).
pub const DEVICE_ID_LEN: usize = 32;
/// AEAD nonce length.
pub const NONCE_LEN: usize = 24;

const TAG_DEVICE_BUNDLE: &[u8] = b"lk1.device_bundle";
const TAG_MEMBER_ADD: &[u8] = b"lk1.member_add";
const TAG_MEMBER_REMOVE: &[u8] = b"lk1.member_remove";
const TAG_INVITE_CLAIM: &[u8] = b"lk1.invite_claim";
const TAG_INVITE: &[u8] = b"lk1.invite";
const TAG_EVENT: &[u8] = b"lk1.event";

struct SignBuf(Vec<u8>);

impl SignBuf {
    fn new(tag: &[u8]) -> Self {
        let mut buf = Vec::with_capacity(256);
        buf.extend_from_slice(tag);
        Self(buf)
    }

    fn fixed(mut self, bytes: &[u8]) -> Self {
        self.0.extend_from_slice(bytes);
        self
    }

    fn uuid(self, id: &Uuid) -> Self {
        self.fixed(id.as_bytes())
    }

    fn u64(mut self, value: u64) -> Self {
        self.0.extend_from_slice(&value.to_be_bytes());
        self
    }

    fn u8(mut self, value: u8) -> Self {
        self.0.push(value);
        self
    }

    fn var(mut self, bytes: &[u8]) -> Self {
        self.0.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        self.0.extend_from_slice(bytes);
        self
    }

    fn finish(self) -> Vec<u8> {
        self.0
    }
}

/// `DEVICE_BUNDLE`: self-signed device identity announcement.
pub fn device_bundle_bytes(
    device_id: &[u8; DEVICE_ID_LEN],
    pubkey_sign: &[u8; PUBKEY_LEN],
    pubkey_box: &[u8; PUBKEY_LEN],
) -> Vec<u8> {
    SignBuf::new(TAG_DEVICE_BUNDLE)
        .fixed(device_id)
        .fixed(pubkey_sign)
        .fixed(pubkey_box)
        .finish()
}

/// `MEMBER_ADD`: admission event on the membership ledger. The bootstrap
/// event uses the nil UUID for `invite_id` and an all-zero `claim_sig`.
#[allow(clippy::too_many_arguments)]
pub fn member_add_bytes(
    member_event_id: &Uuid,
    vault_id: &Uuid,
    member_seq: u64,
    prev_hash: &[u8; HASH_LEN],
    actor_id: &[u8; DEVICE_ID_LEN],
    subject_id: &[u8; DEVICE_ID_LEN],
    invite_id: &Uuid,
    claim_sig: &[u8; SIG_LEN],
    subject_bundle_sig: &[u8; SIG_LEN],
    subject_pubkey_sign: &[u8; PUBKEY_LEN],
    subject_pubkey_box: &[u8; PUBKEY_LEN],
) -> Vec<u8> {
    SignBuf::new(TAG_MEMBER_ADD)
        .uuid(member_event_id)
        .uuid(vault_id)
        .u64(member_seq)
        .fixed(prev_hash)
        .fixed(actor_id)
        .fixed(subject_id)
        .uuid(invite_id)
        .fixed(claim_sig)
        .fixed(subject_bundle_sig)
        .fixed(subject_pubkey_sign)
        .fixed(subject_pubkey_box)
        .finish()
}

/// `MEMBER_REMOVE`: removal event on the membership ledger.
pub fn member_remove_bytes(
    member_event_id: &Uuid,
    vault_id: &Uuid,
    member_seq: u64,
    prev_hash: &[u8; HASH_LEN],
    actor_id: &[u8; DEVICE_ID_LEN],
    subject_id: &[u8; DEVICE_ID_LEN],
) -> Vec<u8> {
    SignBuf::new(TAG_MEMBER_REMOVE)
        .uuid(member_event_id)
        .uuid(vault_id)
        .u64(member_seq)
        .fixed(prev_hash)
        .fixed(actor_id)
        .fixed(subject_id)
        .finish()
}

/// `INVITE_CLAIM`: signed by the claimant to prove possession of the
/// invited device's signing key.
pub fn invite_claim_bytes(
    invite_id: &Uuid,
    vault_id: &Uuid,
    claimant_id: &[u8; DEVICE_ID_LEN],
) -> Vec<u8> {
    SignBuf::new(TAG_INVITE_CLAIM)
        .uuid(invite_id)
        .uuid(vault_id)
        .fixed(claimant_id)
        .finish()
}

/// `INVITE`: signed by the inviter over the sealed vault key and the
/// target's announced identity.
#[allow(clippy::too_many_arguments)]
pub fn invite_bytes(
    invite_id: &Uuid,
    vault_id: &Uuid,
    target_id: &[u8; DEVICE_ID_LEN],
    target_pubkey_sign: &[u8; PUBKEY_LEN],
    target_pubkey_box: &[u8; PUBKEY_LEN],
    target_bundle_sig: &[u8; SIG_LEN],
    nonce: &[u8; NONCE_LEN],
    wrapped_payload: &[u8],
    creator_id: &[u8; DEVICE_ID_LEN],
    single_use: bool,
) -> Vec<u8> {
    SignBuf::new(TAG_INVITE)
        .uuid(invite_id)
        .uuid(vault_id)
        .fixed(target_id)
        .fixed(target_pubkey_sign)
        .fixed(target_pubkey_box)
        .fixed(target_bundle_sig)
        .fixed(nonce)
        .var(wrapped_payload)
        .fixed(creator_id)
        .u8(single_use as u8)
        .finish()
}

/// `EVENT`: one entry on a device's per-device chain.
#[allow(clippy::too_many_arguments)]
pub fn event_bytes(
    event_id: &Uuid,
    vault_id: &Uuid,
    device_id: &[u8; DEVICE_ID_LEN],
    counter: u64,
    lamport: u64,
    key_epoch: u64,
    prev_hash: &[u8; HASH_LEN],
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
) -> Vec<u8> {
    SignBuf::new(TAG_EVENT)
        .uuid(event_id)
        .uuid(vault_id)
        .fixed(device_id)
        .u64(counter)
        .u64(lamport)
        .u64(key_epoch)
        .fixed(prev_hash)
        .fixed(nonce)
        .var(ciphertext)
        .finish()
}

/// Chain hash over a signed byte-sequence: `prev_hash` of event N+1 must
/// equal `chain_hash(signed_bytes(event N))`.
pub fn chain_hash(signed_bytes: &[u8]) -> [u8; HASH_LEN] {
    Sha256::digest(signed_bytes).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event_bytes(mutate: impl FnOnce(&mut EventFields)) -> Vec<u8> {
        let mut f = EventFields::sample();
        mutate(&mut f);
        event_bytes(
            &f.event_id,
            &f.vault_id,
            &f.device_id,
            f.counter,
            f.lamport,
            f.key_epoch,
            &f.prev_hash,
            &f.nonce,
            &f.ciphertext,
        )
    }

    struct EventFields {
        event_id: Uuid,
        vault_id: Uuid,
        device_id: [u8; DEVICE_ID_LEN],
        counter: u64,
        lamport: u64,
        key_epoch: u64,
        prev_hash: [u8; HASH_LEN],
        nonce: [u8; NONCE_LEN],
        ciphertext: Vec<u8>,
    }

    impl EventFields {
        fn sample() -> Self {
            Self {
                event_id: Uuid::from_u128(1),
                vault_id: Uuid::from_u128(2),
                device_id: [3u8; DEVICE_ID_LEN],
                counter: 4,
                lamport: 5,
                key_epoch: 1,
                prev_hash: [6u8; HASH_LEN],
                nonce: [7u8; NONCE_LEN],
                ciphertext: vec![8u8; 40],
            }
        }
    }

    #[test]
    fn every_event_field_is_covered() {
        let base = sample_event_bytes(|_| {});
        assert_ne!(base, sample_event_bytes(|f| f.event_id = Uuid::from_u128(9)));
        assert_ne!(base, sample_event_bytes(|f| f.vault_id = Uuid::from_u128(9)));
        assert_ne!(base, sample_event_bytes(|f| f.device_id[0] ^= 1));
        assert_ne!(base, sample_event_bytes(|f| f.counter += 1));
        assert_ne!(base, sample_event_bytes(|f| f.lamport += 1));
        assert_ne!(base, sample_event_bytes(|f| f.key_epoch += 1));
        assert_ne!(base, sample_event_bytes(|f| f.prev_hash[31] ^= 1));
        assert_ne!(base, sample_event_bytes(|f| f.nonce[0] ^= 1));
        assert_ne!(base, sample_event_bytes(|f| f.ciphertext[0] ^= 1));
    }

    #[test]
    fn tags_separate_message_types() {
        // Same field material must never produce the same signed bytes for
        // two different message types.
        let id = Uuid::from_u128(1);
        let vault = Uuid::from_u128(2);
        let device = [3u8; DEVICE_ID_LEN];
        let claim = invite_claim_bytes(&id, &vault, &device);
        let remove = member_remove_bytes(&id, &vault, 0, &[0u8; HASH_LEN], &device, &device);
        assert_ne!(claim, remove);
        assert!(claim.starts_with(TAG_INVITE_CLAIM));
        assert!(remove.starts_with(TAG_MEMBER_REMOVE));
    }

    #[test]
    fn variable_fields_are_length_prefixed() {
        // `ciphertext = [1,2]` vs `[1]` must differ even when the trailing
        // byte of one equals the length prefix region of the other.
        let mut a = EventFields::sample();
        a.ciphertext = vec![1, 2];
        let mut b = EventFields::sample();
        b.ciphertext = vec![1];
        let bytes_a = sample_event_bytes(|f| f.ciphertext = a.ciphertext.clone());
        let bytes_b = sample_event_bytes(|f| f.ciphertext = b.ciphertext.clone());
        assert_ne!(bytes_a, bytes_b);
        assert_eq!(bytes_a.len(), bytes_b.len() + 1);
    }

    #[test]
    fn chain_hash_is_sha256_of_signed_bytes() {
        let bytes = sample_event_bytes(|_| {});
        let expected: [u8; 32] = Sha256::digest(&bytes).into();
        assert_eq!(chain_hash(&bytes), expected);
    }

    #[test]
    fn single_use_flag_is_signed() {
        let f = EventFields::sample();
        let invite = |single_use| {
            invite_bytes(
                &f.event_id,
                &f.vault_id,
                &f.device_id,
                &[1u8; PUBKEY_LEN],
                &[2u8; PUBKEY_LEN],
                &[3u8; SIG_LEN],
                &f.nonce,
                &f.ciphertext,
                &f.device_id,
                single_use,
            )
        };
        assert_ne!(invite(true), invite(false));
    }
}
