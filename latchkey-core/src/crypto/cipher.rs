//! XChaCha20-Poly1305 encryption for at-rest records and event payloads.
//!
//! Two wire formats share the same cipher:
//! - At-rest records are `nonce(24) || ciphertext` in one blob.
//! - Event payloads carry the 24-byte nonce as a separate structural field.
//!
//! Event keys are derived per key-epoch from the vault key with HKDF-SHA256.
//! Decryption also supports the legacy scheme (`SHA-256(key || info)` +
//! NaCl secretbox) so historical vaults stay readable; encryption always
//! uses the current scheme.

use crate::crypto::{CryptoError, Result};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    Key, XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Symmetric key length in bytes.
pub const KEY_LEN: usize = 32;
/// XChaCha20-Poly1305 nonce length in bytes.
pub const NONCE_LEN: usize = 24;

/// HKDF info prefix for per-epoch event keys. Protocol constant: changing it
/// makes every existing vault's event log undecryptable.
const EVENT_KEY_INFO_PREFIX: &str = "forgor-event-key-epoch-";

/// Which AEAD construction last decrypted an entry's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryScheme {
    /// XChaCha20-Poly1305 under the HKDF-derived event key.
    V2,
    /// NaCl secretbox under `SHA-256(vault_key || info)`.
    Legacy,
}

impl EntryScheme {
    /// String form stored in the `entry_schemes` bucket.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::V2 => "v2",
            Self::Legacy => "legacy",
        }
    }

    /// Parse the stored string form.
    pub fn parse(s: &str) -> Self {
        match s {
            "legacy" => Self::Legacy,
            _ => Self::V2,
        }
    }
}

/// Encrypt an at-rest record. Returns `nonce(24) || ciphertext`.
pub fn seal(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));

    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed("AEAD seal failed".to_string()))?;

    let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

/// Decrypt an at-rest record produced by [`seal`].
pub fn open(key: &[u8; KEY_LEN], blob: &[u8]) -> Result<Vec<u8>> {
    if blob.len() < NONCE_LEN {
        return Err(CryptoError::CiphertextTooShort);
    }

    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let (nonce, ciphertext) = blob.split_at(NONCE_LEN);

    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::AuthenticationFailed)
}

/// Derive the event key for a key epoch from the vault key.
///
/// `HKDF-SHA256(ikm = vault_key, salt = none, info = "forgor-event-key-epoch-{N}")`
pub fn derive_event_key(vault_key: &[u8; KEY_LEN], key_epoch: u64) -> Result<[u8; KEY_LEN]> {
    let info = format!("{}{}", EVENT_KEY_INFO_PREFIX, key_epoch);
    let hkdf = Hkdf::<Sha256>::new(None, vault_key);

    let mut key = [0u8; KEY_LEN];
    hkdf.expand(info.as_bytes(), &mut key)
        .map_err(|e| CryptoError::KdfFailed(format!("HKDF expand failed: {}", e)))?;
    Ok(key)
}

/// Legacy event key: `SHA-256(vault_key || info)`. Decrypt-only.
fn derive_legacy_event_key(vault_key: &[u8; KEY_LEN], key_epoch: u64) -> [u8; KEY_LEN] {
    let info = format!("{}{}", EVENT_KEY_INFO_PREFIX, key_epoch);
    let mut hasher = Sha256::new();
    hasher.update(vault_key);
    hasher.update(info.as_bytes());
    hasher.finalize().into()
}

/// Encrypt an event payload under the current epoch's event key.
///
/// Returns `(ciphertext, nonce)`; the nonce is a structural field of the
/// event, not prepended to the ciphertext.
pub fn encrypt_event_payload(
    vault_key: &[u8; KEY_LEN],
    key_epoch: u64,
    plaintext: &[u8],
) -> Result<(Vec<u8>, [u8; NONCE_LEN])> {
    let event_key = derive_event_key(vault_key, key_epoch)?;
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&event_key));

    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed("event payload seal failed".to_string()))?;

    Ok((ciphertext, nonce))
}

/// Decrypt an event payload, trying the current scheme first and falling
/// back to the legacy scheme. Returns the plaintext and which scheme opened
/// it.
pub fn decrypt_event_payload(
    vault_key: &[u8; KEY_LEN],
    key_epoch: u64,
    nonce: &[u8],
    ciphertext: &[u8],
) -> Result<(Vec<u8>, EntryScheme)> {
    if nonce.len() != NONCE_LEN {
        return Err(CryptoError::InvalidNonceLength {
            expected: NONCE_LEN,
            got: nonce.len(),
        });
    }

    if let Ok(plaintext) = decrypt_event_xchacha(vault_key, key_epoch, nonce, ciphertext) {
        return Ok((plaintext, EntryScheme::V2));
    }

    let plaintext = decrypt_event_legacy(vault_key, key_epoch, nonce, ciphertext)?;
    Ok((plaintext, EntryScheme::Legacy))
}

fn decrypt_event_xchacha(
    vault_key: &[u8; KEY_LEN],
    key_epoch: u64,
    nonce: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    let event_key = derive_event_key(vault_key, key_epoch)?;
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&event_key));

    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::AuthenticationFailed)
}

fn decrypt_event_legacy(
    vault_key: &[u8; KEY_LEN],
    key_epoch: u64,
    nonce: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    use crypto_secretbox::{
        aead::{Aead as _, KeyInit as _},
        Key as SecretboxKey, Nonce as SecretboxNonce, XSalsa20Poly1305,
    };

    let legacy_key = derive_legacy_event_key(vault_key, key_epoch);
    let cipher = XSalsa20Poly1305::new(SecretboxKey::from_slice(&legacy_key));

    cipher
        .decrypt(SecretboxNonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::AuthenticationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> [u8; KEY_LEN] {
        let mut k = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut k);
        k
    }

    #[test]
    fn at_rest_roundtrip() {
        let k = key();
        let blob = seal(&k, b"secret record").unwrap();
        assert_eq!(open(&k, &blob).unwrap(), b"secret record");
    }

    #[test]
    fn at_rest_wrong_key_fails() {
        let blob = seal(&key(), b"secret record").unwrap();
        assert!(matches!(
            open(&key(), &blob),
            Err(CryptoError::AuthenticationFailed)
        ));
    }

    #[test]
    fn at_rest_tampered_fails() {
        let k = key();
        let mut blob = seal(&k, b"secret record").unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0xff;
        assert!(open(&k, &blob).is_err());
    }

    #[test]
    fn at_rest_short_blob_fails() {
        assert!(matches!(
            open(&key(), &[0u8; NONCE_LEN - 1]),
            Err(CryptoError::CiphertextTooShort)
        ));
    }

    #[test]
    fn at_rest_nonces_are_unique() {
        let k = key();
        let b1 = seal(&k, b"same plaintext").unwrap();
        let b2 = seal(&k, b"same plaintext").unwrap();
        assert_ne!(&b1[..NONCE_LEN], &b2[..NONCE_LEN]);
        assert_ne!(b1, b2);
    }

    #[test]
    fn event_key_depends_on_epoch() {
        let vk = key();
        let k1 = derive_event_key(&vk, 1).unwrap();
        let k2 = derive_event_key(&vk, 2).unwrap();
        assert_ne!(k1, k2);
    }

    #[test]
    fn event_payload_roundtrip_is_v2() {
        let vk = key();
        let (ct, nonce) = encrypt_event_payload(&vk, 1, b"{\"op\":\"upsert\"}").unwrap();
        let (pt, scheme) = decrypt_event_payload(&vk, 1, &nonce, &ct).unwrap();
        assert_eq!(pt, b"{\"op\":\"upsert\"}");
        assert_eq!(scheme, EntryScheme::V2);
    }

    #[test]
    fn event_payload_wrong_epoch_fails() {
        let vk = key();
        let (ct, nonce) = encrypt_event_payload(&vk, 1, b"payload").unwrap();
        assert!(decrypt_event_payload(&vk, 2, &nonce, &ct).is_err());
    }

    #[test]
    fn legacy_payload_decrypts_and_is_marked() {
        use crypto_secretbox::{
            aead::{Aead as _, KeyInit as _},
            Key as SecretboxKey, Nonce as SecretboxNonce, XSalsa20Poly1305,
        };

        let vk = key();
        let legacy_key = derive_legacy_event_key(&vk, 1);
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let cipher = XSalsa20Poly1305::new(SecretboxKey::from_slice(&legacy_key));
        let ct = cipher
            .encrypt(SecretboxNonce::from_slice(&nonce), &b"old payload"[..])
            .unwrap();

        let (pt, scheme) = decrypt_event_payload(&vk, 1, &nonce, &ct).unwrap();
        assert_eq!(pt, b"old payload");
        assert_eq!(scheme, EntryScheme::Legacy);
    }

    #[test]
    fn both_schemes_failing_is_an_error() {
        let vk = key();
        let nonce = [7u8; NONCE_LEN];
        assert!(decrypt_event_payload(&vk, 1, &nonce, b"garbage ciphertext").is_err());
    }

    #[test]
    fn bad_nonce_length_rejected() {
        let vk = key();
        assert!(matches!(
            decrypt_event_payload(&vk, 1, &[0u8; 12], b"ct"),
            Err(CryptoError::InvalidNonceLength { expected: 24, .. })
        ));
    }

    #[test]
    fn scheme_string_roundtrip() {
        for scheme in [EntryScheme::V2, EntryScheme::Legacy] {
            assert_eq!(EntryScheme::parse(scheme.as_str()), scheme);
        }
    }
}
