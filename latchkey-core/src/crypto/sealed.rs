//! X25519 sealed payloads for invitation transport.
//!
//! NaCl box (X25519 + XSalsa20-Poly1305) between the inviter's and the
//! invitee's box keypairs. The wire blob is `nonce(24) || sealed`.

use crate::crypto::{CryptoError, Result, KEY_LEN, NONCE_LEN};
use crypto_box::{aead::Aead, Nonce, PublicKey, SalsaBox, SecretKey};
use rand::RngCore;

/// Seal `plaintext` to `recipient_pub` from `sender_secret`.
///
/// Returns `nonce(24) || sealed`.
pub fn seal_to(
    recipient_pub: &[u8; KEY_LEN],
    sender_secret: &[u8; KEY_LEN],
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    let salsa_box = SalsaBox::new(
        &PublicKey::from(*recipient_pub),
        &SecretKey::from(*sender_secret),
    );

    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);

    let sealed = salsa_box
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed("box seal failed".to_string()))?;

    let mut blob = Vec::with_capacity(NONCE_LEN + sealed.len());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&sealed);
    Ok(blob)
}

/// Open a blob produced by [`seal_to`] with the recipient's secret key and
/// the sender's public key.
pub fn open_sealed(
    sender_pub: &[u8; KEY_LEN],
    recipient_secret: &[u8; KEY_LEN],
    blob: &[u8],
) -> Result<Vec<u8>> {
    if blob.len() < NONCE_LEN {
        return Err(CryptoError::CiphertextTooShort);
    }

    let salsa_box = SalsaBox::new(
        &PublicKey::from(*sender_pub),
        &SecretKey::from(*recipient_secret),
    );

    let (nonce, sealed) = blob.split_at(NONCE_LEN);
    salsa_box
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map_err(|_| CryptoError::AuthenticationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair() -> ([u8; 32], [u8; 32]) {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        let public = PublicKey::from(&SecretKey::from(secret));
        (*public.as_bytes(), secret)
    }

    #[test]
    fn seal_open_roundtrip() {
        let (sender_pub, sender_secret) = keypair();
        let (recipient_pub, recipient_secret) = keypair();

        let blob = seal_to(&recipient_pub, &sender_secret, b"vault key material").unwrap();
        let opened = open_sealed(&sender_pub, &recipient_secret, &blob).unwrap();
        assert_eq!(opened, b"vault key material");
    }

    #[test]
    fn wrong_recipient_fails() {
        let (sender_pub, sender_secret) = keypair();
        let (recipient_pub, _) = keypair();
        let (_, other_secret) = keypair();

        let blob = seal_to(&recipient_pub, &sender_secret, b"vault key material").unwrap();
        assert!(open_sealed(&sender_pub, &other_secret, &blob).is_err());
    }

    #[test]
    fn wrong_sender_fails() {
        let (_, sender_secret) = keypair();
        let (other_pub, _) = keypair();
        let (recipient_pub, recipient_secret) = keypair();

        let blob = seal_to(&recipient_pub, &sender_secret, b"vault key material").unwrap();
        assert!(open_sealed(&other_pub, &recipient_secret, &blob).is_err());
    }

    #[test]
    fn short_blob_rejected() {
        let (sender_pub, _) = keypair();
        let (_, recipient_secret) = keypair();
        assert!(matches!(
            open_sealed(&sender_pub, &recipient_secret, &[0u8; 10]),
            Err(CryptoError::CiphertextTooShort)
        ));
    }

    #[test]
    fn tampered_blob_fails() {
        let (sender_pub, sender_secret) = keypair();
        let (recipient_pub, recipient_secret) = keypair();

        let mut blob = seal_to(&recipient_pub, &sender_secret, b"vault key material").unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        assert!(open_sealed(&sender_pub, &recipient_secret, &blob).is_err());
    }
}
