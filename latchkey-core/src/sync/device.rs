//! Device identity: Ed25519 signing keypair, X25519 box keypair, and the
//! device id derived from the signing public key.

use crate::sync::models::{DeviceBundle, DeviceId, WireError};
use crate::sync::wire;
use ed25519_dalek::{Signer, SigningKey};
use rand::RngCore;
use zeroize::Zeroize;

/// A device's long-lived key material. Generated once when sync is first
/// configured; never rotated.
pub struct DeviceKeys {
    pub device_id: DeviceId,
    pub pubkey_sign: [u8; 32],
    pub pubkey_box: [u8; 32],
    privkey_sign: [u8; 32],
    privkey_box: [u8; 32],
}

impl DeviceKeys {
    /// Generate a fresh identity. The device id is the lowercase hex
    /// SHA-256 of the Ed25519 verifying key.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        let signing_key = SigningKey::from_bytes(&seed);
        let pubkey_sign = signing_key.verifying_key().to_bytes();

        let mut privkey_box = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut privkey_box);
        let pubkey_box = *crypto_box::PublicKey::from(&crypto_box::SecretKey::from(privkey_box))
            .as_bytes();

        Self {
            device_id: DeviceId::from_signing_pubkey(&pubkey_sign),
            pubkey_sign,
            pubkey_box,
            privkey_sign: seed,
            privkey_box,
        }
    }

    /// Reassemble an identity from stored key material.
    pub fn from_parts(
        device_id: DeviceId,
        pubkey_sign: [u8; 32],
        privkey_sign: [u8; 32],
        pubkey_box: [u8; 32],
        privkey_box: [u8; 32],
    ) -> Self {
        Self {
            device_id,
            pubkey_sign,
            pubkey_box,
            privkey_sign,
            privkey_box,
        }
    }

    /// The Ed25519 signing key for outbound events.
    pub fn signing_key(&self) -> SigningKey {
        SigningKey::from_bytes(&self.privkey_sign)
    }

    /// The X25519 secret for sealed-box invitation payloads.
    pub fn box_secret(&self) -> [u8; 32] {
        self.privkey_box
    }

    /// The self-signed bundle announcing this identity to the relay.
    pub fn bundle(&self) -> Result<DeviceBundle, WireError> {
        let signed = wire::device_bundle_bytes(
            &self.device_id.to_bytes()?,
            &self.pubkey_sign,
            &self.pubkey_box,
        );
        let signature = self.signing_key().sign(&signed);

        Ok(DeviceBundle {
            device_id: self.device_id.clone(),
            device_pubkey_sign: self.pubkey_sign.to_vec(),
            device_pubkey_box: self.pubkey_box.to_vec(),
            device_bundle_sig: signature.to_bytes().to_vec(),
        })
    }

    pub(crate) fn privkey_sign_bytes(&self) -> &[u8; 32] {
        &self.privkey_sign
    }

    pub(crate) fn privkey_box_bytes(&self) -> &[u8; 32] {
        &self.privkey_box
    }
}

impl Drop for DeviceKeys {
    fn drop(&mut self) {
        self.privkey_sign.zeroize();
        self.privkey_box.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha256};

    #[test]
    fn device_id_is_hash_of_signing_pubkey() {
        let keys = DeviceKeys::generate();
        let expected = hex::encode(Sha256::digest(keys.pubkey_sign));
        assert_eq!(keys.device_id.as_str(), expected);
        assert_eq!(keys.device_id.as_str().len(), 64);
    }

    #[test]
    fn distinct_devices_have_distinct_identities() {
        let a = DeviceKeys::generate();
        let b = DeviceKeys::generate();
        assert_ne!(a.device_id, b.device_id);
        assert_ne!(a.pubkey_sign, b.pubkey_sign);
        assert_ne!(a.pubkey_box, b.pubkey_box);
    }

    #[test]
    fn signing_key_matches_public() {
        let keys = DeviceKeys::generate();
        assert_eq!(keys.signing_key().verifying_key().to_bytes(), keys.pubkey_sign);
    }

    #[test]
    fn box_secret_matches_public() {
        let keys = DeviceKeys::generate();
        let public =
            crypto_box::PublicKey::from(&crypto_box::SecretKey::from(keys.box_secret()));
        assert_eq!(*public.as_bytes(), keys.pubkey_box);
    }

    #[test]
    fn from_parts_roundtrip() {
        let keys = DeviceKeys::generate();
        let rebuilt = DeviceKeys::from_parts(
            keys.device_id.clone(),
            keys.pubkey_sign,
            *keys.privkey_sign_bytes(),
            keys.pubkey_box,
            *keys.privkey_box_bytes(),
        );
        assert_eq!(rebuilt.device_id, keys.device_id);
        assert_eq!(
            rebuilt.signing_key().verifying_key().to_bytes(),
            keys.pubkey_sign
        );
    }
}
