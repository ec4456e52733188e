//! Argon2id key derivation for the master password.
//!
//! Parameters:
//! - Memory cost: 64 MiB (65,536 KiB)
//! - Time cost: 3 iterations
//! - Parallelism: 4 lanes
//! - Output length: 32 bytes
//! - Salt length: 16 bytes, random, stored alongside the vault

use crate::crypto::{CryptoError, Result};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;

/// Memory cost in KiB.
pub const ARGON2_MEM_KIB: u32 = 64 * 1024;
/// Number of iterations.
pub const ARGON2_TIME: u32 = 3;
/// Number of lanes.
pub const ARGON2_LANES: u32 = 4;
/// Salt length in bytes.
pub const SALT_LEN: usize = 16;

/// Generate a fresh random salt for master-key derivation.
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Derive the 32-byte vault master key from the master password.
///
/// The master key encrypts everything at rest: the entry-list blob, the
/// device private keys, the vault key, and queued pending entries. Deriving
/// is deliberately costly; callers should cache the result for the unlock
/// session and zeroize it on lock.
pub fn derive_vault_master_key(password: &str, salt: &[u8; SALT_LEN]) -> Result<[u8; 32]> {
    let params = Params::new(ARGON2_MEM_KIB, ARGON2_TIME, ARGON2_LANES, Some(32))
        .map_err(|e| CryptoError::KdfFailed(format!("invalid parameters: {}", e)))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = [0u8; 32];
    argon2
        .hash_password_into(password.as_bytes(), salt, &mut key)
        .map_err(|e| CryptoError::KdfFailed(format!("hashing failed: {}", e)))?;

    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_password_same_salt_same_key() {
        let salt = generate_salt();
        let k1 = derive_vault_master_key("correct horse battery staple", &salt).unwrap();
        let k2 = derive_vault_master_key("correct horse battery staple", &salt).unwrap();
        assert_eq!(k1, k2);
    }

    #[test]
    fn different_password_different_key() {
        let salt = generate_salt();
        let k1 = derive_vault_master_key("password-one", &salt).unwrap();
        let k2 = derive_vault_master_key("password-two", &salt).unwrap();
        assert_ne!(k1, k2);
    }

    #[test]
    fn different_salt_different_key() {
        let s1 = generate_salt();
        let s2 = generate_salt();
        assert_ne!(s1, s2);

        let k1 = derive_vault_master_key("same password", &s1).unwrap();
        let k2 = derive_vault_master_key("same password", &s2).unwrap();
        assert_ne!(k1, k2);
    }
}
