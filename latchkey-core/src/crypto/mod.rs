//! Cryptographic primitives for the replication core.
//!
//! This module provides:
//! - Argon2id key derivation for the vault master key
//! - XChaCha20-Poly1305 at-rest and event-payload encryption
//! - HKDF-SHA256 per-epoch event key derivation (with legacy fallback)
//! - X25519 sealed boxes for invitation transport

pub mod cipher;
pub mod kdf;
pub mod sealed;

pub use cipher::{
    decrypt_event_payload, derive_event_key, encrypt_event_payload, open, seal, EntryScheme,
    KEY_LEN, NONCE_LEN,
};
pub use kdf::{derive_vault_master_key, generate_salt, SALT_LEN};
pub use sealed::{open_sealed, seal_to};

use thiserror::Error;

/// Errors that can occur in cryptographic operations
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Key derivation failed: {0}")]
    KdfFailed(String),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("Invalid nonce length: expected {expected}, got {got}")]
    InvalidNonceLength { expected: usize, got: usize },

    #[error("Ciphertext too short")]
    CiphertextTooShort,

    #[error("Authentication failed - data may have been tampered with")]
    AuthenticationFailed,
}

/// Result type for crypto operations
pub type Result<T> = std::result::Result<T, CryptoError>;
