//! Latchkey Core Library
//!
//! The replication core of the Latchkey password vault: device identity,
//! vault admission control, authenticated event-log replication through an
//! untrusted relay, and deterministic convergence of per-entry state.

pub mod crypto;
pub mod sync;
pub mod vault;

pub use crypto::CryptoError;
pub use sync::client::{RelayClient, RelayError};
pub use sync::engine::{SyncEngine, SyncReport};
pub use sync::models::DeviceId;
pub use sync::state::{StateError, SyncStateStore};
pub use vault::{Entry, LocalVault};

use thiserror::Error;

/// Result type for latchkey operations
pub type Result<T> = std::result::Result<T, LatchkeyError>;

/// General error type for the replication core
#[derive(Error, Debug)]
pub enum LatchkeyError {
    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("State store error: {0}")]
    State(#[from] sync::state::StateError),

    #[error("Relay error: {0}")]
    Relay(#[from] sync::client::RelayError),

    #[error("Invalid wire data: {0}")]
    Wire(#[from] sync::models::WireError),

    #[error("Vault is locked")]
    VaultLocked,

    #[error("Sync is not configured")]
    NotConfigured,

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Lock poisoned: {0}")]
    LockPoisoned(&'static str),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
