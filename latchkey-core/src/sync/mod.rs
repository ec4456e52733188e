//! Replication engine: device identity, vault admission, authenticated
//! event-log replication, and deterministic convergence.

pub mod client;
pub mod conflict;
pub mod device;
pub mod engine;
pub mod models;
pub mod state;
pub mod wire;

pub use client::{RelayClient, RelayError};
pub use device::DeviceKeys;
pub use engine::{SyncEngine, SyncReport};
pub use models::{DeviceBundle, DeviceId, Event, Invite, InviteClaim, MemberEvent, Op};
pub use state::{StateError, SyncStateStore, VerifiedMember};
