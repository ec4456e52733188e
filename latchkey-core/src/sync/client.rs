//! HTTP client for the coordination relay.
//!
//! All paths are relative to the user-configured server URL. Error bodies
//! carry `{"code": string, "message": string}`; the recognized code
//! `invite_already_used` (or HTTP 409 with a matching message) is treated
//! by callers as an idempotent no-op.

use crate::sync::models::{
    DeviceBundle, DeviceId, Event, EventResponse, Invite, InviteClaim, MemberEvent,
    VaultMembershipResponse,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from relay calls.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The relay answered with an error body.
    #[error("relay error {status} {code}: {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    /// The request never completed (connection failure, timeout,
    /// malformed URL).
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The relay answered 2xx with a body we could not parse.
    #[error("invalid relay response: {0}")]
    InvalidResponse(String),
}

impl RelayError {
    /// Whether this error means the invite behind a claim was already
    /// consumed. The owner's claim-accept loop treats it as success.
    pub fn is_invite_already_used(&self) -> bool {
        match self {
            Self::Api {
                status,
                code,
                message,
            } => {
                code == "invite_already_used"
                    || (*status == 409
                        && message
                            .to_lowercase()
                            .contains("invite has already been used"))
            }
            _ => false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: String,
    message: String,
}

/// Typed client for the relay's JSON API.
pub struct RelayClient {
    http: reqwest::Client,
    base_url: String,
}

impl RelayClient {
    pub fn new(base_url: &str) -> Result<Self, RelayError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn check(&self, response: reqwest::Response) -> Result<reqwest::Response, RelayError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.bytes().await.unwrap_or_default();
        match serde_json::from_slice::<ApiErrorBody>(&body) {
            Ok(err) => Err(RelayError::Api {
                status: status.as_u16(),
                code: err.code,
                message: err.message,
            }),
            Err(_) => Err(RelayError::Api {
                status: status.as_u16(),
                code: "unknown_error".to_string(),
                message: String::from_utf8_lossy(&body).into_owned(),
            }),
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, RelayError> {
        let response = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await?;
        let response = self.check(response).await?;
        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| RelayError::InvalidResponse(e.to_string()))
    }

    async fn post_json<B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<reqwest::Response, RelayError> {
        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .json(body)
            .send()
            .await?;
        self.check(response).await
    }

    /// `POST /v1/devices/register` — idempotent.
    pub async fn register_device(&self, bundle: &DeviceBundle) -> Result<(), RelayError> {
        self.post_json("/v1/devices/register", bundle).await?;
        Ok(())
    }

    /// `GET /v1/devices/{device_id}`
    pub async fn get_device(&self, device_id: &DeviceId) -> Result<DeviceBundle, RelayError> {
        self.get_json(&format!("/v1/devices/{}", device_id)).await
    }

    /// `POST /v1/vaults/{vault_id}/invites`
    pub async fn create_invite(&self, vault_id: &Uuid, invite: &Invite) -> Result<(), RelayError> {
        self.post_json(&format!("/v1/vaults/{}/invites", vault_id), invite)
            .await?;
        Ok(())
    }

    /// `GET /v1/invites?device_id={id}` — invites addressed to a device.
    pub async fn get_invites(&self, device_id: &DeviceId) -> Result<Vec<Invite>, RelayError> {
        self.get_json(&format!("/v1/invites?device_id={}", device_id))
            .await
    }

    /// `POST /v1/invites/{invite_id}/claim`
    pub async fn claim_invite(
        &self,
        invite_id: &Uuid,
        claim: &InviteClaim,
    ) -> Result<(), RelayError> {
        self.post_json(&format!("/v1/invites/{}/claim", invite_id), claim)
            .await?;
        Ok(())
    }

    /// `GET /v1/invite_claims?created_by_device_id={id}` — claims against
    /// invites created by a device.
    pub async fn get_invite_claims(
        &self,
        created_by: &DeviceId,
    ) -> Result<Vec<InviteClaim>, RelayError> {
        self.get_json(&format!(
            "/v1/invite_claims?created_by_device_id={}",
            created_by
        ))
        .await
    }

    /// `POST /v1/vaults/{vault_id}/member_events`
    pub async fn create_member_event(
        &self,
        vault_id: &Uuid,
        event: &MemberEvent,
    ) -> Result<(), RelayError> {
        self.post_json(&format!("/v1/vaults/{}/member_events", vault_id), event)
            .await?;
        Ok(())
    }

    /// `GET /v1/vaults/{vault_id}/member_events?since_seq=N`
    pub async fn get_member_events(
        &self,
        vault_id: &Uuid,
        since_seq: u64,
    ) -> Result<Vec<MemberEvent>, RelayError> {
        self.get_json(&format!(
            "/v1/vaults/{}/member_events?since_seq={}",
            vault_id, since_seq
        ))
        .await
    }

    /// `GET /v1/vaults/{vault_id}/members`
    pub async fn get_vault_members(
        &self,
        vault_id: &Uuid,
    ) -> Result<VaultMembershipResponse, RelayError> {
        self.get_json(&format!("/v1/vaults/{}/members", vault_id))
            .await
    }

    /// `POST /v1/vaults/{vault_id}/events` — returns the relay-assigned
    /// sequence.
    pub async fn push_event(
        &self,
        vault_id: &Uuid,
        event: &Event,
    ) -> Result<EventResponse, RelayError> {
        let response = self
            .post_json(&format!("/v1/vaults/{}/events", vault_id), event)
            .await?;
        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| RelayError::InvalidResponse(e.to_string()))
    }

    /// `GET /v1/vaults/{vault_id}/events?since_seq=N` — each returned
    /// event carries its assigned `seq`.
    pub async fn pull_events(
        &self,
        vault_id: &Uuid,
        since_seq: u64,
    ) -> Result<Vec<Event>, RelayError> {
        self.get_json(&format!(
            "/v1/vaults/{}/events?since_seq={}",
            vault_id, since_seq
        ))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invite_already_used_by_code() {
        let err = RelayError::Api {
            status: 400,
            code: "invite_already_used".to_string(),
            message: "no".to_string(),
        };
        assert!(err.is_invite_already_used());
    }

    #[test]
    fn invite_already_used_by_conflict_message() {
        let err = RelayError::Api {
            status: 409,
            code: "conflict".to_string(),
            message: "Invite Has Already Been Used by another device".to_string(),
        };
        assert!(err.is_invite_already_used());
    }

    #[test]
    fn other_conflicts_are_not_idempotent() {
        let err = RelayError::Api {
            status: 409,
            code: "conflict".to_string(),
            message: "member_seq conflict".to_string(),
        };
        assert!(!err.is_invite_already_used());

        let err = RelayError::Api {
            status: 500,
            code: "internal".to_string(),
            message: "invite has already been used".to_string(),
        };
        assert!(!err.is_invite_already_used());
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let client = RelayClient::new("https://relay.example.com/").unwrap();
        assert_eq!(client.base_url, "https://relay.example.com");
    }
}
