//! The replication engine: vault lifecycle, admission, push/pull, and
//! convergence.
//!
//! Every mutating operation serializes behind one exclusive lock. The
//! critical path is dominated by relay round-trips, so the coarse lock is
//! the simplest correct design; counter and Lamport allocation happen
//! under it, which keeps per-device chains gap-free under concurrent
//! callers.

use crate::crypto::{self, cipher::EntryScheme, sealed};
use crate::sync::client::RelayClient;
use crate::sync::conflict::{Applied, MergeState};
use crate::sync::models::{
    DeviceBundle, DeviceId, Event, EventPayload, Invite, InviteClaim, MemberEvent, Op,
    MSG_TYPE_EVENT, MSG_TYPE_INVITE, MSG_TYPE_INVITE_CLAIM, MSG_TYPE_MEMBER_ADD,
    MSG_TYPE_MEMBER_REMOVE,
};
use crate::sync::state::{EventHead, MembershipHead, SyncStateStore, VerifiedMember};
use crate::sync::wire;
use crate::vault::Entry;
use crate::{LatchkeyError, Result};
use ed25519_dalek::{Signature, Signer, Verifier, VerifyingKey};
use rand::RngCore;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

const ZERO_SIG: [u8; 64] = [0u8; 64];

/// Outcome of a full sync cycle.
#[derive(Debug, Clone)]
pub struct SyncReport {
    /// The merged entry list; callers replace their local list with it.
    pub entries: Vec<Entry>,
    /// Number of verified members after the membership refresh.
    pub member_count: usize,
    /// Non-fatal sub-step failures, joined with `"; "`.
    pub warning: Option<String>,
}

/// Orchestrates replication against the coordination relay.
pub struct SyncEngine {
    client: RelayClient,
    state: Arc<SyncStateStore>,
    lock: Mutex<()>,
}

fn verify_signature(pubkey: &[u8], message: &[u8], signature: &[u8]) -> bool {
    let Ok(pubkey) = <[u8; 32]>::try_from(pubkey) else {
        return false;
    };
    let Ok(key) = VerifyingKey::from_bytes(&pubkey) else {
        return false;
    };
    let Ok(sig) = <[u8; 64]>::try_from(signature) else {
        return false;
    };
    key.verify(message, &Signature::from_bytes(&sig)).is_ok()
}

/// Replay and cryptographically verify a membership ledger.
///
/// Checks per event: `member_seq` increments by exactly one, `prev_hash`
/// links to the SHA-256 of the previous event's signed bytes, the actor is
/// the vault owner (or the subject itself for the bootstrap event), the
/// event signature verifies under the actor's key, the subject's bundle
/// self-signature verifies, the subject's device id matches its signing
/// key, and non-bootstrap admissions carry a valid invite claim signature.
///
/// Returns the resulting membership head and verified member set.
pub fn verify_member_chain(
    vault_id: &Uuid,
    events: &[MemberEvent],
) -> Result<(MembershipHead, Vec<VerifiedMember>)> {
    if events.is_empty() {
        return Err(LatchkeyError::Protocol(
            "membership ledger is empty".to_string(),
        ));
    }

    let mut members: BTreeMap<DeviceId, VerifiedMember> = BTreeMap::new();
    let mut owner: Option<DeviceId> = None;
    let mut prev_hash = [0u8; 32];

    for (index, event) in events.iter().enumerate() {
        let seq = index as u64 + 1;

        if event.vault_id != *vault_id {
            return Err(LatchkeyError::Protocol(format!(
                "member event {} belongs to another vault",
                seq
            )));
        }
        if event.member_seq != seq {
            return Err(LatchkeyError::Protocol(format!(
                "member_seq gap: expected {}, got {}",
                seq, event.member_seq
            )));
        }
        if event.prev_hash != prev_hash {
            return Err(LatchkeyError::Protocol(format!(
                "broken prev_hash link at member_seq {}",
                seq
            )));
        }

        let signed = event.signed_bytes()?;

        let actor_pubkey_sign = if seq == 1 {
            // Bootstrap: the owner admits itself under its own key.
            if event.actor_device_id != event.subject_device_id {
                return Err(LatchkeyError::Protocol(
                    "bootstrap event must be a self-admission".to_string(),
                ));
            }
            event.subject_pubkey_sign.clone()
        } else {
            let owner_id = owner
                .as_ref()
                .ok_or_else(|| LatchkeyError::Protocol("owner unknown".to_string()))?;
            if event.actor_device_id != *owner_id {
                return Err(LatchkeyError::Protocol(format!(
                    "member_seq {} authored by non-owner {}",
                    seq, event.actor_device_id
                )));
            }
            members
                .get(owner_id)
                .ok_or_else(|| LatchkeyError::Protocol("owner was removed".to_string()))?
                .pubkey_sign
                .clone()
        };

        if !verify_signature(&actor_pubkey_sign, &signed, &event.signature) {
            return Err(LatchkeyError::Protocol(format!(
                "invalid signature on member_seq {}",
                seq
            )));
        }

        match event.msg_type.as_str() {
            MSG_TYPE_MEMBER_ADD => {
                let subject_pubkey_sign: [u8; 32] = event
                    .subject_pubkey_sign
                    .as_slice()
                    .try_into()
                    .map_err(|_| {
                        LatchkeyError::Protocol("malformed subject signing key".to_string())
                    })?;

                if event.subject_device_id != DeviceId::from_signing_pubkey(&subject_pubkey_sign) {
                    return Err(LatchkeyError::Protocol(
                        "subject device id does not match signing key".to_string(),
                    ));
                }

                let bundle_bytes = wire::device_bundle_bytes(
                    &event.subject_device_id.to_bytes()?,
                    &subject_pubkey_sign,
                    &event.subject_pubkey_box.as_slice().try_into().map_err(|_| {
                        LatchkeyError::Protocol("malformed subject box key".to_string())
                    })?,
                );
                if !verify_signature(
                    &event.subject_pubkey_sign,
                    &bundle_bytes,
                    &event.subject_bundle_sig,
                ) {
                    return Err(LatchkeyError::Protocol(format!(
                        "invalid subject bundle signature on member_seq {}",
                        seq
                    )));
                }

                if seq > 1 {
                    let claim_bytes = wire::invite_claim_bytes(
                        &event.invite_id,
                        vault_id,
                        &event.subject_device_id.to_bytes()?,
                    );
                    if !verify_signature(
                        &event.subject_pubkey_sign,
                        &claim_bytes,
                        &event.claim_sig,
                    ) {
                        return Err(LatchkeyError::Protocol(format!(
                            "invalid invite claim signature on member_seq {}",
                            seq
                        )));
                    }
                }

                members.insert(
                    event.subject_device_id.clone(),
                    VerifiedMember {
                        device_id: event.subject_device_id.clone(),
                        pubkey_sign: event.subject_pubkey_sign.clone(),
                        pubkey_box: event.subject_pubkey_box.clone(),
                        key_epoch: 1,
                    },
                );
                if seq == 1 {
                    owner = Some(event.subject_device_id.clone());
                }
            }
            MSG_TYPE_MEMBER_REMOVE => {
                members.remove(&event.subject_device_id);
            }
            other => {
                return Err(LatchkeyError::Protocol(format!(
                    "unknown member event type: {}",
                    other
                )));
            }
        }

        prev_hash = wire::chain_hash(&signed);
    }

    Ok((
        MembershipHead {
            member_seq: events.len() as u64,
            member_head_hash: prev_hash,
        },
        members.into_values().collect(),
    ))
}

impl SyncEngine {
    pub fn new(client: RelayClient, state: Arc<SyncStateStore>) -> Self {
        Self {
            client,
            state,
            lock: Mutex::new(()),
        }
    }

    /// Publish this device's self-signed bundle to the relay. Idempotent.
    pub async fn register_device(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        let keys = self.state.device_keys()?;
        let bundle = keys.bundle()?;
        self.client.register_device(&bundle).await?;
        info!(device_id = %keys.device_id, "device registered");
        Ok(())
    }

    /// Create a new vault with this device as sole member and owner.
    pub async fn create_vault(&self) -> Result<Uuid> {
        let _guard = self.lock.lock().await;

        let keys = self.state.device_keys()?;
        let vault_id = Uuid::new_v4();

        let mut vault_key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut vault_key);

        let member_event_id = Uuid::new_v4();
        let prev_hash = [0u8; 32];
        let device_id_bytes = keys.device_id.to_bytes()?;

        let bundle_bytes =
            wire::device_bundle_bytes(&device_id_bytes, &keys.pubkey_sign, &keys.pubkey_box);
        let bundle_sig = keys.signing_key().sign(&bundle_bytes).to_bytes();

        let signed = wire::member_add_bytes(
            &member_event_id,
            &vault_id,
            1,
            &prev_hash,
            &device_id_bytes,
            &device_id_bytes,
            &Uuid::nil(),
            &ZERO_SIG,
            &bundle_sig,
            &keys.pubkey_sign,
            &keys.pubkey_box,
        );
        let signature = keys.signing_key().sign(&signed);

        let event = MemberEvent {
            msg_type: MSG_TYPE_MEMBER_ADD.to_string(),
            member_event_id,
            vault_id,
            member_seq: 1,
            prev_hash: prev_hash.to_vec(),
            actor_device_id: keys.device_id.clone(),
            subject_device_id: keys.device_id.clone(),
            subject_pubkey_sign: keys.pubkey_sign.to_vec(),
            subject_pubkey_box: keys.pubkey_box.to_vec(),
            subject_bundle_sig: bundle_sig.to_vec(),
            invite_id: Uuid::nil(),
            claim_sig: ZERO_SIG.to_vec(),
            signature: signature.to_bytes().to_vec(),
        };

        self.client.create_member_event(&vault_id, &event).await?;

        self.state.set_vault_id(&vault_id)?;
        self.state.set_vault_key(&vault_key)?;
        self.state.set_key_epoch(1)?;
        self.state.set_owner_device_id(&keys.device_id)?;
        self.state.set_membership_head(&MembershipHead {
            member_seq: 1,
            member_head_hash: wire::chain_hash(&signed),
        })?;
        self.state.set_verified_member(&VerifiedMember {
            device_id: keys.device_id.clone(),
            pubkey_sign: keys.pubkey_sign.to_vec(),
            pubkey_box: keys.pubkey_box.to_vec(),
            key_epoch: 1,
        })?;

        info!(%vault_id, "vault created");
        Ok(vault_id)
    }

    /// Seal the vault key to a target device and publish the invite.
    pub async fn invite_device(&self, target: &DeviceBundle) -> Result<Invite> {
        let _guard = self.lock.lock().await;
        self.invite_device_inner(target).await
    }

    /// Fetch the target's bundle by device id, then invite it.
    pub async fn invite_device_by_id(&self, target_device_id: &DeviceId) -> Result<Invite> {
        let target = self.client.get_device(target_device_id).await?;
        let _guard = self.lock.lock().await;
        self.invite_device_inner(&target).await
    }

    async fn invite_device_inner(&self, target: &DeviceBundle) -> Result<Invite> {
        target.verify()?;

        let keys = self.state.device_keys()?;
        let vault_id = self.state.vault_id()?;
        let vault_key = self.state.vault_key()?;

        let sealed_blob = sealed::seal_to(
            &target.pubkey_box_array()?,
            &keys.box_secret(),
            &vault_key,
        )?;
        let nonce: [u8; 24] = sealed_blob[..24]
            .try_into()
            .map_err(|_| LatchkeyError::Protocol("sealed payload too short".to_string()))?;
        let wrapped_payload = sealed_blob[24..].to_vec();

        let invite_id = Uuid::new_v4();
        let signed = wire::invite_bytes(
            &invite_id,
            &vault_id,
            &target.device_id.to_bytes()?,
            &target.pubkey_sign_array()?,
            &target.pubkey_box_array()?,
            &target.bundle_sig_array()?,
            &nonce,
            &wrapped_payload,
            &keys.device_id.to_bytes()?,
            true,
        );
        let signature = keys.signing_key().sign(&signed);

        let invite = Invite {
            msg_type: MSG_TYPE_INVITE.to_string(),
            invite_id,
            vault_id,
            target_device_id: target.device_id.clone(),
            target_device_pubkey_sign: target.device_pubkey_sign.clone(),
            target_device_pubkey_box: target.device_pubkey_box.clone(),
            target_device_bundle_sig: target.device_bundle_sig.clone(),
            nonce: nonce.to_vec(),
            wrapped_payload,
            created_by_device_id: keys.device_id.clone(),
            single_use: true,
            signature: signature.to_bytes().to_vec(),
        };

        self.client.create_invite(&vault_id, &invite).await?;
        info!(%invite_id, target = %target.device_id, "invite created");
        Ok(invite)
    }

    /// Claim an invite addressed to this device and adopt the vault:
    /// recover the vault key from the sealed payload, post the claim, and
    /// install the membership state after replaying the full member-event
    /// ledger. No local events are pushed here; seeding happens on the
    /// first sync after the owner admits us.
    pub async fn join_vault(&self, invite_id: &Uuid) -> Result<()> {
        let _guard = self.lock.lock().await;

        let keys = self.state.device_keys()?;

        let invites = self.client.get_invites(&keys.device_id).await?;
        let invite = invites
            .into_iter()
            .find(|i| i.invite_id == *invite_id)
            .ok_or_else(|| LatchkeyError::NotFound(format!("invite {}", invite_id)))?;

        let creator = self.client.get_device(&invite.created_by_device_id).await?;
        creator.verify()?;

        let mut sealed_blob =
            Vec::with_capacity(invite.nonce.len() + invite.wrapped_payload.len());
        sealed_blob.extend_from_slice(&invite.nonce);
        sealed_blob.extend_from_slice(&invite.wrapped_payload);

        let payload = sealed::open_sealed(
            &creator.pubkey_box_array()?,
            &keys.box_secret(),
            &sealed_blob,
        )?;
        if payload.len() < 32 {
            return Err(LatchkeyError::Protocol(
                "invite payload shorter than a vault key".to_string(),
            ));
        }
        let mut vault_key = [0u8; 32];
        vault_key.copy_from_slice(&payload[..32]);

        let claim_bytes =
            wire::invite_claim_bytes(invite_id, &invite.vault_id, &keys.device_id.to_bytes()?);
        let claim_sig = keys.signing_key().sign(&claim_bytes);

        let claim = InviteClaim {
            msg_type: MSG_TYPE_INVITE_CLAIM.to_string(),
            invite_id: *invite_id,
            vault_id: invite.vault_id,
            device_id: keys.device_id.clone(),
            signature: claim_sig.to_bytes().to_vec(),
        };
        self.client.claim_invite(invite_id, &claim).await?;

        self.state.set_vault_id(&invite.vault_id)?;
        self.state.set_vault_key(&vault_key)?;
        self.state.set_key_epoch(1)?;

        // Trust no summary on first contact: replay the signed ledger.
        let member_events = self.client.get_member_events(&invite.vault_id, 0).await?;
        let (head, members) = verify_member_chain(&invite.vault_id, &member_events)?;
        let owner = member_events[0].subject_device_id.clone();

        self.state.set_owner_device_id(&owner)?;
        self.state.set_membership_head(&head)?;
        self.state.clear_verified_members()?;
        for member in &members {
            self.state.set_verified_member(member)?;
        }

        info!(vault_id = %invite.vault_id, members = members.len(), "joined vault");
        Ok(())
    }

    /// Admit one claimant: compose, sign, and publish the `member_add`,
    /// then advance the cached membership head.
    pub async fn accept_invite_claim(&self, claim: &InviteClaim) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.accept_invite_claim_inner(claim).await
    }

    async fn accept_invite_claim_inner(&self, claim: &InviteClaim) -> Result<()> {
        let keys = self.state.device_keys()?;
        let vault_id = self.state.vault_id()?;
        if claim.vault_id != vault_id {
            return Err(LatchkeyError::Protocol(
                "invite claim vault mismatch".to_string(),
            ));
        }

        let subject = self.client.get_device(&claim.device_id).await?;
        subject.verify()?;

        let claim_bytes = claim.signed_bytes()?;
        if !verify_signature(&subject.device_pubkey_sign, &claim_bytes, &claim.signature) {
            return Err(crate::sync::models::WireError::InvalidSignature.into());
        }

        let head = self.state.membership_head()?;
        let member_event_id = Uuid::new_v4();
        let member_seq = head.member_seq + 1;

        let signed = wire::member_add_bytes(
            &member_event_id,
            &vault_id,
            member_seq,
            &head.member_head_hash,
            &keys.device_id.to_bytes()?,
            &subject.device_id.to_bytes()?,
            &claim.invite_id,
            &claim
                .signature
                .as_slice()
                .try_into()
                .map_err(|_| crate::sync::models::WireError::InvalidLength {
                    field: "claim_sig",
                    expected: 64,
                    got: claim.signature.len(),
                })?,
            &subject.bundle_sig_array()?,
            &subject.pubkey_sign_array()?,
            &subject.pubkey_box_array()?,
        );
        let signature = keys.signing_key().sign(&signed);

        let event = MemberEvent {
            msg_type: MSG_TYPE_MEMBER_ADD.to_string(),
            member_event_id,
            vault_id,
            member_seq,
            prev_hash: head.member_head_hash.to_vec(),
            actor_device_id: keys.device_id.clone(),
            subject_device_id: subject.device_id.clone(),
            subject_pubkey_sign: subject.device_pubkey_sign.clone(),
            subject_pubkey_box: subject.device_pubkey_box.clone(),
            subject_bundle_sig: subject.device_bundle_sig.clone(),
            invite_id: claim.invite_id,
            claim_sig: claim.signature.clone(),
            signature: signature.to_bytes().to_vec(),
        };

        self.client.create_member_event(&vault_id, &event).await?;

        self.state.set_membership_head(&MembershipHead {
            member_seq,
            member_head_hash: wire::chain_hash(&signed),
        })?;
        self.state.set_verified_member(&VerifiedMember {
            device_id: subject.device_id.clone(),
            pubkey_sign: subject.device_pubkey_sign.clone(),
            pubkey_box: subject.device_pubkey_box.clone(),
            key_epoch: 1,
        })?;

        info!(member = %subject.device_id, member_seq, "member admitted");
        Ok(())
    }

    /// Pull claims against invites we created and admit each one. Replays
    /// are harmless: an already-consumed invite is skipped.
    pub async fn accept_pending_invite_claims(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.accept_pending_invite_claims_inner().await
    }

    async fn accept_pending_invite_claims_inner(&self) -> Result<()> {
        let keys = self.state.device_keys()?;
        let claims = self.client.get_invite_claims(&keys.device_id).await?;
        if claims.is_empty() {
            return Ok(());
        }

        let vault_id = self.state.vault_id()?;
        for claim in &claims {
            if claim.vault_id != vault_id {
                continue;
            }
            match self.accept_invite_claim_inner(claim).await {
                Ok(()) => {}
                Err(LatchkeyError::Relay(e)) if e.is_invite_already_used() => {
                    debug!(invite_id = %claim.invite_id, "invite already used, skipping claim");
                }
                Err(LatchkeyError::Wire(e)) => {
                    warn!(invite_id = %claim.invite_id, error = %e, "skipping malformed claim");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    /// Replace the cached membership head and verified-member set from the
    /// relay's summary. Members with malformed key lengths are rejected.
    pub async fn refresh_membership(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.refresh_membership_inner().await
    }

    async fn refresh_membership_inner(&self) -> Result<()> {
        let vault_id = self.state.vault_id()?;
        let response = self.client.get_vault_members(&vault_id).await?;

        let member_head_hash: [u8; 32] = response
            .head_hash
            .as_slice()
            .try_into()
            .map_err(|_| LatchkeyError::Protocol("invalid membership head hash".to_string()))?;

        self.state.set_membership_head(&MembershipHead {
            member_seq: response.member_seq,
            member_head_hash,
        })?;

        self.state.clear_verified_members()?;
        for member in &response.members {
            if member.device_pubkey_sign.len() != 32 || member.device_pubkey_box.len() != 32 {
                warn!(device_id = %member.device_id, "rejecting member with malformed keys");
                continue;
            }
            self.state.set_verified_member(&VerifiedMember {
                device_id: member.device_id.clone(),
                pubkey_sign: member.device_pubkey_sign.clone(),
                pubkey_box: member.device_pubkey_box.clone(),
                key_epoch: member.key_epoch,
            })?;
        }

        Ok(())
    }

    /// Encrypt, chain, sign, and push one local mutation. On push failure
    /// the mutation is queued for retry and the error is returned.
    pub async fn push_entry(&self, entry: &Entry, op: Op) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.push_entry_inner(entry, op).await
    }

    async fn push_entry_inner(&self, entry: &Entry, op: Op) -> Result<()> {
        let keys = self.state.device_keys()?;
        let vault_id = self.state.vault_id()?;
        let key_epoch = self.state.key_epoch()?;
        let head = self.state.event_head(&keys.device_id)?;
        let lamport = self.state.increment_lamport()?;

        let vault_key = self.state.vault_key()?;
        let payload = serde_json::to_vec(&EventPayload {
            op,
            entry: entry.clone(),
        })
        .map_err(|e| LatchkeyError::InvalidInput(e.to_string()))?;
        let (ciphertext, nonce) = crypto::encrypt_event_payload(&vault_key, key_epoch, &payload)?;

        let event_id = Uuid::new_v4();
        let counter = head.last_counter + 1;

        let signed = wire::event_bytes(
            &event_id,
            &vault_id,
            &keys.device_id.to_bytes()?,
            counter,
            lamport,
            key_epoch,
            &head.last_hash,
            &nonce,
            &ciphertext,
        );
        let signature = keys.signing_key().sign(&signed);

        let event = Event {
            msg_type: MSG_TYPE_EVENT.to_string(),
            event_id,
            vault_id,
            device_id: keys.device_id.clone(),
            counter,
            lamport,
            key_epoch,
            prev_hash: head.last_hash.to_vec(),
            nonce: nonce.to_vec(),
            ciphertext,
            signature: signature.to_bytes().to_vec(),
            seq: 0,
        };

        if let Err(e) = self.client.push_event(&vault_id, &event).await {
            warn!(entry_id = %entry.id, error = %e, "push failed, queueing for retry");
            if let Err(qe) = self.state.add_pending(op, entry) {
                warn!(entry_id = %entry.id, error = %qe, "failed to queue pending entry");
            }
            return Err(e.into());
        }

        self.state.set_event_head(
            &keys.device_id,
            &EventHead {
                last_counter: counter,
                last_hash: wire::chain_hash(&signed),
            },
        )?;

        match op {
            Op::Upsert => self.state.set_entry_scheme(&entry.id, EntryScheme::V2)?,
            Op::Delete => self.state.remove_entry_scheme(&entry.id)?,
        }

        debug!(entry_id = %entry.id, counter, lamport, "entry pushed");
        Ok(())
    }

    /// Retry every queued mutation; each success is dequeued. Returns the
    /// first failure, if any, after attempting the whole queue.
    pub async fn flush_pending_entries(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.flush_pending_entries_inner().await
    }

    async fn flush_pending_entries_inner(&self) -> Result<()> {
        let pending = self.state.pending_entries()?;
        if pending.is_empty() {
            return Ok(());
        }

        let mut first_err = None;
        for item in pending {
            match self.push_entry_inner(&item.entry, item.op).await {
                Ok(()) => self.state.remove_pending(&item.entry.id)?,
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Pull events since the cursor, verify and decrypt each against the
    /// verified-member set, and merge them over the local entries. Unknown
    /// senders, bad signatures, and undecryptable payloads are skipped.
    ///
    /// The returned list is authoritative; the caller replaces its local
    /// entries with it.
    pub async fn sync_entries(&self, local_entries: &[Entry]) -> Result<Vec<Entry>> {
        let _guard = self.lock.lock().await;
        self.sync_entries_inner(local_entries).await
    }

    async fn sync_entries_inner(&self, local_entries: &[Entry]) -> Result<Vec<Entry>> {
        let vault_id = self.state.vault_id()?;
        let cursor = self.state.sync_cursor()?;
        let vault_key = self.state.vault_key()?;

        let events = self.client.pull_events(&vault_id, cursor).await?;

        let mut merge = MergeState::from_local(local_entries);
        let mut max_seq = cursor;
        let current_lamport = self.state.lamport()?;
        let mut max_lamport = current_lamport;

        for event in &events {
            let Some(member) = self.state.verified_member(&event.device_id)? else {
                debug!(device_id = %event.device_id, "skipping event from unknown sender");
                continue;
            };

            let Ok(signed) = event.signed_bytes() else {
                debug!(event_id = %event.event_id, "skipping malformed event");
                continue;
            };
            if !verify_signature(&member.pubkey_sign, &signed, &event.signature) {
                debug!(event_id = %event.event_id, "skipping event with bad signature");
                continue;
            }

            let Ok((plaintext, scheme)) = crypto::decrypt_event_payload(
                &vault_key,
                event.key_epoch,
                &event.nonce,
                &event.ciphertext,
            ) else {
                debug!(event_id = %event.event_id, "skipping undecryptable event");
                continue;
            };

            let Ok(payload) = serde_json::from_slice::<EventPayload>(&plaintext) else {
                debug!(event_id = %event.event_id, "skipping event with unknown payload");
                continue;
            };

            match merge.apply(payload.op, payload.entry.clone(), event.lamport, &event.device_id) {
                Applied::UpsertWon => {
                    self.state.set_entry_scheme(&payload.entry.id, scheme)?;
                }
                Applied::DeleteWon => {
                    self.state.remove_entry_scheme(&payload.entry.id)?;
                }
                Applied::Ignored => {}
            }

            max_seq = max_seq.max(event.seq);
            max_lamport = max_lamport.max(event.lamport);
        }

        if max_seq > cursor {
            self.state.set_sync_cursor(max_seq)?;
        }
        if max_lamport > current_lamport {
            self.state.update_lamport(max_lamport)?;
        }

        Ok(merge.into_entries())
    }

    fn is_owner(&self) -> Result<bool> {
        let keys = self.state.device_keys()?;
        Ok(match self.state.owner_device_id()? {
            Some(owner) => owner == keys.device_id,
            None => false,
        })
    }

    /// Push every local entry once if this device has never authored an
    /// event in this vault (`event_head.last_counter == 0`). Covers the
    /// owner who created the vault over pre-existing entries and the
    /// joiner with a prior local vault.
    async fn seed_local_entries_inner(&self, local_entries: &[Entry]) -> Result<()> {
        let keys = self.state.device_keys()?;
        let head = self.state.event_head(&keys.device_id)?;
        if head.last_counter != 0 {
            return Ok(());
        }

        let mut first_err = None;
        for entry in local_entries {
            match self.push_entry_inner(entry, Op::Upsert).await {
                Ok(()) => self.state.remove_pending(&entry.id)?,
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Full sync cycle: accept pending claims (owner only), refresh
    /// membership, seed never-pushed local entries, flush the pending
    /// queue, then pull and merge. Sub-step failures become a composite
    /// warning; only a failed merge fails the sync.
    pub async fn sync_now(&self, local_entries: &[Entry]) -> Result<SyncReport> {
        let _guard = self.lock.lock().await;

        if !self.state.is_configured() {
            return Err(LatchkeyError::NotConfigured);
        }

        let mut warnings: Vec<String> = Vec::new();

        if self.is_owner()? {
            if let Err(e) = self.accept_pending_invite_claims_inner().await {
                warnings.push(format!("failed to accept invite claims: {}", e));
            }
        }

        if let Err(e) = self.refresh_membership_inner().await {
            warnings.push(format!("failed to refresh vault members: {}", e));
        }

        if let Err(e) = self.seed_local_entries_inner(local_entries).await {
            warnings.push(format!("some changes could not be pushed yet: {}", e));
        }

        if let Err(e) = self.flush_pending_entries_inner().await {
            if warnings.is_empty() {
                warnings.push(format!("some changes could not be pushed yet: {}", e));
            }
        }

        let entries = self.sync_entries_inner(local_entries).await?;

        let member_count = self
            .state
            .verified_members()
            .map(|members| members.len())
            .unwrap_or(0);

        let warning = if warnings.is_empty() {
            None
        } else {
            Some(warnings.join("; "))
        };
        if let Some(w) = &warning {
            warn!(warning = %w, "sync completed with warnings");
        } else {
            info!(entries = entries.len(), member_count, "sync completed");
        }

        Ok(SyncReport {
            entries,
            member_count,
            warning,
        })
    }

    /// Forget all vault-scoped state: identity of the vault, keys, heads,
    /// cursor, members, and the pending queue. Device identity persists so
    /// the device can re-create or re-join.
    pub async fn leave_vault(&self) -> Result<()> {
        let _guard = self.lock.lock().await;

        self.state.clear_vault_state()?;
        self.state.clear_verified_members()?;
        self.state.clear_event_heads()?;
        self.state.clear_pending()?;

        info!("left vault");
        Ok(())
    }
}
