//! Pairwise sessions.
//!
//! State machine per remote device: no session until a pre-key bundle is
//! processed (initiator) or a pre-key message is received (responder), then
//! established. Sessions are created with X3DH and advanced with the Double
//! Ratchet. Every function here assumes the caller holds the record lock for
//! the remote address.

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use sigil_protocol::{
    decode, encode, CiphertextMessageType, EncryptedMessage, PreKeyBundle, PreKeySignalMessage,
    ProtocolAddress, RegistrationId, SignalMessage,
};

use crate::aead::AeadCipher;
use crate::directory::KeyDirectory;
use crate::error::{CryptoError, Result};
use crate::keys::{KeyPair, PublicKey};
use crate::prekey::verify_signed_prekey;
use crate::ratchet::{PendingPreKey, SessionParams, SessionState};
use crate::stores::{IdentityTrustRecord, KeyStore, LocalIdentity, TrustLevel};
use crate::{unix_millis, x3dh};

/// Superseded states kept so late messages for them still decrypt.
pub const MAX_ARCHIVED_STATES: usize = 5;

/// All ratchet states for one remote device: the current one plus a few
/// archived predecessors (e.g. after simultaneous initiation).
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct SessionRecord {
    current: Option<SessionState>,
    previous: VecDeque<SessionState>,
}

impl fmt::Debug for SessionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRecord")
            .field("current", &self.current.as_ref().map(|s| s.base_key()))
            .field("archived", &self.previous.len())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Current,
    Archived(usize),
}

impl SessionRecord {
    pub fn new(state: SessionState) -> Self {
        Self {
            current: Some(state),
            previous: VecDeque::new(),
        }
    }

    pub fn current(&self) -> Option<&SessionState> {
        self.current.as_ref()
    }

    pub fn has_current(&self) -> bool {
        self.current.is_some()
    }

    pub fn archived_count(&self) -> usize {
        self.previous.len()
    }

    /// Make `state` current, archiving the old current state.
    pub fn promote(&mut self, state: SessionState) {
        if let Some(old) = self.current.take() {
            self.previous.push_front(old);
            self.previous.truncate(MAX_ARCHIVED_STATES);
        }
        self.current = Some(state);
    }

    fn get(&self, slot: Slot) -> Option<&SessionState> {
        match slot {
            Slot::Current => self.current.as_ref(),
            Slot::Archived(i) => self.previous.get(i),
        }
    }

    fn slots(&self) -> Vec<Slot> {
        let mut slots = Vec::with_capacity(1 + self.previous.len());
        if self.current.is_some() {
            slots.push(Slot::Current);
        }
        slots.extend((0..self.previous.len()).map(Slot::Archived));
        slots
    }

    fn find_by_base_key(&self, base_key: &PublicKey) -> Option<Slot> {
        self.slots()
            .into_iter()
            .find(|slot| self.get(*slot).is_some_and(|s| s.base_key() == base_key))
    }

    /// Store the advanced state back; an archived state that just decrypted
    /// becomes current again.
    fn commit(&mut self, slot: Slot, state: SessionState) {
        match slot {
            Slot::Current => self.current = Some(state),
            Slot::Archived(i) => {
                self.previous.remove(i);
                self.promote(state);
            }
        }
    }
}

/// Diagnostics for one remote device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub address: ProtocolAddress,
    pub established: bool,
    pub initiator: bool,
    /// Outgoing messages still carry pre-key initiation data.
    pub pending_prekey: bool,
    pub sending_index: u32,
    pub receiving_index: u32,
    pub previous_counter: u32,
    pub remote_registration_id: Option<RegistrationId>,
    pub remote_identity: Option<String>,
    pub archived_states: usize,
    pub skipped_keys: usize,
    pub created_at: Option<u64>,
}

impl SessionInfo {
    fn none(address: &ProtocolAddress) -> Self {
        Self {
            address: address.clone(),
            established: false,
            initiator: false,
            pending_prekey: false,
            sending_index: 0,
            receiving_index: 0,
            previous_counter: 0,
            remote_registration_id: None,
            remote_identity: None,
            archived_states: 0,
            skipped_keys: 0,
            created_at: None,
        }
    }
}

pub async fn session_info<S: KeyStore + ?Sized>(store: &S, remote: &ProtocolAddress) -> Result<SessionInfo> {
    let Some(record) = store.load_session(remote).await? else {
        return Ok(SessionInfo::none(remote));
    };
    let Some(state) = record.current() else {
        return Ok(SessionInfo {
            archived_states: record.archived_count(),
            ..SessionInfo::none(remote)
        });
    };
    Ok(SessionInfo {
        address: remote.clone(),
        established: true,
        initiator: state.is_initiator(),
        pending_prekey: state.pending_prekey().is_some(),
        sending_index: state.sending_index(),
        receiving_index: state.receiving_index(),
        previous_counter: state.previous_counter(),
        remote_registration_id: Some(state.remote_registration_id()),
        remote_identity: Some(state.remote_identity().fingerprint()),
        archived_states: record.archived_count(),
        skipped_keys: state.skipped_keys(),
        created_at: Some(state.created_at()),
    })
}

/// TOFU check. Returns the record to save when the device is new.
async fn check_trust<S: KeyStore + ?Sized>(
    store: &S,
    remote: &ProtocolAddress,
    identity_key: &PublicKey,
) -> Result<Option<IdentityTrustRecord>> {
    match store.get_identity(remote).await? {
        Some(record) if record.identity_key == *identity_key => Ok(None),
        Some(record) => {
            warn!(
                %remote,
                known = %record.identity_key.fingerprint(),
                presented = %identity_key.fingerprint(),
                "identity key changed; refusing session"
            );
            Err(CryptoError::IdentityKeyChanged(remote.clone()))
        }
        None => Ok(Some(IdentityTrustRecord {
            identity_key: *identity_key,
            trust: TrustLevel::Unverified,
            first_seen: unix_millis(),
        })),
    }
}

/// Verify a fetched bundle and derive the initiator state from it. Nothing
/// is written; the caller persists the state with its first message.
pub async fn process_prekey_bundle<S: KeyStore + ?Sized>(
    store: &S,
    local: &LocalIdentity,
    remote: &ProtocolAddress,
    bundle: &PreKeyBundle,
) -> Result<(SessionState, Option<IdentityTrustRecord>)> {
    let their_identity = PublicKey::from_bytes(bundle.identity_key);
    let their_signed_prekey = PublicKey::from_bytes(bundle.signed_prekey);
    if bundle.device_id != remote.device_id
        || !verify_signed_prekey(&their_identity, &their_signed_prekey, &bundle.signed_prekey_signature)
    {
        warn!(%remote, "pre-key bundle failed verification");
        return Err(CryptoError::InvalidBundle(remote.clone()));
    }
    let new_trust = check_trust(store, remote, &their_identity).await?;

    let base_key = KeyPair::generate()?;
    let their_one_time = bundle
        .one_time_prekey
        .as_ref()
        .map(|p| PublicKey::from_bytes(p.public_key));
    let secret = x3dh::initiator_secret(
        &local.key_pair,
        &base_key,
        &their_identity,
        &their_signed_prekey,
        their_one_time.as_ref(),
    )?;

    let state = SessionState::initiate(
        &secret,
        SessionParams {
            local_identity: local.key_pair.public_key,
            remote_identity: their_identity,
            remote_registration_id: bundle.registration_id,
            base_key: base_key.public_key,
            created_at: unix_millis(),
        },
        &their_signed_prekey,
        PendingPreKey {
            one_time_prekey_id: bundle.one_time_prekey.as_ref().map(|p| p.id),
            signed_prekey_id: bundle.signed_prekey_id,
            base_key: base_key.public_key,
        },
    )?;
    debug!(
        %remote,
        one_time = bundle.one_time_prekey.is_some(),
        "derived initiator session from bundle"
    );
    Ok((state, new_trust))
}

/// Encrypt for one remote device, establishing a session from the
/// directory first when none exists.
pub async fn encrypt<S, D>(
    store: &S,
    directory: &D,
    cipher: &dyn AeadCipher,
    remote: &ProtocolAddress,
    plaintext: &[u8],
) -> Result<EncryptedMessage>
where
    S: KeyStore + ?Sized,
    D: KeyDirectory + ?Sized,
{
    let local = store.local_identity().await?;
    let existing = store.load_session(remote).await?.filter(SessionRecord::has_current);

    let (mut record, new_trust) = match existing {
        Some(record) => (record, None),
        None => {
            let bundle = directory
                .fetch_prekey_bundle(remote)
                .await
                .map_err(|e| e.for_address(remote))?;
            let (state, new_trust) = process_prekey_bundle(store, &local, remote, &bundle).await?;
            let mut record = store.load_session(remote).await?.unwrap_or_default();
            record.promote(state);
            info!(%remote, "established session as initiator");
            (record, new_trust)
        }
    };

    let state = record
        .current()
        .ok_or_else(|| CryptoError::NoSession(remote.clone()))?;
    let (next, message) = state.encrypt(cipher, plaintext)?;

    let encrypted = match next.pending_prekey() {
        Some(pending) => EncryptedMessage {
            message_type: CiphertextMessageType::PreKey,
            body: encode(&PreKeySignalMessage {
                registration_id: local.registration_id,
                one_time_prekey_id: pending.one_time_prekey_id,
                signed_prekey_id: pending.signed_prekey_id,
                base_key: pending.base_key.to_bytes(),
                identity_key: local.key_pair.public_key.to_bytes(),
                message,
            })?,
        },
        None => EncryptedMessage {
            message_type: CiphertextMessageType::Whisper,
            body: encode(&message)?,
        },
    };

    record.commit(Slot::Current, next);
    if let Some(trust) = new_trust {
        store.save_identity(remote, trust).await?;
    }
    store.store_session(remote, record).await?;
    Ok(encrypted)
}

/// Decrypt a message from `remote`.
pub async fn decrypt<S, D>(
    store: &S,
    directory: &D,
    max_skip: u32,
    remote: &ProtocolAddress,
    encrypted: &EncryptedMessage,
) -> Result<Vec<u8>>
where
    S: KeyStore + ?Sized,
    D: KeyDirectory + ?Sized,
{
    match encrypted.message_type {
        CiphertextMessageType::PreKey => {
            let message: PreKeySignalMessage = decode(&encrypted.body)?;
            decrypt_prekey(store, directory, max_skip, remote, &message).await
        }
        CiphertextMessageType::Whisper => {
            let message: SignalMessage = decode(&encrypted.body)?;
            decrypt_whisper(store, max_skip, remote, &message).await
        }
    }
}

async fn decrypt_whisper<S: KeyStore + ?Sized>(
    store: &S,
    max_skip: u32,
    remote: &ProtocolAddress,
    message: &SignalMessage,
) -> Result<Vec<u8>> {
    let mut record = store
        .load_session(remote)
        .await?
        .ok_or_else(|| CryptoError::NoSession(remote.clone()))?;
    let slots = record.slots();
    if slots.is_empty() {
        return Err(CryptoError::NoSession(remote.clone()));
    }

    if let (Some(state), Some(trusted)) = (record.current(), store.get_identity(remote).await?) {
        if trusted.identity_key != *state.remote_identity() {
            return Err(CryptoError::IdentityKeyChanged(remote.clone()));
        }
    }

    let mut first_error = None;
    for slot in slots {
        let Some(state) = record.get(slot) else { continue };
        match state.decrypt(message, max_skip) {
            Ok((next, plaintext)) => {
                if slot != Slot::Current {
                    debug!(%remote, "message decrypted with archived session state");
                }
                record.commit(slot, next);
                store.store_session(remote, record).await?;
                return Ok(plaintext);
            }
            Err(e @ CryptoError::DuplicateMessage { .. }) => return Err(e),
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }
    }
    Err(first_error.unwrap_or(CryptoError::InvalidMessage("no session state could decrypt")))
}

async fn decrypt_prekey<S, D>(
    store: &S,
    directory: &D,
    max_skip: u32,
    remote: &ProtocolAddress,
    message: &PreKeySignalMessage,
) -> Result<Vec<u8>>
where
    S: KeyStore + ?Sized,
    D: KeyDirectory + ?Sized,
{
    let their_identity = PublicKey::from_bytes(message.identity_key);
    let new_trust = check_trust(store, remote, &their_identity).await?;
    let base_key = PublicKey::from_bytes(message.base_key);
    let mut record = store.load_session(remote).await?.unwrap_or_default();

    // Repeated initiation for a session we already derived.
    if let Some(slot) = record.find_by_base_key(&base_key) {
        let state = record
            .get(slot)
            .ok_or_else(|| CryptoError::NoSession(remote.clone()))?;
        let (next, plaintext) = state.decrypt(&message.message, max_skip)?;
        record.commit(slot, next);
        store.store_session(remote, record).await?;
        return Ok(plaintext);
    }

    let local = store.local_identity().await?;
    let signed = store
        .load_signed_prekey(message.signed_prekey_id)
        .await?
        .ok_or(CryptoError::InvalidSignedPreKeyId(message.signed_prekey_id))?;
    let one_time = match message.one_time_prekey_id {
        Some(id) => Some(
            store
                .load_prekey(id)
                .await?
                .ok_or(CryptoError::InvalidPreKeyId(id))?,
        ),
        None => None,
    };

    let secret = x3dh::responder_secret(
        &local.key_pair,
        &signed.key_pair,
        one_time.as_ref().map(|r| &r.key_pair),
        &their_identity,
        &base_key,
    )?;
    let state = SessionState::respond(
        &secret,
        SessionParams {
            local_identity: local.key_pair.public_key,
            remote_identity: their_identity,
            remote_registration_id: message.registration_id,
            base_key,
            created_at: unix_millis(),
        },
        signed.key_pair.clone(),
    );
    let (state, plaintext) = state.decrypt(&message.message, max_skip)?;

    // Authenticated: commit session, trust and pre-key consumption together.
    record.promote(state);
    let consumed = one_time.as_ref().map(|used| used.id);
    store
        .commit_responder_session(remote, record, new_trust, consumed)
        .await?;
    if let Some(used) = one_time {
        if let Err(e) = directory
            .mark_one_time_prekey_used(&local.address(), used.id)
            .await
        {
            warn!(prekey_id = used.id, "failed to report consumed pre-key: {e}");
        }
    }
    info!(
        %remote,
        one_time = message.one_time_prekey_id.is_some(),
        "established session as responder"
    );
    Ok(plaintext)
}
