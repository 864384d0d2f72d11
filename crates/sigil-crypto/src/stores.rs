//! Key Material Store.
//!
//! One trait per record family, bundled by [`KeyStore`], which adds the
//! whole-store snapshot and swap used by backups and on-disk persistence.
//! [`InMemoryKeyStore`] keeps everything in a single [`StoreSnapshot`] behind
//! a `tokio` `RwLock`, so a restore replaces every record in one write.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use sigil_protocol::{DeviceId, PreKeyId, ProtocolAddress, RegistrationId, SignedPreKeyId, UserId};

use crate::error::{CryptoError, Result};
use crate::group::SenderKeyRecord;
use crate::keys::{KeyPair, PublicKey};
use crate::session::SessionRecord;

// ── Records ─────────────────────────────────────────────────────────────

/// This device's long-term identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalIdentity {
    pub user_id: UserId,
    pub device_id: DeviceId,
    pub key_pair: KeyPair,
    pub registration_id: RegistrationId,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
}

impl LocalIdentity {
    pub fn address(&self) -> ProtocolAddress {
        ProtocolAddress::new(self.user_id.clone(), self.device_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrustLevel {
    /// Accepted on first use, never compared out of band.
    Unverified,
    /// Safety number confirmed by the user.
    Verified,
}

/// Last-seen identity key of a remote device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityTrustRecord {
    pub identity_key: PublicKey,
    pub trust: TrustLevel,
    pub first_seen: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreKeyRecord {
    pub id: PreKeyId,
    pub key_pair: KeyPair,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedPreKeyRecord {
    pub id: SignedPreKeyId,
    pub key_pair: KeyPair,
    /// XEdDSA signature over the public key by the identity key.
    pub signature: Vec<u8>,
    pub created_at: u64,
}

/// Entire contents of a key store. This is the unit of backup and of the
/// encrypted on-disk file; maps are ordered so the encoding is canonical.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub local: Option<LocalIdentity>,
    pub identities: BTreeMap<ProtocolAddress, IdentityTrustRecord>,
    pub prekeys: BTreeMap<PreKeyId, PreKeyRecord>,
    pub signed_prekeys: BTreeMap<SignedPreKeyId, SignedPreKeyRecord>,
    pub sessions: BTreeMap<ProtocolAddress, SessionRecord>,
    pub sender_keys: BTreeMap<(ProtocolAddress, Uuid), SenderKeyRecord>,
    pub next_prekey_id: PreKeyId,
    pub next_signed_prekey_id: SignedPreKeyId,
}

impl Default for StoreSnapshot {
    fn default() -> Self {
        Self {
            local: None,
            identities: BTreeMap::new(),
            prekeys: BTreeMap::new(),
            signed_prekeys: BTreeMap::new(),
            sessions: BTreeMap::new(),
            sender_keys: BTreeMap::new(),
            next_prekey_id: 1,
            next_signed_prekey_id: 1,
        }
    }
}

// ── Store traits ────────────────────────────────────────────────────────

#[async_trait]
pub trait IdentityKeyStore: Send + Sync {
    /// Fails with [`CryptoError::NotProvisioned`] before provisioning.
    async fn local_identity(&self) -> Result<LocalIdentity>;

    async fn save_local_identity(&self, identity: LocalIdentity) -> Result<()>;

    async fn get_identity(&self, address: &ProtocolAddress) -> Result<Option<IdentityTrustRecord>>;

    async fn save_identity(&self, address: &ProtocolAddress, record: IdentityTrustRecord) -> Result<()>;

    /// Trust records for every known device of `user_id`.
    async fn identities_for_user(&self, user_id: &str) -> Result<Vec<(ProtocolAddress, IdentityTrustRecord)>>;
}

#[async_trait]
pub trait PreKeyStore: Send + Sync {
    async fn load_prekey(&self, id: PreKeyId) -> Result<Option<PreKeyRecord>>;

    async fn save_prekey(&self, record: PreKeyRecord) -> Result<()>;

    async fn remove_prekey(&self, id: PreKeyId) -> Result<()>;

    async fn prekey_ids(&self) -> Result<Vec<PreKeyId>>;

    /// Reserve `count` consecutive ids and return the first one.
    async fn reserve_prekey_ids(&self, count: u32) -> Result<PreKeyId>;
}

#[async_trait]
pub trait SignedPreKeyStore: Send + Sync {
    async fn load_signed_prekey(&self, id: SignedPreKeyId) -> Result<Option<SignedPreKeyRecord>>;

    async fn save_signed_prekey(&self, record: SignedPreKeyRecord) -> Result<()>;

    async fn remove_signed_prekey(&self, id: SignedPreKeyId) -> Result<()>;

    async fn signed_prekey_ids(&self) -> Result<Vec<SignedPreKeyId>>;

    async fn reserve_signed_prekey_id(&self) -> Result<SignedPreKeyId>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load_session(&self, address: &ProtocolAddress) -> Result<Option<SessionRecord>>;

    async fn store_session(&self, address: &ProtocolAddress, record: SessionRecord) -> Result<()>;

    async fn delete_session(&self, address: &ProtocolAddress) -> Result<()>;

    async fn session_addresses(&self) -> Result<Vec<ProtocolAddress>>;
}

#[async_trait]
pub trait SenderKeyStore: Send + Sync {
    async fn load_sender_key(
        &self,
        sender: &ProtocolAddress,
        distribution_id: Uuid,
    ) -> Result<Option<SenderKeyRecord>>;

    async fn store_sender_key(
        &self,
        sender: &ProtocolAddress,
        distribution_id: Uuid,
        record: SenderKeyRecord,
    ) -> Result<()>;

    async fn remove_sender_key(&self, sender: &ProtocolAddress, distribution_id: Uuid) -> Result<()>;

    /// Every sender with a stored state for this distribution.
    async fn sender_key_senders(&self, distribution_id: Uuid) -> Result<Vec<ProtocolAddress>>;
}

/// The full Key Material Store.
#[async_trait]
pub trait KeyStore:
    IdentityKeyStore + PreKeyStore + SignedPreKeyStore + SessionStore + SenderKeyStore
{
    async fn snapshot(&self) -> Result<StoreSnapshot>;

    /// Replace every record at once. Nothing of the previous contents survives.
    async fn replace_all(&self, snapshot: StoreSnapshot) -> Result<()>;

    /// Persist a session established from a PreKey message.
    ///
    /// The consumed one-time pre-key is removed first: if a later write
    /// fails, the pre-key is already gone and can never be accepted twice.
    async fn commit_responder_session(
        &self,
        address: &ProtocolAddress,
        record: SessionRecord,
        trust: Option<IdentityTrustRecord>,
        consumed_prekey: Option<PreKeyId>,
    ) -> Result<()> {
        if let Some(id) = consumed_prekey {
            self.remove_prekey(id).await?;
        }
        if let Some(trust) = trust {
            self.save_identity(address, trust).await?;
        }
        self.store_session(address, record).await
    }
}

// ── In-memory implementation ────────────────────────────────────────────

#[derive(Default)]
pub struct InMemoryKeyStore {
    state: RwLock<StoreSnapshot>,
}

impl InMemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        Self {
            state: RwLock::new(snapshot),
        }
    }
}

#[async_trait]
impl IdentityKeyStore for InMemoryKeyStore {
    async fn local_identity(&self) -> Result<LocalIdentity> {
        self.state
            .read()
            .await
            .local
            .clone()
            .ok_or(CryptoError::NotProvisioned)
    }

    async fn save_local_identity(&self, identity: LocalIdentity) -> Result<()> {
        self.state.write().await.local = Some(identity);
        Ok(())
    }

    async fn get_identity(&self, address: &ProtocolAddress) -> Result<Option<IdentityTrustRecord>> {
        Ok(self.state.read().await.identities.get(address).cloned())
    }

    async fn save_identity(&self, address: &ProtocolAddress, record: IdentityTrustRecord) -> Result<()> {
        self.state
            .write()
            .await
            .identities
            .insert(address.clone(), record);
        Ok(())
    }

    async fn identities_for_user(&self, user_id: &str) -> Result<Vec<(ProtocolAddress, IdentityTrustRecord)>> {
        Ok(self
            .state
            .read()
            .await
            .identities
            .iter()
            .filter(|(addr, _)| addr.user_id == user_id)
            .map(|(addr, record)| (addr.clone(), record.clone()))
            .collect())
    }
}

#[async_trait]
impl PreKeyStore for InMemoryKeyStore {
    async fn load_prekey(&self, id: PreKeyId) -> Result<Option<PreKeyRecord>> {
        Ok(self.state.read().await.prekeys.get(&id).cloned())
    }

    async fn save_prekey(&self, record: PreKeyRecord) -> Result<()> {
        self.state.write().await.prekeys.insert(record.id, record);
        Ok(())
    }

    async fn remove_prekey(&self, id: PreKeyId) -> Result<()> {
        self.state.write().await.prekeys.remove(&id);
        Ok(())
    }

    async fn prekey_ids(&self) -> Result<Vec<PreKeyId>> {
        Ok(self.state.read().await.prekeys.keys().copied().collect())
    }

    async fn reserve_prekey_ids(&self, count: u32) -> Result<PreKeyId> {
        let mut state = self.state.write().await;
        let start = state.next_prekey_id;
        state.next_prekey_id = start
            .checked_add(count)
            .ok_or_else(|| CryptoError::Storage("pre-key id space exhausted".into()))?;
        Ok(start)
    }
}

#[async_trait]
impl SignedPreKeyStore for InMemoryKeyStore {
    async fn load_signed_prekey(&self, id: SignedPreKeyId) -> Result<Option<SignedPreKeyRecord>> {
        Ok(self.state.read().await.signed_prekeys.get(&id).cloned())
    }

    async fn save_signed_prekey(&self, record: SignedPreKeyRecord) -> Result<()> {
        self.state
            .write()
            .await
            .signed_prekeys
            .insert(record.id, record);
        Ok(())
    }

    async fn remove_signed_prekey(&self, id: SignedPreKeyId) -> Result<()> {
        self.state.write().await.signed_prekeys.remove(&id);
        Ok(())
    }

    async fn signed_prekey_ids(&self) -> Result<Vec<SignedPreKeyId>> {
        Ok(self.state.read().await.signed_prekeys.keys().copied().collect())
    }

    async fn reserve_signed_prekey_id(&self) -> Result<SignedPreKeyId> {
        let mut state = self.state.write().await;
        let id = state.next_signed_prekey_id;
        state.next_signed_prekey_id = id
            .checked_add(1)
            .ok_or_else(|| CryptoError::Storage("signed pre-key id space exhausted".into()))?;
        Ok(id)
    }
}

#[async_trait]
impl SessionStore for InMemoryKeyStore {
    async fn load_session(&self, address: &ProtocolAddress) -> Result<Option<SessionRecord>> {
        Ok(self.state.read().await.sessions.get(address).cloned())
    }

    async fn store_session(&self, address: &ProtocolAddress, record: SessionRecord) -> Result<()> {
        self.state
            .write()
            .await
            .sessions
            .insert(address.clone(), record);
        Ok(())
    }

    async fn delete_session(&self, address: &ProtocolAddress) -> Result<()> {
        self.state.write().await.sessions.remove(address);
        Ok(())
    }

    async fn session_addresses(&self) -> Result<Vec<ProtocolAddress>> {
        Ok(self.state.read().await.sessions.keys().cloned().collect())
    }
}

#[async_trait]
impl SenderKeyStore for InMemoryKeyStore {
    async fn load_sender_key(
        &self,
        sender: &ProtocolAddress,
        distribution_id: Uuid,
    ) -> Result<Option<SenderKeyRecord>> {
        Ok(self
            .state
            .read()
            .await
            .sender_keys
            .get(&(sender.clone(), distribution_id))
            .cloned())
    }

    async fn store_sender_key(
        &self,
        sender: &ProtocolAddress,
        distribution_id: Uuid,
        record: SenderKeyRecord,
    ) -> Result<()> {
        self.state
            .write()
            .await
            .sender_keys
            .insert((sender.clone(), distribution_id), record);
        Ok(())
    }

    async fn remove_sender_key(&self, sender: &ProtocolAddress, distribution_id: Uuid) -> Result<()> {
        self.state
            .write()
            .await
            .sender_keys
            .remove(&(sender.clone(), distribution_id));
        Ok(())
    }

    async fn sender_key_senders(&self, distribution_id: Uuid) -> Result<Vec<ProtocolAddress>> {
        Ok(self
            .state
            .read()
            .await
            .sender_keys
            .keys()
            .filter(|(_, id)| *id == distribution_id)
            .map(|(addr, _)| addr.clone())
            .collect())
    }
}

#[async_trait]
impl KeyStore for InMemoryKeyStore {
    async fn snapshot(&self) -> Result<StoreSnapshot> {
        Ok(self.state.read().await.clone())
    }

    async fn replace_all(&self, snapshot: StoreSnapshot) -> Result<()> {
        *self.state.write().await = snapshot;
        Ok(())
    }

    async fn commit_responder_session(
        &self,
        address: &ProtocolAddress,
        record: SessionRecord,
        trust: Option<IdentityTrustRecord>,
        consumed_prekey: Option<PreKeyId>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(id) = consumed_prekey {
            state.prekeys.remove(&id);
        }
        if let Some(trust) = trust {
            state.identities.insert(address.clone(), trust);
        }
        state.sessions.insert(address.clone(), record);
        Ok(())
    }
}
