//! Sender-key group crypto.
//!
//! Each device owns one sending chain per group and holds a receiving copy
//! of every other member device's chain. Chains are handed out through
//! pairwise sessions as [`SenderKeyDistributionMessage`]s; the fan-out to
//! recipients is driven by [`crate::SecureMessenger`].

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use sigil_protocol::{decode, ProtocolAddress, SenderKeyDistributionMessage, SenderKeyMessage};

use crate::aead::{cipher_for_id, AeadCipher};
use crate::error::{CryptoError, Result};
use crate::keys::{KeyPair, PrivateKey, PublicKey};
use crate::ratchet::{ChainKey, MessageKeys};
use crate::rng::{random_array, random_u32};
use crate::stores::KeyStore;
use crate::unix_millis;

/// Stable sender-key distribution id of a group.
pub fn distribution_id(group_id: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("sigil-group-{group_id}").as_bytes())
}

/// One sender chain. Our own chains carry the signing private key;
/// received copies only the public half.
#[derive(Clone, Serialize, Deserialize)]
pub struct SenderKeyRecord {
    group_id: String,
    chain_id: u32,
    chain_key: ChainKey,
    signing_public: PublicKey,
    signing_private: Option<PrivateKey>,
    skipped: VecDeque<MessageKeys>,
    created_at: u64,
    /// Start of a new own chain that no member has been sent yet.
    pending: Option<SenderKeyDistributionMessage>,
}

impl fmt::Debug for SenderKeyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SenderKeyRecord")
            .field("group_id", &self.group_id)
            .field("chain_id", &self.chain_id)
            .field("iteration", &self.chain_key.index())
            .field("own", &self.signing_private.is_some())
            .field("pending", &self.pending.is_some())
            .finish()
    }
}

impl SenderKeyRecord {
    /// Fresh sending chain with a random seed and signing key.
    pub fn generate(group_id: &str) -> Result<Self> {
        let signing = KeyPair::generate()?;
        let mut record = Self {
            group_id: group_id.to_string(),
            chain_id: random_u32()?,
            chain_key: ChainKey::new(random_array()?, 0),
            signing_public: signing.public_key,
            signing_private: Some(signing.private_key.clone()),
            skipped: VecDeque::new(),
            created_at: unix_millis(),
            pending: None,
        };
        record.pending = Some(record.distribution_message());
        Ok(record)
    }

    /// Receiving copy installed from a distribution message.
    pub fn from_distribution(message: &SenderKeyDistributionMessage) -> Self {
        Self {
            group_id: message.group_id.clone(),
            chain_id: message.chain_id,
            chain_key: ChainKey::new(message.chain_key, message.iteration),
            signing_public: PublicKey::from_bytes(message.signing_key),
            signing_private: None,
            skipped: VecDeque::new(),
            created_at: unix_millis(),
            pending: None,
        }
    }

    pub fn distribution_message(&self) -> SenderKeyDistributionMessage {
        SenderKeyDistributionMessage {
            group_id: self.group_id.clone(),
            distribution_id: distribution_id(&self.group_id),
            chain_id: self.chain_id,
            iteration: self.chain_key.index(),
            chain_key: *self.chain_key.key(),
            signing_key: self.signing_public.to_bytes(),
        }
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn chain_id(&self) -> u32 {
        self.chain_id
    }

    pub fn iteration(&self) -> u32 {
        self.chain_key.index()
    }

    pub fn is_own(&self) -> bool {
        self.signing_private.is_some()
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// The chain's first distribution, until it has been sent out.
    pub fn pending_distribution(&self) -> Option<&SenderKeyDistributionMessage> {
        self.pending.as_ref()
    }

    /// Seal with the next chain key and sign the result.
    pub fn encrypt(&self, cipher: &dyn AeadCipher, plaintext: &[u8]) -> Result<(SenderKeyRecord, SenderKeyMessage)> {
        let signing = self
            .signing_private
            .as_ref()
            .ok_or(CryptoError::InvalidMessage("cannot send on a received sender key"))?;
        let keys = self.chain_key.message_keys()?;
        let mut message = SenderKeyMessage {
            distribution_id: distribution_id(&self.group_id),
            chain_id: self.chain_id,
            iteration: keys.counter,
            suite: cipher.suite().id(),
            ciphertext: Vec::new(),
            signature: Vec::new(),
        };
        message.ciphertext = cipher.seal(&keys.key, keys.nonce, &message_aad(&message), plaintext)?;
        message.signature = signing.sign(&message.signed_bytes())?;

        let mut next = self.clone();
        next.chain_key = self.chain_key.next()?;
        Ok((next, message))
    }

    /// Verify and open `message`, returning the advanced chain.
    pub fn decrypt(&self, message: &SenderKeyMessage, max_skip: u32) -> Result<(SenderKeyRecord, Vec<u8>)> {
        if message.chain_id != self.chain_id {
            return Err(CryptoError::InvalidMessage("sender key chain mismatch"));
        }
        if !self
            .signing_public
            .verify(&message.signed_bytes(), &message.signature)
        {
            return Err(CryptoError::InvalidMessage("bad sender key signature"));
        }
        let cipher = cipher_for_id(message.suite)?;

        let mut next = self.clone();
        let keys = next.message_keys_for(message.iteration, max_skip)?;
        let plaintext = cipher.open(&keys.key, keys.nonce, &message_aad(message), &message.ciphertext)?;
        Ok((next, plaintext))
    }

    fn message_keys_for(&mut self, iteration: u32, max_skip: u32) -> Result<MessageKeys> {
        let current = self.chain_key.index();
        if iteration < current {
            let pos = self
                .skipped
                .iter()
                .position(|k| k.counter == iteration)
                .ok_or(CryptoError::DuplicateMessage { counter: iteration })?;
            return self
                .skipped
                .remove(pos)
                .ok_or(CryptoError::DuplicateMessage { counter: iteration });
        }
        if iteration - current > max_skip {
            return Err(CryptoError::InvalidMessage("too many skipped messages"));
        }
        let mut chain = self.chain_key.clone();
        while chain.index() < iteration {
            if self.skipped.len() >= max_skip.max(1) as usize {
                self.skipped.pop_front();
            }
            self.skipped.push_back(chain.message_keys()?);
            chain = chain.next()?;
        }
        let keys = chain.message_keys()?;
        self.chain_key = chain.next()?;
        Ok(keys)
    }
}

fn message_aad(message: &SenderKeyMessage) -> Vec<u8> {
    let mut aad = Vec::with_capacity(24);
    aad.extend_from_slice(message.distribution_id.as_bytes());
    aad.extend_from_slice(&message.chain_id.to_be_bytes());
    aad.extend_from_slice(&message.iteration.to_be_bytes());
    aad
}

/// Our sending chain for `group_id`, created if missing. The flag is true
/// when the chain was created by this call.
pub async fn ensure_sender_key<S: KeyStore + ?Sized>(
    store: &S,
    local: &ProtocolAddress,
    group_id: &str,
) -> Result<(SenderKeyRecord, bool)> {
    let dist = distribution_id(group_id);
    if let Some(record) = store.load_sender_key(local, dist).await? {
        if record.is_own() {
            return Ok((record, false));
        }
    }
    let record = SenderKeyRecord::generate(group_id)?;
    store.store_sender_key(local, dist, record.clone()).await?;
    info!(group_id, chain_id = record.chain_id, "created sender key");
    Ok((record, true))
}

/// Advance our own chain for one group message. Returns the message and
/// whether the chain was created by this call.
pub async fn encrypt<S: KeyStore + ?Sized>(
    store: &S,
    cipher: &dyn AeadCipher,
    local: &ProtocolAddress,
    group_id: &str,
    plaintext: &[u8],
) -> Result<(SenderKeyMessage, bool)> {
    let (record, created) = ensure_sender_key(store, local, group_id).await?;
    let (next, message) = record.encrypt(cipher, plaintext)?;
    store
        .store_sender_key(local, message.distribution_id, next)
        .await?;
    Ok((message, created))
}

/// Find which of `sender_user_id`'s devices owns the chain `message` was
/// sent on.
pub async fn resolve_sender<S: KeyStore + ?Sized>(
    store: &S,
    group_id: &str,
    sender_user_id: &str,
    message: &SenderKeyMessage,
) -> Result<ProtocolAddress> {
    let no_key = || CryptoError::NoSenderKey {
        group_id: group_id.to_string(),
        sender: sender_user_id.to_string(),
    };
    if message.distribution_id != distribution_id(group_id) {
        return Err(CryptoError::InvalidMessage("message belongs to another group"));
    }
    for address in store.sender_key_senders(message.distribution_id).await? {
        if address.user_id != sender_user_id {
            continue;
        }
        if let Some(record) = store.load_sender_key(&address, message.distribution_id).await? {
            if record.chain_id == message.chain_id && !record.is_own() {
                return Ok(address);
            }
        }
    }
    Err(no_key())
}

/// Open a group message from `sender`'s stored chain.
pub async fn decrypt<S: KeyStore + ?Sized>(
    store: &S,
    group_id: &str,
    sender: &ProtocolAddress,
    message: &SenderKeyMessage,
    max_skip: u32,
) -> Result<Vec<u8>> {
    let record = store
        .load_sender_key(sender, message.distribution_id)
        .await?
        .filter(|r| r.chain_id == message.chain_id)
        .ok_or_else(|| CryptoError::NoSenderKey {
            group_id: group_id.to_string(),
            sender: sender.user_id.clone(),
        })?;
    let (next, plaintext) = record.decrypt(message, max_skip)?;
    store
        .store_sender_key(sender, message.distribution_id, next)
        .await?;
    Ok(plaintext)
}

pub fn decode_group_message(bytes: &[u8]) -> Result<SenderKeyMessage> {
    Ok(decode(bytes)?)
}

/// Forget the pending distribution of our chain once it went out. A chain
/// rotated in the meantime keeps its own.
pub async fn mark_distributed<S: KeyStore + ?Sized>(
    store: &S,
    local: &ProtocolAddress,
    group_id: &str,
    chain_id: u32,
) -> Result<()> {
    let dist = distribution_id(group_id);
    let Some(mut record) = store.load_sender_key(local, dist).await? else {
        return Ok(());
    };
    if record.chain_id != chain_id || record.pending.is_none() {
        return Ok(());
    }
    record.pending = None;
    store.store_sender_key(local, dist, record).await
}

/// Install `sender`'s chain from a decrypted distribution. A chain that is
/// already installed is kept as is, so a replayed distribution cannot
/// rewind it. Returns whether anything was stored.
pub async fn install_distribution<S: KeyStore + ?Sized>(
    store: &S,
    sender: &ProtocolAddress,
    message: &SenderKeyDistributionMessage,
) -> Result<bool> {
    if message.distribution_id != distribution_id(&message.group_id) {
        return Err(CryptoError::InvalidMessage("distribution id does not match group"));
    }
    if let Some(existing) = store.load_sender_key(sender, message.distribution_id).await? {
        if existing.chain_id == message.chain_id
            && existing.signing_public.to_bytes() == message.signing_key
        {
            debug!(
                group_id = %message.group_id,
                %sender,
                chain_id = message.chain_id,
                "sender key already installed"
            );
            return Ok(false);
        }
    }
    let record = SenderKeyRecord::from_distribution(message);
    store
        .store_sender_key(sender, message.distribution_id, record)
        .await?;
    info!(
        group_id = %message.group_id,
        %sender,
        chain_id = message.chain_id,
        "installed sender key"
    );
    Ok(true)
}

/// Discard our chain for `group_id` and start a new one.
pub async fn rotate<S: KeyStore + ?Sized>(
    store: &S,
    local: &ProtocolAddress,
    group_id: &str,
) -> Result<SenderKeyRecord> {
    let dist = distribution_id(group_id);
    let old = store.load_sender_key(local, dist).await?;
    store.remove_sender_key(local, dist).await?;
    let record = SenderKeyRecord::generate(group_id)?;
    store.store_sender_key(local, dist, record.clone()).await?;
    info!(
        group_id,
        old_chain = old.map(|r| r.chain_id),
        new_chain = record.chain_id,
        "rotated sender key"
    );
    Ok(record)
}

/// Drop stored chains of users who left the group.
pub async fn forget_senders<S: KeyStore + ?Sized>(store: &S, group_id: &str, removed: &[String]) -> Result<usize> {
    let dist = distribution_id(group_id);
    let mut dropped = 0;
    for address in store.sender_key_senders(dist).await? {
        if removed.iter().any(|u| *u == address.user_id) {
            store.remove_sender_key(&address, dist).await?;
            dropped += 1;
        }
    }
    if dropped > 0 {
        debug!(group_id, dropped, "forgot sender keys of removed members");
    }
    Ok(dropped)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SenderChainInfo {
    pub sender: ProtocolAddress,
    pub chain_id: u32,
    pub iteration: u32,
    pub created_at: u64,
}

/// Diagnostics for one group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupKeyInfo {
    pub group_id: String,
    pub distribution_id: Uuid,
    pub own_chain: Option<SenderChainInfo>,
    pub senders: Vec<SenderChainInfo>,
}

pub async fn group_key_info<S: KeyStore + ?Sized>(
    store: &S,
    local: &ProtocolAddress,
    group_id: &str,
) -> Result<GroupKeyInfo> {
    let dist = distribution_id(group_id);
    let mut own_chain = None;
    let mut senders = Vec::new();
    for address in store.sender_key_senders(dist).await? {
        let Some(record) = store.load_sender_key(&address, dist).await? else {
            continue;
        };
        let info = SenderChainInfo {
            sender: address.clone(),
            chain_id: record.chain_id,
            iteration: record.iteration(),
            created_at: record.created_at,
        };
        if address == *local {
            own_chain = Some(info);
        } else {
            senders.push(info);
        }
    }
    Ok(GroupKeyInfo {
        group_id: group_id.to_string(),
        distribution_id: dist,
        own_chain,
        senders,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aead::{cipher_for, CipherSuite};
    use crate::stores::{InMemoryKeyStore, SenderKeyStore};

    const MAX_SKIP: u32 = 100;

    fn cipher() -> &'static dyn AeadCipher {
        cipher_for(CipherSuite::ChaCha20Poly1305)
    }

    #[test]
    fn distribution_id_is_stable_per_group() {
        assert_eq!(distribution_id("team"), distribution_id("team"));
        assert_ne!(distribution_id("team"), distribution_id("other"));
    }

    #[test]
    fn receiving_copy_decrypts_in_any_order() {
        let own = SenderKeyRecord::generate("g").unwrap();
        let copy = SenderKeyRecord::from_distribution(&own.distribution_message());

        let (own, m0) = own.encrypt(cipher(), b"zero").unwrap();
        let (own, m1) = own.encrypt(cipher(), b"one").unwrap();
        let (_own, m2) = own.encrypt(cipher(), b"two").unwrap();

        let (copy, p2) = copy.decrypt(&m2, MAX_SKIP).unwrap();
        assert_eq!(p2, b"two");
        let (copy, p0) = copy.decrypt(&m0, MAX_SKIP).unwrap();
        assert_eq!(p0, b"zero");
        let (copy, p1) = copy.decrypt(&m1, MAX_SKIP).unwrap();
        assert_eq!(p1, b"one");
        assert!(matches!(
            copy.decrypt(&m1, MAX_SKIP),
            Err(CryptoError::DuplicateMessage { counter: 1 })
        ));
    }

    #[test]
    fn received_copy_cannot_send() {
        let own = SenderKeyRecord::generate("g").unwrap();
        let copy = SenderKeyRecord::from_distribution(&own.distribution_message());
        assert!(copy.encrypt(cipher(), b"x").is_err());
    }

    #[test]
    fn forged_signature_rejected() {
        let own = SenderKeyRecord::generate("g").unwrap();
        let copy = SenderKeyRecord::from_distribution(&own.distribution_message());
        let (_own, mut msg) = own.encrypt(cipher(), b"real").unwrap();
        msg.signature[0] ^= 1;
        assert!(copy.decrypt(&msg, MAX_SKIP).is_err());
    }

    #[test]
    fn member_with_a_chain_copy_cannot_sign_for_its_owner() {
        let own = SenderKeyRecord::generate("g").unwrap();
        let bob_copy = SenderKeyRecord::from_distribution(&own.distribution_message());
        let carol_copy = bob_copy.clone();

        // Bob knows the chain key and signs with a key of his own.
        let mut forged = bob_copy;
        forged.signing_private = Some(KeyPair::generate().unwrap().private_key);
        let (_, message) = forged.encrypt(cipher(), b"from alice, honest").unwrap();

        assert!(matches!(
            carol_copy.decrypt(&message, MAX_SKIP),
            Err(CryptoError::InvalidMessage("bad sender key signature"))
        ));
    }

    #[test]
    fn late_joiner_cannot_read_history() {
        let own = SenderKeyRecord::generate("g").unwrap();
        let (own, early) = own.encrypt(cipher(), b"before").unwrap();
        let copy = SenderKeyRecord::from_distribution(&own.distribution_message());
        assert!(copy.decrypt(&early, MAX_SKIP).is_err());
        let (_own, later) = own.encrypt(cipher(), b"after").unwrap();
        assert_eq!(copy.decrypt(&later, MAX_SKIP).unwrap().1, b"after");
    }

    #[tokio::test]
    async fn rotation_locks_out_old_copy() {
        let alice_store = InMemoryKeyStore::new();
        let bob_store = InMemoryKeyStore::new();
        let alice = ProtocolAddress::new("alice", 1);

        let (record, created) = ensure_sender_key(&alice_store, &alice, "g").await.unwrap();
        assert!(created);
        install_distribution(&bob_store, &alice, &record.distribution_message())
            .await
            .unwrap();

        let (m1, created) = encrypt(&alice_store, cipher(), &alice, "g", b"hello").await.unwrap();
        assert!(!created);
        let sender = resolve_sender(&bob_store, "g", "alice", &m1).await.unwrap();
        assert_eq!(decrypt(&bob_store, "g", &sender, &m1, MAX_SKIP).await.unwrap(), b"hello");

        rotate(&alice_store, &alice, "g").await.unwrap();
        let (m2, _) = encrypt(&alice_store, cipher(), &alice, "g", b"world").await.unwrap();
        assert!(matches!(
            resolve_sender(&bob_store, "g", "alice", &m2).await,
            Err(CryptoError::NoSenderKey { .. })
        ));
        assert!(matches!(
            decrypt(&bob_store, "g", &alice, &m2, MAX_SKIP).await,
            Err(CryptoError::NoSenderKey { .. })
        ));
    }

    #[tokio::test]
    async fn forget_and_report() {
        let store = InMemoryKeyStore::new();
        let me = ProtocolAddress::new("me", 1);
        ensure_sender_key(&store, &me, "g").await.unwrap();
        for user in ["bob", "carol"] {
            let other = SenderKeyRecord::generate("g").unwrap();
            install_distribution(&store, &ProtocolAddress::new(user, 1), &other.distribution_message())
                .await
                .unwrap();
        }

        let info = group_key_info(&store, &me, "g").await.unwrap();
        assert!(info.own_chain.is_some());
        assert_eq!(info.senders.len(), 2);

        assert_eq!(forget_senders(&store, "g", &["bob".to_string()]).await.unwrap(), 1);
        assert_eq!(
            store.sender_key_senders(distribution_id("g")).await.unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn replayed_distribution_does_not_rewind_chain() {
        let store = InMemoryKeyStore::new();
        let alice = ProtocolAddress::new("alice", 1);
        let own = SenderKeyRecord::generate("g").unwrap();
        let first = own.distribution_message();
        let (own, m0) = own.encrypt(cipher(), b"zero").unwrap();
        let (_own, m1) = own.encrypt(cipher(), b"one").unwrap();

        assert!(install_distribution(&store, &alice, &first).await.unwrap());
        decrypt(&store, "g", &alice, &m0, MAX_SKIP).await.unwrap();
        decrypt(&store, "g", &alice, &m1, MAX_SKIP).await.unwrap();

        assert!(!install_distribution(&store, &alice, &first).await.unwrap());
        assert!(matches!(
            decrypt(&store, "g", &alice, &m0, MAX_SKIP).await,
            Err(CryptoError::DuplicateMessage { counter: 0 })
        ));

        // A new chain from the same sender still replaces the old one.
        let rotated = SenderKeyRecord::generate("g").unwrap().distribution_message();
        assert!(install_distribution(&store, &alice, &rotated).await.unwrap());
    }

    #[tokio::test]
    async fn new_chain_stays_pending_until_distributed() {
        let store = InMemoryKeyStore::new();
        let me = ProtocolAddress::new("me", 1);
        let (record, _) = ensure_sender_key(&store, &me, "g").await.unwrap();
        let pending = record.pending_distribution().cloned().unwrap();
        assert_eq!(pending.iteration, 0);

        mark_distributed(&store, &me, "g", record.chain_id().wrapping_add(1))
            .await
            .unwrap();
        let (record, created) = ensure_sender_key(&store, &me, "g").await.unwrap();
        assert!(!created);
        assert!(record.pending_distribution().is_some());

        mark_distributed(&store, &me, "g", record.chain_id()).await.unwrap();
        let (record, _) = ensure_sender_key(&store, &me, "g").await.unwrap();
        assert!(record.pending_distribution().is_none());

        let rotated = rotate(&store, &me, "g").await.unwrap();
        assert_eq!(rotated.pending_distribution().unwrap().chain_id, rotated.chain_id());
    }

    #[tokio::test]
    async fn mismatched_distribution_rejected() {
        let store = InMemoryKeyStore::new();
        let mut msg = SenderKeyRecord::generate("g").unwrap().distribution_message();
        msg.distribution_id = distribution_id("other");
        assert!(install_distribution(&store, &ProtocolAddress::new("bob", 1), &msg)
            .await
            .is_err());
    }
}
