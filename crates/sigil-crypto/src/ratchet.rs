//! Double Ratchet.
//!
//! A [`SessionState`] is advanced functionally: [`SessionState::encrypt`] and
//! [`SessionState::decrypt`] take `&self` and return the advanced state next
//! to their output. The caller stores the new state only once the step has
//! succeeded, so a message that fails authentication never moves a chain.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use sigil_protocol::{PreKeyId, RegistrationId, SignalMessage, SignedPreKeyId};

use crate::aead::{cipher_for_id, AeadCipher, KEY_LEN, NONCE_LEN};
use crate::error::{CryptoError, Result};
use crate::kdf::{hkdf_sha256, hmac_sha256};
use crate::keys::{KeyPair, PublicKey};
use crate::x3dh::associated_data;

const MESSAGE_KEY_SEED: u8 = 0x01;
const CHAIN_KEY_SEED: u8 = 0x02;
const MESSAGE_KEYS_INFO: &[u8] = b"Sigil_MessageKeys";
const ROOT_INFO: &[u8] = b"Sigil_Ratchet";

/// Receiving chains kept per state; older ones are dropped.
pub const MAX_RECEIVER_CHAINS: usize = 5;

/// Symmetric chain: each step yields one message key and the next chain key.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct ChainKey {
    key: [u8; 32],
    index: u32,
}

impl ChainKey {
    pub fn new(key: [u8; 32], index: u32) -> Self {
        Self { key, index }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn key(&self) -> &[u8; 32] {
        &self.key
    }

    pub fn message_keys(&self) -> Result<MessageKeys> {
        let seed = Zeroizing::new(hmac_sha256(&self.key, &[&[MESSAGE_KEY_SEED]])?);
        let okm: Zeroizing<[u8; KEY_LEN + NONCE_LEN]> =
            Zeroizing::new(hkdf_sha256(None, &*seed, MESSAGE_KEYS_INFO)?);
        let mut key = [0u8; KEY_LEN];
        let mut nonce = [0u8; NONCE_LEN];
        key.copy_from_slice(&okm[..KEY_LEN]);
        nonce.copy_from_slice(&okm[KEY_LEN..]);
        Ok(MessageKeys {
            key,
            nonce,
            counter: self.index,
        })
    }

    pub fn next(&self) -> Result<ChainKey> {
        let index = self
            .index
            .checked_add(1)
            .ok_or(CryptoError::InvalidMessage("chain index overflow"))?;
        Ok(ChainKey {
            key: hmac_sha256(&self.key, &[&[CHAIN_KEY_SEED]])?,
            index,
        })
    }
}

#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct MessageKeys {
    pub key: [u8; KEY_LEN],
    pub nonce: [u8; NONCE_LEN],
    pub counter: u32,
}

/// KDF_RK: new root key plus a fresh chain from a ratchet DH output.
fn kdf_rk(root_key: &[u8; 32], dh_output: &[u8; 32]) -> Result<(Zeroizing<[u8; 32]>, ChainKey)> {
    let okm: Zeroizing<[u8; 64]> = Zeroizing::new(hkdf_sha256(Some(&root_key[..]), dh_output, ROOT_INFO)?);
    let mut root = Zeroizing::new([0u8; 32]);
    let mut chain = [0u8; 32];
    root.copy_from_slice(&okm[..32]);
    chain.copy_from_slice(&okm[32..]);
    Ok((root, ChainKey::new(chain, 0)))
}

#[derive(Clone, Serialize, Deserialize)]
struct ReceiverChain {
    ratchet_key: PublicKey,
    chain_key: ChainKey,
}

#[derive(Clone, Serialize, Deserialize)]
struct SkippedKey {
    ratchet_key: PublicKey,
    keys: MessageKeys,
}

/// Initiation data the initiator repeats until the responder answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingPreKey {
    pub one_time_prekey_id: Option<PreKeyId>,
    pub signed_prekey_id: SignedPreKeyId,
    pub base_key: PublicKey,
}

/// Identities and ratchet parameters shared by both constructors.
pub struct SessionParams {
    pub local_identity: PublicKey,
    pub remote_identity: PublicKey,
    pub remote_registration_id: RegistrationId,
    pub base_key: PublicKey,
    pub created_at: u64,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct SessionState {
    local_identity: PublicKey,
    remote_identity: PublicKey,
    remote_registration_id: RegistrationId,
    initiator: bool,
    base_key: PublicKey,
    root_key: Zeroizing<[u8; 32]>,
    sending_ratchet: KeyPair,
    sending_chain: Option<ChainKey>,
    receiver_chains: Vec<ReceiverChain>,
    previous_counter: u32,
    skipped: VecDeque<SkippedKey>,
    pending_prekey: Option<PendingPreKey>,
    created_at: u64,
}

impl SessionState {
    /// Initiator state from the X3DH secret; the responder's signed pre-key
    /// is its first ratchet key.
    pub fn initiate(
        shared_secret: &[u8; 32],
        params: SessionParams,
        their_signed_prekey: &PublicKey,
        pending: PendingPreKey,
    ) -> Result<Self> {
        let sending_ratchet = KeyPair::generate()?;
        let dh = Zeroizing::new(sending_ratchet.private_key.agree(their_signed_prekey)?);
        let (root_key, sending_chain) = kdf_rk(shared_secret, &dh)?;
        Ok(Self {
            local_identity: params.local_identity,
            remote_identity: params.remote_identity,
            remote_registration_id: params.remote_registration_id,
            initiator: true,
            base_key: params.base_key,
            root_key,
            sending_ratchet,
            sending_chain: Some(sending_chain),
            receiver_chains: Vec::new(),
            previous_counter: 0,
            skipped: VecDeque::new(),
            pending_prekey: Some(pending),
            created_at: params.created_at,
        })
    }

    /// Responder state: cannot send until the first message is received.
    pub fn respond(shared_secret: &[u8; 32], params: SessionParams, our_signed_prekey: KeyPair) -> Self {
        Self {
            local_identity: params.local_identity,
            remote_identity: params.remote_identity,
            remote_registration_id: params.remote_registration_id,
            initiator: false,
            base_key: params.base_key,
            root_key: Zeroizing::new(*shared_secret),
            sending_ratchet: our_signed_prekey,
            sending_chain: None,
            receiver_chains: Vec::new(),
            previous_counter: 0,
            skipped: VecDeque::new(),
            pending_prekey: None,
            created_at: params.created_at,
        }
    }

    fn aad(&self, header: &[u8]) -> Vec<u8> {
        let mut aad = if self.initiator {
            associated_data(&self.local_identity, &self.remote_identity)
        } else {
            associated_data(&self.remote_identity, &self.local_identity)
        };
        aad.extend_from_slice(header);
        aad
    }

    /// Seal `plaintext` with the next sending key.
    pub fn encrypt(&self, cipher: &dyn AeadCipher, plaintext: &[u8]) -> Result<(SessionState, SignalMessage)> {
        let chain = self
            .sending_chain
            .as_ref()
            .ok_or(CryptoError::InvalidMessage("session cannot send before first reply"))?;
        let keys = chain.message_keys()?;

        let mut message = SignalMessage {
            suite: cipher.suite().id(),
            ratchet_key: self.sending_ratchet.public_key.to_bytes(),
            counter: keys.counter,
            previous_counter: self.previous_counter,
            ciphertext: Vec::new(),
        };
        let aad = self.aad(&message.header_bytes());
        message.ciphertext = cipher.seal(&keys.key, keys.nonce, &aad, plaintext)?;

        let mut next = self.clone();
        next.sending_chain = Some(chain.next()?);
        Ok((next, message))
    }

    /// Open `message`, returning the advanced state with the plaintext.
    pub fn decrypt(&self, message: &SignalMessage, max_skip: u32) -> Result<(SessionState, Vec<u8>)> {
        let cipher = cipher_for_id(message.suite)?;
        let their = PublicKey::from_bytes(message.ratchet_key);

        let mut next = self.clone();
        let keys = next.message_keys_for(&their, message.counter, message.previous_counter, max_skip)?;
        let aad = next.aad(&message.header_bytes());
        let plaintext = cipher.open(&keys.key, keys.nonce, &aad, &message.ciphertext)?;

        // A reply proves the peer holds the session.
        next.pending_prekey = None;
        Ok((next, plaintext))
    }

    fn message_keys_for(
        &mut self,
        their: &PublicKey,
        counter: u32,
        previous_counter: u32,
        max_skip: u32,
    ) -> Result<MessageKeys> {
        if let Some(pos) = self
            .skipped
            .iter()
            .position(|s| s.ratchet_key == *their && s.keys.counter == counter)
        {
            if let Some(skipped) = self.skipped.remove(pos) {
                return Ok(skipped.keys.clone());
            }
        }

        let idx = match self.receiver_chains.iter().position(|c| c.ratchet_key == *their) {
            Some(idx) => idx,
            None => self.ratchet_step(their, previous_counter, max_skip)?,
        };

        let current = self.receiver_chains[idx].chain_key.index();
        if counter < current {
            return Err(CryptoError::DuplicateMessage { counter });
        }
        self.skip_to(idx, counter, max_skip)?;

        let chain = &self.receiver_chains[idx].chain_key;
        let keys = chain.message_keys()?;
        let next = chain.next()?;
        self.receiver_chains[idx].chain_key = next;
        Ok(keys)
    }

    /// Advance receiver chain `idx` to `until`, caching the skipped keys.
    fn skip_to(&mut self, idx: usize, until: u32, max_skip: u32) -> Result<()> {
        let current = self.receiver_chains[idx].chain_key.index();
        if until <= current {
            return Ok(());
        }
        if until - current > max_skip {
            return Err(CryptoError::InvalidMessage("too many skipped messages"));
        }
        let ratchet_key = self.receiver_chains[idx].ratchet_key;
        let mut chain = self.receiver_chains[idx].chain_key.clone();
        while chain.index() < until {
            let keys = chain.message_keys()?;
            if self.skipped.len() >= max_skip.max(1) as usize {
                self.skipped.pop_front();
            }
            self.skipped.push_back(SkippedKey { ratchet_key, keys });
            chain = chain.next()?;
        }
        self.receiver_chains[idx].chain_key = chain;
        Ok(())
    }

    /// DH ratchet on a new remote ratchet key. Returns the index of the new
    /// receiver chain.
    fn ratchet_step(&mut self, their: &PublicKey, previous_counter: u32, max_skip: u32) -> Result<usize> {
        if !self.receiver_chains.is_empty() {
            let last = self.receiver_chains.len() - 1;
            self.skip_to(last, previous_counter, max_skip)?;
        }

        let dh_recv = Zeroizing::new(self.sending_ratchet.private_key.agree(their)?);
        let (root_key, receiving) = kdf_rk(&self.root_key, &dh_recv)?;

        let new_ratchet = KeyPair::generate()?;
        let dh_send = Zeroizing::new(new_ratchet.private_key.agree(their)?);
        let (root_key, sending) = kdf_rk(&root_key, &dh_send)?;

        self.previous_counter = self.sending_chain.as_ref().map_or(0, ChainKey::index);
        self.root_key = root_key;
        self.sending_ratchet = new_ratchet;
        self.sending_chain = Some(sending);
        self.receiver_chains.push(ReceiverChain {
            ratchet_key: *their,
            chain_key: receiving,
        });
        if self.receiver_chains.len() > MAX_RECEIVER_CHAINS {
            self.receiver_chains.remove(0);
        }
        Ok(self.receiver_chains.len() - 1)
    }

    pub fn local_identity(&self) -> &PublicKey {
        &self.local_identity
    }

    pub fn remote_identity(&self) -> &PublicKey {
        &self.remote_identity
    }

    pub fn remote_registration_id(&self) -> RegistrationId {
        self.remote_registration_id
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    pub fn base_key(&self) -> &PublicKey {
        &self.base_key
    }

    pub fn pending_prekey(&self) -> Option<&PendingPreKey> {
        self.pending_prekey.as_ref()
    }

    pub fn can_send(&self) -> bool {
        self.sending_chain.is_some()
    }

    pub fn sending_index(&self) -> u32 {
        self.sending_chain.as_ref().map_or(0, ChainKey::index)
    }

    pub fn receiving_index(&self) -> u32 {
        self.receiver_chains
            .last()
            .map_or(0, |c| c.chain_key.index())
    }

    pub fn previous_counter(&self) -> u32 {
        self.previous_counter
    }

    pub fn skipped_keys(&self) -> usize {
        self.skipped.len()
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }
}
