use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ProtocolError;
use crate::types::*;

// ── Pairwise messages ─────────────────────────────────────────────────

/// Tag carried next to every pairwise ciphertext.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum CiphertextMessageType {
    /// First message(s) of a session; carries the initiation data.
    PreKey = 1,
    /// Regular ratchet message on an established session.
    Whisper = 2,
}

impl CiphertextMessageType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for CiphertextMessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::PreKey),
            2 => Ok(Self::Whisper),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }
}

/// A ratchet message. The ciphertext is sealed under a key derived from the
/// sending chain; the header fields are bound to it as associated data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalMessage {
    /// AEAD suite identifier the message was sealed with.
    pub suite: u8,
    /// Sender's current ratchet public key.
    pub ratchet_key: [u8; PUBLIC_KEY_LEN],
    /// Index of this message in the current sending chain.
    pub counter: u32,
    /// Length of the sender's previous sending chain.
    pub previous_counter: u32,
    pub ciphertext: Vec<u8>,
}

impl SignalMessage {
    /// Canonical header bytes used as associated data.
    pub fn header_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + PUBLIC_KEY_LEN + 8);
        buf.push(self.suite);
        buf.extend_from_slice(&self.ratchet_key);
        buf.extend_from_slice(&self.counter.to_be_bytes());
        buf.extend_from_slice(&self.previous_counter.to_be_bytes());
        buf
    }
}

/// A ratchet message wrapped with everything the responder needs to derive
/// the matching session from its own pre-keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeySignalMessage {
    /// Initiator's registration id.
    pub registration_id: RegistrationId,
    /// One-time pre-key of the responder that was used, if any.
    pub one_time_prekey_id: Option<PreKeyId>,
    pub signed_prekey_id: SignedPreKeyId,
    /// Initiator's ephemeral X3DH key.
    pub base_key: [u8; PUBLIC_KEY_LEN],
    /// Initiator's identity key.
    pub identity_key: [u8; PUBLIC_KEY_LEN],
    pub message: SignalMessage,
}

/// An encrypted pairwise payload, tagged with its type. This is the opaque
/// blob handed to the delivery transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedMessage {
    pub message_type: CiphertextMessageType,
    /// Codec-encoded [`SignalMessage`] or [`PreKeySignalMessage`].
    pub body: Vec<u8>,
}

impl EncryptedMessage {
    /// Serialize as `[type(1)] [body]`.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + self.body.len());
        buf.push(self.message_type.as_u8());
        buf.extend_from_slice(&self.body);
        buf
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (&tag, body) = bytes.split_first().ok_or(ProtocolError::MessageTooShort {
            expected: 1,
            got: 0,
        })?;
        Ok(Self {
            message_type: CiphertextMessageType::try_from(tag)?,
            body: body.to_vec(),
        })
    }
}

// ── Group messages ────────────────────────────────────────────────────

/// A group message, addressed by (distribution, sender chain) rather than by
/// recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderKeyMessage {
    pub distribution_id: Uuid,
    pub chain_id: u32,
    pub iteration: u32,
    pub suite: u8,
    pub ciphertext: Vec<u8>,
    /// XEdDSA signature by the sender chain's signing key over [`Self::signed_bytes`].
    pub signature: Vec<u8>,
}

impl SenderKeyMessage {
    /// Bytes covered by the signature (everything but the signature itself).
    pub fn signed_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + 9 + self.ciphertext.len());
        buf.extend_from_slice(self.distribution_id.as_bytes());
        buf.extend_from_slice(&self.chain_id.to_be_bytes());
        buf.extend_from_slice(&self.iteration.to_be_bytes());
        buf.push(self.suite);
        buf.extend_from_slice(&self.ciphertext);
        buf
    }
}

/// Sender-key state handed to a group member over a pairwise session.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderKeyDistributionMessage {
    pub group_id: String,
    pub distribution_id: Uuid,
    pub chain_id: u32,
    pub iteration: u32,
    pub chain_key: [u8; 32],
    /// Public half of the chain's signing key.
    pub signing_key: [u8; PUBLIC_KEY_LEN],
}

impl std::fmt::Debug for SenderKeyDistributionMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SenderKeyDistributionMessage")
            .field("group_id", &self.group_id)
            .field("distribution_id", &self.distribution_id)
            .field("chain_id", &self.chain_id)
            .field("iteration", &self.iteration)
            .field("chain_key", &"***")
            .finish()
    }
}

// ── Attachments ───────────────────────────────────────────────────────

/// What a recipient needs to fetch-and-decrypt an attachment. Travels inside
/// an already end-to-end encrypted message.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentKeyData {
    pub key: [u8; 32],
    /// SHA-256 over the full attachment ciphertext.
    pub digest: [u8; 32],
    /// Plaintext length in bytes.
    pub length: u64,
}

impl std::fmt::Debug for AttachmentKeyData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachmentKeyData")
            .field("key", &"***")
            .field("digest", &self.digest)
            .field("length", &self.length)
            .finish()
    }
}

// ── Backups ───────────────────────────────────────────────────────────

/// Passphrase-protected export of a whole key store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupEnvelope {
    pub version: u8,
    pub user_id: UserId,
    pub device_id: DeviceId,
    /// Creation time, milliseconds since the Unix epoch.
    pub created_at: u64,
    pub salt: Vec<u8>,
    pub kdf_iterations: u32,
    pub suite: u8,
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
    /// HMAC-SHA256 over [`Self::authenticated_bytes`].
    pub mac: Vec<u8>,
}

impl BackupEnvelope {
    /// Canonical bytes covered by the MAC: every field except the MAC.
    pub fn authenticated_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64 + self.user_id.len() + self.ciphertext.len());
        buf.push(self.version);
        buf.extend_from_slice(&(self.user_id.len() as u32).to_be_bytes());
        buf.extend_from_slice(self.user_id.as_bytes());
        buf.extend_from_slice(&self.device_id.to_be_bytes());
        buf.extend_from_slice(&self.created_at.to_be_bytes());
        buf.extend_from_slice(&(self.salt.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.salt);
        buf.extend_from_slice(&self.kdf_iterations.to_be_bytes());
        buf.push(self.suite);
        buf.extend_from_slice(&(self.nonce.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.nonce);
        buf.extend_from_slice(&self.ciphertext);
        buf
    }
}
