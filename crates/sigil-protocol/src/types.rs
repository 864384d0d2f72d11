use std::fmt;

use serde::{Deserialize, Serialize};

/// Application-level user identifier (opaque to this layer).
pub type UserId = String;

/// Device number within a user's account. Each device has its own identity key.
pub type DeviceId = u32;

/// Identifier of a one-time pre-key.
pub type PreKeyId = u32;

/// Identifier of a signed pre-key.
pub type SignedPreKeyId = u32;

/// 14-bit registration identifier of a device's key generation.
pub type RegistrationId = u32;

/// Size of every Curve25519 public key on the wire.
pub const PUBLIC_KEY_LEN: usize = 32;

/// Size of an XEdDSA signature on the wire.
pub const SIGNATURE_LEN: usize = 64;

/// A (user, device) pair. Sessions, trust records and sender keys are keyed by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProtocolAddress {
    pub user_id: UserId,
    pub device_id: DeviceId,
}

impl ProtocolAddress {
    pub fn new(user_id: impl Into<UserId>, device_id: DeviceId) -> Self {
        Self {
            user_id: user_id.into(),
            device_id,
        }
    }
}

impl fmt::Display for ProtocolAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.user_id, self.device_id)
    }
}

// ── Pre-key material ──────────────────────────────────────────────────

/// A single one-time pre-key's public portion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimePreKey {
    pub id: PreKeyId,
    /// 32-byte Curve25519 public key.
    pub public_key: [u8; PUBLIC_KEY_LEN],
}

/// Everything a device publishes to the key directory: identity, the current
/// signed pre-key, and a batch of one-time pre-keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreKeyBundleData {
    pub registration_id: RegistrationId,
    pub device_id: DeviceId,
    /// 32-byte Curve25519 identity public key.
    pub identity_key: [u8; PUBLIC_KEY_LEN],
    pub signed_prekey_id: SignedPreKeyId,
    /// 32-byte Curve25519 public key.
    pub signed_prekey: [u8; PUBLIC_KEY_LEN],
    /// 64-byte XEdDSA signature over the signed pre-key, made with the identity key.
    pub signed_prekey_signature: Vec<u8>,
    /// Batch of one-time pre-keys.
    pub prekeys: Vec<OneTimePreKey>,
}

/// The public assembly a remote party fetches to start a session while the
/// owning device may be offline. Carries at most one one-time pre-key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyBundle {
    pub registration_id: RegistrationId,
    pub device_id: DeviceId,
    pub identity_key: [u8; PUBLIC_KEY_LEN],
    pub signed_prekey_id: SignedPreKeyId,
    pub signed_prekey: [u8; PUBLIC_KEY_LEN],
    pub signed_prekey_signature: Vec<u8>,
    pub one_time_prekey: Option<OneTimePreKey>,
}
