//! Identity key and registration id generation.
//!
//! Each device has a long-term Curve25519 identity key pair generated once at
//! setup. It is never rotated; it leaves the device only inside an encrypted
//! backup.

use sigil_protocol::RegistrationId;

use crate::error::{CryptoError, Result};
use crate::keys::KeyPair;
use crate::rng::random_u32;

/// Registration ids live in `[0, 16384)`.
pub const REGISTRATION_ID_LIMIT: u32 = 1 << 14;

const REGISTRATION_ID_ATTEMPTS: usize = 8;

/// Generate a fresh identity key pair.
pub fn generate_identity() -> Result<KeyPair> {
    KeyPair::generate()
}

pub fn is_valid_registration_id(id: RegistrationId) -> bool {
    id < REGISTRATION_ID_LIMIT
}

/// Uniformly random 14-bit registration id.
pub fn generate_registration_id() -> Result<RegistrationId> {
    for _ in 0..REGISTRATION_ID_ATTEMPTS {
        let id = random_u32()? & (REGISTRATION_ID_LIMIT - 1);
        if is_valid_registration_id(id) {
            return Ok(id);
        }
    }
    Err(CryptoError::Rng)
}
