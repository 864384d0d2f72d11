//! Curve25519 key pairs.
//!
//! Every key in the system is an X25519 key. Private scalars are stored
//! clamped so the same bytes serve Diffie-Hellman and XEdDSA signing.

use std::fmt;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as DalekPublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CryptoError, Result};
use crate::xeddsa;

pub const KEY_LEN: usize = 32;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey([u8; KEY_LEN]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidMessage("public key must be 32 bytes"))?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn to_bytes(self) -> [u8; KEY_LEN] {
        self.0
    }

    /// Short hex form for logs and diagnostics.
    pub fn fingerprint(&self) -> String {
        hex::encode(&self.0[..8])
    }

    /// Check an XEdDSA signature made by the matching private key.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        xeddsa::verify(self, message, signature)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.fingerprint())
    }
}

#[derive(Clone, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
pub struct PrivateKey([u8; KEY_LEN]);

impl PrivateKey {
    pub fn generate() -> Result<Self> {
        let mut bytes = [0u8; KEY_LEN];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|_| CryptoError::Rng)?;
        let key = Self::from_bytes(bytes);
        bytes.zeroize();
        Ok(key)
    }

    pub fn from_bytes(mut bytes: [u8; KEY_LEN]) -> Self {
        bytes[0] &= 248;
        bytes[31] &= 127;
        bytes[31] |= 64;
        Self(bytes)
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn public_key(&self) -> PublicKey {
        let secret = StaticSecret::from(self.0);
        PublicKey(DalekPublicKey::from(&secret).to_bytes())
    }

    /// X25519 agreement. Rejects low-order peer keys.
    pub fn agree(&self, their: &PublicKey) -> Result<[u8; 32]> {
        let secret = StaticSecret::from(self.0);
        let shared = secret.diffie_hellman(&DalekPublicKey::from(their.0));
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidMessage("non-contributory key agreement"));
        }
        Ok(shared.to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        Ok(xeddsa::sign(self, message)?.to_vec())
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(***)")
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct KeyPair {
    pub public_key: PublicKey,
    pub private_key: PrivateKey,
}

impl KeyPair {
    pub fn generate() -> Result<Self> {
        Ok(Self::from_private(PrivateKey::generate()?))
    }

    pub fn from_private(private_key: PrivateKey) -> Self {
        Self {
            public_key: private_key.public_key(),
            private_key,
        }
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agreement_is_symmetric() {
        let alice = KeyPair::generate().unwrap();
        let bob = KeyPair::generate().unwrap();
        let ab = alice.private_key.agree(&bob.public_key).unwrap();
        let ba = bob.private_key.agree(&alice.public_key).unwrap();
        assert_eq!(ab, ba);
    }

    #[test]
    fn rejects_low_order_point() {
        let alice = KeyPair::generate().unwrap();
        let zero = PublicKey::from_bytes([0u8; 32]);
        assert!(alice.private_key.agree(&zero).is_err());
    }

    #[test]
    fn private_key_is_clamped() {
        let key = PrivateKey::from_bytes([0xFF; 32]);
        assert_eq!(key.as_bytes()[0] & 7, 0);
        assert_eq!(key.as_bytes()[31] & 0x80, 0);
        assert_eq!(key.as_bytes()[31] & 0x40, 0x40);
    }

    #[test]
    fn keypair_serde_roundtrip() {
        let pair = KeyPair::generate().unwrap();
        let bytes = postcard::to_allocvec(&pair).unwrap();
        let restored: KeyPair = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(restored.public_key, pair.public_key);
        assert_eq!(restored.private_key.public_key(), pair.public_key);
    }

    #[test]
    fn debug_hides_private_material() {
        let pair = KeyPair::generate().unwrap();
        let debug = format!("{:?}", pair.private_key);
        assert_eq!(debug, "PrivateKey(***)");
    }

    #[test]
    fn public_key_from_slice_checks_length() {
        assert!(PublicKey::from_slice(&[1u8; 31]).is_err());
        assert!(PublicKey::from_slice(&[1u8; 32]).is_ok());
    }
}
