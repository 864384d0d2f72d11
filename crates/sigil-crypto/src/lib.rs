//! Sigil cryptographic core.
//!
//! This crate provides:
//! - Identity, signed pre-key and one-time pre-key lifecycle
//! - Pairwise sessions (X3DH + Double Ratchet) with TOFU identity checks
//! - Group encryption via sender keys, rotated on member removal
//! - Chunked attachment encryption with digest-first integrity checks
//! - Passphrase-protected backup and atomic restore of the key store
//! - Safety numbers, passphrase generation and encrypted local persistence
//!
//! [`SecureMessenger`] is the entry point for applications.

pub mod aead;
pub mod attachment;
pub mod backup;
pub mod config;
pub mod directory;
pub mod error;
pub mod fingerprint;
pub mod group;
pub mod identity;
pub mod kdf;
pub mod keys;
pub mod locks;
pub mod messenger;
pub mod passphrase;
pub mod persistence;
pub mod prekey;
pub mod ratchet;
pub mod rng;
pub mod session;
pub mod stores;
pub mod x3dh;
pub mod xeddsa;

#[cfg(test)]
mod tests;

use std::time::{SystemTime, UNIX_EPOCH};

// Re-export key types for convenience
pub use aead::{select_cipher, AeadCipher, CipherSuite};
pub use attachment::{parse_key_token, serialize_key_token, EncryptedAttachment};
pub use config::{CipherPreference, CryptoConfig};
pub use directory::{DirectoryError, InMemoryDirectory, KeyDirectory};
pub use error::{CryptoError, Result};
pub use fingerprint::SafetyNumber;
pub use group::{GroupKeyInfo, SenderChainInfo};
pub use keys::{KeyPair, PrivateKey, PublicKey};
pub use messenger::{DeviceFailure, FanOut, GroupSend, MembershipChange, SecureMessenger};
pub use session::SessionInfo;
pub use stores::{InMemoryKeyStore, KeyStore, StoreSnapshot, TrustLevel};

/// Milliseconds since the Unix epoch.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
