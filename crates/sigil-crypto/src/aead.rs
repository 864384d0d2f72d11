//! AEAD strategies.
//!
//! Two ring-backed suites are available: AES-256-GCM, used when the CPU has
//! AES and carry-less multiply instructions, and ChaCha20-Poly1305 as the
//! software fallback. The local preference is detected once per process; every
//! ciphertext records its suite id so any device can open it.

use std::fmt;
use std::sync::OnceLock;

use ring::aead::{Aad, Algorithm, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, CHACHA20_POLY1305};
use tracing::debug;

use crate::config::CipherPreference;
use crate::error::{CryptoError, Result};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CipherSuite {
    Aes256Gcm = 1,
    ChaCha20Poly1305 = 2,
}

impl CipherSuite {
    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn from_id(id: u8) -> Result<Self> {
        match id {
            1 => Ok(Self::Aes256Gcm),
            2 => Ok(Self::ChaCha20Poly1305),
            _ => Err(CryptoError::InvalidMessage("unknown cipher suite")),
        }
    }
}

/// A symmetric authenticated cipher with 256-bit keys and 96-bit nonces.
pub trait AeadCipher: Send + Sync + fmt::Debug {
    fn suite(&self) -> CipherSuite;

    /// Returns ciphertext with the authentication tag appended.
    fn seal(
        &self,
        key: &[u8; KEY_LEN],
        nonce: [u8; NONCE_LEN],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>>;

    /// Verifies the tag and returns the plaintext.
    fn open(
        &self,
        key: &[u8; KEY_LEN],
        nonce: [u8; NONCE_LEN],
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>>;
}

pub struct RingCipher {
    suite: CipherSuite,
    algorithm: &'static Algorithm,
}

impl fmt::Debug for RingCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingCipher").field("suite", &self.suite).finish()
    }
}

impl RingCipher {
    fn key(&self, key: &[u8; KEY_LEN]) -> Result<LessSafeKey> {
        let unbound = UnboundKey::new(self.algorithm, key)
            .map_err(|_| CryptoError::InvalidMessage("invalid AEAD key"))?;
        Ok(LessSafeKey::new(unbound))
    }
}

impl AeadCipher for RingCipher {
    fn suite(&self) -> CipherSuite {
        self.suite
    }

    fn seal(
        &self,
        key: &[u8; KEY_LEN],
        nonce: [u8; NONCE_LEN],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>> {
        let key = self.key(key)?;
        let mut in_out = Vec::with_capacity(plaintext.len() + TAG_LEN);
        in_out.extend_from_slice(plaintext);
        key.seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce), Aad::from(aad), &mut in_out)
            .map_err(|_| CryptoError::InvalidMessage("encryption failed"))?;
        Ok(in_out)
    }

    fn open(
        &self,
        key: &[u8; KEY_LEN],
        nonce: [u8; NONCE_LEN],
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>> {
        if ciphertext.len() < TAG_LEN {
            return Err(CryptoError::InvalidMessage("ciphertext too short for tag"));
        }
        let key = self.key(key)?;
        let mut in_out = ciphertext.to_vec();
        let plaintext = key
            .open_in_place(Nonce::assume_unique_for_key(nonce), Aad::from(aad), &mut in_out)
            .map_err(|_| CryptoError::InvalidMessage("decryption failed: invalid key or tampered data"))?;
        Ok(plaintext.to_vec())
    }
}

static AES_256_GCM_CIPHER: RingCipher = RingCipher {
    suite: CipherSuite::Aes256Gcm,
    algorithm: &AES_256_GCM,
};

static CHACHA20_POLY1305_CIPHER: RingCipher = RingCipher {
    suite: CipherSuite::ChaCha20Poly1305,
    algorithm: &CHACHA20_POLY1305,
};

static DETECTED_SUITE: OnceLock<CipherSuite> = OnceLock::new();

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
fn hardware_aes_available() -> bool {
    is_x86_feature_detected!("aes") && is_x86_feature_detected!("pclmulqdq")
}

#[cfg(target_arch = "aarch64")]
fn hardware_aes_available() -> bool {
    std::arch::is_aarch64_feature_detected!("aes") && std::arch::is_aarch64_feature_detected!("pmull")
}

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64")))]
fn hardware_aes_available() -> bool {
    false
}

/// The suite this process prefers, detected on first use.
pub fn detected_suite() -> CipherSuite {
    *DETECTED_SUITE.get_or_init(|| {
        let suite = if hardware_aes_available() {
            CipherSuite::Aes256Gcm
        } else {
            CipherSuite::ChaCha20Poly1305
        };
        debug!(?suite, "selected AEAD suite");
        suite
    })
}

/// Implementation for a given suite id (used when opening).
pub fn cipher_for(suite: CipherSuite) -> &'static dyn AeadCipher {
    match suite {
        CipherSuite::Aes256Gcm => &AES_256_GCM_CIPHER,
        CipherSuite::ChaCha20Poly1305 => &CHACHA20_POLY1305_CIPHER,
    }
}

/// Implementation to seal new ciphertexts with.
pub fn select_cipher(preference: CipherPreference) -> &'static dyn AeadCipher {
    match preference {
        CipherPreference::Auto => cipher_for(detected_suite()),
        CipherPreference::Aes256Gcm => &AES_256_GCM_CIPHER,
        CipherPreference::ChaCha20Poly1305 => &CHACHA20_POLY1305_CIPHER,
    }
}

/// Look up the implementation for a suite id found on the wire.
pub fn cipher_for_id(id: u8) -> Result<&'static dyn AeadCipher> {
    Ok(cipher_for(CipherSuite::from_id(id)?))
}
