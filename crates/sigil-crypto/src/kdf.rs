//! HKDF / HMAC / SHA-2 helpers shared by the ratchets, backups and
//! attachments.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::error::{CryptoError, Result};

pub type HmacSha256 = Hmac<Sha256>;

/// HKDF-SHA256 extract-and-expand into `N` bytes.
pub fn hkdf_sha256<const N: usize>(salt: Option<&[u8]>, ikm: &[u8], info: &[u8]) -> Result<[u8; N]> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    let mut okm = [0u8; N];
    hk.expand(info, &mut okm)
        .map_err(|_| CryptoError::InvalidMessage("HKDF output too long"))?;
    Ok(okm)
}

/// HMAC-SHA256 over the concatenation of `parts`.
pub fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> Result<[u8; 32]> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|_| CryptoError::InvalidMessage("invalid MAC key"))?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().into())
}

/// Constant-time HMAC-SHA256 tag check.
pub fn verify_hmac_sha256(key: &[u8], data: &[u8], tag: &[u8]) -> Result<bool> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|_| CryptoError::InvalidMessage("invalid MAC key"))?;
    mac.update(data);
    Ok(mac.verify_slice(tag).is_ok())
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hkdf_is_deterministic_and_info_separated() {
        let a: [u8; 32] = hkdf_sha256(None, b"ikm", b"one").unwrap();
        let b: [u8; 32] = hkdf_sha256(None, b"ikm", b"one").unwrap();
        let c: [u8; 32] = hkdf_sha256(None, b"ikm", b"two").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn hmac_parts_concatenate() {
        let joined = hmac_sha256(b"key", &[b"hello world"]).unwrap();
        let split = hmac_sha256(b"key", &[b"hello", b" world"]).unwrap();
        assert_eq!(joined, split);
    }

    #[test]
    fn hmac_verification() {
        let tag = hmac_sha256(b"key", &[b"data"]).unwrap();
        assert!(verify_hmac_sha256(b"key", b"data", &tag).unwrap());
        assert!(!verify_hmac_sha256(b"key", b"data!", &tag).unwrap());
        assert!(!verify_hmac_sha256(b"other", b"data", &tag).unwrap());
        assert!(!verify_hmac_sha256(b"key", b"data", &tag[..16]).unwrap());
    }
}
