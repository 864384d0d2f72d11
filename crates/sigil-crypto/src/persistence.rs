//! Encrypted on-disk persistence of the key store.
//!
//! A password-derived key (PBKDF2-HMAC-SHA256) seals the postcard-encoded
//! [`StoreSnapshot`] under the configured AEAD suite.

use std::num::NonZeroU32;
use std::path::Path;

use ring::pbkdf2;
use zeroize::Zeroizing;

use sigil_protocol::{decode, encode};

use crate::aead::{cipher_for_id, AeadCipher, NONCE_LEN};
use crate::backup::MAX_KDF_ITERATIONS;
use crate::error::{CryptoError, Result};
use crate::rng::random_array;
use crate::stores::StoreSnapshot;

const MAGIC: &[u8; 4] = b"SGST"; // "SiGil STore"
const VERSION: u8 = 0x01;
const SALT_LEN: usize = 32;
// magic(4) version(1) suite(1) iterations(4) salt(32) nonce(12) length(4)
const HEADER_LEN: usize = 4 + 1 + 1 + 4 + SALT_LEN + NONCE_LEN + 4;

// The iteration count of a file being opened comes from its unauthenticated header.
fn derive_key(password: &str, salt: &[u8], iterations: u32) -> Result<Zeroizing<[u8; 32]>> {
    if iterations > MAX_KDF_ITERATIONS {
        return Err(CryptoError::Storage(format!(
            "KDF iteration count {iterations} exceeds {MAX_KDF_ITERATIONS}"
        )));
    }
    let iterations =
        NonZeroU32::new(iterations).ok_or(CryptoError::Storage("zero KDF iterations".into()))?;
    let mut key = Zeroizing::new([0u8; 32]);
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        salt,
        password.as_bytes(),
        &mut key[..],
    );
    Ok(key)
}

/// Encrypt a store snapshot to a binary blob for disk storage.
///
/// File format: [SGST magic(4)] [version(1)] [suite(1)] [iterations(4)] [salt(32)] [nonce(12)] [length(4)] [encrypted payload + tag(16)]
pub fn encrypt_store(
    snapshot: &StoreSnapshot,
    password: &str,
    cipher: &dyn AeadCipher,
    iterations: u32,
) -> Result<Vec<u8>> {
    let plaintext = Zeroizing::new(encode(snapshot)?);
    let salt = random_array::<SALT_LEN>()?;
    let nonce = random_array::<NONCE_LEN>()?;
    let key = derive_key(password, &salt, iterations)?;

    let mut header = Vec::with_capacity(HEADER_LEN);
    header.extend_from_slice(MAGIC);
    header.push(VERSION);
    header.push(cipher.suite().id());
    header.extend_from_slice(&iterations.to_be_bytes());
    header.extend_from_slice(&salt);
    header.extend_from_slice(&nonce);

    // Everything before the length field is authenticated.
    let sealed = cipher.seal(&key, nonce, &header, &plaintext)?;
    let payload_len = u32::try_from(sealed.len())
        .map_err(|_| CryptoError::Storage("store too large".into()))?;

    let mut file_data = header;
    file_data.extend_from_slice(&payload_len.to_be_bytes());
    file_data.extend_from_slice(&sealed);
    Ok(file_data)
}

/// Decrypt a store snapshot written by [`encrypt_store`].
pub fn decrypt_store(file_data: &[u8], password: &str) -> Result<StoreSnapshot> {
    if file_data.len() < HEADER_LEN {
        return Err(CryptoError::Storage("file too short".into()));
    }
    if &file_data[0..4] != MAGIC {
        return Err(CryptoError::Storage("invalid file format (expected SGST header)".into()));
    }
    if file_data[4] != VERSION {
        return Err(CryptoError::Storage("unsupported file version".into()));
    }
    let cipher = cipher_for_id(file_data[5])?;

    let mut iterations = [0u8; 4];
    iterations.copy_from_slice(&file_data[6..10]);
    let salt = &file_data[10..10 + SALT_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&file_data[42..42 + NONCE_LEN]);
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&file_data[54..58]);
    let payload_len = u32::from_be_bytes(len_bytes) as usize;

    if file_data.len() < HEADER_LEN + payload_len {
        return Err(CryptoError::Storage("file truncated".into()));
    }

    let key = derive_key(password, salt, u32::from_be_bytes(iterations))?;
    let plaintext = Zeroizing::new(
        cipher
            .open(
                &key,
                nonce,
                &file_data[..HEADER_LEN - 4],
                &file_data[HEADER_LEN..HEADER_LEN + payload_len],
            )
            .map_err(|_| CryptoError::Authentication)?,
    );
    Ok(decode(&plaintext)?)
}

/// Check if file data starts with a valid SGST header.
pub fn has_valid_header(file_data: &[u8]) -> bool {
    file_data.len() >= HEADER_LEN && &file_data[0..4] == MAGIC && file_data[4] == VERSION
}

/// Write the encrypted store next to `path` and rename it into place.
pub fn save_store_file(
    path: &Path,
    snapshot: &StoreSnapshot,
    password: &str,
    cipher: &dyn AeadCipher,
    iterations: u32,
) -> Result<()> {
    let data = encrypt_store(snapshot, password, cipher, iterations)?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, &data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

pub fn load_store_file(path: &Path, password: &str) -> Result<StoreSnapshot> {
    let data = std::fs::read(path)?;
    decrypt_store(&data, password)
}
