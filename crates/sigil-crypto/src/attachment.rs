//! Attachment encryption.
//!
//! Layout of an encrypted attachment:
//!
//! ```text
//! [version(1)] [suite(1)] [chunk_size(4 BE)] [base_nonce(8)]
//! [chunk 0 ciphertext + tag] ... [final chunk ciphertext + tag]
//! ```
//!
//! Chunk `i` is sealed with nonce `base_nonce || i (u32 BE)` and AAD
//! `header || final_flag`, so truncation, reordering and chunk splicing all
//! fail to authenticate. The digest is SHA-256 over the whole blob and is
//! checked before any decryption. The in-memory functions are the streaming
//! ones run over buffers.

use std::io::{Cursor, Read, Seek, SeekFrom, Write};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::debug;
use zeroize::Zeroizing;

use sigil_protocol::{decode, encode, AttachmentKeyData};

use crate::aead::{cipher_for_id, AeadCipher, KEY_LEN, NONCE_LEN, TAG_LEN};
use crate::error::{CryptoError, Result};
use crate::rng::random_array;

pub const ATTACHMENT_VERSION: u8 = 1;
pub const HEADER_LEN: usize = 14;
/// Largest chunk size accepted when decrypting.
pub const MAX_CHUNK_SIZE: u32 = 16 * 1024 * 1024;

const BASE_NONCE_LEN: usize = 8;

pub struct EncryptedAttachment {
    pub ciphertext: Vec<u8>,
    /// Key, digest and plaintext length; travels inside the referencing message.
    pub key_data: AttachmentKeyData,
}

struct Header {
    suite: u8,
    chunk_size: u32,
    base_nonce: [u8; BASE_NONCE_LEN],
}

impl Header {
    fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = ATTACHMENT_VERSION;
        buf[1] = self.suite;
        buf[2..6].copy_from_slice(&self.chunk_size.to_be_bytes());
        buf[6..].copy_from_slice(&self.base_nonce);
        buf
    }

    fn parse(buf: &[u8; HEADER_LEN]) -> Result<Self> {
        if buf[0] != ATTACHMENT_VERSION {
            return Err(CryptoError::InvalidMessage("unsupported attachment version"));
        }
        let chunk_size = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]);
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(CryptoError::InvalidMessage("invalid attachment chunk size"));
        }
        let mut base_nonce = [0u8; BASE_NONCE_LEN];
        base_nonce.copy_from_slice(&buf[6..]);
        Ok(Self {
            suite: buf[1],
            chunk_size,
            base_nonce,
        })
    }

    fn nonce(&self, index: u32) -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        nonce[..BASE_NONCE_LEN].copy_from_slice(&self.base_nonce);
        nonce[BASE_NONCE_LEN..].copy_from_slice(&index.to_be_bytes());
        nonce
    }

    fn aad(&self, is_final: bool) -> Vec<u8> {
        let mut aad = self.to_bytes().to_vec();
        aad.push(u8::from(is_final));
        aad
    }
}

/// Read until `buf` is full or the reader is exhausted.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

fn next_index(index: u32) -> Result<u32> {
    index
        .checked_add(1)
        .ok_or(CryptoError::InvalidMessage("attachment has too many chunks"))
}

/// Encrypt everything from `reader` into `writer` under a fresh key.
pub fn encrypt_stream<R: Read, W: Write>(
    cipher: &dyn AeadCipher,
    chunk_size: u32,
    reader: &mut R,
    writer: &mut W,
) -> Result<AttachmentKeyData> {
    if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
        return Err(CryptoError::InvalidMessage("invalid attachment chunk size"));
    }
    let key = Zeroizing::new(random_array::<KEY_LEN>()?);
    let header = Header {
        suite: cipher.suite().id(),
        chunk_size,
        base_nonce: random_array()?,
    };
    let header_bytes = header.to_bytes();
    let mut hasher = Sha256::new();
    hasher.update(header_bytes);
    writer.write_all(&header_bytes)?;

    let mut current = vec![0u8; chunk_size as usize];
    let mut ahead = vec![0u8; chunk_size as usize];
    let mut current_len = read_full(reader, &mut current)?;
    let mut index = 0u32;
    let mut length = 0u64;
    loop {
        // A chunk is final when nothing follows it.
        let ahead_len = if current_len == current.len() {
            read_full(reader, &mut ahead)?
        } else {
            0
        };
        let is_final = ahead_len == 0;
        let sealed = cipher.seal(
            &key,
            header.nonce(index),
            &header.aad(is_final),
            &current[..current_len],
        )?;
        hasher.update(&sealed);
        writer.write_all(&sealed)?;
        length += current_len as u64;
        if is_final {
            break;
        }
        std::mem::swap(&mut current, &mut ahead);
        current_len = ahead_len;
        index = next_index(index)?;
    }
    writer.flush()?;
    debug!(length, chunks = u64::from(index) + 1, "encrypted attachment");

    Ok(AttachmentKeyData {
        key: *key,
        digest: hasher.finalize().into(),
        length,
    })
}

/// Verify the digest of `reader`, then decrypt it into `writer`. Returns
/// the plaintext length. On error, anything already written must be
/// discarded.
pub fn decrypt_stream<R: Read + Seek, W: Write>(
    key_data: &AttachmentKeyData,
    reader: &mut R,
    writer: &mut W,
) -> Result<u64> {
    let start = reader.stream_position()?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let digest: [u8; 32] = hasher.finalize().into();
    if !bool::from(digest[..].ct_eq(&key_data.digest[..])) {
        return Err(CryptoError::Integrity);
    }
    reader.seek(SeekFrom::Start(start))?;

    let mut header_bytes = [0u8; HEADER_LEN];
    if read_full(reader, &mut header_bytes)? != HEADER_LEN {
        return Err(CryptoError::InvalidMessage("truncated attachment header"));
    }
    let header = Header::parse(&header_bytes)?;
    let cipher = cipher_for_id(header.suite)?;

    let sealed_len = header.chunk_size as usize + TAG_LEN;
    let mut current = vec![0u8; sealed_len];
    let mut ahead = vec![0u8; sealed_len];
    let mut current_len = read_full(reader, &mut current)?;
    let mut index = 0u32;
    let mut length = 0u64;
    loop {
        if current_len < TAG_LEN {
            return Err(CryptoError::InvalidMessage("truncated attachment chunk"));
        }
        let ahead_len = if current_len == current.len() {
            read_full(reader, &mut ahead)?
        } else {
            0
        };
        let is_final = ahead_len == 0;
        let plaintext = Zeroizing::new(cipher.open(
            &key_data.key,
            header.nonce(index),
            &header.aad(is_final),
            &current[..current_len],
        )?);
        length += plaintext.len() as u64;
        if length > key_data.length {
            return Err(CryptoError::SizeMismatch {
                expected: key_data.length,
                got: length,
            });
        }
        writer.write_all(&plaintext)?;
        if is_final {
            break;
        }
        std::mem::swap(&mut current, &mut ahead);
        current_len = ahead_len;
        index = next_index(index)?;
    }
    writer.flush()?;

    if length != key_data.length {
        return Err(CryptoError::SizeMismatch {
            expected: key_data.length,
            got: length,
        });
    }
    Ok(length)
}

pub fn encrypt_file(cipher: &dyn AeadCipher, chunk_size: u32, plaintext: &[u8]) -> Result<EncryptedAttachment> {
    let mut ciphertext = Vec::with_capacity(HEADER_LEN + plaintext.len() + TAG_LEN);
    let key_data = encrypt_stream(cipher, chunk_size, &mut Cursor::new(plaintext), &mut ciphertext)?;
    Ok(EncryptedAttachment { ciphertext, key_data })
}

pub fn decrypt_file(ciphertext: &[u8], key_data: &AttachmentKeyData) -> Result<Vec<u8>> {
    let mut plaintext = Vec::with_capacity(key_data.length.min(ciphertext.len() as u64) as usize);
    decrypt_stream(key_data, &mut Cursor::new(ciphertext), &mut plaintext)?;
    Ok(plaintext)
}

/// Opaque text token carrying an attachment's key, digest and length.
pub fn serialize_key_token(key_data: &AttachmentKeyData) -> Result<String> {
    Ok(URL_SAFE_NO_PAD.encode(encode(key_data)?))
}

pub fn parse_key_token(token: &str) -> Result<AttachmentKeyData> {
    let bytes = Zeroizing::new(
        URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|_| CryptoError::InvalidMessage("malformed attachment token"))?,
    );
    Ok(decode(&bytes)?)
}
