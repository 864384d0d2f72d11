use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::ProtocolError;

/// Current wire version, prefixed to every encoded structure.
pub const WIRE_VERSION: u8 = 1;

/// Largest encoded structure we accept (backups of large stores included).
pub const MAX_ENCODED_SIZE: usize = 64 * 1024 * 1024;

/// Encode a structure as `[version(1)] [postcard payload]`.
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, ProtocolError> {
    let payload = postcard::to_allocvec(msg)?;
    if payload.len() + 1 > MAX_ENCODED_SIZE {
        return Err(ProtocolError::MessageTooLarge(payload.len() + 1));
    }
    let mut buf = Vec::with_capacity(1 + payload.len());
    buf.push(WIRE_VERSION);
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Decode a structure produced by [`encode`].
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    if bytes.len() > MAX_ENCODED_SIZE {
        return Err(ProtocolError::MessageTooLarge(bytes.len()));
    }
    let (&version, payload) = bytes.split_first().ok_or(ProtocolError::MessageTooShort {
        expected: 1,
        got: 0,
    })?;
    if version != WIRE_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }
    Ok(postcard::from_bytes(payload)?)
}
