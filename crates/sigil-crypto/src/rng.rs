//! System randomness for salts, nonces, seeds and identifiers.

use ring::rand::{SecureRandom, SystemRandom};

use crate::error::{CryptoError, Result};

/// Fill a fixed-size array from the OS entropy source.
pub fn random_array<const N: usize>() -> Result<[u8; N]> {
    let mut bytes = [0u8; N];
    SystemRandom::new()
        .fill(&mut bytes)
        .map_err(|_| CryptoError::Rng)?;
    Ok(bytes)
}

pub fn random_u32() -> Result<u32> {
    Ok(u32::from_be_bytes(random_array()?))
}
