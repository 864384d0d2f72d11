//! XEdDSA: Ed25519-style signatures made directly with an X25519 key pair,
//! so a device's identity key both agrees and signs.
//!
//! <https://signal.org/docs/specifications/xeddsa/>

use curve25519_dalek::constants::ED25519_BASEPOINT_TABLE;
use curve25519_dalek::{EdwardsPoint, MontgomeryPoint, Scalar};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha512};
use subtle::ConstantTimeEq;

use crate::error::{CryptoError, Result};
use crate::keys::{PrivateKey, PublicKey};

pub const SIGNATURE_LEN: usize = 64;

/// hash1 prefix: 0xFE followed by 31 bytes of 0xFF.
const HASH_1_PREFIX: [u8; 32] = [
    0xFE, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
];

fn sha512(parts: &[&[u8]]) -> [u8; 64] {
    let mut hasher = Sha512::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

pub fn sign(private_key: &PrivateKey, message: &[u8]) -> Result<[u8; SIGNATURE_LEN]> {
    let mut z = [0u8; 64];
    OsRng.try_fill_bytes(&mut z).map_err(|_| CryptoError::Rng)?;

    let k = Scalar::from_bytes_mod_order(*private_key.as_bytes());
    let e = &k * ED25519_BASEPOINT_TABLE;
    let mut cap_a = e.compress();
    let sign_bit = cap_a.0[31] >> 7;
    cap_a.0[31] &= 0x7F;
    // Force the public Edwards point to have sign 0.
    let a = if sign_bit == 1 { -k } else { k };

    let r = Scalar::from_bytes_mod_order_wide(&sha512(&[&HASH_1_PREFIX, a.as_bytes(), message, &z]));
    let cap_r = (&r * ED25519_BASEPOINT_TABLE).compress();
    let h = Scalar::from_bytes_mod_order_wide(&sha512(&[cap_r.as_bytes(), cap_a.as_bytes(), message]));
    let s = r + h * a;

    let mut signature = [0u8; SIGNATURE_LEN];
    signature[..32].copy_from_slice(cap_r.as_bytes());
    signature[32..].copy_from_slice(s.as_bytes());
    Ok(signature)
}

pub fn verify(public_key: &PublicKey, message: &[u8], signature: &[u8]) -> bool {
    if signature.len() != SIGNATURE_LEN {
        return false;
    }
    let mut cap_r = [0u8; 32];
    cap_r.copy_from_slice(&signature[..32]);
    let mut s = [0u8; 32];
    s.copy_from_slice(&signature[32..]);
    if s[31] & 0xE0 != 0 {
        return false;
    }

    let Some(a) = MontgomeryPoint(public_key.to_bytes()).to_edwards(0) else {
        return false;
    };
    let cap_a = a.compress();

    let h = Scalar::from_bytes_mod_order_wide(&sha512(&[&cap_r, cap_a.as_bytes(), message]));
    let r_check = EdwardsPoint::vartime_double_scalar_mul_basepoint(
        &h,
        &(-a),
        &Scalar::from_bytes_mod_order(s),
    )
    .compress();

    bool::from(r_check.as_bytes().ct_eq(&cap_r))
}
