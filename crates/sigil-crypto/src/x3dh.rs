//! X3DH key agreement.
//!
//! The initiator combines its identity key and a fresh base key with the
//! responder's identity key, signed pre-key and (optionally) one-time
//! pre-key. Both sides derive the same 32-byte secret that seeds the
//! Double Ratchet.

use zeroize::Zeroizing;

use crate::error::Result;
use crate::kdf::hkdf_sha256;
use crate::keys::{KeyPair, PublicKey};

const X3DH_INFO: &[u8] = b"Sigil_X3DH_SHA256";
const DH_PREFIX: [u8; 32] = [0xFF; 32];

fn derive(dh_outputs: &[[u8; 32]]) -> Result<Zeroizing<[u8; 32]>> {
    let mut ikm = Zeroizing::new(Vec::with_capacity(32 * (dh_outputs.len() + 1)));
    ikm.extend_from_slice(&DH_PREFIX);
    for dh in dh_outputs {
        ikm.extend_from_slice(dh);
    }
    Ok(Zeroizing::new(hkdf_sha256(Some(&[0u8; 32][..]), &ikm, X3DH_INFO)?))
}

/// Initiator side: `identity` and `base_key` are ours.
pub fn initiator_secret(
    identity: &KeyPair,
    base_key: &KeyPair,
    their_identity: &PublicKey,
    their_signed_prekey: &PublicKey,
    their_one_time_prekey: Option<&PublicKey>,
) -> Result<Zeroizing<[u8; 32]>> {
    let mut dhs = Zeroizing::new(vec![
        identity.private_key.agree(their_signed_prekey)?,
        base_key.private_key.agree(their_identity)?,
        base_key.private_key.agree(their_signed_prekey)?,
    ]);
    if let Some(opk) = their_one_time_prekey {
        dhs.push(base_key.private_key.agree(opk)?);
    }
    derive(&dhs)
}

/// Responder side: mirror of [`initiator_secret`] from our pre-keys.
pub fn responder_secret(
    identity: &KeyPair,
    signed_prekey: &KeyPair,
    one_time_prekey: Option<&KeyPair>,
    their_identity: &PublicKey,
    their_base_key: &PublicKey,
) -> Result<Zeroizing<[u8; 32]>> {
    let mut dhs = Zeroizing::new(vec![
        signed_prekey.private_key.agree(their_identity)?,
        identity.private_key.agree(their_base_key)?,
        signed_prekey.private_key.agree(their_base_key)?,
    ]);
    if let Some(opk) = one_time_prekey {
        dhs.push(opk.private_key.agree(their_base_key)?);
    }
    derive(&dhs)
}

/// Associated data binding both identities: `IK_initiator || IK_responder`.
pub fn associated_data(initiator: &PublicKey, responder: &PublicKey) -> Vec<u8> {
    let mut ad = Vec::with_capacity(64);
    ad.extend_from_slice(initiator.as_bytes());
    ad.extend_from_slice(responder.as_bytes());
    ad
}
