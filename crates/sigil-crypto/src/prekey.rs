//! Pre-key and signed pre-key lifecycle.
//!
//! One-time pre-keys are single-use Curve25519 key pairs consumed by X3DH.
//! Signed pre-keys are medium-term keys endorsed by the identity key and
//! rotated periodically; superseded ones are kept for a retention window so
//! in-flight initiations still complete.

use tracing::{debug, info};

use sigil_protocol::{
    DeviceId, OneTimePreKey, PreKeyBundle, PreKeyBundleData, PreKeyId, SignedPreKeyId,
};

use crate::config::CryptoConfig;
use crate::error::{CryptoError, Result};
use crate::identity::{generate_identity, generate_registration_id};
use crate::keys::{KeyPair, PublicKey};
use crate::stores::{
    KeyStore, LocalIdentity, PreKeyRecord, PreKeyStore, SignedPreKeyRecord, SignedPreKeyStore,
};
use crate::unix_millis;

/// New signed pre-key, signed with the identity private key.
pub fn generate_signed_prekey(identity: &KeyPair, id: SignedPreKeyId) -> Result<SignedPreKeyRecord> {
    let key_pair = KeyPair::generate()?;
    let signature = identity.private_key.sign(key_pair.public_key.as_bytes())?;
    Ok(SignedPreKeyRecord {
        id,
        key_pair,
        signature,
        created_at: unix_millis(),
    })
}

/// `count` fresh pre-keys with sequential ids from `start_id`.
pub fn generate_one_time_prekeys(start_id: PreKeyId, count: u32) -> Result<Vec<PreKeyRecord>> {
    (0..count)
        .map(|i| {
            Ok(PreKeyRecord {
                id: start_id + i,
                key_pair: KeyPair::generate()?,
            })
        })
        .collect()
}

pub fn verify_signed_prekey(identity_key: &PublicKey, signed_prekey: &PublicKey, signature: &[u8]) -> bool {
    identity_key.verify(signed_prekey.as_bytes(), signature)
}

fn public_prekey(record: &PreKeyRecord) -> OneTimePreKey {
    OneTimePreKey {
        id: record.id,
        public_key: record.key_pair.public_key.to_bytes(),
    }
}

/// The newest signed pre-key.
pub async fn current_signed_prekey<S: SignedPreKeyStore + ?Sized>(store: &S) -> Result<SignedPreKeyRecord> {
    let id = store
        .signed_prekey_ids()
        .await?
        .into_iter()
        .max()
        .ok_or(CryptoError::NotProvisioned)?;
    store
        .load_signed_prekey(id)
        .await?
        .ok_or(CryptoError::InvalidSignedPreKeyId(id))
}

/// Generate `count` pre-keys with freshly reserved ids and store them.
pub async fn generate_and_store_prekeys<S: PreKeyStore + ?Sized>(
    store: &S,
    count: u32,
) -> Result<Vec<OneTimePreKey>> {
    let start = store.reserve_prekey_ids(count).await?;
    let records = generate_one_time_prekeys(start, count)?;
    let mut published = Vec::with_capacity(records.len());
    for record in records {
        published.push(public_prekey(&record));
        store.save_prekey(record).await?;
    }
    debug!(start, count, "generated one-time pre-keys");
    Ok(published)
}

/// Assemble the public bundle a remote party needs to start a session.
/// Read-only: the included one-time pre-key is consumed only when used.
pub async fn build_prekey_bundle<S: KeyStore + ?Sized>(store: &S) -> Result<PreKeyBundle> {
    let identity = store.local_identity().await?;
    let signed = current_signed_prekey(store).await?;
    let one_time_prekey = match store.prekey_ids().await?.into_iter().min() {
        Some(id) => store.load_prekey(id).await?.map(|r| public_prekey(&r)),
        None => None,
    };
    Ok(PreKeyBundle {
        registration_id: identity.registration_id,
        device_id: identity.device_id,
        identity_key: identity.key_pair.public_key.to_bytes(),
        signed_prekey_id: signed.id,
        signed_prekey: signed.key_pair.public_key.to_bytes(),
        signed_prekey_signature: signed.signature,
        one_time_prekey,
    })
}

/// Upload form of the bundle, carrying `prekeys`.
pub async fn bundle_data<S: KeyStore + ?Sized>(
    store: &S,
    prekeys: Vec<OneTimePreKey>,
) -> Result<PreKeyBundleData> {
    let identity = store.local_identity().await?;
    let signed = current_signed_prekey(store).await?;
    Ok(PreKeyBundleData {
        registration_id: identity.registration_id,
        device_id: identity.device_id,
        identity_key: identity.key_pair.public_key.to_bytes(),
        signed_prekey_id: signed.id,
        signed_prekey: signed.key_pair.public_key.to_bytes(),
        signed_prekey_signature: signed.signature,
        prekeys,
    })
}

/// Upload form of the bundle with every stored one-time pre-key.
pub async fn full_bundle_data<S: KeyStore + ?Sized>(store: &S) -> Result<PreKeyBundleData> {
    let mut prekeys = Vec::new();
    for id in store.prekey_ids().await? {
        if let Some(record) = store.load_prekey(id).await? {
            prekeys.push(public_prekey(&record));
        }
    }
    bundle_data(store, prekeys).await
}

/// Top up one-time pre-keys once fewer than the low-water mark remain.
/// Returns the new public pre-keys (empty when nothing was needed).
///
/// `published` is the directory's count of keys it can still hand out.
/// Keys it already served stay in the local store until their PreKey
/// message arrives, so the smaller of the two counts is what is left.
pub async fn replenish_prekeys<S: KeyStore + ?Sized>(
    store: &S,
    config: &CryptoConfig,
    published: Option<usize>,
) -> Result<Vec<OneTimePreKey>> {
    let local = store.prekey_ids().await?.len();
    let available = published.map_or(local, |published| published.min(local));
    if available >= config.prekey_low_water_mark as usize {
        return Ok(Vec::new());
    }
    let fresh = generate_and_store_prekeys(store, config.prekey_batch_size).await?;
    info!(
        available,
        generated = fresh.len(),
        "replenished one-time pre-keys"
    );
    Ok(fresh)
}

/// Replace the signed pre-key once it is older than the rotation interval
/// (or unconditionally with `force`) and prune expired superseded ones.
pub async fn rotate_signed_prekey<S: KeyStore + ?Sized>(
    store: &S,
    config: &CryptoConfig,
    force: bool,
) -> Result<Option<SignedPreKeyRecord>> {
    let identity = store.local_identity().await?;
    let current = current_signed_prekey(store).await?;
    let now = unix_millis();
    let age_secs = now.saturating_sub(current.created_at) / 1000;

    let rotated = if force || age_secs >= config.signed_prekey_rotation_secs {
        let id = store.reserve_signed_prekey_id().await?;
        let record = generate_signed_prekey(&identity.key_pair, id)?;
        store.save_signed_prekey(record.clone()).await?;
        info!(old = current.id, new = id, "rotated signed pre-key");
        Some(record)
    } else {
        None
    };

    let newest = rotated.as_ref().map_or(current.id, |r| r.id);
    for id in store.signed_prekey_ids().await? {
        if id == newest {
            continue;
        }
        if let Some(old) = store.load_signed_prekey(id).await? {
            let old_age = now.saturating_sub(old.created_at) / 1000;
            if old_age >= config.signed_prekey_retention_secs {
                store.remove_signed_prekey(id).await?;
                debug!(id, "pruned expired signed pre-key");
            }
        }
    }

    Ok(rotated)
}

/// First-time device setup: identity, registration id, signed pre-key and
/// an initial batch of one-time pre-keys. Returns the bundle to publish.
pub async fn provision<S: KeyStore + ?Sized>(
    store: &S,
    user_id: &str,
    device_id: DeviceId,
    config: &CryptoConfig,
) -> Result<PreKeyBundleData> {
    match store.local_identity().await {
        Ok(_) => return Err(CryptoError::Storage("key store already provisioned".into())),
        Err(CryptoError::NotProvisioned) => {}
        Err(e) => return Err(e),
    }

    let key_pair = generate_identity()?;
    let registration_id = generate_registration_id()?;
    let signed_id = store.reserve_signed_prekey_id().await?;
    let signed = generate_signed_prekey(&key_pair, signed_id)?;
    let fingerprint = key_pair.public_key.fingerprint();

    store
        .save_local_identity(LocalIdentity {
            user_id: user_id.to_string(),
            device_id,
            key_pair,
            registration_id,
            created_at: unix_millis(),
        })
        .await?;
    store.save_signed_prekey(signed).await?;
    let prekeys = generate_and_store_prekeys(store, config.prekey_batch_size).await?;

    info!(
        user_id,
        device_id,
        registration_id,
        identity = %fingerprint,
        prekeys = prekeys.len(),
        "provisioned device keys"
    );
    bundle_data(store, prekeys).await
}
