//! Passphrase-protected backup of the whole key store.
//!
//! PBKDF2-HMAC-SHA256 stretches the passphrase into a master key; HKDF
//! splits that into independent encryption and MAC keys. The MAC over the
//! envelope is checked before anything is decrypted, and every failure from
//! that point up to a decrypted snapshot reports the same
//! [`CryptoError::Authentication`].

use std::num::NonZeroU32;

use ring::pbkdf2;
use tracing::{info, warn};
use zeroize::Zeroizing;

use sigil_protocol::{decode, encode, BackupEnvelope};

use crate::aead::{cipher_for_id, AeadCipher, NONCE_LEN, TAG_LEN};
use crate::config::CryptoConfig;
use crate::error::{CryptoError, Result};
use crate::kdf::{hkdf_sha256, hmac_sha256, verify_hmac_sha256};
use crate::passphrase::check_passphrase_policy;
use crate::rng::random_array;
use crate::stores::{KeyStore, StoreSnapshot};
use crate::unix_millis;

pub const BACKUP_VERSION: u8 = 1;
pub const SALT_LEN: usize = 32;
pub const MAC_LEN: usize = 32;
/// Upper bound on accepted iteration counts so a crafted envelope cannot
/// stall a restore.
pub const MAX_KDF_ITERATIONS: u32 = 10_000_000;
/// Tolerated clock skew for backup timestamps.
const MAX_FUTURE_SKEW_MS: u64 = 5 * 60 * 1000;

const ENCRYPTION_INFO: &[u8] = b"Sigil_Backup_Encryption";
const MAC_INFO: &[u8] = b"Sigil_Backup_MAC";
const PAYLOAD_AAD: &[u8] = b"Sigil_Backup_Payload";

struct BackupKeys {
    encryption: Zeroizing<[u8; 32]>,
    mac: Zeroizing<[u8; 32]>,
}

fn derive_keys(passphrase: &str, salt: &[u8], iterations: u32) -> Result<BackupKeys> {
    let iterations =
        NonZeroU32::new(iterations).ok_or(CryptoError::InvalidBackup("zero KDF iterations"))?;
    let mut master = Zeroizing::new([0u8; 32]);
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        salt,
        passphrase.as_bytes(),
        &mut master[..],
    );
    Ok(BackupKeys {
        encryption: Zeroizing::new(hkdf_sha256(None, &master[..], ENCRYPTION_INFO)?),
        mac: Zeroizing::new(hkdf_sha256(None, &master[..], MAC_INFO)?),
    })
}

/// Export every record of `store`, sealed under `passphrase`.
pub async fn create_backup<S: KeyStore + ?Sized>(
    store: &S,
    config: &CryptoConfig,
    cipher: &dyn AeadCipher,
    passphrase: &str,
) -> Result<BackupEnvelope> {
    check_passphrase_policy(passphrase, config)?;
    let snapshot = store.snapshot().await?;
    let local = snapshot.local.as_ref().ok_or(CryptoError::NotProvisioned)?;

    let salt = random_array::<SALT_LEN>()?;
    let nonce = random_array::<NONCE_LEN>()?;
    let keys = derive_keys(passphrase, &salt, config.backup_kdf_iterations)?;
    let plaintext = Zeroizing::new(encode(&snapshot)?);
    let ciphertext = cipher.seal(&keys.encryption, nonce, PAYLOAD_AAD, &plaintext)?;

    let mut envelope = BackupEnvelope {
        version: BACKUP_VERSION,
        user_id: local.user_id.clone(),
        device_id: local.device_id,
        created_at: unix_millis(),
        salt: salt.to_vec(),
        kdf_iterations: config.backup_kdf_iterations,
        suite: cipher.suite().id(),
        nonce: nonce.to_vec(),
        ciphertext,
        mac: Vec::new(),
    };
    envelope.mac = hmac_sha256(&keys.mac[..], &[&envelope.authenticated_bytes()])?.to_vec();

    info!(
        user_id = %envelope.user_id,
        device_id = envelope.device_id,
        sessions = snapshot.sessions.len(),
        sender_keys = snapshot.sender_keys.len(),
        bytes = envelope.ciphertext.len(),
        "created backup"
    );
    Ok(envelope)
}

fn check_structure(envelope: &BackupEnvelope) -> Result<()> {
    if envelope.version != BACKUP_VERSION {
        return Err(CryptoError::InvalidBackup("unsupported version"));
    }
    if envelope.user_id.is_empty() {
        return Err(CryptoError::InvalidBackup("missing user id"));
    }
    if envelope.salt.len() != SALT_LEN {
        return Err(CryptoError::InvalidBackup("bad salt length"));
    }
    if envelope.nonce.len() != NONCE_LEN {
        return Err(CryptoError::InvalidBackup("bad nonce length"));
    }
    if envelope.mac.len() != MAC_LEN {
        return Err(CryptoError::InvalidBackup("bad MAC length"));
    }
    if envelope.ciphertext.len() < TAG_LEN {
        return Err(CryptoError::InvalidBackup("missing payload"));
    }
    if envelope.kdf_iterations == 0 || envelope.kdf_iterations > MAX_KDF_ITERATIONS {
        return Err(CryptoError::InvalidBackup("KDF iterations out of range"));
    }
    cipher_for_id(envelope.suite).map_err(|_| CryptoError::InvalidBackup("unknown cipher suite"))?;
    Ok(())
}

/// Structural and freshness pre-check; needs no passphrase.
pub fn validate_backup(envelope: &BackupEnvelope, config: &CryptoConfig) -> Result<()> {
    check_structure(envelope)?;
    let now = unix_millis();
    if envelope.created_at > now.saturating_add(MAX_FUTURE_SKEW_MS) {
        return Err(CryptoError::InvalidBackup("timestamp in the future"));
    }
    if let Some(max_age) = config.backup_max_age_secs {
        let age_secs = now.saturating_sub(envelope.created_at) / 1000;
        if age_secs > max_age {
            return Err(CryptoError::InvalidBackup("backup is stale"));
        }
    }
    Ok(())
}

/// Decrypt `envelope` and replace the whole store with its contents.
/// Either every record is replaced or nothing changes.
pub async fn restore_backup<S: KeyStore + ?Sized>(
    store: &S,
    envelope: &BackupEnvelope,
    passphrase: &str,
) -> Result<()> {
    check_structure(envelope)?;
    let keys = derive_keys(passphrase, &envelope.salt, envelope.kdf_iterations)?;
    if !verify_hmac_sha256(&keys.mac[..], &envelope.authenticated_bytes(), &envelope.mac)? {
        warn!(user_id = %envelope.user_id, "backup authentication failed");
        return Err(CryptoError::Authentication);
    }

    let cipher = cipher_for_id(envelope.suite).map_err(|_| CryptoError::Authentication)?;
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&envelope.nonce);
    let plaintext = Zeroizing::new(
        cipher
            .open(&keys.encryption, nonce, PAYLOAD_AAD, &envelope.ciphertext)
            .map_err(|_| CryptoError::Authentication)?,
    );
    let snapshot: StoreSnapshot =
        decode(&plaintext).map_err(|_| CryptoError::InvalidBackup("corrupted payload"))?;

    match &snapshot.local {
        Some(local) if local.user_id == envelope.user_id && local.device_id == envelope.device_id => {}
        _ => return Err(CryptoError::InvalidBackup("backup owner mismatch")),
    }

    let sessions = snapshot.sessions.len();
    store.replace_all(snapshot).await?;
    info!(
        user_id = %envelope.user_id,
        device_id = envelope.device_id,
        sessions,
        "restored backup"
    );
    Ok(())
}
