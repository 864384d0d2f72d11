use serde::{Deserialize, Serialize};

/// Which AEAD implementation to seal new ciphertexts with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CipherPreference {
    /// Check the CPU once and pick the fastest suite.
    #[default]
    Auto,
    #[serde(rename = "aes-256-gcm")]
    Aes256Gcm,
    #[serde(rename = "chacha20-poly1305")]
    ChaCha20Poly1305,
}

/// Policy knobs for key lifecycle, backups and attachments, loaded from a
/// TOML table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoConfig {
    /// One-time pre-keys generated per batch.
    #[serde(default = "default_prekey_batch_size")]
    pub prekey_batch_size: u32,

    /// Replenish when fewer one-time pre-keys than this remain.
    #[serde(default = "default_prekey_low_water_mark")]
    pub prekey_low_water_mark: u32,

    /// Age after which the signed pre-key is replaced.
    #[serde(default = "default_signed_prekey_rotation_secs")]
    pub signed_prekey_rotation_secs: u64,

    /// Age after which superseded signed pre-keys are deleted.
    #[serde(default = "default_signed_prekey_retention_secs")]
    pub signed_prekey_retention_secs: u64,

    /// Maximum message keys skipped ahead in a single receiving chain.
    #[serde(default = "default_max_skipped_message_keys")]
    pub max_skipped_message_keys: u32,

    /// PBKDF2-HMAC-SHA256 iterations for backup keys.
    #[serde(default = "default_backup_kdf_iterations")]
    pub backup_kdf_iterations: u32,

    #[serde(default = "default_min_passphrase_len")]
    pub min_passphrase_len: usize,

    #[serde(default = "default_min_passphrase_distinct_chars")]
    pub min_passphrase_distinct_chars: usize,

    /// Backups older than this fail validation. `None` disables the check.
    #[serde(default = "default_backup_max_age_secs")]
    pub backup_max_age_secs: Option<u64>,

    /// Plaintext bytes per attachment chunk.
    #[serde(default = "default_attachment_chunk_size")]
    pub attachment_chunk_size: u32,

    /// Words in a generated passphrase.
    #[serde(default = "default_passphrase_word_count")]
    pub passphrase_word_count: usize,

    #[serde(default)]
    pub cipher: CipherPreference,
}

fn default_prekey_batch_size() -> u32 {
    100
}

fn default_prekey_low_water_mark() -> u32 {
    10
}

fn default_signed_prekey_rotation_secs() -> u64 {
    7 * 24 * 60 * 60
}

fn default_signed_prekey_retention_secs() -> u64 {
    30 * 24 * 60 * 60
}

fn default_max_skipped_message_keys() -> u32 {
    1000
}

fn default_backup_kdf_iterations() -> u32 {
    600_000
}

fn default_min_passphrase_len() -> usize {
    12
}

fn default_min_passphrase_distinct_chars() -> usize {
    6
}

fn default_backup_max_age_secs() -> Option<u64> {
    Some(180 * 24 * 60 * 60)
}

fn default_attachment_chunk_size() -> u32 {
    64 * 1024
}

fn default_passphrase_word_count() -> usize {
    10
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            prekey_batch_size: default_prekey_batch_size(),
            prekey_low_water_mark: default_prekey_low_water_mark(),
            signed_prekey_rotation_secs: default_signed_prekey_rotation_secs(),
            signed_prekey_retention_secs: default_signed_prekey_retention_secs(),
            max_skipped_message_keys: default_max_skipped_message_keys(),
            backup_kdf_iterations: default_backup_kdf_iterations(),
            min_passphrase_len: default_min_passphrase_len(),
            min_passphrase_distinct_chars: default_min_passphrase_distinct_chars(),
            backup_max_age_secs: default_backup_max_age_secs(),
            attachment_chunk_size: default_attachment_chunk_size(),
            passphrase_word_count: default_passphrase_word_count(),
            cipher: CipherPreference::default(),
        }
    }
}

impl CryptoConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}
