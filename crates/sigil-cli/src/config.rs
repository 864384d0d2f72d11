use std::path::PathBuf;

use serde::Deserialize;
use sigil_crypto::CryptoConfig;

/// CLI configuration, loaded from a TOML file.
#[derive(Debug, Deserialize)]
pub struct CliConfig {
    /// Encrypted key store file.
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,

    /// PBKDF2 iterations protecting the store file.
    #[serde(default = "default_store_kdf_iterations")]
    pub store_kdf_iterations: u32,

    /// Cryptographic tunables (`[crypto]` table).
    #[serde(default)]
    pub crypto: CryptoConfig,
}

fn default_store_path() -> PathBuf {
    "sigil-store.bin".into()
}

fn default_store_kdf_iterations() -> u32 {
    600_000
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
            store_kdf_iterations: default_store_kdf_iterations(),
            crypto: CryptoConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = CliConfig::default();
        assert_eq!(config.store_path, PathBuf::from("sigil-store.bin"));
        assert_eq!(config.store_kdf_iterations, 600_000);
        assert_eq!(config.crypto.prekey_batch_size, 100);
    }

    #[test]
    fn config_toml_deserialization() {
        let toml = r#"
            store_path = "/var/lib/sigil/store.bin"

            [crypto]
            prekey_batch_size = 20
            attachment_chunk_size = 4096
        "#;
        let config: CliConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.store_path, PathBuf::from("/var/lib/sigil/store.bin"));
        assert_eq!(config.store_kdf_iterations, 600_000);
        assert_eq!(config.crypto.prekey_batch_size, 20);
        assert_eq!(config.crypto.attachment_chunk_size, 4096);
        assert_eq!(config.crypto.prekey_low_water_mark, 10);
    }
}
