//! Key directory seam.
//!
//! The directory is the external service that holds published pre-key
//! bundles and group rosters. [`InMemoryDirectory`] is the local stand-in
//! used by the CLI and tests: like a relay server it hands out each one-time
//! pre-key at most once.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use sigil_protocol::{
    DeviceId, OneTimePreKey, PreKeyBundle, PreKeyBundleData, PreKeyId, ProtocolAddress, UserId,
};

use crate::error::CryptoError;

/// Stored one-time pre-keys per device are capped.
pub const MAX_PUBLISHED_PREKEYS: usize = 1000;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("not found")]
    NotFound,

    #[error("one-time pre-keys exhausted")]
    Exhausted,

    #[error("directory unavailable: {0}")]
    Unavailable(String),
}

impl DirectoryError {
    /// Attach the address the lookup was for.
    pub fn for_address(self, address: &ProtocolAddress) -> CryptoError {
        match self {
            DirectoryError::NotFound => CryptoError::NoPrekeysAvailable(address.clone()),
            DirectoryError::Exhausted => CryptoError::PrekeysExhausted(address.clone()),
            DirectoryError::Unavailable(reason) => CryptoError::Directory(reason),
        }
    }
}

impl From<DirectoryError> for CryptoError {
    fn from(e: DirectoryError) -> Self {
        CryptoError::Directory(e.to_string())
    }
}

#[async_trait]
pub trait KeyDirectory: Send + Sync {
    /// A bundle with at most one one-time pre-key, which the directory
    /// must not hand out again.
    async fn fetch_prekey_bundle(&self, address: &ProtocolAddress) -> Result<PreKeyBundle, DirectoryError>;

    /// Publish identity and signed pre-key, adding any carried one-time
    /// pre-keys to the device's pool.
    async fn publish_prekey_bundle(&self, user_id: &str, bundle: PreKeyBundleData) -> Result<(), DirectoryError>;

    async fn mark_one_time_prekey_used(
        &self,
        address: &ProtocolAddress,
        prekey_id: PreKeyId,
    ) -> Result<(), DirectoryError>;

    async fn fetch_group_members(&self, group_id: &str) -> Result<Vec<UserId>, DirectoryError>;

    async fn fetch_device_ids(&self, user_id: &str) -> Result<Vec<DeviceId>, DirectoryError>;

    /// One-time pre-keys of `address` the directory can still hand out.
    async fn available_prekey_count(&self, address: &ProtocolAddress) -> Result<usize, DirectoryError>;
}

struct DeviceEntry {
    data: PreKeyBundleData,
}

#[derive(Default)]
pub struct InMemoryDirectory {
    devices: DashMap<ProtocolAddress, DeviceEntry>,
    groups: RwLock<HashMap<String, BTreeSet<UserId>>>,
    /// Answer `Exhausted` instead of a bundle without a one-time pre-key.
    strict: bool,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn strict() -> Self {
        Self {
            strict: true,
            ..Self::default()
        }
    }

    pub async fn set_group_members(&self, group_id: &str, members: impl IntoIterator<Item = UserId>) {
        self.groups
            .write()
            .await
            .insert(group_id.to_string(), members.into_iter().collect());
    }

    pub async fn remove_group_member(&self, group_id: &str, user_id: &str) {
        if let Some(members) = self.groups.write().await.get_mut(group_id) {
            members.remove(user_id);
        }
    }

    pub fn available_prekeys(&self, address: &ProtocolAddress) -> usize {
        self.devices
            .get(address)
            .map_or(0, |entry| entry.data.prekeys.len())
    }
}

#[async_trait]
impl KeyDirectory for InMemoryDirectory {
    async fn fetch_prekey_bundle(&self, address: &ProtocolAddress) -> Result<PreKeyBundle, DirectoryError> {
        let mut entry = self.devices.get_mut(address).ok_or(DirectoryError::NotFound)?;
        let one_time_prekey = if entry.data.prekeys.is_empty() {
            if self.strict {
                return Err(DirectoryError::Exhausted);
            }
            None
        } else {
            Some(entry.data.prekeys.remove(0))
        };
        let data = &entry.data;
        debug!(%address, one_time = one_time_prekey.is_some(), "served pre-key bundle");
        Ok(PreKeyBundle {
            registration_id: data.registration_id,
            device_id: data.device_id,
            identity_key: data.identity_key,
            signed_prekey_id: data.signed_prekey_id,
            signed_prekey: data.signed_prekey,
            signed_prekey_signature: data.signed_prekey_signature.clone(),
            one_time_prekey,
        })
    }

    async fn publish_prekey_bundle(&self, user_id: &str, bundle: PreKeyBundleData) -> Result<(), DirectoryError> {
        let address = ProtocolAddress::new(user_id, bundle.device_id);
        match self.devices.get_mut(&address) {
            Some(mut entry) => {
                let mut pool: Vec<OneTimePreKey> = std::mem::take(&mut entry.data.prekeys);
                // A changed identity means a reset device: old pre-keys are dead.
                if entry.data.identity_key != bundle.identity_key {
                    pool.clear();
                }
                for prekey in bundle.prekeys.iter() {
                    if !pool.iter().any(|p| p.id == prekey.id) {
                        pool.push(prekey.clone());
                    }
                }
                pool.truncate(MAX_PUBLISHED_PREKEYS);
                entry.data = PreKeyBundleData {
                    prekeys: pool,
                    ..bundle
                };
            }
            None => {
                let mut data = bundle;
                data.prekeys.truncate(MAX_PUBLISHED_PREKEYS);
                self.devices.insert(address.clone(), DeviceEntry { data });
            }
        }
        debug!(%address, "published pre-key bundle");
        Ok(())
    }

    async fn mark_one_time_prekey_used(
        &self,
        address: &ProtocolAddress,
        prekey_id: PreKeyId,
    ) -> Result<(), DirectoryError> {
        if let Some(mut entry) = self.devices.get_mut(address) {
            entry.data.prekeys.retain(|p| p.id != prekey_id);
        }
        Ok(())
    }

    async fn fetch_group_members(&self, group_id: &str) -> Result<Vec<UserId>, DirectoryError> {
        self.groups
            .read()
            .await
            .get(group_id)
            .map(|members| members.iter().cloned().collect())
            .ok_or(DirectoryError::NotFound)
    }

    async fn fetch_device_ids(&self, user_id: &str) -> Result<Vec<DeviceId>, DirectoryError> {
        let mut ids: Vec<DeviceId> = self
            .devices
            .iter()
            .filter(|entry| entry.key().user_id == user_id)
            .map(|entry| entry.key().device_id)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn available_prekey_count(&self, address: &ProtocolAddress) -> Result<usize, DirectoryError> {
        if !self.devices.contains_key(address) {
            return Err(DirectoryError::NotFound);
        }
        Ok(self.available_prekeys(address))
    }
}
