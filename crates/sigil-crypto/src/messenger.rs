//! Application-facing facade.
//!
//! [`SecureMessenger`] owns the injected key store and directory, holds the
//! per-record lock table and the cipher chosen at startup, and exposes the
//! pairwise, group, attachment, backup and diagnostic operations. Every
//! ratchet step runs under the lock of the record it advances; backup and
//! restore hold the whole store.

use std::collections::BTreeSet;
use std::io::{Read, Seek, Write};
use std::sync::Arc;

use tracing::{debug, info, warn};

use sigil_protocol::{
    decode, encode, AttachmentKeyData, BackupEnvelope, CiphertextMessageType, EncryptedMessage,
    PreKeyBundle, ProtocolAddress, SenderKeyDistributionMessage, UserId,
};

use crate::aead::{select_cipher, AeadCipher};
use crate::attachment::{self, EncryptedAttachment};
use crate::backup;
use crate::config::CryptoConfig;
use crate::directory::{DirectoryError, KeyDirectory};
use crate::error::{CryptoError, Result};
use crate::fingerprint::{safety_number, SafetyNumber};
use crate::group::{self, distribution_id, GroupKeyInfo};
use crate::keys::PublicKey;
use crate::locks::{LockTable, RecordKey};
use crate::passphrase::generate_secure_passphrase;
use crate::prekey;
use crate::session::{self, SessionInfo};
use crate::stores::{IdentityTrustRecord, KeyStore, LocalIdentity, TrustLevel};
use crate::unix_millis;

/// A per-device failure that did not stop the rest of a fan-out.
#[derive(Debug)]
pub struct DeviceFailure {
    pub address: ProtocolAddress,
    pub error: CryptoError,
}

/// Result of encrypting one payload for several devices.
#[derive(Debug, Default)]
pub struct FanOut {
    pub messages: Vec<(ProtocolAddress, EncryptedMessage)>,
    pub failures: Vec<DeviceFailure>,
}

impl FanOut {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// A group message plus any sender-key distributions that must be
/// delivered before it.
#[derive(Debug)]
pub struct GroupSend {
    /// Codec-encoded sender-key message, addressed to the whole group.
    pub ciphertext: Vec<u8>,
    /// Pairwise envelopes carrying our new sender key; empty unless the
    /// chain had not reached the group yet.
    pub distributions: FanOut,
}

#[derive(Debug)]
pub struct MembershipChange {
    pub rotated: bool,
    pub distributions: FanOut,
}

pub struct SecureMessenger<S: KeyStore, D: KeyDirectory> {
    store: Arc<S>,
    directory: Arc<D>,
    config: CryptoConfig,
    cipher: &'static dyn AeadCipher,
    locks: LockTable,
}

impl<S: KeyStore, D: KeyDirectory> SecureMessenger<S, D> {
    pub fn new(store: Arc<S>, directory: Arc<D>, config: CryptoConfig) -> Self {
        let cipher = select_cipher(config.cipher);
        debug!(suite = ?cipher.suite(), "messenger cipher selected");
        Self {
            store,
            directory,
            config,
            cipher,
            locks: LockTable::new(),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn directory(&self) -> &Arc<D> {
        &self.directory
    }

    pub fn config(&self) -> &CryptoConfig {
        &self.config
    }

    pub fn cipher(&self) -> &'static dyn AeadCipher {
        self.cipher
    }

    pub async fn local_identity(&self) -> Result<LocalIdentity> {
        self.store.local_identity().await
    }

    // ── Identity & pre-keys ─────────────────────────────────────────────

    /// First-time setup of this device, published to the directory.
    pub async fn provision(&self, user_id: &str, device_id: u32) -> Result<()> {
        let data = {
            let _shared = self.locks.shared().await;
            prekey::provision(&*self.store, user_id, device_id, &self.config).await?
        };
        self.directory.publish_prekey_bundle(user_id, data).await?;
        Ok(())
    }

    /// Publish identity, signed pre-key and every stored one-time pre-key.
    pub async fn publish_bundle(&self) -> Result<()> {
        let local = self.local_identity().await?;
        let data = prekey::full_bundle_data(&*self.store).await?;
        self.directory
            .publish_prekey_bundle(&local.user_id, data)
            .await?;
        Ok(())
    }

    pub async fn build_prekey_bundle(&self) -> Result<PreKeyBundle> {
        prekey::build_prekey_bundle(&*self.store).await
    }

    /// Top up one-time pre-keys below the low-water mark and publish the
    /// new ones. Returns how many were generated.
    pub async fn replenish_prekeys(&self) -> Result<usize> {
        let local = self.local_identity().await?;
        let published = match self.directory.available_prekey_count(&local.address()).await {
            Ok(count) => Some(count),
            Err(e) => {
                warn!("could not read published pre-key count: {e}");
                None
            }
        };
        let data = {
            let _shared = self.locks.shared().await;
            let fresh = prekey::replenish_prekeys(&*self.store, &self.config, published).await?;
            if fresh.is_empty() {
                return Ok(0);
            }
            prekey::bundle_data(&*self.store, fresh).await?
        };
        let count = data.prekeys.len();
        self.directory
            .publish_prekey_bundle(&local.user_id, data)
            .await?;
        Ok(count)
    }

    /// Rotate the signed pre-key when due (or `force`) and publish it.
    pub async fn rotate_signed_prekey(&self, force: bool) -> Result<bool> {
        let data = {
            let _shared = self.locks.shared().await;
            let Some(_) = prekey::rotate_signed_prekey(&*self.store, &self.config, force).await? else {
                return Ok(false);
            };
            prekey::bundle_data(&*self.store, Vec::new()).await?
        };
        let local = self.local_identity().await?;
        self.directory
            .publish_prekey_bundle(&local.user_id, data)
            .await?;
        Ok(true)
    }

    // ── Pairwise ────────────────────────────────────────────────────────

    pub async fn encrypt_message(
        &self,
        user_id: &str,
        device_id: u32,
        plaintext: &[u8],
    ) -> Result<EncryptedMessage> {
        let address = ProtocolAddress::new(user_id, device_id);
        let _guard = self.locks.lock(RecordKey::Session(address.clone())).await;
        session::encrypt(&*self.store, &*self.directory, self.cipher, &address, plaintext).await
    }

    pub async fn decrypt_message(
        &self,
        user_id: &str,
        device_id: u32,
        message: &EncryptedMessage,
    ) -> Result<Vec<u8>> {
        let address = ProtocolAddress::new(user_id, device_id);
        let plaintext = {
            let _guard = self.locks.lock(RecordKey::Session(address.clone())).await;
            session::decrypt(
                &*self.store,
                &*self.directory,
                self.config.max_skipped_message_keys,
                &address,
                message,
            )
            .await?
        };
        if message.message_type == CiphertextMessageType::PreKey {
            if let Err(e) = self.replenish_prekeys().await {
                warn!("pre-key replenishment failed: {e}");
            }
        }
        Ok(plaintext)
    }

    /// Encrypt independently for each device. A failing device is recorded
    /// and skipped.
    pub async fn encrypt_for_multiple_devices(&self, recipients: &[ProtocolAddress], plaintext: &[u8]) -> FanOut {
        let mut out = FanOut::default();
        for address in recipients {
            match self
                .encrypt_message(&address.user_id, address.device_id, plaintext)
                .await
            {
                Ok(message) => out.messages.push((address.clone(), message)),
                Err(error) => {
                    warn!(%address, "skipping device: {error}");
                    out.failures.push(DeviceFailure {
                        address: address.clone(),
                        error,
                    });
                }
            }
        }
        if !out.failures.is_empty() {
            info!(
                delivered = out.messages.len(),
                failed = out.failures.len(),
                "partial multi-device encryption"
            );
        }
        out
    }

    /// Every published device of `users` except this one.
    async fn devices_of<'a>(&self, users: impl IntoIterator<Item = &'a str>) -> Result<Vec<ProtocolAddress>> {
        let local = self.local_identity().await?.address();
        let mut addresses = Vec::new();
        for user in users {
            let ids = match self.directory.fetch_device_ids(user).await {
                Ok(ids) => ids,
                Err(DirectoryError::NotFound) => Vec::new(),
                Err(e) => return Err(e.into()),
            };
            addresses.extend(
                ids.into_iter()
                    .map(|id| ProtocolAddress::new(user, id))
                    .filter(|addr| *addr != local),
            );
        }
        Ok(addresses)
    }

    /// Encrypt for every device of `user_id`.
    pub async fn encrypt_for_user(&self, user_id: &str, plaintext: &[u8]) -> Result<FanOut> {
        let devices = self.devices_of([user_id]).await?;
        Ok(self.encrypt_for_multiple_devices(&devices, plaintext).await)
    }

    // ── Trust ───────────────────────────────────────────────────────────

    /// Accept `identity_key` for a device after an identity change. The
    /// stale session is dropped; the new key starts out unverified.
    pub async fn trust_identity(&self, user_id: &str, device_id: u32, identity_key: PublicKey) -> Result<()> {
        let address = ProtocolAddress::new(user_id, device_id);
        let _guard = self.locks.lock(RecordKey::Session(address.clone())).await;
        self.store
            .save_identity(
                &address,
                IdentityTrustRecord {
                    identity_key,
                    trust: TrustLevel::Unverified,
                    first_seen: unix_millis(),
                },
            )
            .await?;
        self.store.delete_session(&address).await?;
        info!(%address, identity = %identity_key.fingerprint(), "re-trusted identity key");
        Ok(())
    }

    /// Record that the safety number with this device was compared.
    pub async fn mark_identity_verified(&self, user_id: &str, device_id: u32) -> Result<()> {
        let address = ProtocolAddress::new(user_id, device_id);
        let _shared = self.locks.shared().await;
        let mut record = self
            .store
            .get_identity(&address)
            .await?
            .ok_or_else(|| CryptoError::NoSession(address.clone()))?;
        record.trust = TrustLevel::Verified;
        self.store.save_identity(&address, record).await?;
        info!(%address, "identity verified");
        Ok(())
    }

    // ── Groups ──────────────────────────────────────────────────────────

    async fn send_distribution(
        &self,
        message: &SenderKeyDistributionMessage,
        recipients: &[ProtocolAddress],
    ) -> Result<FanOut> {
        let payload = zeroize::Zeroizing::new(encode(message)?);
        let out = self.encrypt_for_multiple_devices(recipients, &payload).await;
        info!(
            group_id = %message.group_id,
            chain_id = message.chain_id,
            recipients = out.messages.len(),
            failed = out.failures.len(),
            "distributed sender key"
        );
        Ok(out)
    }

    /// Current distribution message of our chain, creating the chain if
    /// needed.
    async fn own_distribution(&self, group_id: &str) -> Result<SenderKeyDistributionMessage> {
        let local = self.local_identity().await?.address();
        let _guard = self
            .locks
            .lock(RecordKey::SenderKey(local.clone(), distribution_id(group_id)))
            .await;
        let (record, _) = group::ensure_sender_key(&*self.store, &local, group_id).await?;
        Ok(record.distribution_message())
    }

    /// Member devices (directory roster plus `added`, minus `removed`),
    /// including our own other devices.
    async fn group_recipients(
        &self,
        group_id: &str,
        added: &[UserId],
        removed: &[UserId],
    ) -> Result<Vec<ProtocolAddress>> {
        let local = self.local_identity().await?;
        let mut members: BTreeSet<UserId> = match self.directory.fetch_group_members(group_id).await {
            Ok(members) => members.into_iter().collect(),
            Err(DirectoryError::NotFound) => BTreeSet::new(),
            Err(e) => return Err(e.into()),
        };
        members.extend(added.iter().cloned());
        members.insert(local.user_id.clone());
        for user in removed {
            members.remove(user);
        }
        self.devices_of(members.iter().map(String::as_str)).await
    }

    /// Encrypt for the group. A chain no member has received yet is
    /// distributed first; deliver those envelopes before the message. If
    /// that fails nothing is encrypted and the next call tries again.
    pub async fn encrypt_group_message(&self, group_id: &str, plaintext: &[u8]) -> Result<GroupSend> {
        let local = self.local_identity().await?.address();
        let key = RecordKey::SenderKey(local.clone(), distribution_id(group_id));
        let pending = {
            let _guard = self.locks.lock(key.clone()).await;
            let (record, _) = group::ensure_sender_key(&*self.store, &local, group_id).await?;
            record.pending_distribution().cloned()
        };

        let distributions = match pending {
            Some(distribution) => {
                let recipients = self.group_recipients(group_id, &[], &[]).await?;
                let out = self.send_distribution(&distribution, &recipients).await?;
                self.mark_distributed(group_id, &distribution).await?;
                out
            }
            None => FanOut::default(),
        };

        let _guard = self.locks.lock(key).await;
        let (message, _) = group::encrypt(&*self.store, self.cipher, &local, group_id, plaintext).await?;
        Ok(GroupSend {
            ciphertext: encode(&message)?,
            distributions,
        })
    }

    /// Decrypt a group message from any of `sender_user_id`'s devices.
    /// Fails with [`CryptoError::NoSenderKey`] until that chain's
    /// distribution has been processed.
    pub async fn decrypt_group_message(
        &self,
        group_id: &str,
        sender_user_id: &str,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>> {
        let message = group::decode_group_message(ciphertext)?;
        let sender = group::resolve_sender(&*self.store, group_id, sender_user_id, &message).await?;
        let _guard = self
            .locks
            .lock(RecordKey::SenderKey(sender.clone(), message.distribution_id))
            .await;
        group::decrypt(
            &*self.store,
            group_id,
            &sender,
            &message,
            self.config.max_skipped_message_keys,
        )
        .await
    }

    /// Send our current sender key for `group_id` to every device of one
    /// user over pairwise sessions.
    pub async fn distribute_sender_key(&self, recipient_user_id: &str, group_id: &str) -> Result<FanOut> {
        let distribution = self.own_distribution(group_id).await?;
        let recipients = self.devices_of([recipient_user_id]).await?;
        self.send_distribution(&distribution, &recipients).await
    }

    /// Receive a sender key sent with [`Self::distribute_sender_key`].
    /// Only current members of the group, per the directory roster, can
    /// hand out a chain. Returns whether a chain was installed; a chain
    /// already held is kept.
    pub async fn process_sender_key_distribution(
        &self,
        sender_user_id: &str,
        sender_device_id: u32,
        envelope: &EncryptedMessage,
    ) -> Result<bool> {
        let payload = zeroize::Zeroizing::new(
            self.decrypt_message(sender_user_id, sender_device_id, envelope)
                .await?,
        );
        let message: SenderKeyDistributionMessage = decode(&payload)?;
        let not_member = || CryptoError::NotGroupMember {
            group_id: message.group_id.clone(),
            sender: sender_user_id.to_string(),
        };
        let members = match self.directory.fetch_group_members(&message.group_id).await {
            Ok(members) => members,
            Err(DirectoryError::NotFound) => return Err(not_member()),
            Err(e) => return Err(e.into()),
        };
        if !members.iter().any(|member| member == sender_user_id) {
            warn!(
                group_id = %message.group_id,
                sender = sender_user_id,
                "rejected sender key from non-member"
            );
            return Err(not_member());
        }

        let sender = ProtocolAddress::new(sender_user_id, sender_device_id);
        let _guard = self
            .locks
            .lock(RecordKey::SenderKey(sender.clone(), message.distribution_id))
            .await;
        group::install_distribution(&*self.store, &sender, &message).await
    }

    /// Replace our chain and hand the new one to `remaining_members`.
    pub async fn rotate_sender_key(&self, group_id: &str, remaining_members: &[UserId]) -> Result<FanOut> {
        let local = self.local_identity().await?;
        let address = local.address();
        let distribution = {
            let _guard = self
                .locks
                .lock(RecordKey::SenderKey(address.clone(), distribution_id(group_id)))
                .await;
            group::rotate(&*self.store, &address, group_id)
                .await?
                .distribution_message()
        };
        let mut users: BTreeSet<&str> = remaining_members.iter().map(String::as_str).collect();
        users.insert(local.user_id.as_str());
        let recipients = self.devices_of(users).await?;
        let out = self.send_distribution(&distribution, &recipients).await?;
        self.mark_distributed(group_id, &distribution).await?;
        Ok(out)
    }

    async fn mark_distributed(&self, group_id: &str, distribution: &SenderKeyDistributionMessage) -> Result<()> {
        let local = self.local_identity().await?.address();
        let _guard = self
            .locks
            .lock(RecordKey::SenderKey(local.clone(), distribution_id(group_id)))
            .await;
        group::mark_distributed(&*self.store, &local, group_id, distribution.chain_id).await
    }

    /// Removal rotates our chain for the surviving members; pure additions
    /// only hand the current chain to the new members.
    pub async fn handle_membership_change(
        &self,
        group_id: &str,
        added: &[UserId],
        removed: &[UserId],
    ) -> Result<MembershipChange> {
        if !removed.is_empty() {
            {
                let _shared = self.locks.shared().await;
                group::forget_senders(&*self.store, group_id, removed).await?;
            }
            let recipients = self.group_recipients(group_id, added, removed).await?;
            let local = self.local_identity().await?.address();
            let distribution = {
                let _guard = self
                    .locks
                    .lock(RecordKey::SenderKey(local.clone(), distribution_id(group_id)))
                    .await;
                group::rotate(&*self.store, &local, group_id)
                    .await?
                    .distribution_message()
            };
            let distributions = self.send_distribution(&distribution, &recipients).await?;
            self.mark_distributed(group_id, &distribution).await?;
            info!(group_id, removed = removed.len(), "membership shrank; sender key rotated");
            return Ok(MembershipChange {
                rotated: true,
                distributions,
            });
        }

        if !added.is_empty() {
            let distribution = self.own_distribution(group_id).await?;
            let recipients = self.devices_of(added.iter().map(String::as_str)).await?;
            let distributions = self.send_distribution(&distribution, &recipients).await?;
            return Ok(MembershipChange {
                rotated: false,
                distributions,
            });
        }

        Ok(MembershipChange {
            rotated: false,
            distributions: FanOut::default(),
        })
    }

    // ── Attachments ─────────────────────────────────────────────────────

    pub fn encrypt_file(&self, plaintext: &[u8]) -> Result<EncryptedAttachment> {
        attachment::encrypt_file(self.cipher, self.config.attachment_chunk_size, plaintext)
    }

    pub fn decrypt_file(&self, ciphertext: &[u8], key_data: &AttachmentKeyData) -> Result<Vec<u8>> {
        attachment::decrypt_file(ciphertext, key_data)
    }

    pub fn encrypt_file_stream<R: Read, W: Write>(&self, reader: &mut R, writer: &mut W) -> Result<AttachmentKeyData> {
        attachment::encrypt_stream(self.cipher, self.config.attachment_chunk_size, reader, writer)
    }

    pub fn decrypt_file_stream<R: Read + Seek, W: Write>(
        &self,
        key_data: &AttachmentKeyData,
        reader: &mut R,
        writer: &mut W,
    ) -> Result<u64> {
        attachment::decrypt_stream(key_data, reader, writer)
    }

    // ── Backups ─────────────────────────────────────────────────────────

    pub async fn create_backup(&self, passphrase: &str) -> Result<BackupEnvelope> {
        let _exclusive = self.locks.exclusive().await;
        backup::create_backup(&*self.store, &self.config, self.cipher, passphrase).await
    }

    /// Waits for in-flight ratchet steps, then swaps in the backup's store.
    pub async fn restore_backup(&self, envelope: &BackupEnvelope, passphrase: &str) -> Result<()> {
        let _exclusive = self.locks.exclusive().await;
        backup::restore_backup(&*self.store, envelope, passphrase).await
    }

    pub fn validate_backup(&self, envelope: &BackupEnvelope) -> Result<()> {
        backup::validate_backup(envelope, &self.config)
    }

    pub fn generate_secure_passphrase(&self) -> String {
        generate_secure_passphrase(self.config.passphrase_word_count)
    }

    // ── Diagnostics ─────────────────────────────────────────────────────

    pub async fn get_session_info(&self, user_id: &str, device_id: u32) -> Result<SessionInfo> {
        session::session_info(&*self.store, &ProtocolAddress::new(user_id, device_id)).await
    }

    pub async fn get_group_key_info(&self, group_id: &str) -> Result<GroupKeyInfo> {
        let local = self.local_identity().await?.address();
        group::group_key_info(&*self.store, &local, group_id).await
    }

    /// One safety number per known device of `user_id`.
    pub async fn generate_safety_number(&self, user_id: &str) -> Result<Vec<SafetyNumber>> {
        let local = self.local_identity().await?;
        Ok(self
            .store
            .identities_for_user(user_id)
            .await?
            .into_iter()
            .map(|(address, record)| SafetyNumber {
                digits: safety_number(
                    &local.key_pair.public_key,
                    &local.user_id,
                    &record.identity_key,
                    &address.user_id,
                ),
                verified: record.trust == TrustLevel::Verified,
                address,
            })
            .collect())
    }
}
