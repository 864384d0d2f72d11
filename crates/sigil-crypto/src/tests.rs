//! End-to-end scenarios across several devices sharing one directory.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use sigil_protocol::{
    decode, encode, CiphertextMessageType, DeviceId, PreKeyBundle, PreKeyBundleData, PreKeyId,
    ProtocolAddress, SenderKeyMessage, UserId,
};

use crate::directory::{DirectoryError, InMemoryDirectory, KeyDirectory};
use crate::error::CryptoError;
use crate::keys::PublicKey;
use crate::stores::{InMemoryKeyStore, KeyStore, PreKeyStore};
use crate::{parse_key_token, serialize_key_token, CryptoConfig, SecureMessenger};

type Messenger = SecureMessenger<InMemoryKeyStore, InMemoryDirectory>;

const PASS: &str = "lantern-quartz-meadow-falcon";

fn config() -> CryptoConfig {
    CryptoConfig {
        prekey_batch_size: 3,
        prekey_low_water_mark: 2,
        backup_kdf_iterations: 10,
        attachment_chunk_size: 64,
        ..CryptoConfig::default()
    }
}

async fn device(dir: &Arc<InMemoryDirectory>, user: &str, device_id: u32) -> Messenger {
    let messenger = SecureMessenger::new(Arc::new(InMemoryKeyStore::new()), dir.clone(), config());
    messenger.provision(user, device_id).await.unwrap();
    messenger
}

#[tokio::test]
async fn first_message_establishes_both_sides() {
    let dir = Arc::new(InMemoryDirectory::new());
    let alice = device(&dir, "alice", 1).await;
    let bob = device(&dir, "bob", 1).await;

    let message = alice.encrypt_message("bob", 1, b"hi").await.unwrap();
    assert_eq!(message.message_type, CiphertextMessageType::PreKey);
    assert_eq!(bob.decrypt_message("alice", 1, &message).await.unwrap(), b"hi");

    assert!(alice.get_session_info("bob", 1).await.unwrap().established);
    assert!(bob.get_session_info("alice", 1).await.unwrap().established);
    assert!(!bob.get_session_info("carol", 1).await.unwrap().established);
}

#[tokio::test]
async fn long_conversation_round_trips() {
    let dir = Arc::new(InMemoryDirectory::new());
    let alice = device(&dir, "alice", 1).await;
    let bob = device(&dir, "bob", 1).await;

    // Bob cannot open a session to Alice before hearing from her.
    let open = alice.encrypt_message("bob", 1, b"open").await.unwrap();
    bob.decrypt_message("alice", 1, &open).await.unwrap();

    for i in 0..20usize {
        let text = vec![i as u8; i * 13];
        if i % 3 == 0 {
            let m = bob.encrypt_message("alice", 1, &text).await.unwrap();
            assert_eq!(alice.decrypt_message("bob", 1, &m).await.unwrap(), text);
        } else {
            let m = alice.encrypt_message("bob", 1, &text).await.unwrap();
            assert_eq!(bob.decrypt_message("alice", 1, &m).await.unwrap(), text);
        }
    }
}

#[tokio::test]
async fn old_message_keys_are_gone_after_later_exchanges() {
    let dir = Arc::new(InMemoryDirectory::new());
    let alice = device(&dir, "alice", 1).await;
    let bob = device(&dir, "bob", 1).await;

    let first = alice.encrypt_message("bob", 1, b"secret 0").await.unwrap();
    bob.decrypt_message("alice", 1, &first).await.unwrap();
    let mut early = None;
    for i in 0..5u8 {
        let reply = bob.encrypt_message("alice", 1, &[i]).await.unwrap();
        alice.decrypt_message("bob", 1, &reply).await.unwrap();
        let m = alice.encrypt_message("bob", 1, &[i]).await.unwrap();
        if i == 1 {
            early = Some(m.clone());
        }
        bob.decrypt_message("alice", 1, &m).await.unwrap();
    }

    // A copy of Bob's current state cannot reopen the early message.
    let copy = InMemoryKeyStore::from_snapshot(bob.store().snapshot().await.unwrap());
    let copy = SecureMessenger::new(Arc::new(copy), dir.clone(), config());
    assert!(copy
        .decrypt_message("alice", 1, &early.unwrap())
        .await
        .is_err());
}

#[tokio::test]
async fn one_time_prekey_cannot_be_used_twice() {
    let dir = Arc::new(InMemoryDirectory::new());
    let alice = device(&dir, "alice", 1).await;
    let bob = device(&dir, "bob", 1).await;

    // Capture Bob's bundle (with pre-key 1) before anyone uses it.
    let bundle = bob.build_prekey_bundle().await.unwrap();
    let used_id = bundle.one_time_prekey.as_ref().unwrap().id;

    let m = alice.encrypt_message("bob", 1, b"first").await.unwrap();
    bob.decrypt_message("alice", 1, &m).await.unwrap();
    assert!(bob.store().load_prekey(used_id).await.unwrap().is_none());

    // Dave gets the stale bundle from a different source.
    let stale = Arc::new(InMemoryDirectory::new());
    stale
        .publish_prekey_bundle(
            "bob",
            sigil_protocol::PreKeyBundleData {
                registration_id: bundle.registration_id,
                device_id: bundle.device_id,
                identity_key: bundle.identity_key,
                signed_prekey_id: bundle.signed_prekey_id,
                signed_prekey: bundle.signed_prekey,
                signed_prekey_signature: bundle.signed_prekey_signature.clone(),
                prekeys: bundle.one_time_prekey.clone().into_iter().collect(),
            },
        )
        .await
        .unwrap();
    let dave = device(&stale, "dave", 1).await;
    let replay = dave.encrypt_message("bob", 1, b"second").await.unwrap();

    assert!(matches!(
        bob.decrypt_message("dave", 1, &replay).await,
        Err(CryptoError::InvalidPreKeyId(id)) if id == used_id
    ));
}

#[tokio::test]
async fn directory_never_serves_a_prekey_twice() {
    let dir = Arc::new(InMemoryDirectory::new());
    let _bob = device(&dir, "bob", 1).await;
    let addr = ProtocolAddress::new("bob", 1);
    let mut seen = Vec::new();
    for _ in 0..3 {
        let bundle = dir.fetch_prekey_bundle(&addr).await.unwrap();
        let id = bundle.one_time_prekey.unwrap().id;
        assert!(!seen.contains(&id));
        seen.push(id);
    }
    assert!(dir
        .fetch_prekey_bundle(&addr)
        .await
        .unwrap()
        .one_time_prekey
        .is_none());
}

#[tokio::test]
async fn consumed_prekeys_are_replenished() {
    let dir = Arc::new(InMemoryDirectory::new());
    let bob = device(&dir, "bob", 1).await;
    let alice = device(&dir, "alice", 1).await;
    let carol = device(&dir, "carol", 1).await;

    let m = alice.encrypt_message("bob", 1, b"a").await.unwrap();
    bob.decrypt_message("alice", 1, &m).await.unwrap();
    assert_eq!(bob.store().prekey_ids().await.unwrap().len(), 2);

    let m = carol.encrypt_message("bob", 1, b"c").await.unwrap();
    bob.decrypt_message("carol", 1, &m).await.unwrap();
    // One left, below the mark: a batch of three was added and published.
    assert_eq!(bob.store().prekey_ids().await.unwrap().len(), 4);
    assert_eq!(dir.available_prekeys(&ProtocolAddress::new("bob", 1)), 4);
}

#[tokio::test]
async fn exhausted_directory_pool_is_refilled_before_local_keys_run_out() {
    let dir = Arc::new(InMemoryDirectory::strict());
    let bob = device(&dir, "bob", 1).await;
    let bob_addr = ProtocolAddress::new("bob", 1);

    // Three first contacts drain the published pool; Bob is offline.
    for user in ["alice", "carol", "dave"] {
        let sender = device(&dir, user, 1).await;
        sender.encrypt_message("bob", 1, b"hi").await.unwrap();
    }
    assert_eq!(dir.available_prekeys(&bob_addr), 0);
    assert_eq!(bob.store().prekey_ids().await.unwrap().len(), 3);

    let erin = device(&dir, "erin", 1).await;
    let err = erin.encrypt_message("bob", 1, b"late").await.unwrap_err();
    assert!(matches!(err, CryptoError::PrekeysExhausted(_)));
    assert!(err.is_recoverable());

    // Every local key is still unused, yet the directory has none left.
    assert_eq!(bob.replenish_prekeys().await.unwrap(), 3);
    assert_eq!(dir.available_prekeys(&bob_addr), 3);

    let message = erin.encrypt_message("bob", 1, b"late").await.unwrap();
    assert_eq!(bob.decrypt_message("erin", 1, &message).await.unwrap(), b"late");
}

#[tokio::test]
async fn whisper_without_session_is_surfaced() {
    let dir = Arc::new(InMemoryDirectory::new());
    let alice = device(&dir, "alice", 1).await;
    let bob = device(&dir, "bob", 1).await;
    let carol = device(&dir, "carol", 1).await;

    let m = alice.encrypt_message("bob", 1, b"hi").await.unwrap();
    bob.decrypt_message("alice", 1, &m).await.unwrap();
    let reply = bob.encrypt_message("alice", 1, b"yo").await.unwrap();
    assert_eq!(reply.message_type, CiphertextMessageType::Whisper);

    // Delivered to the wrong device: Carol never had a session with Bob.
    assert!(matches!(
        carol.decrypt_message("bob", 1, &reply).await,
        Err(CryptoError::NoSession(_))
    ));
}

#[tokio::test]
async fn multi_device_fan_out_skips_failures() {
    let dir = Arc::new(InMemoryDirectory::new());
    let alice = device(&dir, "alice", 1).await;
    let bob1 = device(&dir, "bob", 1).await;
    let bob2 = device(&dir, "bob", 2).await;

    let recipients = [
        ProtocolAddress::new("bob", 1),
        ProtocolAddress::new("ghost", 1),
        ProtocolAddress::new("bob", 2),
    ];
    let out = alice.encrypt_for_multiple_devices(&recipients, b"to all").await;
    assert_eq!(out.messages.len(), 2);
    assert_eq!(out.failures.len(), 1);
    assert!(matches!(
        out.failures[0].error,
        CryptoError::NoPrekeysAvailable(_)
    ));
    assert!(out.failures[0].error.is_recoverable());

    for (address, message) in &out.messages {
        let target = if address.device_id == 1 { &bob1 } else { &bob2 };
        assert_eq!(target.decrypt_message("alice", 1, message).await.unwrap(), b"to all");
    }

    let per_user = alice.encrypt_for_user("bob", b"again").await.unwrap();
    assert!(per_user.is_complete());
    assert_eq!(per_user.messages.len(), 2);
}

#[tokio::test]
async fn concurrent_sends_on_one_session_stay_ordered() {
    let dir = Arc::new(InMemoryDirectory::new());
    let alice = device(&dir, "alice", 1).await;
    let bob = device(&dir, "bob", 1).await;

    let (a, b, c, d) = tokio::join!(
        alice.encrypt_message("bob", 1, b"a"),
        alice.encrypt_message("bob", 1, b"b"),
        alice.encrypt_message("bob", 1, b"c"),
        alice.encrypt_message("bob", 1, b"d"),
    );
    let mut received = Vec::new();
    for m in [d, b, a, c] {
        received.push(bob.decrypt_message("alice", 1, &m.unwrap()).await.unwrap());
    }
    received.sort();
    assert_eq!(received, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);
}

#[tokio::test]
async fn identity_change_needs_explicit_trust() {
    let dir = Arc::new(InMemoryDirectory::new());
    let alice = device(&dir, "alice", 1).await;
    let bob = device(&dir, "bob", 1).await;
    let m = alice.encrypt_message("bob", 1, b"hi").await.unwrap();
    bob.decrypt_message("alice", 1, &m).await.unwrap();

    // Bob reinstalls: new identity on the same address.
    let bob_again = device(&dir, "bob", 1).await;
    let hello = bob_again.encrypt_message("alice", 1, b"it's me").await.unwrap();
    assert!(matches!(
        alice.decrypt_message("bob", 1, &hello).await,
        Err(CryptoError::IdentityKeyChanged(_))
    ));
    // The old key is still the one on record.
    let numbers = alice.generate_safety_number("bob").await.unwrap();
    assert_eq!(numbers.len(), 1);

    let new_key = bob_again.local_identity().await.unwrap().key_pair.public_key;
    alice.trust_identity("bob", 1, new_key).await.unwrap();
    assert_eq!(
        alice.decrypt_message("bob", 1, &hello).await.unwrap(),
        b"it's me"
    );
    let after = alice.generate_safety_number("bob").await.unwrap();
    assert_ne!(numbers[0].digits, after[0].digits);
}

#[tokio::test]
async fn safety_numbers_match_and_verify() {
    let dir = Arc::new(InMemoryDirectory::new());
    let alice = device(&dir, "alice", 1).await;
    let bob = device(&dir, "bob", 1).await;
    let m = alice.encrypt_message("bob", 1, b"hi").await.unwrap();
    bob.decrypt_message("alice", 1, &m).await.unwrap();

    let from_alice = alice.generate_safety_number("bob").await.unwrap();
    let from_bob = bob.generate_safety_number("alice").await.unwrap();
    assert_eq!(from_alice[0].digits, from_bob[0].digits);
    assert!(!from_alice[0].verified);

    alice.mark_identity_verified("bob", 1).await.unwrap();
    assert!(alice.generate_safety_number("bob").await.unwrap()[0].verified);
    assert!(alice.generate_safety_number("nobody").await.unwrap().is_empty());
}

struct Group {
    alice: Messenger,
    bob: Messenger,
    carol: Messenger,
    dir: Arc<InMemoryDirectory>,
}

async fn deliver(from: &str, envelopes: &crate::FanOut, members: &[(&str, &Messenger)]) {
    for (address, envelope) in &envelopes.messages {
        let (_, target) = members
            .iter()
            .find(|(name, _)| *name == address.user_id)
            .unwrap();
        target
            .process_sender_key_distribution(from, 1, envelope)
            .await
            .unwrap();
    }
}

async fn group() -> Group {
    let dir = Arc::new(InMemoryDirectory::new());
    let alice = device(&dir, "alice", 1).await;
    let bob = device(&dir, "bob", 1).await;
    let carol = device(&dir, "carol", 1).await;
    dir.set_group_members("g", ["alice", "bob", "carol"].map(String::from))
        .await;
    Group {
        alice,
        bob,
        carol,
        dir,
    }
}

#[tokio::test]
async fn removed_member_cannot_read_after_rotation() {
    let g = group().await;

    let hello = g.alice.encrypt_group_message("g", b"hello").await.unwrap();
    assert_eq!(hello.distributions.messages.len(), 2);
    deliver(
        "alice",
        &hello.distributions,
        &[("bob", &g.bob), ("carol", &g.carol)],
    )
    .await;
    assert_eq!(
        g.bob.decrypt_group_message("g", "alice", &hello.ciphertext).await.unwrap(),
        b"hello"
    );
    assert_eq!(
        g.carol.decrypt_group_message("g", "alice", &hello.ciphertext).await.unwrap(),
        b"hello"
    );

    g.dir.remove_group_member("g", "bob").await;
    let change = g
        .alice
        .handle_membership_change("g", &[], &["bob".to_string()])
        .await
        .unwrap();
    assert!(change.rotated);
    assert!(change
        .distributions
        .messages
        .iter()
        .all(|(address, _)| address.user_id == "carol"));
    deliver("alice", &change.distributions, &[("carol", &g.carol)]).await;

    let world = g.alice.encrypt_group_message("g", b"world").await.unwrap();
    assert!(world.distributions.messages.is_empty());
    assert_eq!(
        g.carol.decrypt_group_message("g", "alice", &world.ciphertext).await.unwrap(),
        b"world"
    );
    assert!(matches!(
        g.bob.decrypt_group_message("g", "alice", &world.ciphertext).await,
        Err(CryptoError::NoSenderKey { .. })
    ));
}

#[tokio::test]
async fn new_member_reads_only_future_traffic() {
    let g = group().await;
    let first = g.alice.encrypt_group_message("g", b"before").await.unwrap();
    deliver(
        "alice",
        &first.distributions,
        &[("bob", &g.bob), ("carol", &g.carol)],
    )
    .await;

    let dave = device(&g.dir, "dave", 1).await;
    let change = g
        .alice
        .handle_membership_change("g", &["dave".to_string()], &[])
        .await
        .unwrap();
    assert!(!change.rotated);
    assert_eq!(change.distributions.messages.len(), 1);
    deliver("alice", &change.distributions, &[("dave", &dave)]).await;

    let after = g.alice.encrypt_group_message("g", b"after").await.unwrap();
    assert_eq!(
        dave.decrypt_group_message("g", "alice", &after.ciphertext).await.unwrap(),
        b"after"
    );
    assert!(dave
        .decrypt_group_message("g", "alice", &first.ciphertext)
        .await
        .is_err());
    // Existing members keep their chain.
    assert_eq!(
        g.bob.decrypt_group_message("g", "alice", &after.ciphertext).await.unwrap(),
        b"after"
    );
}

#[tokio::test]
async fn group_message_before_distribution_is_recoverable() {
    let g = group().await;
    let sent = g.alice.encrypt_group_message("g", b"early").await.unwrap();
    let err = g
        .bob
        .decrypt_group_message("g", "alice", &sent.ciphertext)
        .await
        .unwrap_err();
    assert!(matches!(err, CryptoError::NoSenderKey { .. }));
    assert!(err.is_recoverable());

    // Explicit redistribution fixes it.
    let redistributed = g.alice.distribute_sender_key("bob", "g").await.unwrap();
    deliver("alice", &redistributed, &[("bob", &g.bob)]).await;
    let next = g.alice.encrypt_group_message("g", b"later").await.unwrap();
    assert_eq!(
        g.bob.decrypt_group_message("g", "alice", &next.ciphertext).await.unwrap(),
        b"later"
    );

    let info = g.bob.get_group_key_info("g").await.unwrap();
    assert!(info.own_chain.is_none());
    assert_eq!(info.senders.len(), 1);
}

/// Shares an in-memory directory but drops the next roster lookup.
struct FlakyDirectory {
    inner: Arc<InMemoryDirectory>,
    drop_roster: AtomicBool,
}

#[async_trait]
impl KeyDirectory for FlakyDirectory {
    async fn fetch_prekey_bundle(&self, address: &ProtocolAddress) -> Result<PreKeyBundle, DirectoryError> {
        self.inner.fetch_prekey_bundle(address).await
    }

    async fn publish_prekey_bundle(&self, user_id: &str, bundle: PreKeyBundleData) -> Result<(), DirectoryError> {
        self.inner.publish_prekey_bundle(user_id, bundle).await
    }

    async fn mark_one_time_prekey_used(
        &self,
        address: &ProtocolAddress,
        prekey_id: PreKeyId,
    ) -> Result<(), DirectoryError> {
        self.inner.mark_one_time_prekey_used(address, prekey_id).await
    }

    async fn fetch_group_members(&self, group_id: &str) -> Result<Vec<UserId>, DirectoryError> {
        if self.drop_roster.swap(false, Ordering::SeqCst) {
            return Err(DirectoryError::Unavailable("roster request timed out".into()));
        }
        self.inner.fetch_group_members(group_id).await
    }

    async fn fetch_device_ids(&self, user_id: &str) -> Result<Vec<DeviceId>, DirectoryError> {
        self.inner.fetch_device_ids(user_id).await
    }

    async fn available_prekey_count(&self, address: &ProtocolAddress) -> Result<usize, DirectoryError> {
        self.inner.available_prekey_count(address).await
    }
}

#[tokio::test]
async fn failed_first_distribution_is_retried_on_next_send() {
    let dir = Arc::new(InMemoryDirectory::new());
    let flaky = Arc::new(FlakyDirectory {
        inner: dir.clone(),
        drop_roster: AtomicBool::new(true),
    });
    let alice = SecureMessenger::new(Arc::new(InMemoryKeyStore::new()), flaky, config());
    alice.provision("alice", 1).await.unwrap();
    let bob = device(&dir, "bob", 1).await;
    let carol = device(&dir, "carol", 1).await;
    dir.set_group_members("g", ["alice", "bob", "carol"].map(String::from))
        .await;

    let err = alice.encrypt_group_message("g", b"lost").await.unwrap_err();
    assert!(matches!(err, CryptoError::Directory(_)));
    assert!(err.is_recoverable());

    let sent = alice.encrypt_group_message("g", b"hello").await.unwrap();
    assert_eq!(sent.distributions.messages.len(), 2);
    deliver("alice", &sent.distributions, &[("bob", &bob), ("carol", &carol)]).await;
    assert_eq!(
        bob.decrypt_group_message("g", "alice", &sent.ciphertext).await.unwrap(),
        b"hello"
    );
    assert_eq!(
        carol.decrypt_group_message("g", "alice", &sent.ciphertext).await.unwrap(),
        b"hello"
    );

    let next = alice.encrypt_group_message("g", b"again").await.unwrap();
    assert!(next.distributions.messages.is_empty());
}

#[tokio::test]
async fn sender_key_from_non_member_is_refused() {
    let g = group().await;
    let mallory = device(&g.dir, "mallory", 1).await;

    let offered = mallory.distribute_sender_key("bob", "g").await.unwrap();
    assert_eq!(offered.messages.len(), 1);
    let err = g
        .bob
        .process_sender_key_distribution("mallory", 1, &offered.messages[0].1)
        .await
        .unwrap_err();
    assert!(matches!(err, CryptoError::NotGroupMember { .. }));
    assert!(g.bob.get_group_key_info("g").await.unwrap().senders.is_empty());

    let unknown = mallory.distribute_sender_key("bob", "elsewhere").await.unwrap();
    assert!(matches!(
        g.bob
            .process_sender_key_distribution("mallory", 1, &unknown.messages[0].1)
            .await,
        Err(CryptoError::NotGroupMember { .. })
    ));
}

#[tokio::test]
async fn redistributed_chain_does_not_reopen_read_messages() {
    let g = group().await;
    let hello = g.alice.encrypt_group_message("g", b"hello").await.unwrap();
    deliver("alice", &hello.distributions, &[("bob", &g.bob), ("carol", &g.carol)]).await;
    g.bob
        .decrypt_group_message("g", "alice", &hello.ciphertext)
        .await
        .unwrap();

    let again = g.alice.distribute_sender_key("bob", "g").await.unwrap();
    assert!(!g
        .bob
        .process_sender_key_distribution("alice", 1, &again.messages[0].1)
        .await
        .unwrap());
    assert!(matches!(
        g.bob.decrypt_group_message("g", "alice", &hello.ciphertext).await,
        Err(CryptoError::DuplicateMessage { counter: 0 })
    ));
}

#[tokio::test]
async fn simultaneous_join_and_leave_rotates_for_the_new_roster() {
    let g = group().await;
    let hello = g.alice.encrypt_group_message("g", b"hello").await.unwrap();
    deliver("alice", &hello.distributions, &[("bob", &g.bob), ("carol", &g.carol)]).await;

    let dave = device(&g.dir, "dave", 1).await;
    g.dir
        .set_group_members("g", ["alice", "carol", "dave"].map(String::from))
        .await;
    let change = g
        .alice
        .handle_membership_change("g", &["dave".to_string()], &["bob".to_string()])
        .await
        .unwrap();
    assert!(change.rotated);
    let mut recipients: Vec<&str> = change
        .distributions
        .messages
        .iter()
        .map(|(address, _)| address.user_id.as_str())
        .collect();
    recipients.sort_unstable();
    assert_eq!(recipients, ["carol", "dave"]);
    deliver("alice", &change.distributions, &[("carol", &g.carol), ("dave", &dave)]).await;

    let next = g.alice.encrypt_group_message("g", b"next").await.unwrap();
    assert!(next.distributions.messages.is_empty());
    assert_eq!(
        g.carol.decrypt_group_message("g", "alice", &next.ciphertext).await.unwrap(),
        b"next"
    );
    assert_eq!(
        dave.decrypt_group_message("g", "alice", &next.ciphertext).await.unwrap(),
        b"next"
    );
    assert!(matches!(
        g.bob.decrypt_group_message("g", "alice", &next.ciphertext).await,
        Err(CryptoError::NoSenderKey { .. })
    ));
    assert!(dave
        .decrypt_group_message("g", "alice", &hello.ciphertext)
        .await
        .is_err());
}

#[tokio::test]
async fn altered_group_message_fails_signature_check() {
    let g = group().await;
    let hello = g.alice.encrypt_group_message("g", b"hello").await.unwrap();
    deliver("alice", &hello.distributions, &[("bob", &g.bob), ("carol", &g.carol)]).await;

    let sent = g.alice.encrypt_group_message("g", b"pay 10").await.unwrap();
    let mut altered: SenderKeyMessage = decode(&sent.ciphertext).unwrap();
    altered.ciphertext[0] ^= 1;
    let altered = encode(&altered).unwrap();

    assert!(matches!(
        g.carol.decrypt_group_message("g", "alice", &altered).await,
        Err(CryptoError::InvalidMessage("bad sender key signature"))
    ));
    // The rejected copy did not advance Carol's chain.
    assert_eq!(
        g.carol.decrypt_group_message("g", "alice", &sent.ciphertext).await.unwrap(),
        b"pay 10"
    );
}

#[tokio::test]
async fn attachment_key_travels_inside_a_message() {
    let dir = Arc::new(InMemoryDirectory::new());
    let alice = device(&dir, "alice", 1).await;
    let bob = device(&dir, "bob", 1).await;

    let file: Vec<u8> = (0..1000u32).map(|i| (i % 256) as u8).collect();
    let encrypted = alice.encrypt_file(&file).unwrap();
    let token = serialize_key_token(&encrypted.key_data).unwrap();
    let m = alice.encrypt_message("bob", 1, token.as_bytes()).await.unwrap();

    let received = bob.decrypt_message("alice", 1, &m).await.unwrap();
    let key_data = parse_key_token(std::str::from_utf8(&received).unwrap()).unwrap();
    assert_eq!(bob.decrypt_file(&encrypted.ciphertext, &key_data).unwrap(), file);

    let mut tampered = encrypted.ciphertext.clone();
    tampered[500] ^= 0x40;
    assert!(matches!(
        bob.decrypt_file(&tampered, &key_data),
        Err(CryptoError::Integrity)
    ));
}

#[tokio::test]
async fn restored_backup_keeps_sessions_working() {
    let dir = Arc::new(InMemoryDirectory::new());
    let alice = device(&dir, "alice", 1).await;
    let bob = device(&dir, "bob", 1).await;
    let m = alice.encrypt_message("bob", 1, b"hi").await.unwrap();
    bob.decrypt_message("alice", 1, &m).await.unwrap();
    let r = bob.encrypt_message("alice", 1, b"hey").await.unwrap();
    alice.decrypt_message("bob", 1, &r).await.unwrap();

    let envelope = alice.create_backup(PASS).await.unwrap();
    alice.validate_backup(&envelope).unwrap();

    let restored = SecureMessenger::new(Arc::new(InMemoryKeyStore::new()), dir.clone(), config());
    restored.restore_backup(&envelope, PASS).await.unwrap();
    assert_eq!(
        restored.local_identity().await.unwrap().key_pair.public_key,
        alice.local_identity().await.unwrap().key_pair.public_key
    );

    let from_bob = bob.encrypt_message("alice", 1, b"still there?").await.unwrap();
    assert_eq!(
        restored.decrypt_message("bob", 1, &from_bob).await.unwrap(),
        b"still there?"
    );
    let to_bob = restored.encrypt_message("bob", 1, b"yes").await.unwrap();
    assert_eq!(bob.decrypt_message("alice", 1, &to_bob).await.unwrap(), b"yes");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restore_waits_for_in_flight_ratchet_steps() {
    let dir = Arc::new(InMemoryDirectory::new());
    let alice = Arc::new(device(&dir, "alice", 1).await);
    let bob = device(&dir, "bob", 1).await;
    let m = alice.encrypt_message("bob", 1, b"hi").await.unwrap();
    bob.decrypt_message("alice", 1, &m).await.unwrap();
    let r = bob.encrypt_message("alice", 1, b"hey").await.unwrap();
    alice.decrypt_message("bob", 1, &r).await.unwrap();

    let envelope = alice.create_backup(PASS).await.unwrap();
    let at_backup = alice.get_session_info("bob", 1).await.unwrap().sending_index;

    for _ in 0..5 {
        // Move well past the backup so a lost restore would show.
        for _ in 0..10 {
            alice.encrypt_message("bob", 1, b"ahead").await.unwrap();
        }
        let sender = {
            let alice = alice.clone();
            tokio::spawn(async move {
                for _ in 0..4 {
                    alice.encrypt_message("bob", 1, b"racing").await.unwrap();
                }
            })
        };
        alice.restore_backup(&envelope, PASS).await.unwrap();
        sender.await.unwrap();

        // Restore lands between whole steps, never inside one.
        let index = alice.get_session_info("bob", 1).await.unwrap().sending_index;
        assert!(index >= at_backup && index <= at_backup + 4, "index {index}");
    }
}

#[tokio::test]
async fn wrong_passphrase_never_partially_restores() {
    let dir = Arc::new(InMemoryDirectory::new());
    let alice = device(&dir, "alice", 1).await;
    let envelope = alice.create_backup(PASS).await.unwrap();

    let other = device(&dir, "other", 1).await;
    let before = other.store().snapshot().await.unwrap();
    assert!(matches!(
        other.restore_backup(&envelope, "lantern-quartz-meadow-falcoN").await,
        Err(CryptoError::Authentication)
    ));
    let after = other.store().snapshot().await.unwrap();
    assert_eq!(
        before.local.unwrap().key_pair.public_key,
        after.local.unwrap().key_pair.public_key
    );
    assert_eq!(before.prekeys.len(), after.prekeys.len());
}

#[tokio::test]
async fn generated_passphrase_is_accepted_for_backups() {
    let dir = Arc::new(InMemoryDirectory::new());
    let alice = device(&dir, "alice", 1).await;
    let passphrase = alice.generate_secure_passphrase();
    let envelope = alice.create_backup(&passphrase).await.unwrap();
    let fresh = SecureMessenger::new(Arc::new(InMemoryKeyStore::new()), dir.clone(), config());
    fresh.restore_backup(&envelope, &passphrase).await.unwrap();
    let _: PublicKey = fresh.local_identity().await.unwrap().key_pair.public_key;
}
