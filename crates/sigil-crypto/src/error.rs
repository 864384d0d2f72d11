use sigil_protocol::{ProtocolAddress, ProtocolError, UserId};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CryptoError>;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("pre-key bundle for {0} failed signature verification")]
    InvalidBundle(ProtocolAddress),

    #[error("no pre-keys registered for {0}")]
    NoPrekeysAvailable(ProtocolAddress),

    #[error("one-time pre-keys exhausted for {0}")]
    PrekeysExhausted(ProtocolAddress),

    #[error("identity key changed for {0}; explicit re-trust required")]
    IdentityKeyChanged(ProtocolAddress),

    #[error("no session with {0}")]
    NoSession(ProtocolAddress),

    #[error("no sender key for {sender} in group {group_id}")]
    NoSenderKey { group_id: String, sender: UserId },

    #[error("{sender} is not a member of group {group_id}")]
    NotGroupMember { group_id: String, sender: UserId },

    #[error("attachment digest mismatch")]
    Integrity,

    #[error("attachment size mismatch: expected {expected} bytes, got {got}")]
    SizeMismatch { expected: u64, got: u64 },

    #[error("passphrase does not meet the minimum policy: {0}")]
    WeakPassphrase(&'static str),

    #[error("wrong passphrase or corrupted data")]
    Authentication,

    #[error("invalid message: {0}")]
    InvalidMessage(&'static str),

    #[error("duplicate message (counter {counter})")]
    DuplicateMessage { counter: u32 },

    #[error("unknown or already used one-time pre-key {0}")]
    InvalidPreKeyId(u32),

    #[error("unknown signed pre-key {0}")]
    InvalidSignedPreKeyId(u32),

    #[error("key store is not provisioned with a local identity")]
    NotProvisioned,

    #[error("invalid backup: {0}")]
    InvalidBackup(&'static str),

    #[error("key directory unavailable: {0}")]
    Directory(String),

    #[error("RNG failed")]
    Rng,

    #[error("storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CryptoError {
    /// Local conditions the caller can react to (retry later, request a
    /// redistribution) as opposed to corruption or authentication failures.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CryptoError::NoPrekeysAvailable(_)
                | CryptoError::PrekeysExhausted(_)
                | CryptoError::NoSenderKey { .. }
                | CryptoError::Directory(_)
        )
    }
}
