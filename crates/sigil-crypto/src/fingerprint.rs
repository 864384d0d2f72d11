//! Safety numbers for out-of-band identity verification.
//!
//! Each party contributes 30 digits derived from its identity key and user
//! id by iterated SHA-512; the two halves are concatenated in sorted order
//! so both sides display the same 60 digits.

use std::fmt;

use serde::Serialize;
use sha2::{Digest, Sha512};

use sigil_protocol::ProtocolAddress;

use crate::keys::PublicKey;

pub const FINGERPRINT_VERSION: u16 = 0;
pub const FINGERPRINT_ITERATIONS: u32 = 5200;
pub const SAFETY_NUMBER_DIGITS: usize = 60;

/// 30-digit half contributed by one party.
pub fn displayable_fingerprint(identity_key: &PublicKey, stable_id: &str) -> String {
    let mut hash = {
        let mut hasher = Sha512::new();
        hasher.update(FINGERPRINT_VERSION.to_be_bytes());
        hasher.update(identity_key.as_bytes());
        hasher.update(stable_id.as_bytes());
        hasher.finalize()
    };
    for _ in 1..FINGERPRINT_ITERATIONS {
        let mut hasher = Sha512::new();
        hasher.update(hash);
        hasher.update(identity_key.as_bytes());
        hash = hasher.finalize();
    }

    let mut digits = String::with_capacity(30);
    for chunk in hash[..30].chunks(5) {
        let value = chunk.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
        digits.push_str(&format!("{:05}", value % 100_000));
    }
    digits
}

/// Both halves, concatenated so the result is the same from either side.
pub fn safety_number(
    local_key: &PublicKey,
    local_id: &str,
    remote_key: &PublicKey,
    remote_id: &str,
) -> String {
    let local = displayable_fingerprint(local_key, local_id);
    let remote = displayable_fingerprint(remote_key, remote_id);
    if local <= remote {
        local + &remote
    } else {
        remote + &local
    }
}

/// Safety number with one remote device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SafetyNumber {
    pub address: ProtocolAddress,
    pub digits: String,
    pub verified: bool,
}

impl fmt::Display for SafetyNumber {
    /// Groups of five digits, three rows of four groups.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let groups: Vec<&str> = self
            .digits
            .as_bytes()
            .chunks(5)
            .filter_map(|c| std::str::from_utf8(c).ok())
            .collect();
        for (i, row) in groups.chunks(4).enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", row.join(" "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyPair;

    #[test]
    fn symmetric_between_parties() {
        let alice = KeyPair::generate().unwrap().public_key;
        let bob = KeyPair::generate().unwrap().public_key;
        let from_alice = safety_number(&alice, "alice", &bob, "bob");
        let from_bob = safety_number(&bob, "bob", &alice, "alice");
        assert_eq!(from_alice, from_bob);
        assert_eq!(from_alice.len(), SAFETY_NUMBER_DIGITS);
        assert!(from_alice.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn changes_with_identity_key() {
        let alice = KeyPair::generate().unwrap().public_key;
        let bob = KeyPair::generate().unwrap().public_key;
        let mallory = KeyPair::generate().unwrap().public_key;
        assert_ne!(
            safety_number(&alice, "alice", &bob, "bob"),
            safety_number(&alice, "alice", &mallory, "bob")
        );
    }

    #[test]
    fn deterministic_half() {
        let key = PublicKey::from_bytes([7u8; 32]);
        let a = displayable_fingerprint(&key, "carol");
        assert_eq!(a, displayable_fingerprint(&key, "carol"));
        assert_ne!(a, displayable_fingerprint(&key, "dave"));
        assert_eq!(a.len(), 30);
    }

    #[test]
    fn display_groups_digits() {
        let number = SafetyNumber {
            address: ProtocolAddress::new("bob", 1),
            digits: "0".repeat(60),
            verified: false,
        };
        let shown = number.to_string();
        assert_eq!(shown.lines().count(), 3);
        assert_eq!(shown.lines().next().unwrap(), "00000 00000 00000 00000");
    }
}
