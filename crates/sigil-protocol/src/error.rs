use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("message too short: expected at least {expected} bytes, got {got}")]
    MessageTooShort { expected: usize, got: usize },

    #[error("unknown ciphertext message type: 0x{0:02x}")]
    UnknownMessageType(u8),

    #[error("unsupported wire version: {0}")]
    UnsupportedVersion(u8),

    #[error("message too large: {0} bytes (max {max})", max = crate::codec::MAX_ENCODED_SIZE)]
    MessageTooLarge(usize),

    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_too_short_display() {
        let e = ProtocolError::MessageTooShort { expected: 17, got: 5 };
        let msg = e.to_string();
        assert!(msg.contains("17"));
        assert!(msg.contains("5"));
    }

    #[test]
    fn unknown_message_type_display() {
        let e = ProtocolError::UnknownMessageType(0xAB);
        assert!(e.to_string().contains("0xab"));
    }

    #[test]
    fn message_too_large_display() {
        let e = ProtocolError::MessageTooLarge(100_000_000);
        let msg = e.to_string();
        assert!(msg.contains("100000000"));
        assert!(msg.contains(&crate::codec::MAX_ENCODED_SIZE.to_string()));
    }

    #[test]
    fn every_variant_is_produced_and_displayed() {
        let all = [
            ProtocolError::MessageTooShort { expected: 2, got: 1 },
            ProtocolError::UnknownMessageType(9),
            ProtocolError::UnsupportedVersion(9),
            ProtocolError::MessageTooLarge(1),
            ProtocolError::from(postcard::Error::DeserializeUnexpectedEnd),
        ];
        for e in &all {
            // Exhaustive: a new variant must be listed above.
            match e {
                ProtocolError::MessageTooShort { .. }
                | ProtocolError::UnknownMessageType(_)
                | ProtocolError::UnsupportedVersion(_)
                | ProtocolError::MessageTooLarge(_)
                | ProtocolError::Serialization(_) => assert!(!e.to_string().is_empty()),
            }
        }
    }
}
