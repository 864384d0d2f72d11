//! Sigil wire types.
//!
//! Addresses, pre-key bundles, pairwise and group message structures, the
//! attachment key token and the backup envelope, plus a versioned postcard
//! codec. No cryptography happens here.

pub mod codec;
pub mod error;
pub mod messages;
pub mod types;

pub use codec::{decode, encode, WIRE_VERSION};
pub use error::ProtocolError;
pub use messages::*;
pub use types::*;
