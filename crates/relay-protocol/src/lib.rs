// relay-protocol: Nostr domain types shared by the relay server.
//
// Pure data and crypto: events with their canonical serialization and
// BIP-340 verification, subscription filters with the in-memory matching
// predicate, NIP-26 delegation tokens, and the NIP-11 relay information
// document. No I/O lives here.

pub mod delegation;
pub mod event;
pub mod filter;
pub mod info;

pub use delegation::DelegationToken;
pub use event::Event;
pub use filter::Filter;
pub use info::{Limitation, RelayInformationDocument};

/// Errors produced while validating protocol data.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("field {0} is not well-formed lowercase hex of the expected length")]
    MalformedHex(&'static str),
    #[error("event id does not match the canonical serialization hash")]
    IdMismatch,
    #[error("invalid public key")]
    InvalidKey,
    #[error("signature verification failed")]
    BadSignature,
    #[error("malformed delegation tag")]
    MalformedDelegation,
    #[error("delegation conditions do not permit this event")]
    DelegationViolation,
    #[error(transparent)]
    Serialize(#[from] serde_json::Error),
}
