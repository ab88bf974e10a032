//! Nostr events: canonical serialization, id hashing, BIP-340 verification.

use k256::schnorr::signature::Verifier;
use k256::schnorr::{Signature, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::Error;

/// A signed Nostr event as it appears on the wire.
///
/// Field order matches the canonical JSON object layout, so serializing an
/// `Event` with serde yields the representation stored in the `raw` column
/// and forwarded to subscribers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub pubkey: String,
    pub created_at: i64,
    pub kind: i64,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

impl Event {
    /// The canonical serialization `[0, pubkey, created_at, kind, tags, content]`
    /// whose SHA-256 hash defines the event id.
    pub fn canonical_json(&self) -> Result<String, Error> {
        let canonical = (
            0,
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        );
        Ok(serde_json::to_string(&canonical)?)
    }

    /// Recomputes the event id from the canonical serialization.
    pub fn compute_id(&self) -> Result<String, Error> {
        let canonical = self.canonical_json()?;
        Ok(hex::encode(Sha256::digest(canonical.as_bytes())))
    }

    /// Full validation: well-formed hex fields, id matches the canonical
    /// hash, and the schnorr signature verifies against `pubkey` over the id
    /// bytes.
    pub fn verify(&self) -> Result<(), Error> {
        if !is_lower_hex(&self.id, 64) {
            return Err(Error::MalformedHex("id"));
        }
        if !is_lower_hex(&self.pubkey, 64) {
            return Err(Error::MalformedHex("pubkey"));
        }
        if !is_lower_hex(&self.sig, 128) {
            return Err(Error::MalformedHex("sig"));
        }
        if self.kind < 0 {
            return Err(Error::IdMismatch);
        }
        if self.compute_id()? != self.id {
            return Err(Error::IdMismatch);
        }
        let pubkey = hex::decode(&self.pubkey).map_err(|_| Error::MalformedHex("pubkey"))?;
        let id = hex::decode(&self.id).map_err(|_| Error::MalformedHex("id"))?;
        let sig = hex::decode(&self.sig).map_err(|_| Error::MalformedHex("sig"))?;
        let key = VerifyingKey::from_bytes(&pubkey).map_err(|_| Error::InvalidKey)?;
        let sig = Signature::try_from(sig.as_slice()).map_err(|_| Error::BadSignature)?;
        key.verify(&id, &sig).map_err(|_| Error::BadSignature)
    }

    /// Values of all tags named `name` (the tag value is the second element).
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.tags
            .iter()
            .filter(move |t| t.len() >= 2 && t[0] == name)
            .map(|t| t[1].as_str())
    }

    /// Unix timestamp from the first `expiration` tag, if present and numeric.
    pub fn expiration(&self) -> Option<i64> {
        self.tag_values("expiration").next()?.parse().ok()
    }

    /// The raw `delegation` tag, if any.
    pub fn delegation_tag(&self) -> Option<&[String]> {
        self.tags
            .iter()
            .find(|t| t.first().is_some_and(|n| n == "delegation"))
            .map(Vec::as_slice)
    }
}

/// True when `s` is exactly `len` lowercase hex characters.
pub fn is_lower_hex(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// True when `s` is a non-empty lowercase-hex prefix of a 64-char field.
pub fn is_hex_prefix(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 64
        && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;
    use k256::schnorr::signature::Signer;
    use k256::schnorr::SigningKey;

    fn signed_event(kind: i64, tags: Vec<Vec<String>>, content: &str) -> Event {
        let key = SigningKey::random(&mut OsRng);
        sign_event(&key, kind, tags, content)
    }

    fn sign_event(
        key: &SigningKey,
        kind: i64,
        tags: Vec<Vec<String>>,
        content: &str,
    ) -> Event {
        let mut event = Event {
            pubkey: hex::encode(key.verifying_key().to_bytes()),
            created_at: 1_700_000_000,
            kind,
            tags,
            content: content.to_owned(),
            ..Event::default()
        };
        event.id = event.compute_id().unwrap();
        let id_bytes = hex::decode(&event.id).unwrap();
        let sig: k256::schnorr::Signature = key.sign(&id_bytes);
        event.sig = hex::encode(sig.to_bytes());
        event
    }

    #[test]
    fn canonical_serialization_is_the_hash_preimage() {
        let event = Event {
            pubkey: "ab".repeat(32),
            created_at: 1_700_000_000,
            kind: 1,
            tags: vec![vec!["p".to_owned(), "cd".repeat(32)]],
            content: "hello \"world\"".to_owned(),
            ..Event::default()
        };
        let canonical = event.canonical_json().unwrap();
        assert!(canonical.starts_with("[0,\""));
        assert!(canonical.contains("\"hello \\\"world\\\"\""));
        assert_eq!(
            event.compute_id().unwrap(),
            hex::encode(Sha256::digest(canonical.as_bytes()))
        );
    }

    #[test]
    fn signed_event_verifies() {
        let event = signed_event(1, vec![], "content");
        event.verify().unwrap();
    }

    #[test]
    fn tampered_content_fails_verification() {
        let mut event = signed_event(1, vec![], "content");
        event.content = "tampered".to_owned();
        assert!(matches!(event.verify(), Err(Error::IdMismatch)));
    }

    #[test]
    fn tampered_id_fails_signature_check() {
        let mut event = signed_event(1, vec![], "content");
        // Recompute a consistent id for different content, keeping the old sig.
        event.content = "tampered".to_owned();
        event.id = event.compute_id().unwrap();
        assert!(matches!(event.verify(), Err(Error::BadSignature)));
    }

    #[test]
    fn malformed_hex_fields_are_rejected() {
        let mut event = signed_event(1, vec![], "x");
        event.pubkey = "ZZ".repeat(32);
        assert!(matches!(event.verify(), Err(Error::MalformedHex("pubkey"))));
    }

    #[test]
    fn tag_projections_and_expiration() {
        let event = Event {
            tags: vec![
                vec!["p".to_owned(), "aa".to_owned()],
                vec!["e".to_owned(), "bb".to_owned()],
                vec!["p".to_owned(), "cc".to_owned()],
                vec!["expiration".to_owned(), "1700000123".to_owned()],
                vec!["solo".to_owned()],
            ],
            ..Event::default()
        };
        let ptags: Vec<&str> = event.tag_values("p").collect();
        assert_eq!(ptags, vec!["aa", "cc"]);
        assert_eq!(event.tag_values("e").count(), 1);
        assert_eq!(event.expiration(), Some(1_700_000_123));
        assert_eq!(event.tag_values("solo").count(), 0);
    }

    #[test]
    fn hex_helpers() {
        assert!(is_lower_hex(&"ab".repeat(32), 64));
        assert!(!is_lower_hex(&"AB".repeat(32), 64));
        assert!(is_hex_prefix("abc123"));
        assert!(!is_hex_prefix(""));
        assert!(!is_hex_prefix("xyz"));
    }
}
