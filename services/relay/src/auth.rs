//! NIP-42 authentication: validating the signed challenge event.

use relay_protocol::Event;
use url::Url;

/// The ephemeral event kind clients sign to answer an AUTH challenge.
pub const AUTH_KIND: i64 = 22242;

/// How far an AUTH event's `created_at` may drift from now, in seconds.
const MAX_AUTH_AGE_SECS: i64 = 600;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("event failed verification")]
    BadEvent,
    #[error("wrong event kind")]
    WrongKind,
    #[error("created_at outside the accepted window")]
    Stale,
    #[error("challenge tag does not match")]
    ChallengeMismatch,
    #[error("relay tag does not match this relay")]
    RelayMismatch,
}

/// Validates a client AUTH event against the session challenge and the
/// configured relay URL. Returns the authenticated pubkey.
pub fn validate_auth_event(
    event: &Event,
    challenge: &str,
    relay_url: &str,
    now: i64,
) -> Result<String, AuthError> {
    event.verify().map_err(|_| AuthError::BadEvent)?;
    if event.kind != AUTH_KIND {
        return Err(AuthError::WrongKind);
    }
    if (now - event.created_at).abs() > MAX_AUTH_AGE_SECS {
        return Err(AuthError::Stale);
    }
    if event.tag_values("challenge").next() != Some(challenge) {
        return Err(AuthError::ChallengeMismatch);
    }
    let tagged = event
        .tag_values("relay")
        .next()
        .ok_or(AuthError::RelayMismatch)?;
    if !urls_match(tagged, relay_url) {
        return Err(AuthError::RelayMismatch);
    }
    Ok(event.pubkey.clone())
}

/// Compares relay URLs by host and port; clients routinely differ in
/// scheme (`ws`/`wss`) and trailing slashes.
fn urls_match(a: &str, b: &str) -> bool {
    match (Url::parse(a), Url::parse(b)) {
        (Ok(a), Ok(b)) => {
            a.host_str().map(str::to_ascii_lowercase) == b.host_str().map(str::to_ascii_lowercase)
                && a.port_or_known_default() == b.port_or_known_default()
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;
    use k256::schnorr::signature::Signer;
    use k256::schnorr::SigningKey;

    fn signed_auth_event(challenge: &str, relay: &str, created_at: i64) -> Event {
        let key = SigningKey::random(&mut OsRng);
        let mut event = Event {
            pubkey: hex::encode(key.verifying_key().to_bytes()),
            created_at,
            kind: AUTH_KIND,
            tags: vec![
                vec!["relay".to_owned(), relay.to_owned()],
                vec!["challenge".to_owned(), challenge.to_owned()],
            ],
            content: String::new(),
            ..Event::default()
        };
        event.id = event.compute_id().unwrap();
        let sig: k256::schnorr::Signature = key.sign(&hex::decode(&event.id).unwrap());
        event.sig = hex::encode(sig.to_bytes());
        event
    }

    const RELAY: &str = "wss://relay.example.com";

    #[test]
    fn valid_auth_event_yields_the_pubkey() {
        let event = signed_auth_event("abcd", RELAY, 1_700_000_000);
        let pubkey =
            validate_auth_event(&event, "abcd", RELAY, 1_700_000_100).unwrap();
        assert_eq!(pubkey, event.pubkey);
    }

    #[test]
    fn scheme_and_trailing_slash_differences_are_tolerated() {
        let event = signed_auth_event("abcd", "ws://relay.example.com/", 1_700_000_000);
        assert!(validate_auth_event(&event, "abcd", RELAY, 1_700_000_000).is_ok());
    }

    #[test]
    fn wrong_challenge_is_rejected() {
        let event = signed_auth_event("abcd", RELAY, 1_700_000_000);
        assert_eq!(
            validate_auth_event(&event, "efgh", RELAY, 1_700_000_000),
            Err(AuthError::ChallengeMismatch)
        );
    }

    #[test]
    fn wrong_relay_is_rejected() {
        let event = signed_auth_event("abcd", "wss://other.example.com", 1_700_000_000);
        assert_eq!(
            validate_auth_event(&event, "abcd", RELAY, 1_700_000_000),
            Err(AuthError::RelayMismatch)
        );
    }

    #[test]
    fn stale_auth_event_is_rejected() {
        let event = signed_auth_event("abcd", RELAY, 1_700_000_000);
        assert_eq!(
            validate_auth_event(&event, "abcd", RELAY, 1_700_010_000),
            Err(AuthError::Stale)
        );
    }

    #[test]
    fn tampered_event_is_rejected() {
        let mut event = signed_auth_event("abcd", RELAY, 1_700_000_000);
        event.content = "tampered".to_owned();
        assert_eq!(
            validate_auth_event(&event, "abcd", RELAY, 1_700_000_000),
            Err(AuthError::BadEvent)
        );
    }

    #[test]
    fn wrong_kind_is_rejected() {
        let key = SigningKey::random(&mut OsRng);
        let mut event = Event {
            pubkey: hex::encode(key.verifying_key().to_bytes()),
            created_at: 1_700_000_000,
            kind: 1,
            tags: vec![
                vec!["relay".to_owned(), RELAY.to_owned()],
                vec!["challenge".to_owned(), "abcd".to_owned()],
            ],
            ..Event::default()
        };
        event.id = event.compute_id().unwrap();
        let sig: k256::schnorr::Signature = key.sign(&hex::decode(&event.id).unwrap());
        event.sig = hex::encode(sig.to_bytes());
        assert_eq!(
            validate_auth_event(&event, "abcd", RELAY, 1_700_000_000),
            Err(AuthError::WrongKind)
        );
    }
}
