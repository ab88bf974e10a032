//! Relay information document (NIP-11).
//!
//! Served to plain HTTP GETs with `Accept: application/nostr+json` before any
//! WebSocket upgrade.

use serde::{Deserialize, Serialize};

/// The relay metadata document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayInformationDocument {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Owner public key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pubkey: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supported_nips: Option<Vec<u16>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub software: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Practical limits clients should expect to be enforced.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limitation: Option<Limitation>,
}

/// Limits imposed by the relay on clients; requests exceeding them are
/// rejected or fail immediately.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limitation {
    /// Maximum bytes of incoming JSON the relay will decode and act upon.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_message_length: Option<i32>,
    /// Maximum length of a subscription id string.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_subid_length: Option<i32>,
    /// The relay clamps each filter's `limit` to this value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_limit: Option<i32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optional_fields_are_omitted() {
        let doc = RelayInformationDocument {
            name: Some("test relay".to_owned()),
            supported_nips: Some(vec![1, 11, 42]),
            ..RelayInformationDocument::default()
        };
        let json = serde_json::to_string(&doc).unwrap();
        assert!(json.contains("\"name\":\"test relay\""));
        assert!(json.contains("\"supported_nips\":[1,11,42]"));
        assert!(!json.contains("description"));
        assert!(!json.contains("limitation"));
    }

    #[test]
    fn round_trips_with_limitation() {
        let doc = RelayInformationDocument {
            limitation: Some(Limitation {
                max_message_length: Some(524_288),
                max_subid_length: Some(64),
                max_limit: Some(500),
            }),
            ..RelayInformationDocument::default()
        };
        let json = serde_json::to_string(&doc).unwrap();
        let back: RelayInformationDocument = serde_json::from_str(&json).unwrap();
        assert_eq!(back, doc);
    }
}
