//! NIP-26 delegated event signing.
//!
//! A `delegation` tag carries the delegator's pubkey, a conditions query
//! string, and the delegator's signature over
//! `sha256("nostr:delegation:<delegatee>:<conditions>")`. When the tag
//! verifies, the delegator is the effective author for kind and time-window
//! checks.

use k256::schnorr::signature::Verifier;
use k256::schnorr::{Signature, VerifyingKey};
use sha2::{Digest, Sha256};

use crate::event::{is_lower_hex, Event};
use crate::Error;

/// Parsed conditions from a delegation query string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conditions {
    pub kinds: Vec<i64>,
    pub created_after: Option<i64>,
    pub created_before: Option<i64>,
}

impl Conditions {
    /// Parses `kind=1&created_at>1000&created_at<2000`. Unknown or
    /// malformed clauses are an error; a delegation we cannot fully
    /// interpret must not be honoured.
    pub fn parse(s: &str) -> Result<Self, Error> {
        let mut conditions = Self::default();
        for clause in s.split('&') {
            if let Some(kind) = clause.strip_prefix("kind=") {
                let kind = kind.parse().map_err(|_| Error::MalformedDelegation)?;
                conditions.kinds.push(kind);
            } else if let Some(ts) = clause.strip_prefix("created_at>") {
                let ts = ts.parse().map_err(|_| Error::MalformedDelegation)?;
                conditions.created_after = Some(ts);
            } else if let Some(ts) = clause.strip_prefix("created_at<") {
                let ts = ts.parse().map_err(|_| Error::MalformedDelegation)?;
                conditions.created_before = Some(ts);
            } else {
                return Err(Error::MalformedDelegation);
            }
        }
        Ok(conditions)
    }

    /// True when the delegated event satisfies every condition.
    pub fn allow(&self, event: &Event) -> bool {
        if !self.kinds.is_empty() && !self.kinds.contains(&event.kind) {
            return false;
        }
        if let Some(after) = self.created_after {
            if event.created_at <= after {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if event.created_at >= before {
                return false;
            }
        }
        true
    }
}

/// A delegation token lifted from an event's `delegation` tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegationToken {
    pub delegator: String,
    pub conditions: Conditions,
    conditions_str: String,
    sig: String,
}

impl DelegationToken {
    /// Parses the tag `["delegation", delegator, conditions, sig]`.
    pub fn from_tag(tag: &[String]) -> Result<Self, Error> {
        if tag.len() != 4 {
            return Err(Error::MalformedDelegation);
        }
        if !is_lower_hex(&tag[1], 64) || !is_lower_hex(&tag[3], 128) {
            return Err(Error::MalformedDelegation);
        }
        Ok(Self {
            delegator: tag[1].clone(),
            conditions: Conditions::parse(&tag[2])?,
            conditions_str: tag[2].clone(),
            sig: tag[3].clone(),
        })
    }

    /// Verifies the token against the delegated event: the conditions must
    /// allow the event, and the delegator must have signed the delegation
    /// string for the event's author.
    pub fn verify(&self, event: &Event) -> Result<(), Error> {
        if !self.conditions.allow(event) {
            return Err(Error::DelegationViolation);
        }
        let delegation_string = format!(
            "nostr:delegation:{}:{}",
            event.pubkey, self.conditions_str
        );
        let digest = Sha256::digest(delegation_string.as_bytes());
        let delegator = hex::decode(&self.delegator).map_err(|_| Error::MalformedDelegation)?;
        let sig = hex::decode(&self.sig).map_err(|_| Error::MalformedDelegation)?;
        let key = VerifyingKey::from_bytes(&delegator).map_err(|_| Error::InvalidKey)?;
        let sig = Signature::try_from(sig.as_slice()).map_err(|_| Error::BadSignature)?;
        key.verify(digest.as_slice(), &sig)
            .map_err(|_| Error::BadSignature)
    }
}
