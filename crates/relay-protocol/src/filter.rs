//! Subscription filters and the in-memory matching predicate.
//!
//! A REQ carries one or more filters; a filter matches an event only if every
//! present field matches. The SQL compiled by the server and [`Filter::accepts`]
//! must agree exactly — the former answers backfill queries, the latter drives
//! the live fanout.

use serde::{Deserialize, Serialize};

use crate::event::{is_hex_prefix, Event};
use crate::Error;

/// A single subscription filter.
///
/// Unknown fields are a deserialization error on purpose: the relay skips
/// such filters with a NOTICE instead of silently matching more than the
/// client asked for. `#p`/`#e`/`#g` are the tag queries backed by the store's
/// indexed projections.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Filter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<i64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(rename = "#p", skip_serializing_if = "Option::is_none")]
    pub ptags: Option<Vec<String>>,
    #[serde(rename = "#e", skip_serializing_if = "Option::is_none")]
    pub etags: Option<Vec<String>>,
    #[serde(rename = "#g", skip_serializing_if = "Option::is_none")]
    pub gtags: Option<Vec<String>>,
}

impl Filter {
    /// Semantic validation beyond what serde checks: id and author entries
    /// must be non-empty lowercase-hex prefixes, and set fields must not be
    /// empty lists.
    pub fn validate(&self) -> Result<(), Error> {
        if let Some(ids) = &self.ids {
            if ids.is_empty() || !ids.iter().all(|p| is_hex_prefix(p)) {
                return Err(Error::MalformedHex("ids"));
            }
        }
        if let Some(authors) = &self.authors {
            if authors.is_empty() || !authors.iter().all(|p| is_hex_prefix(p)) {
                return Err(Error::MalformedHex("authors"));
            }
        }
        Ok(())
    }

    /// True when every present field of the filter matches `event`.
    pub fn accepts(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|p| event.id.starts_with(p.as_str())) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.iter().any(|p| event.pubkey.starts_with(p.as_str())) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.created_at > until {
                return false;
            }
        }
        tag_set_matches(self.ptags.as_deref(), event, "p")
            && tag_set_matches(self.etags.as_deref(), event, "e")
            && tag_set_matches(self.gtags.as_deref(), event, "g")
    }
}

fn tag_set_matches(wanted: Option<&[String]>, event: &Event, name: &str) -> bool {
    match wanted {
        None => true,
        Some(values) => event.tag_values(name).any(|v| values.iter().any(|w| w == v)),
    }
}
