//! Relay information document, pre-serialized at startup.

use std::io::Write;

use flate2::write::GzEncoder;
use flate2::Compression;
use relay_protocol::{Limitation, RelayInformationDocument};

use crate::config::Config;

/// Identity and gzip encodings of the NIP-11 document, shared read-only by
/// every connection.
#[derive(Debug)]
pub struct Nip11Bytes {
    pub plain: Vec<u8>,
    pub gzip: Vec<u8>,
}

pub fn build(cfg: &Config) -> Result<Nip11Bytes, std::io::Error> {
    let doc = RelayInformationDocument {
        name: cfg.name.clone(),
        description: cfg.description.clone(),
        pubkey: cfg.pubkey.clone(),
        contact: cfg.contact.clone(),
        supported_nips: Some(vec![1, 4, 11, 12, 20, 26, 40, 42]),
        software: Some(env!("CARGO_PKG_NAME").to_owned()),
        version: Some(env!("CARGO_PKG_VERSION").to_owned()),
        limitation: Some(Limitation {
            max_message_length: i32::try_from(cfg.max_message_bytes).ok(),
            max_subid_length: i32::try_from(cfg.max_subid_length).ok(),
            max_limit: i32::try_from(cfg.max_query_limit).ok(),
        }),
    };
    let plain = serde_json::to_vec(&doc)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&plain)?;
    let gzip = encoder.finish()?;
    Ok(Nip11Bytes { plain, gzip })
}
