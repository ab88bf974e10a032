//! Relay configuration.
//!
//! Environment variables are the sole config source, read once at startup.
//! Only `DATABASE_URL` is required; everything else has a default.

use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Upper bound on pooled store connections shared by all workers.
    pub db_max_connections: u32,
    pub bind_addr: String,
    /// The URL clients must reference in NIP-42 AUTH events.
    pub relay_url: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub contact: Option<String>,
    pub pubkey: Option<String>,
    /// Per-connection message rate (steady tokens per second + burst).
    pub msg_rate_per_sec: u32,
    pub msg_rate_burst: u32,
    /// Event writer rate; deliberately lower than per-connection limits so
    /// the combined write rate is what protects the store.
    pub event_write_rate_per_sec: u32,
    pub event_write_burst: u32,
    pub max_subid_length: usize,
    pub max_message_bytes: usize,
    /// Cap applied to every REQ's effective `LIMIT`.
    pub max_query_limit: u32,
    pub reap_interval: Duration,
    /// Serve the NIP-11 document to any plain GET, not only ones that ask
    /// for `application/nostr+json`.
    pub nip11_unconditional: bool,
}

impl Config {
    /// Reads the configuration from the environment. Panics when
    /// `DATABASE_URL` is missing, which exits non-zero before any socket is
    /// bound.
    pub fn from_env() -> Self {
        let bind_addr = env::var("RELAY_BIND_ADDR").unwrap_or_else(|_| "localhost:8080".to_owned());
        let relay_url = env::var("RELAY_URL").unwrap_or_else(|_| format!("ws://{bind_addr}"));
        Self {
            database_url: env::var("DATABASE_URL").expect("DATABASE_URL must be set"),
            db_max_connections: env_or("DB_MAX_CONNECTIONS", 10),
            bind_addr,
            relay_url,
            name: env::var("RELAY_NAME").ok(),
            description: env::var("RELAY_DESCRIPTION").ok(),
            contact: env::var("RELAY_CONTACT").ok(),
            pubkey: env::var("RELAY_PUBKEY").ok(),
            msg_rate_per_sec: env_or("MSG_RATE_PER_SEC", 8),
            msg_rate_burst: env_or("MSG_RATE_BURST", 16),
            event_write_rate_per_sec: env_or("EVENT_WRITE_RATE_PER_SEC", 25),
            event_write_burst: env_or("EVENT_WRITE_BURST", 5),
            max_subid_length: env_or("MAX_SUBID_LENGTH", 64),
            max_message_bytes: env_or("MAX_MESSAGE_BYTES", 512 * 1024),
            max_query_limit: env_or("MAX_QUERY_LIMIT", 500),
            reap_interval: Duration::from_secs(env_or("REAP_INTERVAL_SECS", 600)),
            nip11_unconditional: env_or("NIP11_UNCONDITIONAL", false),
        }
    }
}

fn env_or<T: FromStr + Copy>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
