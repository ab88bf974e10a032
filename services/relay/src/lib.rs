pub mod auth;
pub mod config;
pub mod db;
pub mod event_writer;
pub mod fanout;
pub mod nip11;
pub mod pools;
pub mod session;
pub mod sql;
pub mod state;
pub mod ws_codec;
pub mod ws_handshake;

pub use state::AppState;

/// Seconds since the unix epoch.
pub fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}
