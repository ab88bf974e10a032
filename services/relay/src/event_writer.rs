//! The single event-submission worker.
//!
//! Serializes all writes into the store behind its own rate limiter (set
//! lower than any per-connection limit so the combined write rate is what
//! protects the store), and reaps expired rows on a timer.

use std::num::NonZeroU32;
use std::sync::Arc;

use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use relay_protocol::{DelegationToken, Event};
use serde_json::json;
use sqlx::PgPool;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::state::EventSubmission;
use crate::unix_now;

const INSERT_EVENT: &str = "INSERT INTO events \
    (id, pubkey, created_at, kind, ptags, etags, gtags, expiration, raw) \
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
    ON CONFLICT (id) DO NOTHING";

const DELETE_EXPIRED: &str =
    "DELETE FROM events WHERE expiration IS NOT NULL AND expiration < $1";

#[derive(Debug, thiserror::Error)]
enum StoreError {
    /// The event is refused; the client gets `OK false` with this reason.
    #[error("{0}")]
    Rejected(&'static str),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
    #[error(transparent)]
    Serialize(#[from] serde_json::Error),
}

/// Runs until the submission channel closes. Returns an error only on an
/// unexpected store failure, which the caller treats as fatal.
pub async fn run(
    mut rx: mpsc::Receiver<EventSubmission>,
    pool: PgPool,
    cfg: Arc<Config>,
) -> Result<(), sqlx::Error> {
    let limiter = RateLimiter::direct(
        Quota::per_second(
            NonZeroU32::new(cfg.event_write_rate_per_sec).unwrap_or(nonzero!(1u32)),
        )
        .allow_burst(NonZeroU32::new(cfg.event_write_burst).unwrap_or(nonzero!(1u32))),
    );

    let deleted = delete_expired(&pool).await?;
    info!(deleted, "store initialized, expired events deleted");

    let mut reaper = tokio::time::interval(cfg.reap_interval);
    reaper.tick().await; // the first tick fires immediately

    // Scratch buffers, reset per event.
    let mut ptags: Vec<String> = Vec::new();
    let mut etags: Vec<String> = Vec::new();
    let mut gtags: Vec<String> = Vec::new();
    let mut raw: Vec<u8> = Vec::new();

    loop {
        tokio::select! {
            _ = reaper.tick() => {
                let deleted = delete_expired(&pool).await?;
                info!(deleted, "expired events reaped");
            }
            submission = rx.recv() => {
                let Some(submission) = submission else { break };
                if !wait(&limiter, &submission.token).await {
                    continue;
                }
                let stored = store_event(
                    &pool,
                    &submission.event,
                    &mut ptags,
                    &mut etags,
                    &mut gtags,
                    &mut raw,
                )
                .await;
                let reply = match stored {
                    Ok(()) => json!(["OK", submission.event.id, true, ""]),
                    Err(StoreError::Rejected(reason)) => {
                        json!(["OK", submission.event.id, false, reason])
                    }
                    Err(StoreError::Db(_) | StoreError::Serialize(_)) => {
                        if submission.token.is_cancelled() {
                            // The session died mid-write; nothing to report.
                            continue;
                        }
                        json!(["OK", submission.event.id, false, "event not accepted into database"])
                    }
                };
                if submission.writer.send(reply.to_string()).await.is_err() {
                    submission.token.cancel();
                }
            }
        }
    }
    Ok(())
}

async fn wait(
    limiter: &governor::DefaultDirectRateLimiter,
    token: &CancellationToken,
) -> bool {
    tokio::select! {
        () = token.cancelled() => false,
        () = limiter.until_ready() => true,
    }
}

async fn store_event(
    pool: &PgPool,
    event: &Event,
    ptags: &mut Vec<String>,
    etags: &mut Vec<String>,
    gtags: &mut Vec<String>,
    raw: &mut Vec<u8>,
) -> Result<(), StoreError> {
    if let Some(tag) = event.delegation_tag() {
        let token = DelegationToken::from_tag(tag)
            .map_err(|_| StoreError::Rejected("invalid delegation"))?;
        token
            .verify(event)
            .map_err(|_| StoreError::Rejected("invalid delegation"))?;
    }

    ptags.clear();
    etags.clear();
    gtags.clear();
    ptags.extend(event.tag_values("p").map(str::to_owned));
    etags.extend(event.tag_values("e").map(str::to_owned));
    gtags.extend(event.tag_values("g").map(str::to_owned));
    let expiration = event.expiration();

    raw.clear();
    serde_json::to_writer(&mut *raw, event)?;
    let raw_str = std::str::from_utf8(raw)
        .map_err(|_| StoreError::Rejected("event not accepted into database"))?;

    let result = sqlx::query(INSERT_EVENT)
        .bind(&event.id)
        .bind(&event.pubkey)
        .bind(event.created_at)
        .bind(event.kind)
        .bind(&ptags[..])
        .bind(&etags[..])
        .bind(&gtags[..])
        .bind(expiration)
        .bind(raw_str)
        .execute(pool)
        .await;

    match result {
        Ok(_) => Ok(()),
        Err(e) => Err(StoreError::Db(e)),
    }
}

async fn delete_expired(pool: &PgPool) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(DELETE_EXPIRED)
        .bind(unix_now())
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
