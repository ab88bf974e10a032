//! Per-connection session: handshake loop, AUTH challenge, and the
//! AUTH/EVENT/REQ/CLOSE dispatch.
//!
//! The session task owns the frame reader and drives the state machine; the
//! writer runs as its own task (see `ws_codec`) so the event writer and the
//! fanout workers can reply on this connection too. After every client
//! message the session waits on its token bucket; malformed messages consume
//! the full burst to deter flooding.

use std::io::Cursor;
use std::num::NonZeroU32;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use nonzero_ext::nonzero;
use relay_protocol::{Event, Filter};
use serde_json::json;
use serde_json::value::RawValue;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::state::{AppState, CloseSubmission, EventSubmission, ReqSubmission};
use crate::unix_now;
use crate::ws_codec::{
    spawn_writer, DeflateState, FrameReader, InboundEvent, InflateState, MessageWriter,
};
use crate::ws_handshake::{self, DeflateConfig, Outcome};
use crate::{auth, sql};

/// Entry point for one accepted TCP connection. Serves metadata GETs until
/// the connection upgrades, then runs the WebSocket session to completion.
pub async fn serve<S>(stream: S, addr: String, state: AppState)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut stream = stream;
    let mut buf = Vec::new();
    loop {
        match ws_handshake::accept(
            &mut stream,
            &mut buf,
            &state.nip11,
            state.cfg.nip11_unconditional,
        )
        .await
        {
            Ok(Outcome::Upgraded(deflate)) => {
                run_session(stream, std::mem::take(&mut buf), deflate, addr, state).await;
                return;
            }
            Ok(Outcome::Hijacked) => {}
            Err(e) => {
                debug!(addr = %addr, error = %e, "connection ended before upgrade");
                return;
            }
        }
    }
}

enum Disposition {
    /// Normal wait on the limiter.
    Continue,
    /// Malformed input: consume the whole burst.
    Penalize,
    /// Tear the connection down.
    Close,
}

async fn run_session<S>(
    stream: S,
    leftover: Vec<u8>,
    deflate: Option<DeflateConfig>,
    addr: String,
    state: AppState,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let cfg = state.cfg.clone();
    let token = CancellationToken::new();
    let (read_half, write_half) = tokio::io::split(stream);
    let inflate = deflate.map(|config| InflateState {
        config,
        context: state.decompressors.acquire(),
    });
    let compress = deflate.map(|config| DeflateState {
        config,
        context: state.compressors.acquire(),
    });
    let mut reader = FrameReader::new(
        Cursor::new(leftover).chain(BufReader::new(read_half)),
        inflate,
        cfg.max_message_bytes,
    );
    let writer = spawn_writer(write_half, compress, token.clone());
    let limiter = RateLimiter::direct(quota(cfg.msg_rate_per_sec, cfg.msg_rate_burst));

    let mut session = Session {
        challenge: state.next_challenge(),
        authenticated: None,
        addr,
        writer: writer.clone(),
        token: token.clone(),
        state,
    };
    info!(addr = %session.addr, "client connected");

    if writer
        .send(json!(["AUTH", session.challenge]).to_string())
        .await
        .is_err()
    {
        token.cancel();
        return;
    }

    loop {
        let inbound = tokio::select! {
            () = token.cancelled() => break,
            inbound = reader.next_message() => inbound,
        };
        match inbound {
            Ok(Some(InboundEvent::Ping(payload))) => {
                if writer.pong(payload).await.is_err() {
                    break;
                }
            }
            Ok(Some(InboundEvent::Text(text))) => {
                let tokens = match session.handle_message(&text).await {
                    Disposition::Continue => 1,
                    Disposition::Penalize => cfg.msg_rate_burst,
                    Disposition::Close => break,
                };
                if !wait(&limiter, &token, tokens).await {
                    break;
                }
            }
            Ok(None) => {
                debug!(addr = %session.addr, "client sent close");
                break;
            }
            Err(e) => {
                debug!(addr = %session.addr, error = %e, "read failed");
                break;
            }
        }
    }

    token.cancel();
    writer.close().await;
    info!(addr = %session.addr, "client disconnected");
}

fn quota(per_sec: u32, burst: u32) -> Quota {
    let per_sec = NonZeroU32::new(per_sec).unwrap_or(nonzero!(1u32));
    let burst = NonZeroU32::new(burst).unwrap_or(nonzero!(1u32));
    Quota::per_second(per_sec).allow_burst(burst)
}

/// Waits for `tokens` on the limiter; false means the session was cancelled
/// (or the bucket can never satisfy the request) and should end.
async fn wait(limiter: &DefaultDirectRateLimiter, token: &CancellationToken, tokens: u32) -> bool {
    let tokens = NonZeroU32::new(tokens).unwrap_or(nonzero!(1u32));
    tokio::select! {
        () = token.cancelled() => false,
        result = limiter.until_n_ready(tokens) => result.is_ok(),
    }
}

struct Session {
    state: AppState,
    addr: String,
    writer: MessageWriter,
    token: CancellationToken,
    challenge: String,
    authenticated: Option<String>,
}

impl Session {
    async fn handle_message(&mut self, text: &str) -> Disposition {
        let Ok(frames) = serde_json::from_str::<Vec<&RawValue>>(text) else {
            return self.protocol_error("could not parse message").await;
        };
        if frames.len() < 2 {
            return self.protocol_error("message is too short").await;
        }
        let Ok(label) = serde_json::from_str::<String>(frames[0].get()) else {
            return self.protocol_error("message label must be a string").await;
        };
        match label.as_str() {
            "AUTH" => self.handle_auth(frames[1]).await,
            "EVENT" => self.handle_event(frames[1]).await,
            "REQ" => self.handle_req(&frames).await,
            "CLOSE" => self.handle_close(frames[1]).await,
            _ => self.protocol_error("unknown message type").await,
        }
    }

    async fn notice(&self, text: &str) -> Result<(), crate::ws_codec::CodecError> {
        self.writer.send(json!(["NOTICE", text]).to_string()).await
    }

    async fn protocol_error(&self, text: &str) -> Disposition {
        if self.notice(text).await.is_err() {
            Disposition::Close
        } else {
            Disposition::Penalize
        }
    }

    fn reply_or_close(&self, sent: Result<(), crate::ws_codec::CodecError>) -> Disposition {
        if sent.is_err() {
            Disposition::Close
        } else {
            Disposition::Continue
        }
    }

    async fn handle_auth(&mut self, payload: &RawValue) -> Disposition {
        let Ok(event) = serde_json::from_str::<Event>(payload.get()) else {
            return self.protocol_error("Invalid AUTH").await;
        };
        match auth::validate_auth_event(
            &event,
            &self.challenge,
            &self.state.cfg.relay_url,
            unix_now(),
        ) {
            Ok(pubkey) => {
                let text = format!("Authenticated as {pubkey}");
                self.authenticated = Some(pubkey);
                let sent = self.notice(&text).await;
                self.reply_or_close(sent)
            }
            Err(_) => {
                let sent = self.notice("AUTH failed").await;
                self.reply_or_close(sent)
            }
        }
    }

    async fn handle_event(&mut self, payload: &RawValue) -> Disposition {
        let Ok(event) = serde_json::from_str::<Event>(payload.get()) else {
            return self.protocol_error("Invalid EVENT").await;
        };
        if event.verify().is_err() {
            let sent = self
                .writer
                .send(json!(["OK", event.id, false, ""]).to_string())
                .await;
            return self.reply_or_close(sent);
        }
        let submission = EventSubmission {
            event,
            writer: self.writer.clone(),
            token: self.token.clone(),
        };
        // Bounded channel: blocking here is the backpressure that slows a
        // flooding client down to the event writer's pace.
        tokio::select! {
            () = self.token.cancelled() => Disposition::Close,
            sent = self.state.event_tx.send(submission) => {
                if sent.is_err() {
                    Disposition::Close
                } else {
                    Disposition::Continue
                }
            }
        }
    }

    async fn handle_req(&mut self, frames: &[&RawValue]) -> Disposition {
        if frames.len() < 3 {
            return self.protocol_error("REQ is too short").await;
        }
        let Ok(id) = serde_json::from_str::<String>(frames[1].get()) else {
            return self.protocol_error("cannot parse REQ subscription id").await;
        };
        if id.is_empty() || id.len() > self.state.cfg.max_subid_length {
            let text = format!(
                "subscription id must be between 1 and {} characters",
                self.state.cfg.max_subid_length
            );
            return self.protocol_error(&text).await;
        }

        let mut filters: Vec<Filter> = Vec::with_capacity(frames.len() - 2);
        for raw in &frames[2..] {
            let mut filter = match serde_json::from_str::<Filter>(raw.get()) {
                Ok(filter) => filter,
                Err(e) => {
                    if self
                        .notice(&format!("Invalid filter in {id}: {e}"))
                        .await
                        .is_err()
                    {
                        return Disposition::Close;
                    }
                    continue;
                }
            };
            if let Err(e) = filter.validate() {
                if self
                    .notice(&format!("Invalid filter in {id}: {e}"))
                    .await
                    .is_err()
                {
                    return Disposition::Close;
                }
                continue;
            }
            if filter.kinds.is_none() {
                filter.kinds = Some(vec![1]);
            }
            if !kind4_allowed(self.authenticated.as_deref(), &filter) {
                if self
                    .notice(&format!(
                        "Invalid filter in {id}: user is not authenticated as sender or receiver."
                    ))
                    .await
                    .is_err()
                {
                    return Disposition::Close;
                }
                continue;
            }
            filters.push(filter);
        }
        if filters.is_empty() {
            let sent = self.notice("No filters were accepted. REQ Cancelled.").await;
            return self.reply_or_close(sent);
        }

        let query = match sql::compile(
            &filters,
            self.state.cfg.max_query_limit,
            &self.state.query_buffers,
        ) {
            Ok(query) => query,
            Err(e) => {
                let sent = self.notice(&format!("SQL Query Error: {e}")).await;
                return self.reply_or_close(sent);
            }
        };
        let submission = ReqSubmission {
            addr: self.addr.clone(),
            id,
            filters,
            query,
            writer: self.writer.clone(),
            token: self.token.clone(),
        };
        tokio::select! {
            () = self.token.cancelled() => Disposition::Close,
            sent = self.state.req_tx.send(submission) => {
                if sent.is_err() {
                    Disposition::Close
                } else {
                    Disposition::Continue
                }
            }
        }
    }

    async fn handle_close(&mut self, payload: &RawValue) -> Disposition {
        let Ok(id) = serde_json::from_str::<String>(payload.get()) else {
            return self.protocol_error("Invalid CLOSE message").await;
        };
        if id.is_empty() || id.len() > self.state.cfg.max_subid_length {
            return self.protocol_error("Invalid CLOSE message").await;
        }
        let submission = CloseSubmission {
            addr: self.addr.clone(),
            id,
        };
        if self.state.close_tx.send(submission).await.is_err() {
            Disposition::Close
        } else {
            Disposition::Continue
        }
    }
}

/// Kind-4 (encrypted DM) filters are only served to the authenticated sender
/// or receiver: the sole author entry, or the sole `#p` entry, must equal the
/// authenticated pubkey.
fn kind4_allowed(authenticated: Option<&str>, filter: &Filter) -> bool {
    let requests_dms = filter.kinds.as_ref().is_some_and(|k| k.contains(&4));
    if !requests_dms {
        return true;
    }
    let Some(user) = authenticated else {
        return false;
    };
    let sole_author = filter
        .authors
        .as_ref()
        .is_some_and(|a| a.len() == 1 && a[0] == user);
    let sole_receiver = filter
        .ptags
        .as_ref()
        .is_some_and(|p| p.len() == 1 && p[0] == user);
    sole_author || sole_receiver
}
