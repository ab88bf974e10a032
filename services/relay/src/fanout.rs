//! Request backfill and live fanout.
//!
//! Two long-lived workers share one mutex-guarded map of live subscriptions
//! keyed `addr/sub_id`: the backfill worker drains REQ and CLOSE
//! submissions, and the notify worker forwards store notifications to every
//! matching subscription. A subscription only enters the map after its EOSE
//! went out, so no live event can ever precede the end of backfill.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::TryStreamExt;
use relay_protocol::{Event, Filter};
use serde_json::json;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::state::{CloseSubmission, ReqSubmission};
use crate::unix_now;
use crate::ws_codec::MessageWriter;

/// One live subscription. The filters keep their REQ order; the first
/// matching filter wins during fanout so one event is never delivered twice
/// under the same subscription id.
pub struct Subscription {
    pub id: String,
    pub filters: Vec<Filter>,
    pub writer: MessageWriter,
    pub token: tokio_util::sync::CancellationToken,
}

pub type SubscriptionMap = Arc<Mutex<HashMap<String, Subscription>>>;

pub fn subscription_map() -> SubscriptionMap {
    Arc::new(Mutex::new(HashMap::new()))
}

/// Backfill worker: runs REQ queries, streams results, installs live
/// subscriptions, and removes them on CLOSE.
pub async fn run_requests(
    mut req_rx: mpsc::Receiver<ReqSubmission>,
    mut close_rx: mpsc::Receiver<CloseSubmission>,
    pool: PgPool,
    subscriptions: SubscriptionMap,
) -> Result<(), sqlx::Error> {
    loop {
        tokio::select! {
            req = req_rx.recv() => {
                let Some(req) = req else { break };
                backfill(req, &pool, &subscriptions).await?;
            }
            close = close_rx.recv() => {
                let Some(close) = close else { break };
                let key = subscription_key(&close.addr, &close.id);
                subscriptions.lock().await.remove(&key);
            }
        }
    }
    Ok(())
}

async fn backfill(
    req: ReqSubmission,
    pool: &PgPool,
    subscriptions: &SubscriptionMap,
) -> Result<(), sqlx::Error> {
    let ReqSubmission {
        addr,
        id,
        mut filters,
        query,
        writer,
        token,
    } = req;
    let crate::sql::Query { sql, mut params } = query;

    let mut rows = {
        let mut q = sqlx::query_scalar::<_, String>(sql.as_str());
        for param in params.drain(..) {
            q = match param {
                crate::sql::Param::Text(v) => q.bind(v),
                crate::sql::Param::Int(v) => q.bind(v),
                crate::sql::Param::TextArray(v) => q.bind(v),
                crate::sql::Param::IntArray(v) => q.bind(v),
            };
        }
        q.fetch(pool)
    };

    let sub_json = json!(id).to_string();
    // Per-filter row counts so Cull can tell which limits were reached.
    let mut delivered = vec![0u32; filters.len()];
    let count_rows = filters.iter().any(|f| f.limit.is_some());

    loop {
        let row = tokio::select! {
            () = token.cancelled() => return Ok(()),
            row = rows.try_next() => row,
        };
        match row {
            Ok(Some(raw)) => {
                if count_rows {
                    if let Ok(event) = serde_json::from_str::<Event>(&raw) {
                        for (filter, count) in filters.iter().zip(delivered.iter_mut()) {
                            if filter.accepts(&event) {
                                *count += 1;
                            }
                        }
                    }
                }
                let msg = format!("[\"EVENT\",{sub_json},{raw}]");
                if writer.send(msg).await.is_err() {
                    token.cancel();
                    return Ok(());
                }
            }
            Ok(None) => break,
            Err(e) => {
                if token.is_cancelled() {
                    // The client went away mid-query; not a store problem.
                    return Ok(());
                }
                return Err(e);
            }
        }
    }
    drop(rows);

    if writer.send(format!("[\"EOSE\",{sub_json}]")).await.is_err() {
        token.cancel();
        return Ok(());
    }

    cull(&mut filters, &delivered, unix_now());
    if filters.is_empty() || token.is_cancelled() {
        debug!(addr = %addr, sub = %id, "subscription exhausted by backfill");
        return Ok(());
    }
    let key = subscription_key(&addr, &id);
    subscriptions.lock().await.insert(
        key,
        Subscription {
            id,
            filters,
            writer,
            token,
        },
    );
    Ok(())
}

/// Prunes filters that can no longer match live events: an `until` already
/// in the past, or a `limit` the backfill has reached. Order is preserved so
/// fanout matching stays aligned with backfill semantics.
pub fn cull(filters: &mut Vec<Filter>, delivered: &[u32], now: i64) {
    let mut index = 0;
    filters.retain(|filter| {
        let delivered = delivered.get(index).copied().unwrap_or(0);
        index += 1;
        if filter.until.is_some_and(|until| until < now) {
            return false;
        }
        !filter.limit.is_some_and(|limit| delivered >= limit)
    });
}

/// Notify worker: forwards each store notification to every matching live
/// subscription, short-circuiting on the first matching filter.
pub async fn run_notifications(
    pool: PgPool,
    subscriptions: SubscriptionMap,
) -> Result<(), sqlx::Error> {
    let mut listener = PgListener::connect_with(&pool).await?;
    listener.listen("submissions").await?;
    loop {
        let notification = listener.recv().await?;
        let payload = notification.payload();
        let Ok(event) = serde_json::from_str::<Event>(payload) else {
            warn!("unparseable submission notification payload");
            continue;
        };
        let mut map = subscriptions.lock().await;
        let mut dead: Vec<String> = Vec::new();
        for (key, sub) in map.iter() {
            if sub.token.is_cancelled() {
                dead.push(key.clone());
                continue;
            }
            if sub.filters.iter().any(|f| f.accepts(&event)) {
                let msg = format!("[\"EVENT\",{},{payload}]", json!(sub.id));
                if sub.writer.send(msg).await.is_err() {
                    sub.token.cancel();
                    dead.push(key.clone());
                }
            }
        }
        for key in dead {
            map.remove(&key);
        }
    }
}

fn subscription_key(addr: &str, id: &str) -> String {
    format!("{addr}/{id}")
}
