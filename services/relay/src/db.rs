//! Postgres store bootstrap.

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::config::Config;

/// Connects the pool the relay's workers share: the event writer, the
/// backfill worker, the notify listener, and concurrent REQ queries all
/// draw connections from here, so the size comes from config rather than a
/// hardcoded count.
pub async fn create_pool(cfg: &Config) -> PgPool {
    PgPoolOptions::new()
        .max_connections(cfg.db_max_connections)
        .connect(&cfg.database_url)
        .await
        .expect("failed to connect to Postgres")
}

/// Applies the events-table migration at startup: the table itself, its
/// indexes, and the trigger that feeds `NOTIFY submissions` to the fanout.
pub async fn run_migrations(pool: &PgPool) {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .expect("failed to run database migrations")
}
