use std::env;
use std::future::Future;
use std::sync::Arc;

use relay::state::AppState;
use relay::{config::Config, db, event_writer, fanout, nip11, session};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let cfg = Arc::new(Config::from_env());

    info!("connecting to database...");
    let pool = db::create_pool(&cfg).await;
    db::run_migrations(&pool).await;
    info!("migrations applied");

    let nip11 = nip11::build(&cfg).expect("failed to build relay information document");
    let (state, channels) = AppState::new(cfg.clone(), pool.clone(), nip11);
    let subscriptions = fanout::subscription_map();

    spawn_worker(
        "event-writer",
        event_writer::run(channels.event_rx, pool.clone(), cfg.clone()),
    );
    spawn_worker(
        "request-handler",
        fanout::run_requests(
            channels.req_rx,
            channels.close_rx,
            pool.clone(),
            subscriptions.clone(),
        ),
    );
    spawn_worker(
        "notify-listener",
        fanout::run_notifications(pool, subscriptions),
    );

    let listener = TcpListener::bind(&cfg.bind_addr)
        .await
        .expect("failed to bind");
    info!(addr = %cfg.bind_addr, relay_url = %cfg.relay_url, "relay listening");

    loop {
        tokio::select! {
            () = shutdown_signal() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let state = state.clone();
                    tokio::spawn(async move {
                        session::serve(stream, peer.to_string(), state).await;
                    });
                }
                Err(e) => warn!(error = %e, "accept failed"),
            }
        }
    }
    info!("relay shut down gracefully");
}

/// Singleton workers must not die quietly: an unexpected store failure exits
/// the process non-zero so the supervisor restarts it.
fn spawn_worker<F>(name: &'static str, worker: F)
where
    F: Future<Output = Result<(), sqlx::Error>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = worker.await {
            error!(worker = name, error = %e, "worker failed");
            std::process::exit(1);
        }
    });
}

/// Resolves on SIGINT or SIGTERM. Returning ends the accept loop; open
/// client sessions drop with the process, as subscriptions are not meant to
/// survive a restart.
async fn shutdown_signal() {
    use tokio::signal;

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let signal_name = tokio::select! {
        result = signal::ctrl_c() => {
            result.expect("failed to install Ctrl+C handler");
            "SIGINT"
        }
        () = terminate => "SIGTERM",
    };
    info!(signal = signal_name, "stopping the accept loop");
}
