use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;

use stallbook::clock::SystemClock;
use stallbook::compactor;
use stallbook::config::Config;
use stallbook::engine::Engine;
use stallbook::notify::{InAppHub, Notifier};
use stallbook::wire;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    stallbook::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;

    let hub = Arc::new(InAppHub::new());
    let notifier = Notifier::spawn(hub.clone());
    let engine = Arc::new(Engine::new(
        config.wal_path(),
        notifier,
        Arc::new(SystemClock),
        config.policy,
    )?);
    tokio::spawn(compactor::run_compactor(engine.clone(), config.compact_threshold));

    let max_connections = config.max_connections;
    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("stallbook listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  max_connections: {max_connections}");
    info!(
        "  policy: advance {}d, stay {}d, cool-down {}d",
        config.policy.max_advance_days, config.policy.max_stay_days, config.policy.cool_down_days
    );

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, drain in-flight connections
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                        continue;
                    }
                };

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::warn!("connection limit reached, rejecting {peer}");
                        metrics::counter!(stallbook::observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(stallbook::observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(stallbook::observability::CONNECTIONS_ACTIVE).increment(1.0);
                let engine = engine.clone();
                let hub = hub.clone();
                let pw = config.password.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = wire::process_connection(socket, engine, hub, pw).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(stallbook::observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    drain_connections(&semaphore, max_connections, DRAIN_TIMEOUT).await;
    info!("stallbook stopped");
    Ok(())
}

/// Wait until every connection permit is back or `timeout` passes.
async fn drain_connections(semaphore: &Semaphore, max_connections: usize, timeout: Duration) {
    info!("draining connections...");
    let deadline = tokio::time::Instant::now() + timeout;
    let mut poll = tokio::time::interval(Duration::from_millis(100));
    while semaphore.available_permits() < max_connections {
        if tokio::time::Instant::now() >= deadline {
            let remaining = max_connections - semaphore.available_permits();
            tracing::warn!("drain timeout, {remaining} connections still open");
            return;
        }
        poll.tick().await;
    }
    info!("all connections drained");
}
