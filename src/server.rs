//! TCP listener accept loop: one task per accepted connection.
//!
//! Generalizes `internal/server/tcp_server.go`'s `Start(addr, handler)` to
//! async tasks; the per-connection panic-containment requirement
//! (`spec.md` §4.5) is handled here by awaiting each spawned task's
//! `JoinHandle` in a second task and logging only if it panicked.

use std::sync::Arc;

use tokio::net::TcpListener;

use crate::config::Config;
use crate::connection;
use crate::metrics::Metrics;
use crate::store::Store;
use crate::upstream::UpstreamLink;

pub async fn run(
    config: Arc<Config>,
    store: Arc<dyn Store>,
    upstream: UpstreamLink,
    metrics: Arc<Metrics>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", config.tcp_port)).await?;
    tracing::info!(port = config.tcp_port, "tcp server listening");

    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::warn!(%err, "accept error");
                continue;
            }
        };

        metrics
            .accepted_connections
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let store = store.clone();
        let upstream = upstream.clone();
        let config = config.clone();
        let conn_metrics = metrics.clone();

        let handle = tokio::spawn(async move {
            connection::handle(stream, remote_addr, store, upstream, config, conn_metrics).await
        });

        tokio::spawn(async move {
            if let Err(join_err) = handle.await {
                if join_err.is_panic() {
                    tracing::error!(%remote_addr, error = %join_err, "connection task panicked");
                }
            }
        });
    }
}
