//! Process bootstrap: load config, init logging, connect the store, start
//! the upstream link, the metrics endpoint and the TCP listener.
//!
//! Mirrors `cmd/server/main.go`'s shape (`config.Load()` ->
//! `observability.NewLogger()` -> `go observability.StartMetricsServer(...)`
//! -> `tcp.Start(...)`), just with explicit tokio tasks instead of bare
//! goroutines.

use std::sync::Arc;

use tracker_ingest::config::Config;
use tracker_ingest::logging;
use tracker_ingest::metrics::{self, Metrics};
use tracker_ingest::server;
use tracker_ingest::store::{RedisStore, Store};
use tracker_ingest::upstream::UpstreamLink;

#[tokio::main]
async fn main() {
    logging::init();

    let config = Arc::new(Config::from_env());
    tracing::info!(port = config.tcp_port, "starting tracker-ingestd");

    let store: Arc<dyn Store> = match RedisStore::connect(&config.redis_addr).await {
        Ok(store) => Arc::new(store),
        Err(err) => {
            tracing::error!(%err, addr = config.redis_addr, "failed to connect to redis");
            std::process::exit(1);
        }
    };

    let upstream = UpstreamLink::new(config.proxy_addr.clone());
    upstream.spawn();

    let metrics = Metrics::new();
    let metrics_port = config.metrics_port;
    let metrics_for_http = metrics.clone();
    tokio::spawn(async move {
        if let Err(err) = metrics::serve(metrics_for_http, metrics_port).await {
            tracing::error!(%err, "metrics endpoint failed");
        }
    });

    if let Err(err) = server::run(config, store, upstream, metrics).await {
        tracing::error!(%err, "tcp server failed");
        std::process::exit(1);
    }
}
