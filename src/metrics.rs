//! Metrics endpoint (out of scope per `spec.md` §1, implemented anyway since
//! `main` needs something observable to run).
//!
//! A generalization of `observability/metrics.go`'s `promhttp.Handler()` +
//! healthz handler: counters named in `spec.md` §7, exposed as Prometheus
//! text exposition on `/metrics`, plus `/healthz`. Hand-rolled HTTP/1.0
//! responder rather than a full framework dependency, since this is
//! explicitly outside the core.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

#[derive(Default)]
pub struct Metrics {
    pub accepted_connections: AtomicU64,
    pub successful_handshakes: AtomicU64,
    pub packets_received: AtomicU64,
    pub records_acknowledged: AtomicU64,
    pub parse_errors: AtomicU64,
    pub store_errors: AtomicU64,
    pub io_changes: AtomicU64,
    decode_latency_count: AtomicU64,
    decode_latency_sum_micros: AtomicU64,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Metrics::default())
    }

    pub fn record_decode_latency(&self, elapsed: Duration) {
        self.decode_latency_count.fetch_add(1, Ordering::Relaxed);
        self.decode_latency_sum_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    fn render(&self) -> String {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let count = get(&self.decode_latency_count);
        let sum_secs = get(&self.decode_latency_sum_micros) as f64 / 1_000_000.0;
        format!(
            "# TYPE ingest_accepted_connections_total counter\n\
             ingest_accepted_connections_total {}\n\
             # TYPE ingest_successful_handshakes_total counter\n\
             ingest_successful_handshakes_total {}\n\
             # TYPE ingest_packets_received_total counter\n\
             ingest_packets_received_total {}\n\
             # TYPE ingest_records_acknowledged_total counter\n\
             ingest_records_acknowledged_total {}\n\
             # TYPE ingest_parse_errors_total counter\n\
             ingest_parse_errors_total {}\n\
             # TYPE ingest_store_errors_total counter\n\
             ingest_store_errors_total {}\n\
             # TYPE ingest_io_changes_total counter\n\
             ingest_io_changes_total {}\n\
             # TYPE ingest_decode_latency_seconds histogram\n\
             ingest_decode_latency_seconds_sum {}\n\
             ingest_decode_latency_seconds_count {}\n",
            get(&self.accepted_connections),
            get(&self.successful_handshakes),
            get(&self.packets_received),
            get(&self.records_acknowledged),
            get(&self.parse_errors),
            get(&self.store_errors),
            get(&self.io_changes),
            sum_secs,
            count,
        )
    }
}

/// Serves `/metrics` and `/healthz` on `port` until the process exits.
/// Every other path gets a `404`. Connections are read just far enough to
/// find the request line; bodies and headers are ignored.
pub async fn serve(metrics: Arc<Metrics>, port: u16) -> std::io::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "metrics endpoint listening");
    loop {
        let (mut stream, _) = listener.accept().await?;
        let metrics = metrics.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let n = match stream.read(&mut buf).await {
                Ok(n) => n,
                Err(_) => return,
            };
            let request = String::from_utf8_lossy(&buf[..n]);
            let path = request
                .lines()
                .next()
                .and_then(|line| line.split_whitespace().nth(1))
                .unwrap_or("/");

            let (status, body) = match path {
                "/metrics" => ("200 OK", metrics.render()),
                "/healthz" => ("200 OK", "ok".to_string()),
                _ => ("404 Not Found", String::new()),
            };
            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = stream.write_all(response.as_bytes()).await;
        });
    }
}
