//! C7 — Upstream Link.
//!
//! A single long-lived outbound connection to the telemetry proxy, almost a
//! direct port of `link/client.go`'s `connectLoop`/`setConn`/`clearConn`/
//! `sendNDJSON`. Every connection task shares one [`UpstreamLink`] handle;
//! rather than guard one shared writer with a lock held across socket I/O,
//! sends hand a line to a channel and a single background task owns the
//! socket and does all the writing, the same split the sinyalist backend
//! uses for its persistence worker. The one deliberate behavior change from
//! the original: lifecycle messages (`device_connect`/`device_update`) are
//! buffered across a disconnect and flushed on reconnect instead of being
//! dropped, per `spec.md` §4.7.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};

const DIAL_RETRY_DELAY: Duration = Duration::from_secs(5);
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// One line queued for the link task. Tracking lines are fire-and-forget;
/// lifecycle lines are buffered across a disconnect.
enum OutMsg {
    Tracking(String),
    Lifecycle(String),
}

/// Shared handle to the upstream connection. Cheap to clone; every
/// connection task sends through the same channel.
#[derive(Clone)]
pub struct UpstreamLink {
    /// `None` when `PROXY_ADDR` is unset: the link is disabled and every
    /// send call is a no-op, matching the original's `proxyAddr == ""`
    /// short-circuit.
    proxy_addr: Option<String>,
    tx: Option<mpsc::UnboundedSender<OutMsg>>,
    /// Handed off to the background task the first time `spawn` runs; `None`
    /// afterwards. Only ever touched outside of socket I/O.
    rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<OutMsg>>>>,
}

impl UpstreamLink {
    pub fn new(proxy_addr: String) -> Self {
        let proxy_addr = if proxy_addr.is_empty() {
            None
        } else {
            Some(proxy_addr)
        };
        let (tx, rx) = match &proxy_addr {
            Some(_) => {
                let (tx, rx) = mpsc::unbounded_channel();
                (Some(tx), Some(rx))
            }
            None => (None, None),
        };
        UpstreamLink {
            proxy_addr,
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Spawns the background link task. No-op when the link is disabled.
    pub fn spawn(&self) {
        let Some(addr) = self.proxy_addr.clone() else {
            tracing::info!(component = "link", "disabled (no proxy address configured)");
            return;
        };
        let rx_slot = self.rx.clone();
        tokio::spawn(async move {
            let rx = rx_slot.lock().await.take();
            if let Some(rx) = rx {
                run_link(addr, rx).await;
            }
        });
    }

    /// Fire-and-forget send: dropped silently if the link is disabled or the
    /// channel has no receiver left. Never buffered across a disconnect.
    pub async fn send_tracking(&self, msg: &impl Serialize) {
        let Some(tx) = &self.tx else {
            return;
        };
        let Ok(line) = to_ndjson_line(msg) else {
            return;
        };
        let _ = tx.send(OutMsg::Tracking(line));
    }

    /// Buffered send: queued for the link task, which buffers it locally
    /// when disconnected and flushes in order on the next successful
    /// connect.
    pub async fn send_lifecycle(&self, msg: &impl Serialize) {
        let Some(tx) = &self.tx else {
            return;
        };
        let Ok(line) = to_ndjson_line(msg) else {
            return;
        };
        let _ = tx.send(OutMsg::Lifecycle(line));
    }
}

/// Owns the proxy socket for the whole process's lifetime. Dial, reconnect,
/// and the pending-lifecycle buffer all live here, touched only by this
/// task — no lock is ever held across a socket read or write.
async fn run_link(addr: String, mut rx: mpsc::UnboundedReceiver<OutMsg>) {
    let mut pending: Vec<String> = Vec::new();

    loop {
        let stream = match TcpStream::connect(&addr).await {
            Ok(stream) => stream,
            Err(err) => {
                tracing::error!(component = "link", addr, %err, "dial failed");
                tokio::time::sleep(DIAL_RETRY_DELAY).await;
                continue;
            }
        };
        let remote = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        tracing::info!(component = "link", remote, "connected");
        let (read_half, mut write_half) = stream.into_split();

        if !flush_pending(&mut write_half, &mut pending).await {
            tokio::time::sleep(RECONNECT_DELAY).await;
            continue;
        }

        if !serve_until_disconnected(&mut write_half, read_half, &mut rx, &mut pending).await {
            return;
        }
        tracing::warn!(component = "link", "connection closed, reconnecting");
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

/// Writes every buffered lifecycle line. Returns `false` (leaving the
/// unsent remainder in `pending`) on the first write failure.
async fn flush_pending(write_half: &mut OwnedWriteHalf, pending: &mut Vec<String>) -> bool {
    let queued = std::mem::take(pending);
    for line in queued {
        if write_half.write_all(line.as_bytes()).await.is_err() {
            pending.push(line);
            return false;
        }
    }
    true
}

/// Drains outgoing messages and incoming lines until the socket closes or
/// errors. Returns `false` once every sender has dropped (process shutting
/// down), `true` when the connection needs to be redialed.
async fn serve_until_disconnected(
    write_half: &mut OwnedWriteHalf,
    read_half: tokio::net::tcp::OwnedReadHalf,
    rx: &mut mpsc::UnboundedReceiver<OutMsg>,
    pending: &mut Vec<String>,
) -> bool {
    let mut lines = BufReader::new(read_half).lines();
    loop {
        tokio::select! {
            msg = rx.recv() => {
                match msg {
                    Some(OutMsg::Tracking(line)) => {
                        if write_half.write_all(line.as_bytes()).await.is_err() {
                            return true;
                        }
                    }
                    Some(OutMsg::Lifecycle(line)) => {
                        if write_half.write_all(line.as_bytes()).await.is_err() {
                            pending.push(line);
                            return true;
                        }
                    }
                    None => return false,
                }
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(text)) => tracing::info!(component = "link", line = text, "incoming line"),
                    Ok(None) => return true,
                    Err(err) => {
                        tracing::warn!(component = "link", %err, "read error");
                        return true;
                    }
                }
            }
        }
    }
}

fn to_ndjson_line(msg: &impl Serialize) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(msg)?;
    line.push('\n');
    Ok(line)
}
