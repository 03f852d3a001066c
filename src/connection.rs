//! C5 — Connection State Machine.
//!
//! One task per accepted TCP connection (`spec.md` §5), generalized from
//! the teacher's single persistent client loop to "one task per connection"
//! and filled in with the handshake/dispatch/command-scheduling behavior
//! `spec.md` §4.5 specifies — the original's `tcp.Start` callback
//! (`cmd/server/main.go`) left this part as a stub.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::avl::decode::decode_avl_frame;
use crate::command::codec as cmdcodec;
use crate::command::interpret;
use crate::config::Config;
use crate::error::IngestError;
use crate::frame::{try_read_frame, try_read_handshake, Frame};
use crate::message::{DeviceConnect, DeviceUpdate};
use crate::metrics::Metrics;
use crate::normalize::Pipeline;
use crate::scheduler::{self, CommandSpec, CommandState, GETVER};
use crate::store::Store;
use crate::upstream::UpstreamLink;

const HANDSHAKE_REJECT_BYTE: u8 = 0x00;
const HANDSHAKE_ACCEPT_BYTE: u8 = 0x01;
const READ_CHUNK_SIZE: usize = 4096;

const CODEC_AVL_BASIC: u8 = 0x08;
const CODEC_AVL_EXTENDED: u8 = 0x8E;
const CODEC_COMMAND: u8 = 0x0C;

/// Per-connection state, alive only for the socket's lifetime.
struct Session {
    imei: String,
    fw_ver: String,
    model: String,
    iccid: String,
    command_state: HashMap<&'static str, CommandState>,
    pipeline: Pipeline,
    acked_once: bool,
}

impl Session {
    fn state_for(&mut self, name: &'static str) -> &mut CommandState {
        self.command_state.entry(name).or_default()
    }
}

/// Drives one accepted connection through handshake, dispatch and command
/// scheduling until the socket closes.
pub async fn handle(
    mut stream: TcpStream,
    remote_addr: SocketAddr,
    store: Arc<dyn Store>,
    upstream: UpstreamLink,
    config: Arc<Config>,
    metrics: Arc<Metrics>,
) {
    let mut buf: Vec<u8> = Vec::new();

    let imei = match await_handshake(&mut stream, &mut buf).await {
        Ok(imei) => imei,
        Err(err) => {
            tracing::warn!(%err, %remote_addr, "handshake failed");
            return;
        }
    };

    metrics.successful_handshakes.fetch_add(1, Ordering::Relaxed);
    tracing::info!(imei, %remote_addr, "handshake accepted");

    let mut session = Session {
        fw_ver: store.get_string(&format!("dev:{imei}:fw")).await,
        model: store.get_string(&format!("dev:{imei}:model")).await,
        iccid: store.get_string(&format!("dev:{imei}:iccid")).await,
        imei,
        command_state: HashMap::new(),
        pipeline: Pipeline::new(),
        acked_once: false,
    };

    upstream
        .send_lifecycle(&DeviceConnect {
            device_connect: true,
            imei: session.imei.clone(),
            fw_ver: session.fw_ver.clone(),
            model: session.model.clone(),
            iccid: session.iccid.clone(),
            remote_ip: remote_addr.ip().to_string(),
            remote_port: Some(remote_addr.port()),
        })
        .await;

    run_ready_loop(
        &mut stream,
        &mut buf,
        &store,
        &upstream,
        &metrics,
        &config,
        &mut session,
    )
    .await;

    tracing::info!(imei = session.imei, %remote_addr, "connection closed");
}

/// Reads until a valid handshake is parsed, writing the accept/reject byte
/// as soon as the outcome is known.
async fn await_handshake(stream: &mut TcpStream, buf: &mut Vec<u8>) -> Result<String, String> {
    loop {
        if let Some(result) = try_read_handshake(buf) {
            return match result {
                Ok(imei) => {
                    stream
                        .write_all(&[HANDSHAKE_ACCEPT_BYTE])
                        .await
                        .map_err(|e| e.to_string())?;
                    Ok(imei)
                }
                Err(reason) => {
                    let _ = stream.write_all(&[HANDSHAKE_REJECT_BYTE]).await;
                    Err(reason.to_string())
                }
            };
        }
        read_more(stream, buf).await.map_err(|e| e.to_string())?;
    }
}

async fn read_more(stream: &mut TcpStream, buf: &mut Vec<u8>) -> std::io::Result<()> {
    let mut chunk = [0u8; READ_CHUNK_SIZE];
    let n = stream.read(&mut chunk).await?;
    if n == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed",
        ));
    }
    buf.extend_from_slice(&chunk[..n]);
    Ok(())
}

async fn run_ready_loop(
    stream: &mut TcpStream,
    buf: &mut Vec<u8>,
    store: &Arc<dyn Store>,
    upstream: &UpstreamLink,
    metrics: &Arc<Metrics>,
    config: &Arc<Config>,
    session: &mut Session,
) {
    loop {
        while let Some(frame) = try_read_frame(buf) {
            dispatch_frame(stream, &frame, store, upstream, metrics, config, session).await;
        }
        if let Err(err) = read_more(stream, buf).await {
            tracing::info!(imei = session.imei, %err, "socket closed");
            return;
        }
    }
}

async fn dispatch_frame(
    stream: &mut TcpStream,
    frame: &Frame,
    store: &Arc<dyn Store>,
    upstream: &UpstreamLink,
    metrics: &Arc<Metrics>,
    config: &Arc<Config>,
    session: &mut Session,
) {
    match frame.codec_byte() {
        Some(CODEC_AVL_BASIC) | Some(CODEC_AVL_EXTENDED) => {
            handle_avl_frame(stream, frame, store, upstream, metrics, config, session).await
        }
        Some(CODEC_COMMAND) => handle_command_frame(frame, store, upstream, metrics, session).await,
        Some(other) => tracing::debug!(imei = session.imei, codec = other, "unhandled codec, ignoring"),
        None => tracing::debug!(imei = session.imei, "empty frame payload, ignoring"),
    }
}

async fn handle_avl_frame(
    stream: &mut TcpStream,
    frame: &Frame,
    store: &Arc<dyn Store>,
    upstream: &UpstreamLink,
    metrics: &Arc<Metrics>,
    config: &Arc<Config>,
    session: &mut Session,
) {
    let decode_started = Instant::now();
    let packet = match decode_avl_frame(frame) {
        Ok(packet) => packet,
        Err(err) => {
            metrics.parse_errors.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(imei = session.imei, %err, "dropping malformed AVL frame");
            return;
        }
    };
    metrics.record_decode_latency(decode_started.elapsed());
    metrics.packets_received.fetch_add(1, Ordering::Relaxed);

    let n1 = packet.records.len() as u32;
    if let Err(err) = stream.write_all(&n1.to_be_bytes()).await {
        tracing::warn!(imei = session.imei, %err, "failed to write AVL ack");
        return;
    }
    session.acked_once = true;
    metrics.records_acknowledged.fetch_add(n1 as u64, Ordering::Relaxed);

    for record in &packet.records {
        match session
            .pipeline
            .process(
                store.as_ref(),
                &session.imei,
                record,
                packet.records.len(),
                &session.model,
                &session.fw_ver,
                metrics,
            )
            .await
        {
            Ok((tracking, new_iccid)) => {
                upstream.send_tracking(&tracking).await;
                if let Some(iccid) = new_iccid {
                    session.iccid = iccid;
                    emit_device_update(upstream, session).await;
                }
            }
            Err(err) => {
                metrics.store_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(imei = session.imei, %err, "normalization pipeline failed");
            }
        }
    }

    try_schedule_enrichment(stream, store, config, session).await;
}

async fn handle_command_frame(
    frame: &Frame,
    store: &Arc<dyn Store>,
    upstream: &UpstreamLink,
    metrics: &Arc<Metrics>,
    session: &mut Session,
) {
    let text = match cmdcodec::parse(frame) {
        Ok(text) => text,
        Err(err) => {
            metrics.parse_errors.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(imei = session.imei, %err, "dropping malformed command response");
            return;
        }
    };

    let lower = text.to_lowercase();
    let mut changed = false;

    if lower.contains("ver:") || lower.contains("hw:") {
        let info = interpret::parse_getver(&text);
        store
            .set_string(&format!("dev:{}:getver_raw", session.imei), &text, 0)
            .await
            .ok();
        if !info.firmware.is_empty() && info.firmware != session.fw_ver {
            store
                .set_string(&format!("dev:{}:fw", session.imei), &info.firmware, 0)
                .await
                .ok();
            session.fw_ver = info.firmware;
            changed = true;
        }
        if !info.model.is_empty() && info.model != session.model {
            store
                .set_string(&format!("dev:{}:model", session.imei), &info.model, 0)
                .await
                .ok();
            session.model = info.model;
            changed = true;
        }
    } else if lower.contains("iccid") {
        if let Some(iccid) = interpret::parse_iccid_text(&text) {
            if iccid != session.iccid {
                store
                    .set_string(&format!("dev:{}:iccid", session.imei), &iccid, 0)
                    .await
                    .ok();
                session.iccid = iccid;
                changed = true;
            }
        }
    } else if lower.contains("param values") {
        if let Some(iccid) = interpret::parse_iccid_packed(&text) {
            if iccid != session.iccid {
                store
                    .set_string(&format!("dev:{}:iccid", session.imei), &iccid, 0)
                    .await
                    .ok();
                session.iccid = iccid;
                changed = true;
            }
        }
    }

    if changed {
        emit_device_update(upstream, session).await;
    }
}

async fn emit_device_update(upstream: &UpstreamLink, session: &Session) {
    upstream
        .send_lifecycle(&DeviceUpdate {
            device_update: true,
            imei: session.imei.clone(),
            fw_ver: session.fw_ver.clone(),
            model: session.model.clone(),
            iccid: session.iccid.clone(),
        })
        .await;
}

/// Runs after the first AVL ack of the session (`spec.md` §4.5/§5: the
/// device never sees a command before its data has been acknowledged).
/// `GETVER_ON_HANDSHAKE` gates only whether `getver` itself is attempted;
/// it never moves this earlier than the first ack.
async fn try_schedule_enrichment(
    stream: &mut TcpStream,
    store: &Arc<dyn Store>,
    config: &Arc<Config>,
    session: &mut Session,
) {
    if !session.acked_once {
        return;
    }
    if config.getver_on_handshake {
        let needed = session_needs_getver(session);
        try_schedule_one(stream, store, session, GETVER, needed).await;
    }

    // The SIM command is only meaningful once the model is known or a
    // getver attempt has already been made this session; otherwise wait.
    let getver_attempted = session
        .command_state
        .get(GETVER.name)
        .map(|s| s.session_count > 0)
        .unwrap_or(false);
    if session.model.is_empty() && !getver_attempted {
        return;
    }
    let sim_spec = scheduler::sim_command_for_model(&session.model);
    let needed = session.iccid.is_empty();
    try_schedule_one(stream, store, session, sim_spec, needed).await;
}

fn session_needs_getver(session: &Session) -> bool {
    session.fw_ver.is_empty() || session.model.is_empty()
}

/// Turns a suppression reason into the `RateLimited` taxonomy entry for
/// logging, the same role the original's silent `TrySchedule` return gets
/// replaced with per `spec.md` §7.
fn log_suppressed(imei: &str, cmd: &'static str, reason: scheduler::Suppressed) {
    let detail = match reason {
        scheduler::Suppressed::NotNeeded => "not needed",
        scheduler::Suppressed::SessionLimitReached => "session limit reached",
        scheduler::Suppressed::TooSoon => "retry interval not elapsed",
        scheduler::Suppressed::DailyBudgetExhausted => "daily budget exhausted",
    };
    let err = IngestError::RateLimited(detail);
    tracing::debug!(imei, cmd, %err, "command suppressed");
}

/// Evaluates `should_send` and, if allowed, writes the command frame and
/// updates per-session attempt state. `needed` is computed by the caller
/// against pre-call session state, since it may change once the command
/// itself runs.
async fn try_schedule_one(
    stream: &mut TcpStream,
    store: &Arc<dyn Store>,
    session: &mut Session,
    spec: CommandSpec,
    needed: bool,
) {
    let now = Instant::now();
    let state = *session.state_for(spec.name);

    // Needed/session/interval are checked before touching the daily
    // counter so a locally-denied attempt never costs budget.
    if let Err(reason) = scheduler::should_send(&spec, &state, now, needed, true) {
        log_suppressed(&session.imei, spec.name, reason);
        return;
    }

    let (allowed, _daily_count) = match store.incr_daily_counter(&session.imei, spec.name, spec.daily_limit).await
    {
        Ok(result) => result,
        Err(err) => {
            tracing::warn!(imei = session.imei, cmd = spec.name, %err, "daily counter increment failed");
            return;
        }
    };
    if let Err(reason) = scheduler::should_send(&spec, &state, now, needed, allowed) {
        log_suppressed(&session.imei, spec.name, reason);
        return;
    }

    let frame = cmdcodec::build(spec.wire_text);
    if let Err(err) = stream.write_all(&frame).await {
        tracing::error!(imei = session.imei, cmd = spec.name, %err, "command send failed");
        return;
    }

    let state = session.state_for(spec.name);
    state.session_count += 1;
    state.last_attempt = Some(now);
    tracing::info!(
        imei = session.imei,
        cmd = spec.name,
        session = state.session_count,
        "command sent"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;
    use std::sync::Mutex as StdMutex;

    use tokio::net::TcpListener;
    use tokio::time::{timeout, Duration as TestDuration};

    use crate::crc::crc16_ibm;
    use crate::error::Result;

    /// In-memory stand-in for `RedisStore`, good enough to drive
    /// `connection::handle` end to end without a real Redis instance.
    #[derive(Default)]
    struct FakeStore {
        strings: StdMutex<StdHashMap<String, String>>,
        hashes: StdMutex<StdHashMap<String, StdHashMap<String, u64>>>,
        daily: StdMutex<StdHashMap<String, u64>>,
    }

    #[async_trait::async_trait]
    impl Store for FakeStore {
        async fn get_string(&self, key: &str) -> String {
            self.strings.lock().unwrap().get(key).cloned().unwrap_or_default()
        }

        async fn set_string(&self, key: &str, value: &str, _ttl_secs: i64) -> Result<()> {
            self.strings
                .lock()
                .unwrap()
                .insert(key.to_string(), value.to_string());
            Ok(())
        }

        async fn hash_set(&self, key: &str, field: &str, value: u64) -> Result<()> {
            self.hashes
                .lock()
                .unwrap()
                .entry(key.to_string())
                .or_default()
                .insert(field.to_string(), value);
            Ok(())
        }

        async fn hash_get_all(&self, key: &str) -> Result<StdHashMap<String, u64>> {
            Ok(self.hashes.lock().unwrap().get(key).cloned().unwrap_or_default())
        }

        async fn mget(&self, _keys: &[String]) -> Result<StdHashMap<String, i64>> {
            Ok(StdHashMap::new())
        }

        async fn incr_daily_counter(&self, imei: &str, command: &str, max: u64) -> Result<(bool, u64)> {
            let mut daily = self.daily.lock().unwrap();
            let count = daily.entry(format!("{imei}:{command}")).or_insert(0);
            *count += 1;
            Ok((*count <= max, *count))
        }
    }

    fn hex_bytes(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    fn handshake_frame(imei: &str) -> Vec<u8> {
        let mut buf = (imei.len() as u16).to_be_bytes().to_vec();
        buf.extend_from_slice(imei.as_bytes());
        buf
    }

    fn avl_frame_hex(hex: &str) -> Vec<u8> {
        let payload = hex_bytes(hex);
        let crc = crc16_ibm(&payload);
        let mut out = vec![0, 0, 0, 0];
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&payload);
        out.extend_from_slice(&[0, 0, (crc >> 8) as u8, (crc & 0xFF) as u8]);
        out
    }

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            tcp_port: 0,
            metrics_port: 0,
            redis_addr: String::new(),
            proxy_addr: String::new(),
            getver_on_handshake: true,
        })
    }

    #[tokio::test]
    async fn enrichment_command_is_never_sent_before_the_first_avl_ack() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let store: Arc<dyn Store> = Arc::new(FakeStore::default());
        let upstream = crate::upstream::UpstreamLink::new(String::new());
        let config = test_config();
        let metrics = Metrics::new();

        let server_task = tokio::spawn(async move {
            let (stream, remote_addr) = listener.accept().await.unwrap();
            handle(stream, remote_addr, store, upstream, config, metrics).await;
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(&handshake_frame("356307042441013"))
            .await
            .unwrap();

        let mut accept_byte = [0u8; 1];
        client.read_exact(&mut accept_byte).await.unwrap();
        assert_eq!(accept_byte[0], HANDSHAKE_ACCEPT_BYTE);

        // Nothing should arrive before the device's first AVL frame is acked
        // — this is the ordering the premature `try_schedule_getver` call
        // used to violate.
        let mut probe = [0u8; 16];
        let premature = timeout(TestDuration::from_millis(100), client.read(&mut probe)).await;
        assert!(
            premature.is_err(),
            "data arrived on the wire before any AVL frame had been sent"
        );

        let avl = avl_frame_hex(
            "08010000016b40d8ea3001000000000000000000000000070000010101ef010000000001",
        );
        client.write_all(&avl).await.unwrap();

        let mut ack = [0u8; 4];
        client.read_exact(&mut ack).await.unwrap();
        assert_eq!(u32::from_be_bytes(ack), 1);

        let mut enrichment = [0u8; 256];
        let n = timeout(TestDuration::from_millis(500), client.read(&mut enrichment))
            .await
            .expect("enrichment command never arrived after the ack")
            .unwrap();
        assert!(n >= 8, "expected at least one framed command, got {n} bytes");
        assert_eq!(&enrichment[0..4], &[0, 0, 0, 0]);
        let text = String::from_utf8_lossy(&enrichment[..n]);
        assert!(
            text.contains("getver"),
            "expected a getver command frame, got {text:?}"
        );

        drop(client);
        let _ = server_task.await;
    }
}
