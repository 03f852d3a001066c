//! C6 — Normalization Pipeline.
//!
//! Turns one decoded [`AvlRecord`] into a [`Tracking`] message, the same
//! shape of work `codec8.go`'s `ProcessIOState` did for a hardcoded set of
//! named I/O fields — generalized here to the full snapshot of arbitrary
//! I/O identifiers, per `spec.md` §4.6.

use std::collections::BTreeMap;

use chrono::{TimeZone, Utc};

use crate::avl::model::{AvlRecord, GpsFix, IoValue};
use crate::command::interpret::{decode_iccid_parts, MIN_ICCID_LEN};
use crate::error::Result;
use crate::message::{PermIo, Tracking};
use crate::metrics::Metrics;
use crate::store::Store;

/// A record is considered stale (classified `msg_type = 0`, "buffer")
/// once it's older than this.
const LIVE_WINDOW_SECS: i64 = 120;

/// Minimum satellite count for a fix to be considered valid.
const MIN_SATELLITES_FOR_FIX: u8 = 3;

/// Whether a GPS block represents a usable fix: more than
/// [`MIN_SATELLITES_FOR_FIX`] satellites, not the all-zero "no fix"
/// coordinate, and coordinates within their valid ranges.
pub fn has_valid_fix(gps: &GpsFix) -> bool {
    if gps.satellites <= MIN_SATELLITES_FOR_FIX {
        return false;
    }
    let lat = gps.latitude();
    let lon = gps.longitude();
    if lat == 0.0 && lon == 0.0 {
        return false;
    }
    (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon)
}

/// `msg_type = 1` ("live") unless the packet is a batch (`batch_size > 1`)
/// or the record is older than [`LIVE_WINDOW_SECS`].
pub fn classify_msg_type(batch_size: usize, timestamp_ms: u64, now: chrono::DateTime<Utc>) -> u8 {
    if batch_size > 1 {
        return 0;
    }
    let record_time = Utc.timestamp_millis_opt(timestamp_ms as i64).single();
    match record_time {
        Some(ts) if (now - ts).num_seconds() <= LIVE_WINDOW_SECS => 1,
        Some(_) => 0,
        // An unparseable timestamp can't be judged fresh.
        None => 0,
    }
}

/// Per-connection, per-IMEI cache of the last value written for each I/O
/// identifier. Owned and mutated only by the connection task that holds the
/// socket (`spec.md` §5's single-writer rule), so no locking is needed here.
#[derive(Debug, Default)]
pub struct Pipeline {
    last_known_io: BTreeMap<u16, u64>,
}

impl Pipeline {
    pub fn new() -> Self {
        Pipeline::default()
    }

    /// Runs steps 1-7 of the normalization pipeline for one record and
    /// returns the tracking message to emit, plus a freshly-accepted SIM
    /// identifier if the record's inline 219/220/221 I/O decoded to one.
    pub async fn process(
        &mut self,
        store: &dyn Store,
        imei: &str,
        record: &AvlRecord,
        batch_size: usize,
        model: &str,
        fw_ver: &str,
        metrics: &Metrics,
    ) -> Result<(Tracking, Option<String>)> {
        self.update_snapshot(store, imei, record, metrics).await?;
        let new_iccid = self.opportunistic_iccid(store, imei, record).await?;

        // A store error here still emits the record, just with an empty
        // perm_io rather than dropping the GPS fix entirely.
        let snapshot = self.read_snapshot(store, imei).await.unwrap_or_else(|err| {
            metrics
                .store_errors
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            tracing::warn!(imei, %err, "snapshot read failed, emitting empty perm_io");
            BTreeMap::new()
        });

        let now = Utc::now();
        let msg_type = classify_msg_type(batch_size, record.timestamp_ms, now);
        let fix = u8::from(has_valid_fix(&record.gps));

        let tracking = Tracking {
            imei: imei.to_string(),
            dt: Utc
                .timestamp_millis_opt(record.timestamp_ms as i64)
                .single()
                .unwrap_or(now)
                .to_rfc3339(),
            lat: record.gps.latitude(),
            lon: record.gps.longitude(),
            spd: record.gps.speed_kmh,
            crs: record.gps.heading_deg,
            sats: record.gps.satellites,
            perm_io: PermIo::from_snapshot(&snapshot),
            msg_type,
            fix,
            model: model.to_string(),
            fw_ver: fw_ver.to_string(),
        };

        Ok((tracking, new_iccid))
    }

    /// Step 1: writes every numeric I/O element whose value changed since
    /// the last record to the shared hash, skipping unchanged values and
    /// the opaque X-byte variant entirely.
    async fn update_snapshot(
        &mut self,
        store: &dyn Store,
        imei: &str,
        record: &AvlRecord,
        metrics: &Metrics,
    ) -> Result<()> {
        for (&id, value) in &record.io {
            let Some(numeric) = value.as_u64() else {
                continue;
            };
            if self.last_known_io.get(&id) == Some(&numeric) {
                continue;
            }
            store.hash_set(imei, &id.to_string(), numeric).await?;
            self.last_known_io.insert(id, numeric);
            metrics.io_changes.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        Ok(())
    }

    /// Step 2: opportunistically decodes a SIM identifier from inline I/O
    /// keys 219/220/221 when all three arrived on this record, accepting it
    /// only if it meets the usual length/difference rule.
    async fn opportunistic_iccid(
        &self,
        store: &dyn Store,
        imei: &str,
        record: &AvlRecord,
    ) -> Result<Option<String>> {
        let (Some(p219), Some(p220), Some(p221)) = (
            numeric_io(record, 219),
            numeric_io(record, 220),
            numeric_io(record, 221),
        ) else {
            return Ok(None);
        };

        let candidate = decode_iccid_parts(p219, p220, p221);
        if candidate.len() < MIN_ICCID_LEN {
            return Ok(None);
        }

        let key = format!("dev:{imei}:iccid");
        let cached = store.get_string(&key).await;
        if cached == candidate {
            return Ok(None);
        }

        store.set_string(&key, &candidate, 0).await?;
        Ok(Some(candidate))
    }

    /// Step 3: the shared hash is the source of truth for enrichment
    /// fields, independent of which I/Os this particular record carried.
    async fn read_snapshot(&self, store: &dyn Store, imei: &str) -> Result<BTreeMap<u16, u64>> {
        let raw = store.hash_get_all(imei).await?;
        Ok(raw
            .into_iter()
            .filter_map(|(k, v)| k.parse::<u16>().ok().map(|id| (id, v)))
            .collect())
    }
}

fn numeric_io(record: &AvlRecord, id: u16) -> Option<u64> {
    record.io.get(&id).and_then(IoValue::as_u64)
}
