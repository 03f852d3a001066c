//! NDJSON payload shapes sent to the upstream proxy.
//!
//! Reshapes the original's `deviceConnectPayload`/`deviceUpdatePayload`
//! (`link/client.go`) and `TrackingObject` (`pipeline/processor.go`) into
//! the exact JSON this server emits: `perm_io` grouped into magnitude
//! buckets rather than one flat map, per `spec.md` §6/§9.

use std::collections::BTreeMap;

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct DeviceConnect {
    pub device_connect: bool,
    pub imei: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub fw_ver: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub model: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub iccid: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub remote_ip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceUpdate {
    pub device_update: bool,
    pub imei: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub fw_ver: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub model: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub iccid: String,
}

/// I/O values grouped by magnitude; empty buckets are omitted entirely
/// rather than serialized as `{}` (see [`PermIo::from_snapshot`]).
#[derive(Debug, Clone, Default, Serialize)]
pub struct PermIo {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub n1: BTreeMap<String, u64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub n2: BTreeMap<String, u64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub n4: BTreeMap<String, u64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub n8: BTreeMap<String, u64>,
}

impl PermIo {
    /// Buckets a flat snapshot (I/O id -> value) by value magnitude: `<=
    /// 0xFF` -> `n1`, `<= 0xFFFF` -> `n2`, `<= 0xFFFFFFFF` -> `n4`, else
    /// `n8`. Grouping follows the magnitude of the *value*, not the wire
    /// width the element was originally decoded from (`spec.md` §9).
    pub fn from_snapshot(snapshot: &BTreeMap<u16, u64>) -> Self {
        let mut out = PermIo::default();
        for (&id, &value) in snapshot {
            let key = id.to_string();
            if value <= u64::from(u8::MAX) {
                out.n1.insert(key, value);
            } else if value <= u64::from(u16::MAX) {
                out.n2.insert(key, value);
            } else if value <= u64::from(u32::MAX) {
                out.n4.insert(key, value);
            } else {
                out.n8.insert(key, value);
            }
        }
        out
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Tracking {
    pub imei: String,
    pub dt: String,
    pub lat: f64,
    pub lon: f64,
    pub spd: u16,
    pub crs: u16,
    pub sats: u8,
    pub perm_io: PermIo,
    pub msg_type: u8,
    pub fix: u8,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub model: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub fw_ver: String,
}
