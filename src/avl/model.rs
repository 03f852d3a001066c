//! Data model for a decoded AVL packet.
//!
//! `IoValue` replaces the dynamic identifier-to-untyped-value map the
//! original server used with a tagged variant, per `spec.md` §9: the
//! decoder emits the variant directly, so no runtime reflection is needed
//! to pull a numeric value back out downstream.

use std::collections::BTreeMap;

/// One I/O element's value, tagged by the wire width it was decoded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoValue {
    U1(u8),
    U2(u16),
    U4(u32),
    U8(u64),
    /// Variable-length opaque payload (X-byte group). Never feeds the
    /// permanent-I/O snapshot; carried through for future consumers.
    X(Vec<u8>),
}

impl IoValue {
    /// The value as an unsigned 64-bit integer, for the numeric variants
    /// only. `None` for `X`.
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            IoValue::U1(v) => Some(v as u64),
            IoValue::U2(v) => Some(v as u64),
            IoValue::U4(v) => Some(v as u64),
            IoValue::U8(v) => Some(v),
            IoValue::X(_) => None,
        }
    }
}

/// GPS fix as carried on the wire: raw integer fields, not yet validity
/// checked (see `normalize::has_valid_fix`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpsFix {
    /// Degrees * 10^7.
    pub longitude_e7: i32,
    /// Degrees * 10^7.
    pub latitude_e7: i32,
    pub altitude_m: u16,
    pub heading_deg: u16,
    pub satellites: u8,
    pub speed_kmh: u16,
}

impl GpsFix {
    pub fn latitude(&self) -> f64 {
        self.latitude_e7 as f64 / 10_000_000.0
    }

    pub fn longitude(&self) -> f64 {
        self.longitude_e7 as f64 / 10_000_000.0
    }
}

/// One telemetry sample.
#[derive(Debug, Clone, PartialEq)]
pub struct AvlRecord {
    /// Milliseconds since Unix epoch.
    pub timestamp_ms: u64,
    pub priority: u8,
    pub gps: GpsFix,
    pub event_io_id: u16,
    pub io_count_declared: u16,
    /// Keyed by I/O identifier; last write wins if the wire repeats a key.
    pub io: BTreeMap<u16, IoValue>,
}

/// The codec identifier selecting wire widths for the I/O section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    /// `0x08` — 1-byte group counts and identifiers.
    Basic,
    /// `0x8E` — 2-byte group counts and identifiers.
    Extended,
}

impl Codec {
    pub fn from_byte(b: u8) -> Option<Codec> {
        match b {
            0x08 => Some(Codec::Basic),
            0x8E => Some(Codec::Extended),
            _ => None,
        }
    }
}

/// A decoded AVL packet: one or more records sharing a codec.
#[derive(Debug, Clone, PartialEq)]
pub struct AvlPacket {
    pub codec: Codec,
    pub records: Vec<AvlRecord>,
}
