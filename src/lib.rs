//! `tracker-ingest` is a telemetry ingest server for GPS/IoT trackers that
//! speak a Teltonika-style binary AVL protocol over long-lived TCP
//! connections. For each device it performs an IMEI handshake, decodes
//! streamed AVL frames, issues in-band text commands to enrich device
//! metadata (firmware version, SIM identifier), deduplicates state against
//! Redis, and forwards normalized tracking and lifecycle events to an
//! upstream proxy as newline-delimited JSON.
//!
//! The modules mirror the protocol's layering, bottom-up:
//!
//! - [`frame`] — extracts length-prefixed frames from the byte stream.
//! - [`avl`] — decodes telemetry records and their packed I/O groups.
//! - [`command`] — builds/parses the in-band text-command channel.
//! - [`store`] — the shared key/value adapter (Redis-backed).
//! - [`scheduler`] — enrichment-command rate limiting, as a pure predicate.
//! - [`connection`] — the per-socket state machine tying the above together.
//! - [`normalize`] — change detection, classification and message shaping.
//! - [`upstream`] — the persistent outbound link to the telemetry proxy.

pub mod avl;
pub mod command;
pub mod config;
pub mod connection;
pub mod crc;
pub mod error;
pub mod frame;
pub mod logging;
pub mod message;
pub mod metrics;
pub mod normalize;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod upstream;
