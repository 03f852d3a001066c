//! Crate-wide error taxonomy.
//!
//! Mirrors `gpsd_proto::GpsdError`'s shape (a flat enum with `From` impls for
//! the foreign error types it wraps) but covers the larger taxonomy this
//! server needs: decode errors, transport errors, store errors and rate
//! limiting.

use thiserror::Error;

/// Errors that can occur while decoding, transporting or storing telemetry.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Truncated read, bad preamble alignment, declared-length vs buffer
    /// mismatch, unexpected codec byte, `n2 != n1`, or an X-bytes length
    /// that exceeds the buffer.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// CRC-16/IBM mismatch on a command response or AVL payload.
    #[error("integrity check failed")]
    IntegrityFailed,

    /// The text-command parser was called on a frame that wasn't a codec
    /// `0x0C` response.
    #[error("not a command response frame")]
    NotCommandResponse,

    /// Socket read/write failure, or a dial failure against the upstream.
    #[error("transport error: {0}")]
    TransportError(#[from] std::io::Error),

    /// The shared key/value store is unreachable or returned an error.
    #[error("store error: {0}")]
    StoreError(#[from] redis::RedisError),

    /// A command was suppressed by the session, interval or daily-budget
    /// rule.
    #[error("rate limited: {0}")]
    RateLimited(&'static str),
}

pub type Result<T> = std::result::Result<T, IngestError>;
