//! Structured JSON logging setup.
//!
//! The ecosystem analogue of the original server's
//! `slog.New(slog.NewJSONHandler(os.Stdout, nil))`: one global subscriber,
//! JSON-formatted, level controlled by `RUST_LOG` (default `info`).

use tracing_subscriber::EnvFilter;

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .try_init();
}
