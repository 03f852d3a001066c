//! C3/C4 — the in-band text-command channel: framing codec and response
//! interpreters.

pub mod codec;
pub mod interpret;
