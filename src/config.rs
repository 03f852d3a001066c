//! Process configuration, loaded from environment variables.
//!
//! Mirrors `config.Load()`/`getEnv` from the original server: every field
//! falls back to a documented default when its variable is unset or empty.

use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub tcp_port: u16,
    pub metrics_port: u16,
    pub redis_addr: String,
    pub proxy_addr: String,
    pub getver_on_handshake: bool,
}

impl Config {
    pub fn from_env() -> Self {
        Config {
            tcp_port: get_env("TCP_PORT", "8001").parse().unwrap_or(8001),
            metrics_port: get_env("METRICS_PORT", "9000").parse().unwrap_or(9000),
            redis_addr: get_env("REDIS_ADDR", "localhost:6379"),
            proxy_addr: get_env("PROXY_ADDR", "201.122.135.23:6100"),
            getver_on_handshake: get_env("GETVER_ON_HANDSHAKE", "1") != "0",
        }
    }
}

fn get_env(key: &str, fallback: &str) -> String {
    match env::var(key) {
        Ok(val) if !val.is_empty() => val,
        _ => fallback.to_string(),
    }
}
