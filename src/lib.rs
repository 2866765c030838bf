//! Microscope control agent and remote signaling bridge.
//!
//! The crate wraps a concrete microscope behind a uniform asynchronous
//! contract ([`hardware::MicroscopeHardware`]), runs it as a single-writer
//! command loop ([`hardware::agent::MicroscopeAgent`]) and optionally exposes
//! it over gRPC ([`net`]) so remote controllers are indistinguishable from
//! local ones.

pub mod agent;
pub mod config;
pub mod error;
pub mod hardware;
pub mod net;
pub mod signals;

/// Initializes the global tracing subscriber from `RUST_LOG`, defaulting to
/// `info` for this crate and `warn` for the transport stack.
///
/// Safe to call repeatedly; installing over an existing subscriber is a
/// no-op, so tests may share it.
pub fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("rust_scope=info,tonic=warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init();
}
