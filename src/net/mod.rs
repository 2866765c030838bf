//! Remote signaling bridge.
//!
//! Exposes a local [`crate::hardware::MicroscopeHardware`] over gRPC
//! ([`server`]) and re-implements the same contract on top of a gRPC channel
//! ([`client`]), so controllers cannot tell a remote microscope from a local
//! one. [`proto`] holds the generated bindings and the conversions between
//! wire messages and the domain model.

pub mod client;
pub mod proto;
pub mod server;
