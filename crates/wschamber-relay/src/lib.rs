//! wschamber relay library entry.
//!
//! This crate assembles the relay server stack:
//! - Transport: raw-TCP HTTP Upgrade handshake, per-connection chunked read
//!   loop, frame assembly/validation, and typed frame events.
//! - Relay core: chambers (URL-keyed peer groups), per-receiver output
//!   queues with single-message-in-flight fairness and truncation on
//!   overflow, and the inbound target-header mini-protocol.
//! - Directory: URL prefix + subprotocol + origin gatekeeping, chamber
//!   creation/eviction with capacity limits.
//! - Listener: accept loop, connection registry, graceful drain
//!   (close 1001 to every live peer).
//! - Config: strict YAML schema with CLI overrides.
//! - Observability: dependency-free atomic counters and per-connection
//!   tracing spans.
//!
//! The relay is designed for panic-free operation: hostile traffic surfaces
//! as HTTP error responses or WebSocket close frames instead of crashing
//! the process. This crate is consumed by the binary (`main.rs`) and by the
//! integration tests.

pub mod config;
pub mod obs;
pub mod relay;
pub mod transport;
