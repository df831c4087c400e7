//! Lightweight in-process metrics (dependency-free).
//!
//! Counters are plain atomics; there is no exposition endpoint (general
//! HTTP serving is out of scope), so the listener logs a summary on
//! shutdown and tests read the counters directly.

pub mod metrics;

pub use metrics::RelayMetrics;
