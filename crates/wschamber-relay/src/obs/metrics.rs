use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide relay counters.
///
/// All counters are monotonically increasing and updated with relaxed
/// ordering; readers only ever see a best-effort snapshot.
#[derive(Debug, Default)]
pub struct RelayMetrics {
    /// TCP connections accepted.
    pub connections_accepted: AtomicU64,
    /// Successful WebSocket upgrades.
    pub upgrades: AtomicU64,
    /// Handshakes answered with an HTTP error.
    pub handshake_rejections: AtomicU64,
    /// Frames forwarded between peers (metadata and body alike).
    pub relayed_frames: AtomicU64,
    /// Queued messages dropped with a truncation marker.
    pub truncations: AtomicU64,
    /// Connections refused with close code 1013.
    pub capacity_rejects: AtomicU64,
    /// Post-upgrade protocol violations (close code 1002).
    pub protocol_errors: AtomicU64,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// One-line summary for the shutdown log.
    pub fn summary(&self) -> String {
        format!(
            "accepted={} upgraded={} rejected={} relayed={} truncated={} capacity_rejects={} protocol_errors={}",
            Self::get(&self.connections_accepted),
            Self::get(&self.upgrades),
            Self::get(&self.handshake_rejections),
            Self::get(&self.relayed_frames),
            Self::get(&self.truncations),
            Self::get(&self.capacity_rejects),
            Self::get(&self.protocol_errors),
        )
    }
}
