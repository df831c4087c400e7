//! Chamber directory: one per configured family.
//!
//! Gatekeeps upgrades (subprotocol, URL prefix, origin allow-list) and maps
//! request URLs to live chambers, creating on first join and evicting on
//! chamber close. The chamber-count cap is enforced optimistically: the
//! length check happens before the insert, so under extreme contention a
//! small temporary overshoot is possible. This avoids a global lock on the
//! accept path.

use std::sync::Arc;

use dashmap::DashMap;

use wschamber_core::error::{RelayError, Result};

use crate::config::FamilyConfig;
use crate::obs::RelayMetrics;
use crate::relay::chamber::{AddError, Chamber, ChamberLimits};
use crate::transport::{Accept, ConnectionHandle, FrameSink, HeaderMap, PeerSocket, UpgradeHandler};

/// The only subprotocol this relay speaks.
pub const PROTOCOL: &str = "echo";

struct DirShared {
    base_url: String,
    permitted_origins: Arc<Vec<String>>,
    max_chambers: usize,
    limits: ChamberLimits,
    chambers: DashMap<String, Arc<Chamber>>,
    metrics: Arc<RelayMetrics>,
}

#[derive(Clone)]
pub struct ChamberDirectory {
    shared: Arc<DirShared>,
}

impl ChamberDirectory {
    pub fn new(
        family: &FamilyConfig,
        permitted_origins: Arc<Vec<String>>,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        Self {
            shared: Arc::new(DirShared {
                base_url: family.base_url.clone(),
                permitted_origins,
                max_chambers: family.max_chambers,
                limits: ChamberLimits {
                    max_connections: family.max_connections,
                    max_queue_items: family.max_queue_items,
                    max_queue_data: family.max_queue_data,
                    headers_max_length: family.headers_max_length,
                },
                chambers: DashMap::new(),
                metrics,
            }),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.shared.base_url
    }

    pub fn chamber_count(&self) -> usize {
        self.shared.chambers.len()
    }

    /// Attach an upgraded connection to the chamber for `url`.
    pub fn accept(&self, url: &str, conn: Arc<ConnectionHandle>) -> Result<Arc<dyn FrameSink>> {
        loop {
            let chamber = match self.lookup_or_create(url) {
                Ok(c) => c,
                Err(e) => {
                    RelayMetrics::inc(&self.shared.metrics.capacity_rejects);
                    conn.close(1013, "Too many chambers");
                    return Err(e);
                }
            };
            match chamber.add(Arc::clone(&conn) as Arc<dyn PeerSocket>) {
                Ok(sink) => return Ok(sink),
                Err(AddError::Full) => {
                    return Err(RelayError::CapacityExceeded("Chamber is full".into()))
                }
                Err(AddError::Closed) => {
                    // Lost the race against the last peer leaving; drop the
                    // stale entry and start over with a fresh chamber.
                    self.shared
                        .chambers
                        .remove_if(url, |_, c| Arc::ptr_eq(c, &chamber));
                }
            }
        }
    }

    fn lookup_or_create(&self, url: &str) -> Result<Arc<Chamber>> {
        if let Some(existing) = self.shared.chambers.get(url) {
            return Ok(existing.clone());
        }
        if self.shared.chambers.len() >= self.shared.max_chambers {
            return Err(RelayError::CapacityExceeded("Too many chambers".into()));
        }
        let chamber = match self.shared.chambers.entry(url.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(e) => e.get().clone(),
            dashmap::mapref::entry::Entry::Vacant(e) => {
                let chamber = Arc::new(Chamber::new(
                    url.to_string(),
                    self.shared.limits.clone(),
                    Arc::clone(&self.shared.metrics),
                ));
                let evict_from = Arc::downgrade(&self.shared);
                let evict_key = url.to_string();
                let evict_chamber = Arc::downgrade(&chamber);
                chamber.set_on_close(move || {
                    if let (Some(dir), Some(ch)) = (evict_from.upgrade(), evict_chamber.upgrade()) {
                        dir.chambers.remove_if(&evict_key, |_, c| Arc::ptr_eq(c, &ch));
                    }
                });
                e.insert(chamber.clone());
                tracing::debug!(url, "chamber created");
                chamber
            }
        };
        Ok(chamber)
    }
}

impl UpgradeHandler for ChamberDirectory {
    fn test(&self, path: &str, headers: &HeaderMap, protocols: &[String]) -> Result<Option<Accept>> {
        if !protocols.iter().any(|p| p == PROTOCOL) {
            return Ok(None);
        }
        if !path.starts_with(&self.shared.base_url) {
            return Ok(None);
        }
        if !self.shared.permitted_origins.is_empty() {
            let origin = headers.get("Origin").unwrap_or_default();
            if !self.shared.permitted_origins.iter().any(|o| o == origin) {
                return Err(RelayError::OriginNotPermitted(origin.to_string()));
            }
        }

        let dir = self.clone();
        let url = path.to_string();
        Ok(Some(Accept {
            protocol: PROTOCOL,
            acceptor: Box::new(move |conn| dir.accept(&url, conn)),
        }))
    }
}
