//! Accept loop and connection registry.
//!
//! Each accepted socket gets a connection id, a registry entry, and its own
//! task. The registry exists for shutdown: on the shutdown signal the
//! listener stops accepting, closes every live connection with
//! `1001 Shutting down`, and awaits task drain.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::obs::RelayMetrics;
use crate::transport::connection::{Connection, ConnectionHandle, PeerSocket};
use crate::transport::UpgradeHandler;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

fn next_conn_id() -> u64 {
    NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed)
}

/// RAII guard that drops the registry entry when a connection task ends.
struct ConnCleanup {
    registry: Arc<DashMap<u64, Arc<ConnectionHandle>>>,
    id: u64,
}

impl Drop for ConnCleanup {
    fn drop(&mut self) {
        self.registry.remove(&self.id);
        tracing::debug!(conn = self.id, "connection cleanup done");
    }
}

pub struct Listener {
    handlers: Arc<Vec<Arc<dyn UpgradeHandler>>>,
    registry: Arc<DashMap<u64, Arc<ConnectionHandle>>>,
    metrics: Arc<RelayMetrics>,
}

impl Listener {
    pub fn new(handlers: Vec<Arc<dyn UpgradeHandler>>, metrics: Arc<RelayMetrics>) -> Self {
        Self {
            handlers: Arc::new(handlers),
            registry: Arc::new(DashMap::new()),
            metrics,
        }
    }

    /// Live connection count. Used by tests and the shutdown log.
    pub fn active_connections(&self) -> usize {
        self.registry.len()
    }

    /// Accept until `shutdown` resolves, then drain.
    pub async fn run(&self, listener: TcpListener, shutdown: impl Future<Output = ()>) {
        let mut tasks = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(a) => a,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let _ = stream.set_nodelay(true);
                    let id = next_conn_id();
                    RelayMetrics::inc(&self.metrics.connections_accepted);

                    let conn = Connection::new(id, Arc::clone(&self.handlers), Arc::clone(&self.metrics));
                    self.registry.insert(id, conn.handle());
                    let guard = ConnCleanup { registry: Arc::clone(&self.registry), id };

                    let span = tracing::info_span!("conn", id, %addr);
                    tasks.spawn(
                        async move {
                            let _guard = guard;
                            tracing::debug!("accepted");
                            conn.run(stream).await;
                        }
                        .instrument(span),
                    );
                }
                _ = &mut shutdown => break,
                // Reap finished tasks as we go so the set stays small.
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        drop(listener);
        tracing::info!(live = self.registry.len(), "shutting down, closing connections");
        for entry in self.registry.iter() {
            entry.value().close(1001, "Shutting down");
        }
        while tasks.join_next().await.is_some() {}
        tracing::info!(metrics = %self.metrics.summary(), "relay stopped");
    }
}
