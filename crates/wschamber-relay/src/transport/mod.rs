//! Transport layer: upgrade handshake, connections, listener.

pub mod connection;
pub mod handshake;
pub mod listener;

use std::sync::Arc;

use wschamber_core::error::Result;

pub use connection::{Connection, ConnectionHandle, FrameEvent, FrameSink, PeerSocket};
pub use handshake::HeaderMap;
pub use listener::Listener;

/// Outcome of a successful [`UpgradeHandler::test`].
pub struct Accept {
    /// Subprotocol echoed back in the `101` response.
    pub protocol: &'static str,
    /// Invoked after the `101` is written; returns the sink that will
    /// receive the connection's frame events.
    pub acceptor: Box<dyn FnOnce(Arc<ConnectionHandle>) -> Result<Arc<dyn FrameSink>> + Send>,
}

impl std::fmt::Debug for Accept {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Accept").field("protocol", &self.protocol).finish_non_exhaustive()
    }
}

/// A handler candidate for incoming upgrades.
///
/// Handlers are tested in registration order; the first one returning
/// `Some` wins. `Err` aborts the handshake with the error's HTTP status.
pub trait UpgradeHandler: Send + Sync {
    fn test(&self, path: &str, headers: &HeaderMap, protocols: &[String]) -> Result<Option<Accept>>;
}
