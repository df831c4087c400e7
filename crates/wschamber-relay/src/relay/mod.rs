//! Relay core: output queues, chambers, and the chamber directory.

pub mod chamber;
pub mod directory;
pub mod queue;

pub use chamber::{Chamber, ChamberLimits};
pub use directory::ChamberDirectory;
pub use queue::{FrameInfo, OutputQueue};

#[cfg(test)]
pub(crate) mod testutil {
    use std::sync::Mutex;

    use bytes::Bytes;

    use crate::transport::PeerSocket;

    /// Records everything a peer socket would have written.
    #[derive(Debug, Default)]
    pub struct MockSock {
        pub frames: Mutex<Vec<(u8, Bytes, bool)>>,
        pub closed: Mutex<Option<(u16, String)>>,
    }

    impl MockSock {
        pub fn new() -> std::sync::Arc<Self> {
            std::sync::Arc::new(Self::default())
        }

        pub fn frames(&self) -> Vec<(u8, Bytes, bool)> {
            self.frames.lock().unwrap().clone()
        }

        /// Concatenate payloads of all recorded frames as UTF-8.
        pub fn rendered(&self) -> String {
            self.frames()
                .iter()
                .map(|(_, d, _)| String::from_utf8_lossy(d).into_owned())
                .collect()
        }

        pub fn closed_with(&self) -> Option<(u16, String)> {
            self.closed.lock().unwrap().clone()
        }
    }

    impl PeerSocket for MockSock {
        fn send_frame(&self, op: u8, data: Bytes, fin: bool) {
            if self.closed.lock().unwrap().is_some() {
                return;
            }
            self.frames.lock().unwrap().push((op, data, fin));
        }

        fn close(&self, code: u16, reason: &str) {
            let mut closed = self.closed.lock().unwrap();
            if closed.is_none() {
                *closed = Some((code, reason.to_string()));
            }
        }
    }
}
