//! Per-receiver output queue.
//!
//! Serialises many sender streams through one receiver socket while keeping
//! each multi-frame message contiguous. Frames from the active sender pass
//! straight through; frames from everyone else wait in arrival order until
//! the active message finishes. Overflow never blocks ingress: the in-flight
//! message is truncated instead (synthetic continuation-fin plus an `"X"`
//! marker message), which is this system's explicit backpressure tradeoff.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;

use wschamber_core::frame::opcode;

use crate::transport::PeerSocket;

/// One frame as produced by a sender's inbound stream.
#[derive(Debug, Clone)]
pub struct FrameInfo {
    /// Opcode of the message's opening frame.
    pub opcode: u8,
    pub data: Bytes,
    pub fin: bool,
    /// True for every frame after the message's first.
    pub continuation: bool,
}

struct QueueItem {
    sender: u64,
    info: FrameInfo,
}

pub struct OutputQueue {
    sock: Arc<dyn PeerSocket>,
    max_items: usize,
    max_data: usize,
    items: VecDeque<QueueItem>,
    queued_bytes: usize,
    /// Sender whose multi-frame message is currently in flight.
    active: Option<u64>,
}

impl OutputQueue {
    pub fn new(sock: Arc<dyn PeerSocket>, max_items: usize, max_data: usize) -> Self {
        Self {
            sock,
            max_items,
            max_data,
            items: VecDeque::new(),
            queued_bytes: 0,
            active: None,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    pub fn active_sender(&self) -> Option<u64> {
        self.active
    }

    /// Route one frame from `sender`.
    ///
    /// Contract: callers append frames in per-sender stream order. A
    /// continuation frame arriving with no active sender belongs to a
    /// message that was already truncated and is silently discarded.
    ///
    /// Returns the number of queued messages truncated to satisfy the caps.
    pub fn add_frame(&mut self, sender: u64, info: FrameInfo) -> usize {
        if self.active.is_none() || self.active == Some(sender) {
            if info.continuation && self.active.is_none() {
                return 0;
            }
            self.write_now(sender, info);
            return 0;
        }

        self.queued_bytes += info.data.len();
        self.items.push_back(QueueItem { sender, info });

        let mut truncated = 0;
        while self.items.len() > self.max_items || self.queued_bytes > self.max_data {
            self.abort_current();
            truncated += 1;
        }
        truncated
    }

    /// Drop all influence of `sender`: abort its in-flight message, or
    /// filter its queued frames. Returns 1 if a truncation was emitted.
    pub fn remove_sender(&mut self, sender: u64) -> usize {
        if self.active == Some(sender) {
            self.abort_current();
            return 1;
        }
        let removed: usize = self
            .items
            .iter()
            .filter(|it| it.sender == sender)
            .map(|it| it.info.data.len())
            .sum();
        self.queued_bytes -= removed;
        self.items.retain(|it| it.sender != sender);
        0
    }

    /// `sender` is gone. If its last contribution left a half-open message
    /// (active without fin, or last queued frame not fin), flush it with a
    /// truncation marker; otherwise let the queued remainder drain normally.
    pub fn close_sender(&mut self, sender: u64) -> usize {
        let dangling = if self.active == Some(sender) {
            // While a sender is active none of its frames sit in the queue,
            // so an active sender is by definition mid-message.
            true
        } else {
            self.items
                .iter()
                .rev()
                .find(|it| it.sender == sender)
                .is_some_and(|last| !last.info.fin)
        };
        if dangling {
            self.remove_sender(sender)
        } else {
            0
        }
    }

    fn write_now(&mut self, sender: u64, info: FrameInfo) {
        let fin = info.fin;
        self.send(&info);
        if fin {
            self.active = None;
            self.drain();
        } else {
            self.active = Some(sender);
        }
    }

    fn send(&self, info: &FrameInfo) {
        let op = if info.continuation {
            opcode::CONTINUATION
        } else {
            info.opcode
        };
        self.sock.send_frame(op, info.data.clone(), info.fin);
    }

    /// Close the in-flight message with a synthetic continuation-fin, tell
    /// the receiver it was truncated, and resume queue consumption.
    fn abort_current(&mut self) {
        self.sock.send_frame(opcode::CONTINUATION, Bytes::new(), true);
        self.sock
            .send_frame(opcode::TEXT, Bytes::from_static(b"X"), true);
        self.active = None;
        self.drain();
    }

    /// The rewind loop: after a completed message, walk the queue in
    /// arrival order handing the line to the first waiting sender; if that
    /// sender's message completes mid-walk, start over.
    fn drain(&mut self) {
        'rewind: loop {
            if self.active.is_some() {
                return;
            }
            let Some(first) = self.items.front() else {
                return;
            };
            let sender = first.sender;
            self.active = Some(sender);

            let mut idx = 0;
            while idx < self.items.len() {
                if self.items[idx].sender != sender {
                    idx += 1;
                    continue;
                }
                let Some(item) = self.items.remove(idx) else {
                    return;
                };
                self.queued_bytes -= item.info.data.len();
                let fin = item.info.fin;
                self.send(&item.info);
                if fin {
                    self.active = None;
                    continue 'rewind;
                }
            }
            // Active sender still mid-message; more frames will arrive via
            // add_frame and pass straight through.
            return;
        }
    }
}
