//! A chamber: the set of peers joined to one URL.
//!
//! Join/leave bookkeeping, the welcome/notification protocol
//! (`I`/`H`/`B` text messages), and the inbound header mini-protocol that
//! selects each message's targets (`T` items terminated by `'\n'`). All
//! mutable state sits behind one mutex; nothing awaits while holding it —
//! outbound work is non-blocking sends into each receiver's channel.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use wschamber_core::buffer::OnDemandBuffer;
use wschamber_core::frame::opcode;

use crate::obs::RelayMetrics;
use crate::relay::queue::{FrameInfo, OutputQueue};
use crate::transport::{FrameEvent, FrameSink, PeerSocket};

/// Peers younger than this are deprioritised by `pick_one_target`.
const ESTABLISHED_AFTER: Duration = Duration::from_secs(30);

/// Limits inherited by every chamber of a family.
#[derive(Debug, Clone)]
pub struct ChamberLimits {
    pub max_connections: usize,
    pub max_queue_items: usize,
    pub max_queue_data: usize,
    pub headers_max_length: usize,
}

/// Why `add` refused a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddError {
    /// The chamber is at `max_connections`; the peer was closed with 1013.
    Full,
    /// The chamber emptied and closed concurrently; retry with a fresh one.
    Closed,
}

struct PeerRecord {
    sock: Arc<dyn PeerSocket>,
    queue: OutputQueue,
    joined: Instant,
    header_buf: OnDemandBuffer,
    /// Bytes of header consumed for the current inbound message; zero while
    /// the header is still being collected.
    header_len: usize,
    targets: Vec<u64>,
}

struct ChamberInner {
    peers: BTreeMap<u64, PeerRecord>,
    next_id: u64,
    closed: bool,
}

pub struct Chamber {
    url: String,
    limits: ChamberLimits,
    metrics: Arc<RelayMetrics>,
    inner: Mutex<ChamberInner>,
    on_close: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl std::fmt::Debug for Chamber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chamber").field("url", &self.url).finish_non_exhaustive()
    }
}

impl Chamber {
    pub fn new(url: String, limits: ChamberLimits, metrics: Arc<RelayMetrics>) -> Self {
        Self {
            url,
            limits,
            metrics,
            inner: Mutex::new(ChamberInner {
                peers: BTreeMap::new(),
                next_id: 0,
                closed: false,
            }),
            on_close: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn peer_count(&self) -> usize {
        self.lock().peers.len()
    }

    /// Invoked once, after the last peer leaves.
    pub fn set_on_close(&self, f: impl FnOnce() + Send + 'static) {
        *lock_tolerant(&self.on_close) = Some(Box::new(f));
    }

    fn lock(&self) -> MutexGuard<'_, ChamberInner> {
        lock_tolerant(&self.inner)
    }

    /// Admit a peer: assign an id, notify the others (`H<id>`), and queue
    /// the joiner's welcome (`I<id>:H<p>...`). The notifications to
    /// existing peers are enqueued first, but the welcome is still the
    /// first frame the joiner sees since nothing precedes it on that queue.
    pub fn add(
        self: &Arc<Self>,
        sock: Arc<dyn PeerSocket>,
    ) -> std::result::Result<Arc<dyn FrameSink>, AddError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(AddError::Closed);
        }
        if inner.peers.len() >= self.limits.max_connections {
            RelayMetrics::inc(&self.metrics.capacity_rejects);
            sock.close(1013, "Chamber is full");
            return Err(AddError::Full);
        }

        let id = inner.next_id;
        inner.next_id += 1;

        let mut truncated = 0;
        let mut welcome = format!("I{id}");
        for (pid, peer) in inner.peers.iter_mut() {
            truncated += peer.queue.add_frame(id, single_text(format!("H{id}")));
            welcome.push_str(&format!(":H{pid}"));
        }

        let mut record = PeerRecord {
            sock: Arc::clone(&sock),
            queue: OutputQueue::new(
                sock,
                self.limits.max_queue_items,
                self.limits.max_queue_data,
            ),
            joined: Instant::now(),
            header_buf: OnDemandBuffer::new(self.limits.headers_max_length),
            header_len: 0,
            targets: Vec::new(),
        };
        record.queue.add_frame(id, single_text(welcome));
        inner.peers.insert(id, record);

        RelayMetrics::add(&self.metrics.truncations, truncated as u64);
        tracing::debug!(url = %self.url, peer = id, peers = inner.peers.len(), "peer joined");
        Ok(Arc::new(PeerEvents {
            chamber: Arc::clone(self),
            peer: id,
        }))
    }

    /// Remove a peer, flush any half-open message it left behind on each
    /// receiver, and broadcast `B<id>`.
    pub fn remove(&self, peer: u64) {
        let on_close = {
            let mut inner = self.lock();
            if inner.peers.remove(&peer).is_none() {
                return;
            }
            let note = format!("B{peer}");
            let mut truncated = 0;
            for rec in inner.peers.values_mut() {
                truncated += rec.queue.close_sender(peer);
                rec.queue.add_frame(peer, single_text(note.clone()));
            }
            RelayMetrics::add(&self.metrics.truncations, truncated as u64);
            tracing::debug!(url = %self.url, peer, peers = inner.peers.len(), "peer left");

            if inner.peers.is_empty() {
                inner.closed = true;
                lock_tolerant(&self.on_close).take()
            } else {
                None
            }
        };
        if let Some(f) = on_close {
            tracing::debug!(url = %self.url, "chamber closed");
            f();
        }
    }

    fn begin_message(&self, peer: u64) {
        let mut inner = self.lock();
        if let Some(rec) = inner.peers.get_mut(&peer) {
            rec.header_buf.clear();
            rec.header_len = 0;
            rec.targets.clear();
        }
    }

    fn end_message(&self, peer: u64) {
        let mut inner = self.lock();
        if let Some(rec) = inner.peers.get_mut(&peer) {
            rec.header_buf.clear();
            rec.header_len = 0;
        }
    }

    fn inbound_part(&self, peer: u64, data: Bytes, op: u8, fin: bool) {
        enum Phase {
            /// Still collecting header bytes, or the peer is gone.
            Pending,
            /// Header just completed; `rest` is the first body chunk.
            Header { header: Vec<u8>, rest: Bytes },
            Body { targets: Vec<u64> },
        }

        let mut guard = self.lock();
        let inner = &mut *guard;

        let phase = {
            let Some(rec) = inner.peers.get_mut(&peer) else {
                return;
            };
            if rec.header_len > 0 {
                Phase::Body {
                    targets: rec.targets.clone(),
                }
            } else {
                match rec.header_buf.add_and_test(&data, |b| {
                    b.iter()
                        .position(|&c| c == b'\n')
                        .map(|pos| (b[..pos].to_vec(), pos + 1))
                }) {
                    Ok(Some((header, consumed))) => {
                        rec.header_len = header.len() + 1;
                        Phase::Header {
                            header,
                            rest: data.slice(consumed..),
                        }
                    }
                    Ok(None) => Phase::Pending,
                    Err(_) => {
                        tracing::debug!(url = %self.url, peer, "header overflow");
                        rec.sock.close(4000, "Header too large");
                        Phase::Pending
                    }
                }
            }
        };

        match phase {
            Phase::Pending => {}
            Phase::Body { targets } => {
                self.forward(
                    inner,
                    peer,
                    &targets,
                    FrameInfo {
                        opcode: op,
                        data,
                        fin,
                        continuation: true,
                    },
                );
            }
            Phase::Header { header, rest } => {
                let selector = parse_target_items(&header);
                let targets = resolve_targets(inner, peer, &selector);
                if let Some(rec) = inner.peers.get_mut(&peer) {
                    rec.targets = targets.clone();
                }
                // Metadata frame first (same opcode, not final, not a
                // continuation), then the post-newline remainder opens the
                // body. An empty remainder still travels when it carries fin.
                self.forward(
                    inner,
                    peer,
                    &targets,
                    FrameInfo {
                        opcode: op,
                        data: Bytes::from(format!("F{peer}\n")),
                        fin: false,
                        continuation: false,
                    },
                );
                self.forward(
                    inner,
                    peer,
                    &targets,
                    FrameInfo {
                        opcode: op,
                        data: rest,
                        fin,
                        continuation: true,
                    },
                );
            }
        }
    }

    fn forward(&self, inner: &mut ChamberInner, sender: u64, targets: &[u64], info: FrameInfo) {
        let mut truncated = 0;
        for t in targets {
            let Some(rec) = inner.peers.get_mut(t) else {
                continue;
            };
            truncated += rec.queue.add_frame(sender, info.clone());
            RelayMetrics::inc(&self.metrics.relayed_frames);
        }
        RelayMetrics::add(&self.metrics.truncations, truncated as u64);
    }
}

/// Per-peer event sink wired into the connection by the acceptor.
struct PeerEvents {
    chamber: Arc<Chamber>,
    peer: u64,
}

impl FrameSink for PeerEvents {
    fn on_event(&self, ev: FrameEvent) {
        match ev {
            FrameEvent::MessageStart { .. } => self.chamber.begin_message(self.peer),
            FrameEvent::MessagePart {
                data, opcode, fin, ..
            } => self.chamber.inbound_part(self.peer, data, opcode, fin),
            FrameEvent::MessageEnd => self.chamber.end_message(self.peer),
            FrameEvent::Closed => self.chamber.remove(self.peer),
            FrameEvent::Error { code, ref message } => {
                tracing::debug!(peer = self.peer, code, error = %message, "peer error");
            }
            _ => {}
        }
    }
}

fn single_text(text: String) -> FrameInfo {
    FrameInfo {
        opcode: opcode::TEXT,
        data: Bytes::from(text),
        fin: true,
        continuation: false,
    }
}

fn lock_tolerant<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Parsed target selector from the message header.
enum TargetSpec {
    AllExceptSender,
    AllIncludingSender,
    Literal { ids: Vec<u64>, pick_extra: bool },
}

/// The header is colon-separated items; only items whose first byte is `T`
/// are interpreted, each contributing comma-separated target tokens.
fn parse_target_items(header: &[u8]) -> TargetSpec {
    let mut tokens: Vec<&[u8]> = Vec::new();
    for item in header.split(|&b| b == b':') {
        if item.first() == Some(&b'T') {
            tokens.extend(item[1..].split(|&b| b == b','));
        }
    }
    if tokens.is_empty() {
        return TargetSpec::AllExceptSender;
    }
    if tokens.iter().any(|t| *t == b"**") {
        return TargetSpec::AllIncludingSender;
    }
    let pick_extra = tokens.iter().any(|t| *t == b"*");
    let ids = tokens
        .iter()
        .filter(|t| **t != b"*")
        .filter_map(|t| std::str::from_utf8(t).ok()?.parse().ok())
        .collect();
    TargetSpec::Literal { ids, pick_extra }
}

fn resolve_targets(inner: &ChamberInner, sender: u64, selector: &TargetSpec) -> Vec<u64> {
    match selector {
        TargetSpec::AllExceptSender => inner
            .peers
            .keys()
            .copied()
            .filter(|&id| id != sender)
            .collect(),
        TargetSpec::AllIncludingSender => inner.peers.keys().copied().collect(),
        TargetSpec::Literal { ids, pick_extra } => {
            let mut targets: Vec<u64> = Vec::with_capacity(ids.len() + 1);
            for &id in ids {
                if inner.peers.contains_key(&id) && !targets.contains(&id) {
                    targets.push(id);
                }
            }
            if *pick_extra {
                if let Some(extra) = pick_one_target(inner, sender, &targets) {
                    targets.push(extra);
                }
            }
            targets
        }
    }
}

/// Choose one extra peer for a `"*"` selector. Candidates exclude the
/// sender and the already-listed targets; prefer established peers, then
/// idle queues, then peers not mid-inbound-message. A shuffle before the
/// stable sort breaks ties uniformly.
fn pick_one_target(inner: &ChamberInner, sender: u64, exclude: &[u64]) -> Option<u64> {
    let mut candidates: Vec<(u64, bool, bool, bool)> = inner
        .peers
        .iter()
        .filter(|(id, _)| **id != sender && !exclude.contains(id))
        .map(|(id, rec)| {
            (
                *id,
                rec.joined.elapsed() < ESTABLISHED_AFTER,
                !rec.queue.is_empty(),
                rec.header_len > 0,
            )
        })
        .collect();
    shuffle(&mut candidates);
    candidates.sort_by_key(|&(_, fresh, busy, sending)| (fresh, busy, sending));
    candidates.first().map(|&(id, ..)| id)
}

/// Fisher-Yates with a clock-seeded xorshift. Uniformity is all that
/// matters here; no RNG crate needed.
fn shuffle<T>(items: &mut [T]) {
    let mut seed = u64::from(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos(),
    ) | 1;
    for i in (1..items.len()).rev() {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        items.swap(i, (seed % (i as u64 + 1)) as usize);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::testutil::MockSock;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn limits() -> ChamberLimits {
        ChamberLimits {
            max_connections: 16,
            max_queue_items: 64,
            max_queue_data: 64 * 1024,
            headers_max_length: 64,
        }
    }

    fn new_chamber(limits: ChamberLimits) -> Arc<Chamber> {
        Arc::new(Chamber::new(
            "/room".into(),
            limits,
            Arc::new(RelayMetrics::new()),
        ))
    }

    fn join(chamber: &Arc<Chamber>) -> (Arc<MockSock>, Arc<dyn FrameSink>) {
        let sock = MockSock::new();
        let sink = chamber
            .add(Arc::clone(&sock) as Arc<dyn PeerSocket>)
            .expect("join");
        (sock, sink)
    }

    fn send_message(sink: &Arc<dyn FrameSink>, payload: &str, fin: bool) {
        sink.on_event(FrameEvent::MessageStart { opcode: opcode::TEXT });
        sink.on_event(FrameEvent::MessagePart {
            data: Bytes::copy_from_slice(payload.as_bytes()),
            opcode: opcode::TEXT,
            continuation: false,
            fin,
        });
        if fin {
            sink.on_event(FrameEvent::MessageEnd);
        }
    }

    #[test]
    fn join_assigns_ids_and_notifies() {
        let chamber = new_chamber(limits());
        let (a, _sa) = join(&chamber);
        assert_eq!(a.rendered(), "I0");

        let (b, _sb) = join(&chamber);
        assert_eq!(a.rendered(), "I0H1");
        assert_eq!(b.rendered(), "I1:H0");

        let (c, _sc) = join(&chamber);
        assert_eq!(a.rendered(), "I0H1H2");
        assert_eq!(c.rendered(), "I2:H0:H1");
    }

    #[test]
    fn message_is_relayed_with_sender_tag() {
        let chamber = new_chamber(limits());
        let (a, _sa) = join(&chamber);
        let (_b, sb) = join(&chamber);

        send_message(&sb, "\nhello", true);

        let frames = a.frames();
        // After I0 and H1: the metadata frame, then the body continuation.
        assert_eq!(frames[2].0, opcode::TEXT);
        assert_eq!(frames[2].1.as_ref(), b"F1\n");
        assert!(!frames[2].2);
        assert_eq!(frames[3].0, opcode::CONTINUATION);
        assert_eq!(frames[3].1.as_ref(), b"hello");
        assert!(frames[3].2);
        assert_eq!(a.rendered(), "I0H1F1\nhello");
    }

    #[test]
    fn no_self_echo_by_default() {
        let chamber = new_chamber(limits());
        let (a, sa) = join(&chamber);
        let (b, _sb) = join(&chamber);

        send_message(&sa, "\nhi", true);
        assert_eq!(a.rendered(), "I0H1");
        assert_eq!(b.rendered(), "I1:H0F0\nhi");
    }

    #[test]
    fn targeted_unicast_skips_other_peers() {
        let chamber = new_chamber(limits());
        let (_a, sa) = join(&chamber);
        let (b, _sb) = join(&chamber);
        let (c, _sc) = join(&chamber);

        send_message(&sa, "T2\nhi", true);
        assert_eq!(b.rendered(), "I1:H0H2");
        assert_eq!(c.rendered(), "I2:H0:H1F0\nhi");
    }

    #[test]
    fn double_star_includes_the_sender() {
        let chamber = new_chamber(limits());
        let (a, sa) = join(&chamber);
        let (b, _sb) = join(&chamber);
        let (c, _sc) = join(&chamber);

        send_message(&sa, "T**\nhi", true);
        assert!(a.rendered().ends_with("F0\nhi"));
        assert!(b.rendered().ends_with("F0\nhi"));
        assert!(c.rendered().ends_with("F0\nhi"));
    }

    #[test]
    fn star_picks_an_idle_peer_over_one_mid_message() {
        let chamber = new_chamber(limits());
        let (_a, sa) = join(&chamber);
        let (b, sb) = join(&chamber);
        let (c, _sc) = join(&chamber);

        // Peer 1 parks mid-message with an empty target list ("T" alone
        // names nobody), leaving it flagged as currently sending.
        send_message(&sb, "T\npartial", false);

        send_message(&sa, "T*\nhi", true);
        assert!(!b.rendered().contains("F0"), "busy peer must be skipped");
        assert!(c.rendered().ends_with("F0\nhi"));
    }

    #[test]
    fn star_excludes_already_listed_targets() {
        let chamber = new_chamber(limits());
        let (_a, sa) = join(&chamber);
        let (b, _sb) = join(&chamber);
        let (c, _sc) = join(&chamber);

        send_message(&sa, "T1,*\nhi", true);
        assert!(b.rendered().ends_with("F0\nhi"));
        assert!(c.rendered().ends_with("F0\nhi"));
    }

    #[test]
    fn fragmented_message_streams_to_targets() {
        let chamber = new_chamber(limits());
        let (a, _sa) = join(&chamber);
        let (_b, sb) = join(&chamber);

        sb.on_event(FrameEvent::MessageStart { opcode: opcode::TEXT });
        sb.on_event(FrameEvent::MessagePart {
            data: Bytes::from_static(b"\nhel"),
            opcode: opcode::TEXT,
            continuation: false,
            fin: false,
        });
        sb.on_event(FrameEvent::MessagePart {
            data: Bytes::from_static(b"lo"),
            opcode: opcode::TEXT,
            continuation: true,
            fin: true,
        });
        sb.on_event(FrameEvent::MessageEnd);

        assert_eq!(a.rendered(), "I0H1F1\nhello");
        let frames = a.frames();
        assert!(frames.last().unwrap().2, "fin travels on the last chunk");
    }

    #[test]
    fn admission_cap_closes_with_1013() {
        let mut l = limits();
        l.max_connections = 2;
        let chamber = new_chamber(l);
        let (_a, _sa) = join(&chamber);
        let (_b, _sb) = join(&chamber);

        let sock = MockSock::new();
        let err = chamber
            .add(Arc::clone(&sock) as Arc<dyn PeerSocket>)
            .expect_err("third peer must be rejected");
        assert_eq!(err, AddError::Full);
        assert_eq!(sock.closed_with(), Some((1013, "Chamber is full".into())));
        assert_eq!(chamber.peer_count(), 2);
    }

    #[test]
    fn oversized_header_closes_with_4000() {
        let mut l = limits();
        l.headers_max_length = 16;
        let chamber = new_chamber(l);
        let (_a, _sa) = join(&chamber);
        let (b, sb) = join(&chamber);

        send_message(&sb, &"T".repeat(32), false);
        assert_eq!(b.closed_with(), Some((4000, "Header too large".into())));
    }

    #[test]
    fn leave_notifies_and_closes_empty_chamber() {
        let chamber = new_chamber(limits());
        let closed = Arc::new(AtomicBool::new(false));
        {
            let closed = Arc::clone(&closed);
            chamber.set_on_close(move || closed.store(true, Ordering::SeqCst));
        }

        let (_a, sa) = join(&chamber);
        let (b, sb) = join(&chamber);

        sa.on_event(FrameEvent::Closed);
        assert_eq!(b.rendered(), "I1:H0B0");
        assert!(!closed.load(Ordering::SeqCst));

        sb.on_event(FrameEvent::Closed);
        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(chamber.peer_count(), 0);
    }

    #[test]
    fn departing_sender_mid_message_leaves_truncation_marker() {
        let chamber = new_chamber(limits());
        let (a, _sa) = join(&chamber);
        let (_b, sb) = join(&chamber);

        send_message(&sb, "\nhalf", false);
        sb.on_event(FrameEvent::Closed);

        let frames = a.frames();
        // ... F1\n, "half", then the synthetic continuation-fin, the "X"
        // marker, and finally the departure note.
        let n = frames.len();
        assert!(frames[n - 3].1.is_empty() && frames[n - 3].2);
        assert_eq!(frames[n - 2].1.as_ref(), b"X");
        assert_eq!(frames[n - 1].1.as_ref(), b"B1");
    }

    #[test]
    fn ids_are_never_reused() {
        let chamber = new_chamber(limits());
        let (_a, sa) = join(&chamber);
        let (b, _sb) = join(&chamber);

        sa.on_event(FrameEvent::Closed);
        let (c, _sc) = join(&chamber);
        assert_eq!(c.rendered(), "I2:H1");
        assert_eq!(b.rendered(), "I1:H0B0H2");
    }
}
