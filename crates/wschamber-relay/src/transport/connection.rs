//! One TCP peer: handshake state machine, frame assembler, event emitter.
//!
//! The connection task owns the socket and runs a single `select!` loop
//! over the outbound frame channel and inbound reads, so the two-level
//! frame state machine is never re-entered. Writers elsewhere in the
//! process only ever enqueue encoded frames; the channel's FIFO order is
//! the socket order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use wschamber_core::buffer::OnDemandBuffer;
use wschamber_core::error::{RelayError, Result};
use wschamber_core::frame::{
    self, opcode, FrameHeader, CLOSE_NO_STATUS, MAX_CONTROL_PAYLOAD, MAX_HEADER_LEN,
};

use crate::obs::RelayMetrics;
use crate::transport::handshake::{self, HeaderMap, MAX_HEADER_LINE};
use crate::transport::UpgradeHandler;

const READ_CHUNK: usize = 8 * 1024;

/// Post-upgrade events emitted by a connection, in stream order.
#[derive(Debug, Clone)]
pub enum FrameEvent {
    /// A new (non-control) message opened with this opcode.
    MessageStart { opcode: u8 },
    /// A chunk of message payload. `opcode` is the message's opening
    /// opcode; `continuation` marks frames after the first; `fin` marks the
    /// last chunk of the last frame.
    MessagePart {
        data: Bytes,
        opcode: u8,
        continuation: bool,
        fin: bool,
    },
    MessageEnd,
    FrameStart { fin: bool },
    FrameEnd,
    Ping { data: Bytes },
    Pong { data: Bytes },
    CloseReceived { code: u16, reason: String },
    Error { code: u16, message: String },
    /// The socket is gone; no further events follow.
    Closed,
}

/// Consumer of a connection's frame events (attached by the acceptor).
pub trait FrameSink: Send + Sync {
    fn on_event(&self, ev: FrameEvent);
}

impl std::fmt::Debug for dyn FrameSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FrameSink")
    }
}

/// Write side of a peer as seen by the relay core. Implemented by
/// [`ConnectionHandle`]; mocked in queue/chamber tests.
pub trait PeerSocket: Send + Sync {
    /// Encode and enqueue one frame. No-op after close.
    fn send_frame(&self, op: u8, data: Bytes, fin: bool);
    /// Enqueue a close frame and tear the socket down once written.
    fn close(&self, code: u16, reason: &str);
}

enum Outbound {
    Frame(Bytes),
    /// Write, then shut the socket down.
    Finish(Bytes),
}

/// Shared write-side handle for one connection.
pub struct ConnectionHandle {
    id: u64,
    out_tx: mpsc::UnboundedSender<Outbound>,
    closed: AtomicBool,
}

impl ConnectionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Send a single-frame text message.
    pub fn send_text(&self, text: &str) {
        self.send_frame(opcode::TEXT, Bytes::copy_from_slice(text.as_bytes()), true);
    }

    /// Send a single-frame binary message.
    pub fn send_binary(&self, data: Bytes) {
        self.send_frame(opcode::BINARY, data, true);
    }

    pub fn ping(&self, data: Bytes) {
        self.send_frame(opcode::PING, data, true);
    }

    pub fn pong(&self, data: Bytes) {
        self.send_frame(opcode::PONG, data, true);
    }

    fn send_raw(&self, bytes: Bytes) {
        if self.is_closed() {
            return;
        }
        let _ = self.out_tx.send(Outbound::Frame(bytes));
    }

    /// Write `bytes` and destroy the socket (HTTP error path).
    fn finish_with(&self, bytes: Bytes) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.out_tx.send(Outbound::Finish(bytes));
    }
}

impl PeerSocket for ConnectionHandle {
    fn send_frame(&self, op: u8, data: Bytes, fin: bool) {
        if self.is_closed() {
            return;
        }
        let _ = self.out_tx.send(Outbound::Frame(frame::encode_frame(op, &data, fin)));
    }

    fn close(&self, code: u16, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // 1005 means "no code was present"; it must not appear on the wire.
        let payload = if code == CLOSE_NO_STATUS {
            Bytes::new()
        } else {
            frame::close_payload(code, reason)
        };
        let _ = self
            .out_tx
            .send(Outbound::Finish(frame::encode_frame(opcode::CLOSE, &payload, true)));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    ReadingRequest,
    ReadingHeaders,
    Upgraded,
    Closing,
    Closed,
}

/// Frame currently being consumed.
struct InFrame {
    header: FrameHeader,
    remaining: u64,
    mask_cursor: usize,
}

/// Read-side state for one connection. Owned by its task; never shared.
pub struct Connection {
    handle: Arc<ConnectionHandle>,
    out_rx: mpsc::UnboundedReceiver<Outbound>,
    handlers: Arc<Vec<Arc<dyn UpgradeHandler>>>,
    metrics: Arc<RelayMetrics>,

    stage: Stage,
    // Handshake state.
    line_buf: OnDemandBuffer,
    path: String,
    headers: HeaderMap,
    // Frame-stream state.
    frame_buf: OnDemandBuffer,
    current: Option<InFrame>,
    /// Opcode of the open message; 0 while no message is open.
    last_data_opcode: u8,
    control_buf: OnDemandBuffer,
    sink: Option<Arc<dyn FrameSink>>,
}

impl Connection {
    pub fn new(
        id: u64,
        handlers: Arc<Vec<Arc<dyn UpgradeHandler>>>,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let handle = Arc::new(ConnectionHandle {
            id,
            out_tx,
            closed: AtomicBool::new(false),
        });
        Self {
            handle,
            out_rx,
            handlers,
            metrics,
            stage: Stage::ReadingRequest,
            line_buf: OnDemandBuffer::new(MAX_HEADER_LINE),
            path: String::new(),
            headers: HeaderMap::new(),
            frame_buf: OnDemandBuffer::new(MAX_HEADER_LEN),
            current: None,
            last_data_opcode: 0,
            control_buf: OnDemandBuffer::new(MAX_CONTROL_PAYLOAD),
            sink: None,
        }
    }

    pub fn handle(&self) -> Arc<ConnectionHandle> {
        Arc::clone(&self.handle)
    }

    /// Drive the connection until the socket closes.
    pub async fn run(mut self, stream: TcpStream) {
        let (mut rd, mut wr) = stream.into_split();
        let mut rbuf = BytesMut::with_capacity(READ_CHUNK);

        loop {
            tokio::select! {
                out = self.out_rx.recv() => match out {
                    Some(Outbound::Frame(b)) => {
                        if let Err(e) = wr.write_all(&b).await {
                            // Broken pipe on write is terminal, not an error
                            // to surface to the peer.
                            tracing::debug!(error = %e, "write failed");
                            break;
                        }
                    }
                    Some(Outbound::Finish(b)) => {
                        let _ = wr.write_all(&b).await;
                        let _ = wr.shutdown().await;
                        break;
                    }
                    None => break,
                },
                read = rd.read_buf(&mut rbuf) => match read {
                    Ok(0) => break,
                    Ok(_) => {
                        if let Err(e) = self.feed(&mut rbuf) {
                            self.fail(&e);
                        }
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "read failed");
                        break;
                    }
                },
            }
        }

        self.finish();
    }

    /// Consume one chunk of inbound bytes. Always drains `buf`.
    pub fn feed(&mut self, buf: &mut BytesMut) -> Result<()> {
        while !buf.is_empty() {
            match self.stage {
                Stage::ReadingRequest | Stage::ReadingHeaders => self.feed_line(buf)?,
                Stage::Upgraded => self.feed_frames(buf)?,
                Stage::Closing | Stage::Closed => buf.clear(),
            }
        }
        Ok(())
    }

    fn feed_line(&mut self, buf: &mut BytesMut) -> Result<()> {
        let parsed = self
            .line_buf
            .add_and_test(&buf[..], |b| {
                find_crlf(b).map(|pos| (String::from_utf8_lossy(&b[..pos]).into_owned(), pos + 2))
            })
            .map_err(|_| RelayError::BadRequest("header line too long".into()))?;
        match parsed {
            Some((line, consumed)) => {
                buf.advance(consumed);
                self.handle_line(&line)
            }
            None => {
                buf.clear();
                Ok(())
            }
        }
    }

    fn handle_line(&mut self, line: &str) -> Result<()> {
        match self.stage {
            Stage::ReadingRequest => {
                self.path = handshake::parse_request_line(line)?;
                self.stage = Stage::ReadingHeaders;
                Ok(())
            }
            Stage::ReadingHeaders => {
                if line.is_empty() {
                    return self.upgrade();
                }
                let (key, value) = handshake::parse_header_line(line)?;
                self.headers.append(key, value)
            }
            _ => Ok(()),
        }
    }

    fn upgrade(&mut self) -> Result<()> {
        let (accept, response) =
            handshake::resolve_upgrade(&self.path, &self.headers, &self.handlers)?;
        self.handle.send_raw(response);
        self.stage = Stage::Upgraded;
        RelayMetrics::inc(&self.metrics.upgrades);
        tracing::debug!(path = %self.path, protocol = accept.protocol, "upgraded");

        match (accept.acceptor)(Arc::clone(&self.handle)) {
            Ok(sink) => {
                self.sink = Some(sink);
                Ok(())
            }
            Err(e) => {
                // The acceptor already answered the peer (capacity close).
                tracing::debug!(error = %e, "acceptor rejected connection");
                self.stage = Stage::Closing;
                Ok(())
            }
        }
    }

    fn feed_frames(&mut self, buf: &mut BytesMut) -> Result<()> {
        while !buf.is_empty() && self.stage == Stage::Upgraded {
            if self.current.is_none() {
                let parsed = self
                    .frame_buf
                    .add_and_test(&buf[..], |b| {
                        frame::read_header(b).map(|h| (h, h.header_len))
                    })
                    .map_err(|_| RelayError::Protocol("oversized frame header".into()))?;
                match parsed {
                    Some((header, consumed)) => {
                        buf.advance(consumed);
                        self.begin_frame(header)?;
                    }
                    None => {
                        buf.clear();
                        return Ok(());
                    }
                }
            } else {
                let take = self
                    .current
                    .as_ref()
                    .map(|f| f.remaining.min(buf.len() as u64) as usize)
                    .unwrap_or(0);
                let chunk = buf.split_to(take);
                self.frame_payload(chunk)?;
            }
        }
        if self.stage != Stage::Upgraded {
            buf.clear();
        }
        Ok(())
    }

    fn begin_frame(&mut self, h: FrameHeader) -> Result<()> {
        if h.is_control() && h.payload_len > MAX_CONTROL_PAYLOAD as u64 {
            return Err(RelayError::Protocol("control frame too large".into()));
        }
        if h.is_control() && !h.fin {
            return Err(RelayError::Protocol("fragmented control frame".into()));
        }
        if h.mask.is_none() {
            return Err(RelayError::Protocol("client frame not masked".into()));
        }
        if h.rsv_set() {
            return Err(RelayError::Protocol("reserved bits set".into()));
        }
        if h.payload_len >= 1 << 63 {
            return Err(RelayError::Protocol("payload length out of range".into()));
        }
        if !h.is_control() {
            if h.opcode != opcode::CONTINUATION && self.last_data_opcode != 0 {
                return Err(RelayError::Protocol("data frame while message open".into()));
            }
            if h.opcode == opcode::CONTINUATION && self.last_data_opcode == 0 {
                return Err(RelayError::Protocol("continuation without message".into()));
            }
        }

        self.emit(FrameEvent::FrameStart { fin: h.fin });
        if !h.is_control() && h.opcode != opcode::CONTINUATION {
            self.last_data_opcode = h.opcode;
            self.emit(FrameEvent::MessageStart { opcode: h.opcode });
        }

        self.current = Some(InFrame {
            header: h,
            remaining: h.payload_len,
            mask_cursor: 0,
        });
        if h.payload_len == 0 {
            // Zero-length frames complete immediately (empty continuation
            // frames still carry a fin that must reach the sink).
            self.frame_payload(BytesMut::new())?;
        }
        Ok(())
    }

    fn frame_payload(&mut self, mut chunk: BytesMut) -> Result<()> {
        let Some(f) = self.current.as_mut() else {
            return Ok(());
        };
        if let Some(mask) = f.header.mask {
            f.mask_cursor = frame::apply_mask(&mut chunk, mask, f.mask_cursor);
        }
        f.remaining -= chunk.len() as u64;
        let last = f.remaining == 0;
        let header = f.header;

        if header.is_control() {
            self.control_buf
                .add(&chunk)
                .map_err(|_| RelayError::Protocol("control frame too large".into()))?;
            if last {
                self.current = None;
                self.finish_control(header.opcode)?;
            }
            return Ok(());
        }

        let continuation = header.opcode == opcode::CONTINUATION;
        self.emit(FrameEvent::MessagePart {
            data: chunk.freeze(),
            opcode: self.last_data_opcode,
            continuation,
            fin: header.fin && last,
        });
        if last {
            self.current = None;
            self.emit(FrameEvent::FrameEnd);
            if header.fin {
                self.emit(FrameEvent::MessageEnd);
                self.last_data_opcode = 0;
            }
        }
        Ok(())
    }

    fn finish_control(&mut self, op: u8) -> Result<()> {
        let data = Bytes::copy_from_slice(self.control_buf.as_slice());
        self.control_buf.clear();
        match op {
            opcode::CLOSE => {
                let (code, reason) = frame::parse_close_payload(&data);
                self.emit(FrameEvent::CloseReceived {
                    code,
                    reason: reason.clone(),
                });
                if self.stage == Stage::Upgraded {
                    self.handle.close(code, &reason);
                    self.stage = Stage::Closing;
                }
                Ok(())
            }
            opcode::PING => {
                self.emit(FrameEvent::Ping { data: data.clone() });
                self.handle.pong(data);
                Ok(())
            }
            opcode::PONG => {
                self.emit(FrameEvent::Pong { data });
                Ok(())
            }
            other => Err(RelayError::Protocol(format!(
                "unknown control opcode: {other:#x}"
            ))),
        }
    }

    fn fail(&mut self, err: &RelayError) {
        match self.stage {
            Stage::ReadingRequest | Stage::ReadingHeaders => {
                RelayMetrics::inc(&self.metrics.handshake_rejections);
                tracing::debug!(status = err.http_status(), error = %err, "handshake failed");
                self.handle.finish_with(handshake::http_error_response(err));
            }
            Stage::Upgraded | Stage::Closing => {
                let code = err.close_code();
                if code == 1002 {
                    RelayMetrics::inc(&self.metrics.protocol_errors);
                }
                tracing::warn!(code, error = %err, "connection error");
                self.emit(FrameEvent::Error {
                    code,
                    message: err.to_string(),
                });
                self.handle.close(code, &err.to_string());
            }
            Stage::Closed => {}
        }
        self.stage = Stage::Closing;
    }

    fn finish(&mut self) {
        self.stage = Stage::Closed;
        self.handle.closed.store(true, Ordering::SeqCst);
        if let Some(sink) = self.sink.take() {
            sink.on_event(FrameEvent::Closed);
        }
    }

    fn emit(&self, ev: FrameEvent) {
        if let Some(sink) = &self.sink {
            sink.on_event(ev);
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}
