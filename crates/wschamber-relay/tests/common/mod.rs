//! Minimal WebSocket test client (client-side masking over raw TCP).

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(dead_code)] // not every test file uses every helper

use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use wschamber_core::frame::{opcode, parse_close_payload, read_header};

const IO_TIMEOUT: Duration = Duration::from_secs(5);
const MASK: [u8; 4] = [0x12, 0x34, 0x56, 0x78];

pub struct TestClient {
    stream: TcpStream,
    rbuf: BytesMut,
}

impl TestClient {
    /// Connect and complete the upgrade handshake with subprotocol `echo`.
    pub async fn connect(addr: SocketAddr, path: &str) -> Self {
        Self::connect_with_origin(addr, path, None).await
    }

    pub async fn connect_with_origin(addr: SocketAddr, path: &str, origin: Option<&str>) -> Self {
        let mut stream = TcpStream::connect(addr).await.expect("connect");
        let origin_line = origin
            .map(|o| format!("Origin: {o}\r\n"))
            .unwrap_or_default();
        let request = format!(
            "GET {path} HTTP/1.1\r\n\
             Host: localhost\r\n\
             Connection: Upgrade\r\n\
             Upgrade: websocket\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
             Sec-WebSocket-Version: 13\r\n\
             Sec-WebSocket-Protocol: echo\r\n\
             {origin_line}\r\n"
        );
        stream.write_all(request.as_bytes()).await.expect("request");

        let head = read_response_head(&mut stream).await;
        assert!(
            head.starts_with("HTTP/1.1 101"),
            "expected 101, got: {head}"
        );
        assert!(head.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));

        Self {
            stream,
            rbuf: BytesMut::new(),
        }
    }

    pub async fn send_frame(&mut self, op: u8, payload: &[u8], fin: bool) {
        let mut out = Vec::with_capacity(payload.len() + 14);
        out.push(if fin { 0x80 | op } else { op });
        match payload.len() {
            n if n <= 125 => out.push(0x80 | n as u8),
            n if n <= 65535 => {
                out.push(0x80 | 126);
                out.extend_from_slice(&(n as u16).to_be_bytes());
            }
            n => {
                out.push(0x80 | 127);
                out.extend_from_slice(&(n as u64).to_be_bytes());
            }
        }
        out.extend_from_slice(&MASK);
        out.extend(payload.iter().enumerate().map(|(i, b)| b ^ MASK[i & 3]));
        self.stream.write_all(&out).await.expect("send frame");
    }

    pub async fn send_text(&mut self, payload: &str) {
        self.send_frame(opcode::TEXT, payload.as_bytes(), true).await;
    }

    pub async fn send_ping(&mut self, payload: &[u8]) {
        self.send_frame(opcode::PING, payload, true).await;
    }

    pub async fn send_close(&mut self, code: u16) {
        let payload = code.to_be_bytes();
        self.send_frame(opcode::CLOSE, &payload, true).await;
    }

    /// Read one complete frame: (opcode, payload, fin).
    pub async fn next_frame(&mut self) -> (u8, Vec<u8>, bool) {
        loop {
            if let Some(h) = read_header(&self.rbuf) {
                assert!(h.mask.is_none(), "server frames must not be masked");
                let total = h.header_len + h.payload_len as usize;
                if self.rbuf.len() >= total {
                    self.rbuf.advance(h.header_len);
                    let payload = self.rbuf.split_to(h.payload_len as usize).to_vec();
                    return (h.opcode, payload, h.fin);
                }
            }
            let n = timeout(IO_TIMEOUT, self.stream.read_buf(&mut self.rbuf))
                .await
                .expect("timed out waiting for frame")
                .expect("read");
            assert!(n > 0, "connection closed while waiting for a frame");
        }
    }

    /// Assemble one data message (frames up to fin), skipping control
    /// frames other than close (close mid-wait is a test failure).
    pub async fn next_message(&mut self) -> (u8, Vec<u8>) {
        let mut op = 0;
        let mut out = Vec::new();
        loop {
            let (frame_op, payload, fin) = self.next_frame().await;
            match frame_op {
                opcode::CLOSE => panic!(
                    "unexpected close while waiting for a message: {:?}",
                    parse_close_payload(&payload)
                ),
                opcode::PING | opcode::PONG => continue,
                opcode::CONTINUATION => out.extend_from_slice(&payload),
                o => {
                    op = o;
                    out.extend_from_slice(&payload);
                }
            }
            if fin {
                return (op, out);
            }
        }
    }

    pub async fn next_text(&mut self) -> String {
        let (op, data) = self.next_message().await;
        assert_eq!(op, opcode::TEXT);
        String::from_utf8(data).expect("text message")
    }

    /// Read frames until a close frame arrives; returns (code, reason).
    pub async fn expect_close(&mut self) -> (u16, String) {
        loop {
            let (op, payload, _fin) = self.next_frame().await;
            if op == opcode::CLOSE {
                return parse_close_payload(&payload);
            }
        }
    }

    /// Raw stream access for tests that write malformed bytes on purpose.
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// True when no frame arrives within `wait`.
    pub async fn is_silent(&mut self, wait: Duration) -> bool {
        timeout(wait, self.stream.read_buf(&mut self.rbuf))
            .await
            .is_err()
    }
}

/// Send a raw request and return the entire response (error paths close the
/// socket after writing, so read-to-end terminates).
pub async fn raw_request(addr: SocketAddr, request: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    stream
        .write_all(request.as_bytes())
        .await
        .expect("write request");
    let mut out = Vec::new();
    timeout(IO_TIMEOUT, stream.read_to_end(&mut out))
        .await
        .expect("timed out reading response")
        .expect("read response");
    String::from_utf8_lossy(&out).into_owned()
}

async fn read_response_head(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        let n = timeout(IO_TIMEOUT, stream.read(&mut byte))
            .await
            .expect("timed out reading response head")
            .expect("read");
        assert!(n > 0, "connection closed during handshake");
        buf.push(byte[0]);
        if buf.ends_with(b"\r\n\r\n") {
            return String::from_utf8_lossy(&buf).into_owned();
        }
    }
}
