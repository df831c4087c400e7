//! HTTP Upgrade handshake (RFC 6455 section 4, server side).
//!
//! The connection feeds CRLF-terminated lines through these parsers while
//! in its pre-upgrade stages. Everything here is bounded: request line and
//! header lines are capped, the header map rejects oversized values and
//! too many entries, and every failure maps to a fixed-format HTTP error
//! response before the socket is destroyed.

use base64::Engine;
use sha1::{Digest, Sha1};

use bytes::Bytes;
use wschamber_core::error::{RelayError, Result};

use crate::transport::{Accept, UpgradeHandler};

/// RFC 6455 GUID for the Sec-WebSocket-Accept calculation.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Per-line cap for the request line and each header line.
pub const MAX_HEADER_LINE: usize = 1024;
/// Cap for one header value after repeated-header concatenation.
pub const MAX_HEADER_VALUE: usize = 1024;
/// Cap on distinct header names.
pub const MAX_HEADER_COUNT: usize = 32;

/// Compute the Sec-WebSocket-Accept value from a client key
/// (base64 of SHA1(key + GUID)).
pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Case-preserving header map with case-insensitive lookup. Repeated
/// headers concatenate with `", "`.
#[derive(Debug, Default)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert one parsed `Key: Value` line, enforcing value and count caps.
    pub fn append(&mut self, key: &str, value: &str) -> Result<()> {
        if let Some((_, existing)) = self
            .entries
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
        {
            existing.push_str(", ");
            existing.push_str(value);
            if existing.len() > MAX_HEADER_VALUE {
                return Err(RelayError::BadRequest(format!("header {key} too long")));
            }
            return Ok(());
        }
        if value.len() > MAX_HEADER_VALUE {
            return Err(RelayError::BadRequest(format!("header {key} too long")));
        }
        if self.entries.len() >= MAX_HEADER_COUNT {
            return Err(RelayError::BadRequest("too many headers".into()));
        }
        self.entries.push((key.to_string(), value.to_string()));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn path_byte_ok(b: u8) -> bool {
    b.is_ascii_alphanumeric()
        || matches!(
            b,
            b'_' | b'/' | b'\\' | b'.' | b'?' | b'&' | b'%' | b'+' | b' ' | b'-' | b'=' | b'~'
        )
}

/// Parse `GET <path> HTTP/1.1` with a conservative path character class.
pub fn parse_request_line(line: &str) -> Result<String> {
    let path = line
        .strip_prefix("GET ")
        .and_then(|rest| rest.strip_suffix(" HTTP/1.1"))
        .ok_or_else(|| RelayError::BadRequest("malformed request line".into()))?;
    if path.is_empty() || !path.bytes().all(path_byte_ok) {
        return Err(RelayError::BadRequest("malformed request path".into()));
    }
    Ok(path.to_string())
}

/// Parse one `Key: Value` header line.
pub fn parse_header_line(line: &str) -> Result<(&str, &str)> {
    let (key, value) = line
        .split_once(':')
        .ok_or_else(|| RelayError::BadRequest("malformed header line".into()))?;
    Ok((key.trim(), value.trim()))
}

/// Split a `Sec-WebSocket-Protocol` value into requested protocol names.
pub fn parse_protocols(value: Option<&str>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Validate the collected upgrade headers and resolve the first matching
/// handler. Returns the winning [`Accept`] and the `101` response bytes.
pub fn resolve_upgrade(
    path: &str,
    headers: &HeaderMap,
    handlers: &[std::sync::Arc<dyn UpgradeHandler>],
) -> Result<(Accept, Bytes)> {
    let connection = headers
        .get("Connection")
        .ok_or_else(|| RelayError::BadRequest("missing Connection header".into()))?;
    if !connection.eq_ignore_ascii_case("Upgrade") {
        return Err(RelayError::BadRequest("Connection must be Upgrade".into()));
    }
    let upgrade = headers
        .get("Upgrade")
        .ok_or_else(|| RelayError::BadRequest("missing Upgrade header".into()))?;
    if !upgrade.eq_ignore_ascii_case("websocket") {
        return Err(RelayError::BadRequest("Upgrade must be websocket".into()));
    }
    let key = headers
        .get("Sec-WebSocket-Key")
        .ok_or_else(|| RelayError::BadRequest("missing Sec-WebSocket-Key".into()))?;
    let version: u32 = headers
        .get("Sec-WebSocket-Version")
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| RelayError::BadRequest("missing Sec-WebSocket-Version".into()))?;
    if version < 13 {
        return Err(RelayError::BadRequest(format!(
            "unsupported WebSocket version: {version}"
        )));
    }

    let protocols = parse_protocols(headers.get("Sec-WebSocket-Protocol"));

    // First-match dispatch over registered handlers.
    for h in handlers {
        if let Some(accept) = h.test(path, headers, &protocols)? {
            let response = switching_protocols(&compute_accept_key(key), accept.protocol);
            return Ok((accept, response));
        }
    }
    Err(RelayError::NoHandler)
}

fn switching_protocols(accept_key: &str, protocol: &str) -> Bytes {
    Bytes::from(format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept_key}\r\n\
         Sec-WebSocket-Protocol: {protocol}\r\n\
         \r\n"
    ))
}

fn status_text(code: u16) -> &'static str {
    match code {
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        _ => "Internal Server Error",
    }
}

/// Fixed-format HTTP error response written before the socket is destroyed.
pub fn http_error_response(err: &RelayError) -> Bytes {
    let code = err.http_status();
    let message = err.to_string();
    Bytes::from(format!(
        "HTTP/1.1 {code} {status}\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         Content-Length: {len}\r\n\
         \r\n\
         {message}\n",
        status = status_text(code),
        len = message.len() + 1,
    ))
}
