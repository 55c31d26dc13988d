//! Client side of the HTTP upgrade handshake (RFC 6455 Section 4.1).
//!
//! - [`generate_key`]: fresh random `Sec-WebSocket-Key`
//! - [`compute_accept_key`]: SHA-1 + Base64 per RFC 6455 Section 4.2.2
//! - [`write_upgrade_request`]: writes the `GET` upgrade request
//! - [`read_upgrade_response`]: reads and parses the response head
//! - [`check_response`]: validates status, `Connection`, `Upgrade` and `Sec-WebSocket-Accept`

use std::io::{BufRead, Read, Write};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha1::{Digest, Sha1};

use crate::error::{Result, WsError};

/// RFC 6455 magic GUID concatenated with the client key for Sec-WebSocket-Accept.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Upper bound on the response status line plus headers.
const MAX_RESPONSE_HEAD: usize = 16 * 1024;

const MAX_RESPONSE_HEADERS: usize = 64;

/// Headers the handshake sets itself; caller-supplied copies are dropped.
const RESERVED_HEADERS: [&str; 5] = [
    "Host",
    "Upgrade",
    "Connection",
    "Sec-WebSocket-Key",
    "Sec-WebSocket-Version",
];

/// Target of an upgrade request plus any extra headers to send with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub host: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
}

impl UpgradeRequest {
    pub fn new(host: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            path: path.into(),
            headers: Vec::new(),
        }
    }

    /// Add an extra request header (for example `Authorization` or
    /// `Sec-WebSocket-Protocol`).
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(WsError::InvalidArgument("host must not be empty".into()));
        }
        if !self.path.starts_with('/') {
            return Err(WsError::InvalidArgument(format!(
                "path must start with '/': {}",
                self.path
            )));
        }
        let bad = |s: &str| s.contains('\r') || s.contains('\n');
        if let Some((name, _)) = self.headers.iter().find(|(n, v)| bad(n) || bad(v)) {
            return Err(WsError::InvalidArgument(format!(
                "header {name:?} contains a line break"
            )));
        }
        Ok(())
    }
}

/// Parsed status line and headers of the server's upgrade response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeResponse {
    pub code: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
}

impl UpgradeResponse {
    /// Case-insensitive header lookup. Returns the first match.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// 16 random bytes, Base64 encoded.
pub fn generate_key() -> String {
    let nonce: [u8; 16] = rand::random();
    BASE64.encode(nonce)
}

/// Compute the `Sec-WebSocket-Accept` value per RFC 6455 Section 4.2.2.
pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Write the upgrade request for `key` and flush it.
pub fn write_upgrade_request<W: Write>(
    stream: &mut W,
    request: &UpgradeRequest,
    key: &str,
) -> Result<()> {
    request.validate()?;

    let mut head = format!(
        "GET {} HTTP/1.1\r\n\
         Host: {}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {}\r\n\
         Sec-WebSocket-Version: 13\r\n",
        request.path, request.host, key
    );
    for (name, value) in &request.headers {
        if RESERVED_HEADERS.iter().any(|r| r.eq_ignore_ascii_case(name)) {
            tracing::debug!(header = %name, "ignoring caller-supplied handshake header");
            continue;
        }
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");

    stream.write_all(head.as_bytes())?;
    stream.flush()?;
    Ok(())
}

/// Read the response head up to and including the blank line.
///
/// Reads line by line so that frame bytes the server sends right after the
/// head stay buffered in `reader`.
pub fn read_upgrade_response<R: BufRead>(reader: &mut R) -> Result<UpgradeResponse> {
    let mut head = Vec::new();
    loop {
        let start = head.len();
        let limit = (MAX_RESPONSE_HEAD - start) as u64;
        if limit == 0 {
            return Err(WsError::Handshake("upgrade response head too large".into()));
        }
        let n = reader.by_ref().take(limit).read_until(b'\n', &mut head)?;
        if n == 0 {
            return Err(WsError::Handshake(
                "connection closed before upgrade response".into(),
            ));
        }
        let line = &head[start..];
        if line == b"\r\n" || line == b"\n" {
            break;
        }
    }

    let mut headers = [httparse::EMPTY_HEADER; MAX_RESPONSE_HEADERS];
    let mut response = httparse::Response::new(&mut headers);
    match response.parse(&head) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(WsError::Handshake("incomplete upgrade response".into()))
        }
        Err(e) => return Err(WsError::Handshake(format!("malformed upgrade response: {e}"))),
    }

    Ok(UpgradeResponse {
        code: response.code.unwrap_or(0),
        reason: response.reason.unwrap_or("").to_string(),
        headers: response
            .headers
            .iter()
            .map(|h| {
                (
                    h.name.to_string(),
                    String::from_utf8_lossy(h.value).trim().to_string(),
                )
            })
            .collect(),
    })
}

/// Validate the response against the key we sent.
pub fn check_response(response: &UpgradeResponse, key: &str) -> Result<()> {
    if response.code != 101 {
        return Err(WsError::Handshake(format!(
            "Expected HTTP 101 response but was '{} {}'",
            response.code, response.reason
        )));
    }

    let connection = response.header("Connection").unwrap_or("");
    if !connection.eq_ignore_ascii_case("Upgrade") {
        return Err(WsError::Handshake(format!(
            "Expected 'Connection' header value 'Upgrade' but was '{connection}'"
        )));
    }

    let upgrade = response.header("Upgrade").unwrap_or("");
    if !upgrade.eq_ignore_ascii_case("websocket") {
        return Err(WsError::Handshake(format!(
            "Expected 'Upgrade' header value 'websocket' but was '{upgrade}'"
        )));
    }

    let accept = response.header("Sec-WebSocket-Accept").unwrap_or("");
    let expected = compute_accept_key(key);
    if accept != expected {
        return Err(WsError::Handshake(format!(
            "Expected 'Sec-WebSocket-Accept' header value '{expected}' but was '{accept}'"
        )));
    }
    Ok(())
}
