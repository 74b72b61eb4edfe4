//! HTTP/1.1 upgrade handshake for the app-server WebSocket.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use crate::endpoint::WsTarget;

/// Upper bound on response header bytes before the handshake is abandoned.
pub const MAX_HEADER_BYTES: usize = 16 * 1024;

const HEADER_DELIMITER: &[u8] = b"\r\n\r\n";
const PREVIEW_CHARS: usize = 160;

/// A serialized upgrade request plus the key it was built with.
#[derive(Debug, Clone)]
pub struct HandshakeRequest {
    pub key: String,
    pub bytes: Vec<u8>,
}

/// Build the GET upgrade request for `target` with a fresh random key.
pub fn build_request(target: &WsTarget) -> HandshakeRequest {
    let nonce: [u8; 16] = rand::random();
    let key = STANDARD.encode(nonce);
    let request = format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         \r\n",
        path = target.path,
        host = target.host_header(),
    );
    HandshakeRequest {
        key,
        bytes: request.into_bytes(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// Header block not complete yet.
    Incomplete,
    /// `101` received; `leftover` holds bytes that followed the header block.
    Accepted { leftover: Vec<u8> },
    /// Any other status line, or an oversized header block.
    Rejected { status: String, preview: String },
}

/// Accumulates response bytes until the header block terminates.
#[derive(Debug, Default)]
pub struct HandshakeParser {
    buffer: Vec<u8>,
}

impl HandshakeParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> HandshakeOutcome {
        self.buffer.extend_from_slice(bytes);

        let Some(end) = find_delimiter(&self.buffer) else {
            if self.buffer.len() > MAX_HEADER_BYTES {
                return HandshakeOutcome::Rejected {
                    status: "response headers too large".to_string(),
                    preview: String::new(),
                };
            }
            return HandshakeOutcome::Incomplete;
        };

        let header = String::from_utf8_lossy(&self.buffer[..end]).into_owned();
        let leftover = self.buffer[end + HEADER_DELIMITER.len()..].to_vec();
        let status = header.lines().next().unwrap_or_default().trim().to_string();

        if status_is_switching(&status) {
            HandshakeOutcome::Accepted { leftover }
        } else {
            HandshakeOutcome::Rejected {
                status: if status.is_empty() {
                    "empty status line".to_string()
                } else {
                    status
                },
                preview: body_preview(&leftover),
            }
        }
    }
}

fn find_delimiter(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(HEADER_DELIMITER.len())
        .position(|window| window == HEADER_DELIMITER)
}

fn status_is_switching(status: &str) -> bool {
    let mut parts = status.split_whitespace();
    let version = parts.next().unwrap_or_default();
    version.starts_with("HTTP/") && parts.next() == Some("101")
}

fn body_preview(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() > PREVIEW_CHARS {
        let truncated: String = collapsed.chars().take(PREVIEW_CHARS).collect();
        format!("{truncated}...")
    } else {
        collapsed
    }
}
