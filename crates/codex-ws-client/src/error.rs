//! Client error types.

use thiserror::Error;

/// Client error type.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("timeout error: {0}")]
    Timeout(String),

    #[error("handshake rejected: {status}{}", preview_suffix(.preview))]
    HandshakeRejected { status: String, preview: String },

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("connection closed ({code}): {reason}")]
    Closed { code: u16, reason: String },

    #[error("not connected")]
    NotConnected,
}

/// WebSocket framing violations detected while decoding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("reserved opcode {0:#x}")]
    ReservedOpcode(u8),

    #[error("reserved bits set")]
    ReservedBits,

    #[error("control frame must not be fragmented")]
    FragmentedControl,

    #[error("control frame payload of {0} bytes exceeds 125")]
    ControlTooLong(usize),

    #[error("continuation frame without a message in progress")]
    UnexpectedContinuation,

    #[error("new data frame while a fragmented message is in progress")]
    InterleavedMessage,

    #[error("payload of {0} bytes exceeds limit")]
    PayloadTooLarge(u64),

    #[error("text payload is not valid UTF-8")]
    InvalidUtf8,
}

fn preview_suffix(preview: &str) -> String {
    if preview.is_empty() {
        String::new()
    } else {
        format!(" ({preview})")
    }
}

/// Client result type.
pub type Result<T> = std::result::Result<T, ClientError>;
