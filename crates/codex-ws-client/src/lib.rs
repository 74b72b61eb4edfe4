//! WebSocket client primitives for the Codex app-server.
//!
//! The crate covers the wire layers only:
//! - frame codec and HTTP upgrade handshake over TCP or TLS
//! - JSON-RPC request ids, pending-request bookkeeping, envelope parsing
//! - normalization of namespaced and legacy notifications

pub mod endpoint;
pub mod error;
pub mod events;
pub mod frame;
pub mod handshake;
pub mod rpc;
pub mod socket;
pub mod types;

pub use endpoint::{FALLBACK_PATH, WsTarget, candidate_urls, parse_endpoint};
pub use error::{ClientError, FrameError, Result};
pub use events::{EventIds, ItemPayload, NormalizedEvent, ServerEvent, normalize_notification};
pub use frame::{Frame, FrameReader, Message, Opcode, encode_client_frame};
pub use handshake::{HandshakeOutcome, HandshakeParser, HandshakeRequest, build_request};
pub use rpc::{AppServerRequestId, Incoming, PendingRequest, RpcDispatcher, RpcError, parse_incoming};
pub use socket::{AsyncStream, BoxedStream, open_stream, perform_handshake};
pub use types::*;

pub const SUPPORTED_CLIENT_REQUEST_METHODS: &[&str] = &[
    "initialize",
    "thread/start",
    "thread/resume",
    "thread/list",
    "thread/read",
    "thread/archive",
    "turn/start",
    "model/list",
    "collaborationMode/list",
    "command/exec",
];

pub const SUPPORTED_CLIENT_NOTIFICATION_METHODS: &[&str] = &["initialized"];

pub const SUPPORTED_SERVER_NOTIFICATION_METHODS: &[&str] = &[
    "error",
    "thread/started",
    "thread/archived",
    "thread/name/updated",
    "turn/started",
    "turn/completed",
    "item/started",
    "item/completed",
    "item/agentMessage/delta",
];

/// Legacy event types recognized through a `type` discriminator.
pub const SUPPORTED_LEGACY_EVENT_TYPES: &[&str] = &[
    "session_configured",
    "thread_started",
    "task_started",
    "turn_started",
    "task_complete",
    "turn_complete",
    "turn_aborted",
    "agent_message_delta",
    "agent_message",
    "exec_command_begin",
    "exec_command_end",
    "patch_apply_begin",
    "patch_apply_end",
    "mcp_tool_call_begin",
    "mcp_tool_call_end",
    "web_search_begin",
    "web_search_end",
    "error",
    "stream_error",
];
