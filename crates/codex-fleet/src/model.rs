//! Published state of a connection engine.

use chrono::{DateTime, Utc};
use codex_ws_client::ReasoningEffort;
use serde::Serialize;

/// Protocol-level connection state shown to consumers.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl ConnectionState {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Failed => "failed",
        }
    }
}

/// Transport-level phase of the current socket.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SocketPhase {
    Idle,
    Connecting,
    Handshaking,
    Open,
    Closed,
}

impl SocketPhase {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Handshaking => "handshaking",
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }

    /// Whether `state` is a valid projection of this phase.
    pub const fn admits(self, state: ConnectionState) -> bool {
        match state {
            ConnectionState::Connected => matches!(self, Self::Open),
            ConnectionState::Connecting => {
                matches!(self, Self::Connecting | Self::Handshaking | Self::Open)
            }
            ConnectionState::Disconnected | ConnectionState::Failed => {
                matches!(self, Self::Idle | Self::Closed)
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ThreadInfo {
    pub id: String,
    pub cwd: Option<String>,
    pub title: String,
    pub updated_at: DateTime<Utc>,
    /// Known only by id; details not fetched yet.
    pub placeholder: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskKind {
    CommandExecution,
    FileChange,
    McpToolCall,
    WebSearch,
    Turn,
}

impl TaskKind {
    /// Item types tracked as running tasks.
    pub fn from_item_type(item_type: &str) -> Option<Self> {
        match item_type {
            "commandExecution" => Some(Self::CommandExecution),
            "fileChange" => Some(Self::FileChange),
            "mcpToolCall" => Some(Self::McpToolCall),
            "webSearch" => Some(Self::WebSearch),
            _ => None,
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::CommandExecution => "commandExecution",
            Self::FileChange => "fileChange",
            Self::McpToolCall => "mcpToolCall",
            Self::WebSearch => "webSearch",
            Self::Turn => "turn",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RunningTask {
    /// Item id, or `turn:<id>` for a whole turn.
    pub id: String,
    pub name: String,
    pub kind: TaskKind,
    pub thread_id: Option<String>,
    pub turn_id: Option<String>,
    pub started_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    System,
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ActivityEntry {
    pub thread_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub kind: ActivityKind,
    pub text: String,
    pub images: Vec<String>,
    pub item_id: Option<String>,
}

impl ActivityEntry {
    pub fn system(thread_id: Option<String>, text: impl Into<String>) -> Self {
        Self {
            thread_id,
            timestamp: Utc::now(),
            kind: ActivityKind::System,
            text: text.into(),
            images: Vec::new(),
            item_id: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ModelOption {
    pub id: String,
    pub model: String,
    pub display_name: String,
    pub description: String,
    pub default_effort: Option<ReasoningEffort>,
    pub supported_efforts: Vec<ReasoningEffort>,
    pub is_default: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CollaborationModeOption {
    pub name: String,
    pub mode: Option<String>,
    pub model: Option<String>,
    pub reasoning_effort: Option<ReasoningEffort>,
}

/// Everything a consumer can observe about one engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EngineSnapshot {
    pub state: ConnectionState,
    pub phase: SocketPhase,
    pub url: Option<String>,
    pub last_error: Option<String>,
    /// Sorted by descending update time.
    pub threads: Vec<ThreadInfo>,
    /// Sorted by descending start time.
    pub tasks: Vec<RunningTask>,
    pub activity: Vec<ActivityEntry>,
    pub models: Vec<ModelOption>,
    pub collaboration_modes: Vec<CollaborationModeOption>,
    pub current_thread_id: Option<String>,
    pub submitted_task_count: u64,
    pub submitting: bool,
}

impl Default for EngineSnapshot {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            phase: SocketPhase::Idle,
            url: None,
            last_error: None,
            threads: Vec::new(),
            tasks: Vec::new(),
            activity: Vec::new(),
            models: Vec::new(),
            collaboration_modes: Vec::new(),
            current_thread_id: None,
            submitted_task_count: 0,
            submitting: false,
        }
    }
}

impl EngineSnapshot {
    pub fn thread(&self, thread_id: &str) -> Option<&ThreadInfo> {
        self.threads.iter().find(|thread| thread.id == thread_id)
    }

    pub fn activity_for<'a>(&'a self, thread_id: &'a str) -> impl Iterator<Item = &'a ActivityEntry> {
        self.activity
            .iter()
            .filter(move |entry| entry.thread_id.as_deref() == Some(thread_id))
    }
}

/// A prompt submission.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TaskRequest {
    pub prompt: String,
    pub thread_id: Option<String>,
    pub model: Option<String>,
    pub effort: Option<ReasoningEffort>,
    /// Name of a mode from the collaboration mode catalog.
    pub collaboration_mode: Option<String>,
    pub cwd: Option<String>,
    /// Image URLs, `data:` URIs, or paths on the server host.
    pub images: Vec<String>,
}

impl TaskRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }
}

/// Result of a remote directory listing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DirectoryListing {
    pub cwd: String,
    pub directories: Vec<String>,
}
