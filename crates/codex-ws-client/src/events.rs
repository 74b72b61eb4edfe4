//! Normalization of app-server notifications.
//!
//! Servers emit a namespaced event set (`turn/started`, `item/completed`, ...)
//! and, on older builds, a flat snake_case set discriminated by a `type` field
//! (`params.msg.type`, `params.type`, or the method name itself). Both shapes
//! are parsed into one [`NormalizedEvent`] so callers never branch on shape.

use serde_json::{Value, json};

/// Identifiers found in a notification, before any correlation lookups.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventIds {
    pub thread_id: Option<String>,
    /// Thread id nested under a `turn` object.
    pub turn_thread_id: Option<String>,
    pub turn_id: Option<String>,
    pub item_id: Option<String>,
}

/// A turn item in the namespaced shape. Legacy items are rewritten into it.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemPayload {
    pub id: Option<String>,
    pub kind: String,
    pub raw: Value,
}

impl ItemPayload {
    pub fn from_value(raw: &Value) -> Option<Self> {
        let kind = raw.get("type").and_then(Value::as_str)?.to_string();
        Some(Self {
            id: string_field(raw, "id"),
            kind,
            raw: raw.clone(),
        })
    }

    pub fn text(&self) -> Option<String> {
        string_field(&self.raw, "text")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    ThreadStarted {
        thread: Value,
    },
    ThreadArchived,
    ThreadNameUpdated {
        name: Option<String>,
    },
    TurnStarted,
    TurnCompleted {
        status: Option<String>,
        error: Option<String>,
    },
    ItemStarted {
        item: ItemPayload,
    },
    ItemCompleted {
        item: ItemPayload,
    },
    AgentMessageDelta {
        delta: String,
    },
    Error {
        message: String,
        will_retry: bool,
    },
}

impl ServerEvent {
    pub const fn label(&self) -> &'static str {
        match self {
            Self::ThreadStarted { .. } => "thread_started",
            Self::ThreadArchived => "thread_archived",
            Self::ThreadNameUpdated { .. } => "thread_name_updated",
            Self::TurnStarted => "turn_started",
            Self::TurnCompleted { .. } => "turn_completed",
            Self::ItemStarted { .. } => "item_started",
            Self::ItemCompleted { .. } => "item_completed",
            Self::AgentMessageDelta { .. } => "agent_message_delta",
            Self::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEvent {
    pub ids: EventIds,
    pub event: ServerEvent,
}

/// Normalize one notification. Unknown methods and types yield `None`.
pub fn normalize_notification(method: &str, params: &Value) -> Option<NormalizedEvent> {
    if let Some(event) = normalize_namespaced(method, params) {
        return Some(event);
    }
    let (kind, body) = legacy_discriminator(method, params)?;
    normalize_legacy(&kind, body, params)
}

fn normalize_namespaced(method: &str, params: &Value) -> Option<NormalizedEvent> {
    let mut ids = common_ids(params);
    let event = match method {
        "thread/started" => {
            let thread = params.get("thread").cloned().unwrap_or(Value::Null);
            if let Some(id) = string_field(&thread, "id") {
                ids.thread_id = Some(id);
            }
            ids.thread_id.as_ref()?;
            ServerEvent::ThreadStarted { thread }
        }
        "thread/archived" => {
            ids.thread_id.as_ref()?;
            ServerEvent::ThreadArchived
        }
        "thread/name/updated" => ServerEvent::ThreadNameUpdated {
            name: string_field(params, "threadName").or_else(|| string_field(params, "name")),
        },
        "turn/started" => ServerEvent::TurnStarted,
        "turn/completed" => {
            let turn = params.get("turn");
            let status = turn
                .and_then(|turn| string_field(turn, "status"))
                .or_else(|| string_field(params, "status"));
            let error = turn
                .and_then(|turn| turn.get("error"))
                .and_then(error_message)
                .or_else(|| params.get("error").and_then(error_message));
            ServerEvent::TurnCompleted { status, error }
        }
        "item/started" | "item/completed" => {
            let item = ItemPayload::from_value(params.get("item")?)?;
            if let Some(id) = &item.id {
                ids.item_id = Some(id.clone());
            }
            if method == "item/started" {
                ServerEvent::ItemStarted { item }
            } else {
                ServerEvent::ItemCompleted { item }
            }
        }
        "item/agentMessage/delta" => {
            ids.item_id.as_ref()?;
            ServerEvent::AgentMessageDelta {
                delta: string_field(params, "delta")?,
            }
        }
        "error" => ServerEvent::Error {
            message: params
                .get("error")
                .and_then(error_message)
                .or_else(|| string_field(params, "message"))
                .unwrap_or_else(|| "Unknown error".to_string()),
            will_retry: params
                .get("willRetry")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        },
        _ => return None,
    };
    Some(NormalizedEvent { ids, event })
}

/// Find the legacy event type and the object holding its fields.
fn legacy_discriminator<'a>(method: &str, params: &'a Value) -> Option<(String, &'a Value)> {
    if let Some(msg) = params.get("msg").filter(|msg| msg.is_object())
        && let Some(kind) = string_field(msg, "type")
    {
        return Some((kind, msg));
    }
    if let Some(kind) = string_field(params, "type") {
        return Some((kind, params));
    }
    let tail = method.rsplit('/').next().unwrap_or(method);
    is_snake_case(tail).then(|| (tail.to_string(), params))
}

fn is_snake_case(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_')
}

fn normalize_legacy(kind: &str, body: &Value, params: &Value) -> Option<NormalizedEvent> {
    let mut ids = common_ids(body);
    merge_ids(&mut ids, common_ids(params));
    if ids.thread_id.is_none() {
        ids.thread_id = string_field(params, "conversationId")
            .or_else(|| string_field(body, "conversation_id"))
            .or_else(|| string_field(body, "session_id"));
    }
    if ids.turn_id.is_none() {
        // Legacy envelopes tag events with the submission id that started the turn.
        ids.turn_id = string_field(params, "id").filter(|_| params.get("msg").is_some());
    }

    let call_id = string_field(body, "call_id").or_else(|| string_field(body, "item_id"));
    let event = match kind {
        "session_configured" | "thread_started" => {
            let id = ids.thread_id.clone()?;
            ServerEvent::ThreadStarted {
                thread: json!({
                    "id": id,
                    "cwd": body.get("cwd").cloned().unwrap_or(Value::Null),
                }),
            }
        }
        "task_started" | "turn_started" => ServerEvent::TurnStarted,
        "task_complete" | "turn_complete" => ServerEvent::TurnCompleted {
            status: Some("completed".to_string()),
            error: None,
        },
        "turn_aborted" => ServerEvent::TurnCompleted {
            status: Some("interrupted".to_string()),
            error: string_field(body, "reason"),
        },
        "agent_message_delta" => {
            ids.item_id = Some(call_id.unwrap_or_else(|| legacy_message_id(&ids)));
            ServerEvent::AgentMessageDelta {
                delta: string_field(body, "delta")?,
            }
        }
        "agent_message" => {
            let id = call_id.unwrap_or_else(|| legacy_message_id(&ids));
            ids.item_id = Some(id.clone());
            ServerEvent::ItemCompleted {
                item: ItemPayload {
                    id: Some(id.clone()),
                    kind: "agentMessage".to_string(),
                    raw: json!({
                        "id": id,
                        "type": "agentMessage",
                        "text": string_field(body, "message").unwrap_or_default(),
                    }),
                },
            }
        }
        "exec_command_begin" | "exec_command_end" => {
            let command = match body.get("command") {
                Some(Value::Array(parts)) => parts
                    .iter()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .join(" "),
                Some(Value::String(command)) => command.clone(),
                _ => String::new(),
            };
            legacy_item(
                &mut ids,
                kind,
                call_id?,
                "commandExecution",
                json!({ "command": command, "cwd": body.get("cwd").cloned().unwrap_or(Value::Null) }),
            )
        }
        "patch_apply_begin" | "patch_apply_end" => {
            let changes = body
                .get("changes")
                .and_then(Value::as_object)
                .map(|changes| {
                    changes
                        .keys()
                        .map(|path| json!({ "path": path }))
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            legacy_item(
                &mut ids,
                kind,
                call_id?,
                "fileChange",
                json!({ "changes": changes }),
            )
        }
        "mcp_tool_call_begin" | "mcp_tool_call_end" => {
            let invocation = body.get("invocation").unwrap_or(body);
            legacy_item(
                &mut ids,
                kind,
                call_id?,
                "mcpToolCall",
                json!({
                    "server": string_field(invocation, "server").unwrap_or_default(),
                    "tool": string_field(invocation, "tool").unwrap_or_default(),
                }),
            )
        }
        "web_search_begin" | "web_search_end" => legacy_item(
            &mut ids,
            kind,
            call_id?,
            "webSearch",
            json!({ "query": string_field(body, "query").unwrap_or_default() }),
        ),
        "error" | "stream_error" => ServerEvent::Error {
            message: string_field(body, "message").unwrap_or_else(|| "Unknown error".to_string()),
            will_retry: kind == "stream_error",
        },
        _ => return None,
    };
    Some(NormalizedEvent { ids, event })
}

fn legacy_item(
    ids: &mut EventIds,
    kind: &str,
    id: String,
    item_type: &str,
    mut fields: Value,
) -> ServerEvent {
    ids.item_id = Some(id.clone());
    fields["id"] = Value::String(id.clone());
    fields["type"] = Value::String(item_type.to_string());
    let item = ItemPayload {
        id: Some(id),
        kind: item_type.to_string(),
        raw: fields,
    };
    if kind.ends_with("_begin") {
        ServerEvent::ItemStarted { item }
    } else {
        ServerEvent::ItemCompleted { item }
    }
}

fn legacy_message_id(ids: &EventIds) -> String {
    let scope = ids
        .turn_id
        .as_deref()
        .or(ids.thread_id.as_deref())
        .unwrap_or("unknown");
    format!("legacy-message:{scope}")
}

fn common_ids(value: &Value) -> EventIds {
    let turn = value.get("turn");
    EventIds {
        thread_id: string_field(value, "threadId").or_else(|| string_field(value, "thread_id")),
        turn_thread_id: turn
            .and_then(|turn| string_field(turn, "threadId").or_else(|| string_field(turn, "thread_id"))),
        turn_id: turn
            .and_then(|turn| string_field(turn, "id"))
            .or_else(|| string_field(value, "turnId"))
            .or_else(|| string_field(value, "turn_id")),
        item_id: string_field(value, "itemId").or_else(|| string_field(value, "item_id")),
    }
}

fn merge_ids(ids: &mut EventIds, fallback: EventIds) {
    if ids.thread_id.is_none() {
        ids.thread_id = fallback.thread_id;
    }
    if ids.turn_thread_id.is_none() {
        ids.turn_thread_id = fallback.turn_thread_id;
    }
    if ids.turn_id.is_none() {
        ids.turn_id = fallback.turn_id;
    }
    if ids.item_id.is_none() {
        ids.item_id = fallback.item_id;
    }
}

fn error_message(value: &Value) -> Option<String> {
    match value {
        Value::String(message) => Some(message.clone()),
        other => string_field(other, "message"),
    }
}

pub(crate) fn string_field(value: &Value, field: &str) -> Option<String> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
}
