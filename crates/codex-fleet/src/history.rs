//! Reconstruction of threads and activity from loosely shaped payloads.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use crate::model::{ActivityEntry, ActivityKind, ThreadInfo};

/// Shown instead of assistant text that is really an encoded image.
pub const IMAGE_PLACEHOLDER: &str = "[image omitted]";

pub const UNTITLED_THREAD: &str = "Untitled thread";
const TITLE_MAX_CHARS: usize = 80;
const BASE64_BLOB_MIN_LEN: usize = 256;

/// Build a thread from a `thread` object. Returns `None` without an id.
pub fn thread_from_value(value: &Value, observed_at: DateTime<Utc>) -> Option<ThreadInfo> {
    let id = string_field(value, "id").filter(|id| !id.is_empty())?;
    let title = string_field(value, "name")
        .or_else(|| string_field(value, "title"))
        .or_else(|| string_field(value, "preview"))
        .map(|text| title_from_text(&text))
        .filter(|title| !title.is_empty())
        .unwrap_or_else(|| UNTITLED_THREAD.to_string());
    let updated_at = value
        .get("updatedAt")
        .or_else(|| value.get("updated_at"))
        .or_else(|| value.get("createdAt"))
        .or_else(|| value.get("created_at"))
        .and_then(timestamp_from_value)
        .unwrap_or(observed_at);
    Some(ThreadInfo {
        id,
        cwd: string_field(value, "cwd").filter(|cwd| !cwd.is_empty()),
        title,
        updated_at,
        placeholder: false,
    })
}

/// Entry for a thread known only by id.
pub fn placeholder_thread(id: &str) -> ThreadInfo {
    let short: String = id.chars().take(8).collect();
    ThreadInfo {
        id: id.to_string(),
        cwd: None,
        title: format!("Thread {short}"),
        updated_at: DateTime::<Utc>::UNIX_EPOCH,
        placeholder: true,
    }
}

/// Fold a newer observation of the same thread into `existing`.
///
/// Placeholders never overwrite real details.
pub fn merge_thread(existing: &mut ThreadInfo, incoming: ThreadInfo) {
    if incoming.placeholder && !existing.placeholder {
        return;
    }
    if existing.placeholder || incoming.title != UNTITLED_THREAD {
        existing.title = incoming.title;
    }
    if incoming.cwd.is_some() {
        existing.cwd = incoming.cwd;
    }
    existing.updated_at = existing.updated_at.max(incoming.updated_at);
    existing.placeholder = existing.placeholder && incoming.placeholder;
}

pub fn title_from_text(text: &str) -> String {
    let line = text
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or_default();
    if line.chars().count() > TITLE_MAX_CHARS {
        let truncated: String = line.chars().take(TITLE_MAX_CHARS).collect();
        format!("{}...", truncated.trim_end())
    } else {
        line.to_string()
    }
}

/// Accepts unix seconds, unix milliseconds, or RFC 3339 strings.
pub fn timestamp_from_value(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(number) => {
            let raw = number.as_i64()?;
            if raw > 10_000_000_000 {
                Utc.timestamp_millis_opt(raw).single()
            } else {
                Utc.timestamp_opt(raw, 0).single()
            }
        }
        Value::String(text) => DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|parsed| parsed.with_timezone(&Utc)),
        _ => None,
    }
}

/// Rebuild the activity log of one thread from `thread/read` turns.
pub fn activity_from_turns(
    thread_id: &str,
    turns: &[Value],
    fallback_time: DateTime<Utc>,
) -> Vec<ActivityEntry> {
    let mut entries = Vec::new();
    for turn in turns {
        let turn_time = turn
            .get("startedAt")
            .or_else(|| turn.get("createdAt"))
            .and_then(timestamp_from_value)
            .unwrap_or(fallback_time);
        let Some(items) = turn.get("items").and_then(Value::as_array) else {
            continue;
        };
        for item in items {
            if let Some(entry) = entry_from_item(thread_id, item, turn_time) {
                entries.push(entry);
            }
        }
        if let Some(message) = turn
            .get("error")
            .and_then(|error| string_field(error, "message"))
        {
            entries.push(ActivityEntry {
                timestamp: turn_time,
                ..ActivityEntry::system(Some(thread_id.to_string()), format!("Turn failed: {message}"))
            });
        }
    }
    entries
}

fn entry_from_item(thread_id: &str, item: &Value, timestamp: DateTime<Utc>) -> Option<ActivityEntry> {
    let item_type = string_field(item, "type")?;
    let (kind, text, images) = match item_type.as_str() {
        "userMessage" => {
            let (text, images) = content_parts(item.get("content"));
            (ActivityKind::User, text, images)
        }
        "agentMessage" => (
            ActivityKind::Assistant,
            sanitize_assistant_text(&string_field(item, "text").unwrap_or_default()),
            Vec::new(),
        ),
        "message" => {
            let kind = match string_field(item, "role").as_deref() {
                Some("user") => ActivityKind::User,
                Some("assistant") => ActivityKind::Assistant,
                _ => return None,
            };
            let (text, images) = content_parts(item.get("content"));
            let text = if kind == ActivityKind::Assistant {
                sanitize_assistant_text(&text)
            } else {
                text
            };
            (kind, text, images)
        }
        _ => return None,
    };
    if text.trim().is_empty() && images.is_empty() {
        return None;
    }
    Some(ActivityEntry {
        thread_id: Some(thread_id.to_string()),
        timestamp,
        kind,
        text,
        images,
        item_id: string_field(item, "id"),
    })
}

/// Text and image references from a content array, in either item dialect.
fn content_parts(content: Option<&Value>) -> (String, Vec<String>) {
    let mut texts = Vec::new();
    let mut images = Vec::new();
    match content {
        Some(Value::String(text)) => texts.push(text.clone()),
        Some(Value::Array(parts)) => {
            for part in parts {
                match string_field(part, "type").as_deref() {
                    Some("text" | "input_text" | "output_text") => {
                        if let Some(text) = string_field(part, "text") {
                            texts.push(text);
                        }
                    }
                    Some("image") => images.extend(string_field(part, "url")),
                    Some("input_image") => images.extend(
                        string_field(part, "image_url").or_else(|| string_field(part, "url")),
                    ),
                    Some("localImage" | "local_image") => images.extend(string_field(part, "path")),
                    _ => {}
                }
            }
        }
        _ => {}
    }
    (texts.join("\n"), images)
}

/// Collapse text that is an embedded or whole base64 image to a placeholder.
pub fn sanitize_assistant_text(text: &str) -> String {
    if contains_data_image(text) || is_base64_blob(text) {
        IMAGE_PLACEHOLDER.to_string()
    } else {
        text.to_string()
    }
}

fn contains_data_image(text: &str) -> bool {
    text.find("data:image/")
        .is_some_and(|start| text[start..].contains(";base64,"))
}

fn is_base64_blob(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.contains(' ') {
        return false;
    }
    let compact: String = trimmed.chars().filter(|ch| !ch.is_whitespace()).collect();
    compact.len() >= BASE64_BLOB_MIN_LEN
        && compact
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '+' | '/' | '=' | '-' | '_'))
}

/// Display name for a running item.
pub fn task_name_for_item(item_type: &str, item: &Value) -> String {
    match item_type {
        "commandExecution" => {
            let command = match item.get("command") {
                Some(Value::Array(parts)) => parts
                    .iter()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .join(" "),
                Some(Value::String(command)) => command.clone(),
                _ => String::new(),
            };
            if command.is_empty() {
                "Running command".to_string()
            } else {
                title_from_text(&command)
            }
        }
        "fileChange" => {
            let paths: Vec<String> = item
                .get("changes")
                .and_then(Value::as_array)
                .map(|changes| {
                    changes
                        .iter()
                        .filter_map(|change| string_field(change, "path"))
                        .collect()
                })
                .unwrap_or_default();
            match paths.as_slice() {
                [] => "Editing files".to_string(),
                [single] => format!("Editing {single}"),
                [first, rest @ ..] => format!("Editing {first} and {} more", rest.len()),
            }
        }
        "mcpToolCall" => {
            let server = string_field(item, "server").unwrap_or_default();
            let tool = string_field(item, "tool").unwrap_or_default();
            match (server.is_empty(), tool.is_empty()) {
                (false, false) => format!("{server}.{tool}"),
                (true, false) => tool,
                _ => "Tool call".to_string(),
            }
        }
        "webSearch" => match string_field(item, "query").filter(|query| !query.is_empty()) {
            Some(query) => format!("Searching: {}", title_from_text(&query)),
            None => "Web search".to_string(),
        },
        other => other.to_string(),
    }
}

pub(crate) fn string_field(value: &Value, field: &str) -> Option<String> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn thread_parsing_prefers_name_then_preview() {
        let now = Utc::now();
        let named = thread_from_value(
            &json!({"id": "t1", "name": "Fix CI", "preview": "ignored", "updatedAt": 1_700_000_000}),
            now,
        )
        .expect("thread");
        assert_eq!(named.title, "Fix CI");
        assert_eq!(named.updated_at.timestamp(), 1_700_000_000);
        assert!(!named.placeholder);

        let previewed = thread_from_value(
            &json!({"id": "t2", "preview": "\n  refactor the parser\nsecond line", "cwd": "/srv/app"}),
            now,
        )
        .expect("thread");
        assert_eq!(previewed.title, "refactor the parser");
        assert_eq!(previewed.cwd.as_deref(), Some("/srv/app"));
        assert_eq!(previewed.updated_at, now);

        assert!(thread_from_value(&json!({"preview": "no id"}), now).is_none());
    }

    #[test]
    fn timestamps_accept_seconds_millis_and_rfc3339() {
        assert_eq!(
            timestamp_from_value(&json!(1_700_000_000_123_i64)).map(|t| t.timestamp_millis()),
            Some(1_700_000_000_123)
        );
        assert_eq!(
            timestamp_from_value(&json!("2025-01-02T03:04:05Z")).map(|t| t.timestamp()),
            Some(1_735_787_045)
        );
        assert_eq!(timestamp_from_value(&json!(true)), None);
    }

    #[test]
    fn placeholder_never_overwrites_real_thread() {
        let mut real = thread_from_value(&json!({"id": "t1", "preview": "real"}), Utc::now())
            .expect("thread");
        let before = real.clone();
        merge_thread(&mut real, placeholder_thread("t1"));
        assert_eq!(real, before);

        let mut placeholder = placeholder_thread("t1");
        merge_thread(&mut placeholder, before.clone());
        assert_eq!(placeholder.title, "real");
        assert!(!placeholder.placeholder);
    }

    #[test]
    fn reconstructs_modern_and_legacy_items() {
        let turns = vec![
            json!({
                "id": "turn-1",
                "items": [
                    {"type": "userMessage", "id": "u1", "content": [
                        {"type": "text", "text": "describe this"},
                        {"type": "image", "url": "https://example.com/a.png"},
                        {"type": "localImage", "path": "/tmp/b.png"}
                    ]},
                    {"type": "reasoning", "id": "r1", "summary": []},
                    {"type": "agentMessage", "id": "a1", "text": "It is a cat."}
                ]
            }),
            json!({
                "id": "turn-2",
                "items": [
                    {"type": "message", "role": "user", "content": [{"type": "input_text", "text": "thanks"}]},
                    {"type": "message", "role": "assistant", "content": [{"type": "output_text", "text": "welcome"}]},
                    {"type": "message", "role": "system", "content": [{"type": "input_text", "text": "hidden"}]}
                ],
                "error": {"message": "rate limited"}
            }),
        ];
        let entries = activity_from_turns("thread-1", &turns, Utc::now());
        let summary: Vec<(ActivityKind, &str)> = entries
            .iter()
            .map(|entry| (entry.kind, entry.text.as_str()))
            .collect();
        assert_eq!(
            summary,
            vec![
                (ActivityKind::User, "describe this"),
                (ActivityKind::Assistant, "It is a cat."),
                (ActivityKind::User, "thanks"),
                (ActivityKind::Assistant, "welcome"),
                (ActivityKind::System, "Turn failed: rate limited"),
            ]
        );
        assert_eq!(
            entries[0].images,
            vec!["https://example.com/a.png".to_string(), "/tmp/b.png".to_string()]
        );
        assert!(entries.iter().all(|entry| entry.thread_id.as_deref() == Some("thread-1")));
    }

    #[test]
    fn image_blobs_collapse_to_placeholder() {
        assert_eq!(
            sanitize_assistant_text("here: data:image/png;base64,iVBORw0KGgo="),
            IMAGE_PLACEHOLDER
        );
        assert_eq!(sanitize_assistant_text(&"QUJD".repeat(100)), IMAGE_PLACEHOLDER);
        assert_eq!(sanitize_assistant_text("short plain answer"), "short plain answer");
        let prose = "word ".repeat(100);
        assert_eq!(sanitize_assistant_text(&prose), prose);
    }

    #[test]
    fn task_names_describe_items() {
        assert_eq!(
            task_name_for_item("commandExecution", &json!({"command": ["cargo", "test"]})),
            "cargo test"
        );
        assert_eq!(
            task_name_for_item(
                "fileChange",
                &json!({"changes": [{"path": "a.rs"}, {"path": "b.rs"}, {"path": "c.rs"}]})
            ),
            "Editing a.rs and 2 more"
        );
        assert_eq!(
            task_name_for_item("mcpToolCall", &json!({"server": "docs", "tool": "search"})),
            "docs.search"
        );
        assert_eq!(
            task_name_for_item("webSearch", &json!({"query": "tokio select"})),
            "Searching: tokio select"
        );
    }
}
